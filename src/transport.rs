//! Child-process transport: output capture, tagged-message waits, commands.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::{SelfprofError, SelfprofResult, ToolOutput, protocol};

/// Every blocking wait in the crate polls at this fixed interval.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(40);

/// Receives every service message parsed out of the child's stdout. Invoked
/// synchronously on the reader thread, in exact line order; implementations
/// must not block.
pub trait ResponseProcessor: Send + Sync {
    fn process(&self, command: &str, args: Option<&str>);
}

/// Construction options for [`ConsoleTool`].
#[derive(Default)]
pub struct ConsoleToolOptions {
    /// Fixed tag prefix of the tool's service messages (e.g. `##dotMemory`).
    pub prefix: String,
    /// Human-readable tool name used in error messages.
    pub presentable_name: String,
    /// Present only for sessions controlled through the in-process api: the
    /// tool reports "connected" before the control surface inside the target
    /// is initialized, so `await_connected` additionally polls this.
    pub ready_check: Option<Box<dyn Fn() -> bool + Send + Sync>>,
    /// Optional sink for parsed service messages.
    pub processor: Option<Arc<dyn ResponseProcessor>>,
    /// When true the session is driven through the in-process api and
    /// protocol commands are rejected with `InvalidState`.
    pub api_controlled: bool,
}

/// A response matched by [`ConsoleTool::await_response`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedResponse {
    pub command: String,
    pub args: Option<String>,
}

/// Owns one spawned runner process. Stdout and stderr are drained by two
/// detached reader threads for the process's whole lifetime; waits scan the
/// accumulated stdout lines behind a cursor that only successful waits
/// advance.
pub struct ConsoleTool {
    prefix: String,
    presentable_name: String,
    api_controlled: bool,
    ready_check: Option<Box<dyn Fn() -> bool + Send + Sync>>,
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout_lines: Arc<Mutex<Vec<String>>>,
    stderr_lines: Arc<Mutex<Vec<String>>>,
    cursor: Mutex<usize>,
    exit_status: Mutex<Option<ExitStatus>>,
}

impl ConsoleTool {
    pub fn start(
        executable: &Path,
        arguments: &[String],
        options: ConsoleToolOptions,
    ) -> SelfprofResult<Self> {
        tracing::info!(
            executable = %executable.display(),
            arguments = %arguments.join(" "),
            "starting console tool"
        );

        let mut child = Command::new(executable)
            .args(arguments)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SelfprofError::LaunchFailed {
                tool: options.presentable_name.clone(),
                source,
            })?;

        let Some(stdout) = child.stdout.take() else {
            return Err(SelfprofError::InvalidState(
                "child stdout was not captured".to_string(),
            ));
        };
        let Some(stderr) = child.stderr.take() else {
            return Err(SelfprofError::InvalidState(
                "child stderr was not captured".to_string(),
            ));
        };
        let stdin = child.stdin.take();

        let stdout_lines = Arc::new(Mutex::new(Vec::new()));
        let stderr_lines = Arc::new(Mutex::new(Vec::new()));

        let out_buffer = stdout_lines.clone();
        let dispatch = options
            .processor
            .clone()
            .map(|processor| (options.prefix.clone(), processor));
        std::thread::Builder::new()
            .name(format!("selfprof-stdout-{}", options.prefix))
            .spawn(move || read_stream(stdout, &out_buffer, dispatch.as_ref()))?;

        let err_buffer = stderr_lines.clone();
        std::thread::Builder::new()
            .name(format!("selfprof-stderr-{}", options.prefix))
            .spawn(move || read_stream(stderr, &err_buffer, None))?;

        Ok(Self {
            prefix: options.prefix,
            presentable_name: options.presentable_name,
            api_controlled: options.api_controlled,
            ready_check: options.ready_check,
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            stdout_lines,
            stderr_lines,
            cursor: Mutex::new(0),
            exit_status: Mutex::new(None),
        })
    }

    /// Both captured streams so far, for diagnostics.
    pub fn output(&self) -> ToolOutput {
        ToolOutput {
            stdout: lock(&self.stdout_lines).clone(),
            stderr: lock(&self.stderr_lines).clone(),
        }
    }

    /// Waits for a service message whose command matches one of `commands`
    /// (case-insensitive). Scans only lines not consumed by a prior
    /// successful wait; `None` timeout waits until the process exits.
    pub fn await_response(
        &self,
        commands: &[&str],
        timeout: Option<Duration>,
    ) -> SelfprofResult<MatchedResponse> {
        let start = Instant::now();
        let mut scan_from = *lock(&self.cursor);

        loop {
            {
                let lines = lock(&self.stdout_lines);
                while scan_from < lines.len() {
                    let line = &lines[scan_from];
                    scan_from += 1;
                    if let Some(msg) = protocol::parse_line(&self.prefix, line)
                        && commands.iter().any(|c| c.eq_ignore_ascii_case(msg.command))
                    {
                        *lock(&self.cursor) = scan_from;
                        return Ok(MatchedResponse {
                            command: msg.command.to_string(),
                            args: msg.args.map(String::from),
                        });
                    }
                }
            }

            // Scan before the exit check: the process may have exited right
            // after printing the line being waited for.
            if self.poll_exit().is_some() {
                return Err(self.wait_failure(format!(
                    "exited before reporting {}",
                    commands.join(" or ")
                )));
            }
            if let Some(limit) = timeout
                && start.elapsed() >= limit
            {
                return Err(self.wait_failure(format!(
                    "did not report {} in the given time",
                    commands.join(" or ")
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Serializes one command line to the tool's stdin. Rejected when the
    /// session is controlled through the in-process api: the two control
    /// channels are mutually exclusive per session.
    pub fn send(&self, command: &str, args: &[(&str, Option<&str>)]) -> SelfprofResult<()> {
        if self.api_controlled {
            return Err(SelfprofError::InvalidState(format!(
                "the {} session is api-controlled; protocol commands are not allowed",
                self.presentable_name
            )));
        }

        let line = protocol::format_command(&self.prefix, command, args);
        tracing::debug!(line = line.as_str(), "sending command");

        let mut stdin = lock(&self.stdin);
        let Some(stdin) = stdin.as_mut() else {
            return Err(SelfprofError::InvalidState(
                "the tool's stdin is closed".to_string(),
            ));
        };
        writeln!(stdin, "{line}")?;
        stdin.flush()?;
        Ok(())
    }

    /// Waits for process exit; a non-zero code is a failure. Both outcomes
    /// attach the full captured output.
    pub fn await_finished(&self, timeout: Option<Duration>) -> SelfprofResult<()> {
        let start = Instant::now();
        let status = loop {
            if let Some(status) = self.poll_exit() {
                break status;
            }
            if let Some(limit) = timeout
                && start.elapsed() >= limit
            {
                return Err(self.wait_failure("has not finished in the given time".to_string()));
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        if !status.success() {
            return Err(SelfprofError::NonZeroExit {
                tool: self.presentable_name.clone(),
                code: status.code().unwrap_or(-1),
                output: self.output(),
            });
        }
        Ok(())
    }

    /// Two-phase connect wait: first the `connected` tag, then (only when a
    /// ready check was supplied) the in-process control surface. One deadline
    /// covers both phases.
    pub fn await_connected(&self, timeout: Option<Duration>) -> SelfprofResult<()> {
        let start = Instant::now();

        self.await_response(&["connected"], timeout)
            .map_err(|err| match err {
                SelfprofError::Timeout { tool, output, .. } => SelfprofError::Timeout {
                    tool,
                    what: "was not connected".to_string(),
                    output,
                },
                other => other,
            })?;

        let Some(ready) = &self.ready_check else {
            return Ok(());
        };
        loop {
            if ready() {
                return Ok(());
            }
            if self.poll_exit().is_some() {
                return Err(
                    self.wait_failure("exited before the profiler api became ready".to_string())
                );
            }
            if let Some(limit) = timeout
                && start.elapsed() >= limit
            {
                return Err(self.wait_failure(
                    "profiler api did not become ready in the given time".to_string(),
                ));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Best-effort termination, used when an attach fails midway and the
    /// half-connected child must not linger.
    pub fn kill(&self) {
        let mut child = lock(&self.child);
        child.kill().ok();
        if let Ok(Some(status)) = child.try_wait() {
            *lock(&self.exit_status) = Some(status);
        }
    }

    fn poll_exit(&self) -> Option<ExitStatus> {
        if let Some(status) = *lock(&self.exit_status) {
            return Some(status);
        }
        let mut child = lock(&self.child);
        match child.try_wait() {
            Ok(Some(status)) => {
                *lock(&self.exit_status) = Some(status);
                Some(status)
            }
            _ => None,
        }
    }

    fn wait_failure(&self, what: String) -> SelfprofError {
        SelfprofError::Timeout {
            tool: self.presentable_name.clone(),
            what,
            output: self.output(),
        }
    }
}

fn read_stream<R: Read>(
    stream: R,
    lines: &Arc<Mutex<Vec<String>>>,
    dispatch: Option<&(String, Arc<dyn ResponseProcessor>)>,
) {
    let reader = std::io::BufReader::new(stream);
    for line in std::io::BufRead::lines(reader) {
        let Ok(line) = line else {
            break;
        };
        tracing::trace!(line = line.as_str(), "tool output");
        lock(lines).push(line.clone());

        if let Some((prefix, processor)) = dispatch
            && let Some(msg) = protocol::parse_line(prefix, &line)
        {
            processor.process(msg.command, msg.args);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn init_logs() {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init()
            .ok();
    }

    #[cfg(unix)]
    fn start_script(script: &str, options: ConsoleToolOptions) -> ConsoleTool {
        init_logs();
        ConsoleTool::start(
            Path::new("/bin/sh"),
            &["-c".to_string(), script.to_string()],
            options,
        )
        .expect("start")
    }

    fn options(prefix: &str) -> ConsoleToolOptions {
        ConsoleToolOptions {
            prefix: prefix.to_string(),
            presentable_name: "test tool".to_string(),
            ..ConsoleToolOptions::default()
        }
    }

    #[cfg(unix)]
    #[test]
    fn sequential_waits_never_rematch_consumed_lines() {
        let script = r#"
printf '%s\n' '##tool["alpha",{}]'
printf '%s\n' '##tool["beta",{}]'
sleep 0.3
"#;
        let tool = start_script(script, options("##tool"));

        let first = tool.await_response(&["alpha"], Some(Duration::from_secs(5))).expect("alpha");
        assert_eq!(first.command, "alpha");
        let second = tool.await_response(&["beta"], Some(Duration::from_secs(5))).expect("beta");
        assert_eq!(second.command, "beta");

        // "alpha" was consumed by the first wait; it must not match again.
        let err = tool
            .await_response(&["alpha"], Some(Duration::from_secs(5)))
            .expect_err("alpha is consumed");
        assert!(matches!(err, SelfprofError::Timeout { .. }));
        tool.await_finished(Some(Duration::from_secs(5))).expect("exit");
    }

    #[cfg(unix)]
    #[test]
    fn command_matching_is_case_insensitive() {
        let script = "printf '%s\\n' '##tool[\"Connected\",{}]'; sleep 0.2";
        let tool = start_script(script, options("##tool"));
        tool.await_connected(Some(Duration::from_secs(5))).expect("connected");
        tool.await_finished(Some(Duration::from_secs(5))).expect("exit");
    }

    #[cfg(unix)]
    #[test]
    fn exit_before_match_fails_without_waiting_out_the_timeout() {
        let tool = start_script("exit 0", options("##tool"));
        let start = Instant::now();
        let err = tool
            .await_response(&["never"], Some(Duration::from_secs(30)))
            .expect_err("must fail fast");
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(matches!(err, SelfprofError::Timeout { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_attaches_captured_output() {
        let script = "echo some stdout; echo some stderr 1>&2; exit 3";
        let tool = start_script(script, options("##tool"));
        let err = tool
            .await_finished(Some(Duration::from_secs(5)))
            .expect_err("must fail");
        match err {
            SelfprofError::NonZeroExit { code, output, .. } => {
                assert_eq!(code, 3);
                assert!(output.stdout.iter().any(|l| l.contains("some stdout")));
                assert!(output.stderr.iter().any(|l| l.contains("some stderr")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn send_drives_a_scripted_exchange() {
        let script = r#"
printf '%s\n' '##tool["connected",{}]'
read line
case "$line" in
  *get-snapshot*) printf '%s\n' '##tool["snapshot-saved",{"filename":"/tmp/out.dmw"}]' ;;
esac
"#;
        struct Recorder(Mutex<Vec<String>>);
        impl ResponseProcessor for Recorder {
            fn process(&self, command: &str, args: Option<&str>) {
                self.0
                    .lock()
                    .expect("recorder lock")
                    .push(format!("{command}:{}", args.unwrap_or_default()));
            }
        }

        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let mut opts = options("##tool");
        opts.processor = Some(recorder.clone());
        let tool = start_script(script, opts);

        tool.await_connected(Some(Duration::from_secs(5))).expect("connected");
        tool.send("get-snapshot", &[("name", Some("snap1"))]).expect("send");
        let saved = tool
            .await_response(&["snapshot-saved"], Some(Duration::from_secs(5)))
            .expect("saved");
        assert_eq!(saved.command, "snapshot-saved");

        tool.await_finished(Some(Duration::from_secs(5))).expect("exit");
        let seen = recorder.0.lock().expect("recorder lock").clone();
        assert!(seen.iter().any(|s| s.starts_with("connected:")));
        assert!(seen.iter().any(|s| s.contains("snapshot-saved")));
    }

    #[cfg(unix)]
    #[test]
    fn ready_check_failure_times_out_at_the_overall_deadline() {
        let script = "printf '%s\\n' '##tool[\"connected\",{}]'; sleep 5";
        let mut opts = options("##tool");
        opts.ready_check = Some(Box::new(|| false));
        let tool = start_script(script, opts);

        let start = Instant::now();
        let err = tool
            .await_connected(Some(Duration::from_millis(400)))
            .expect_err("never ready");
        let elapsed = start.elapsed();
        assert!(matches!(err, SelfprofError::Timeout { .. }));
        assert!(elapsed >= Duration::from_millis(400));
        assert!(elapsed < Duration::from_secs(3));
        tool.kill();
    }

    #[cfg(unix)]
    #[test]
    fn ready_check_runs_after_the_connected_tag() {
        let script = "printf '%s\\n' '##tool[\"connected\",{}]'; sleep 1";
        let flag = Arc::new(AtomicBool::new(true));
        let probe = flag.clone();
        let mut opts = options("##tool");
        opts.ready_check = Some(Box::new(move || probe.load(Ordering::SeqCst)));
        let tool = start_script(script, opts);

        tool.await_connected(Some(Duration::from_secs(5))).expect("connected");
        tool.kill();
    }

    #[cfg(unix)]
    #[test]
    fn api_controlled_transport_rejects_protocol_commands() {
        let mut opts = options("##tool");
        opts.api_controlled = true;
        let tool = start_script("sleep 1", opts);

        let err = tool.send("start", &[]).expect_err("must reject");
        assert!(matches!(err, SelfprofError::InvalidState(_)));
        tool.kill();
    }
}
