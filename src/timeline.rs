//! Performance/timeline collection facade around the trace console profiler.

use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::common::{CommonOptions, console_tools_version};
use crate::session::{self, AttachSpec, CommandSet};
use crate::{
    ApiMode, DownloadHandle, EnsureRequest, SelfprofError, SelfprofResult, SessionManager,
    SessionState, Settings, SnapshotLedger, ToolArtifact, ToolResolver, capability::ApiBinding,
};

const PREFIX: &str = "##dotTrace";
const PRESENTABLE_NAME: &str = "dotTrace console profiler";

const COMMANDS: CommandSet = CommandSet {
    start: "start",
    stop: "stop",
    save: "get-snapshot",
    drop: "drop",
    detach: "disconnect",
    save_responses: &["snapshot-saved", "get-snapshot-error"],
};

fn runner_file_name() -> &'static str {
    if cfg!(windows) { "ConsoleProfiler.exe" } else { "dotTrace.sh" }
}

/// Timeline profiling configuration, consumed by one attach.
#[derive(Debug, Clone, Default)]
pub struct TimelineConfig {
    common: CommonOptions,
    snapshot_file: Option<PathBuf>,
    snapshot_dir: Option<PathBuf>,
    overwrite: bool,
}

impl TimelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path of the snapshot index file; later snapshots get a numeric
    /// suffix. Mutually exclusive with `save_to_dir`.
    pub fn save_to_file(mut self, path: impl Into<PathBuf>, overwrite: bool) -> SelfprofResult<Self> {
        if self.snapshot_dir.is_some() {
            return Err(SelfprofError::InvalidArgument(
                "save_to_file and save_to_dir are mutually exclusive".to_string(),
            ));
        }
        let path = path.into();
        if path.is_dir() {
            return Err(SelfprofError::InvalidArgument(format!(
                "{} is a directory; use save_to_dir to save there",
                path.display()
            )));
        }
        self.snapshot_file = Some(path);
        self.overwrite = overwrite;
        Ok(self)
    }

    /// Directory for snapshot files (names are generated by the tool). The
    /// directory must already exist.
    pub fn save_to_dir(mut self, dir: impl Into<PathBuf>) -> SelfprofResult<Self> {
        if self.snapshot_file.is_some() {
            return Err(SelfprofError::InvalidArgument(
                "save_to_dir and save_to_file are mutually exclusive".to_string(),
            ));
        }
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(SelfprofError::InvalidArgument(format!(
                "the directory {} does not exist",
                dir.display()
            )));
        }
        self.snapshot_dir = Some(dir);
        Ok(self)
    }

    pub fn use_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.common.log_file = Some(path.into());
        self
    }

    /// Requires the in-process profiler api; the attach fails when none is
    /// installed. Mutually exclusive with `do_not_use_api`.
    pub fn use_api(mut self) -> SelfprofResult<Self> {
        self.common.choose_api_mode(ApiMode::Require)?;
        Ok(self)
    }

    /// Always drives the session through protocol commands. Mutually
    /// exclusive with `use_api`.
    pub fn do_not_use_api(mut self) -> SelfprofResult<Self> {
        self.common.choose_api_mode(ApiMode::Forbid)?;
        Ok(self)
    }

    /// Profiles another process instead of the current one.
    pub fn attach_to_pid(mut self, pid: u32) -> Self {
        self.common.pid = Some(pid);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.common.set_timeout(timeout);
        self
    }

    pub fn with_extra_arguments(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.common.extra_arguments.extend(args);
        self
    }
}

/// Drives performance collection of the current (or a target) process
/// through the external trace profiler: attach, start/stop, save/drop,
/// detach, plus bookkeeping of the collected snapshot files.
pub struct TimelineProfiler {
    settings: Settings,
    resolver: ToolResolver,
    binding: ApiBinding,
    sessions: SessionManager,
    ledger: Mutex<SnapshotLedger>,
    attached_once: AtomicBool,
}

impl Default for TimelineProfiler {
    fn default() -> Self {
        Self::new()
    }
}

impl TimelineProfiler {
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Self {
        let artifact = ToolArtifact {
            name: "dotTrace".to_string(),
            version_pin: console_tools_version(),
            package_id: "JetBrains.dotTrace.CommandLineTools".to_string(),
            runner_file_name: runner_file_name().to_string(),
            estimated_size: 30 * 1024 * 1024,
        };
        Self {
            settings,
            resolver: ToolResolver::new(artifact),
            binding: ApiBinding::new(),
            sessions: SessionManager::new(),
            ledger: Mutex::new(SnapshotLedger::default()),
            attached_once: AtomicBool::new(false),
        }
    }

    /// Installation slot for the in-process performance profiler api.
    pub fn api_binding(&self) -> &ApiBinding {
        &self.binding
    }

    pub fn session_state(&self) -> SessionState {
        self.sessions.state()
    }

    /// Makes sure the runner is downloaded and ready. Registry defaults come
    /// from the facade settings unless the request overrides them.
    pub fn ensure_ready(&self, mut request: EnsureRequest) -> SelfprofResult<DownloadHandle> {
        if request.registry_url.is_none() {
            request.registry_url = self.settings.registry_url.clone();
        }
        if request.registry_api.is_none() {
            request.registry_api = Some(self.settings.registry_api);
        }
        if request.dest_dir.is_none() {
            request.dest_dir = self.settings.cache_dir.clone();
        }
        self.resolver.ensure_ready(request)
    }

    /// Attaches the profiler. Collection starts stopped; call
    /// `start_collecting` to begin gathering data.
    pub fn attach(&self, config: TimelineConfig) -> SelfprofResult<()> {
        let mut slot = self.sessions.slot();
        if slot.is_some() {
            return Err(SelfprofError::AlreadyActive);
        }

        let runner = self.resolver.runner_path()?;
        let api = session::resolve_control(config.common.api_mode, &self.binding)?;
        let arguments = build_arguments(&config, api.is_some());

        let session = session::attach(AttachSpec {
            executable: runner,
            arguments,
            prefix: PREFIX,
            presentable_name: PRESENTABLE_NAME,
            api,
            commands: COMMANDS,
            workspace_file: config.snapshot_file.clone(),
            timeout: config.common.effective_timeout(&self.settings),
        })?;

        lock_ledger(&self.ledger).reset();
        self.attached_once.store(true, Ordering::SeqCst);
        *slot = Some(session);
        Ok(())
    }

    pub fn start_collecting(&self) -> SelfprofResult<()> {
        let mut slot = self.sessions.slot();
        let Some(session) = slot.as_mut() else {
            return Err(SelfprofError::NotActive);
        };
        session.start_collecting()
    }

    pub fn stop_collecting(&self) -> SelfprofResult<()> {
        let mut slot = self.sessions.slot();
        let Some(session) = slot.as_mut() else {
            return Err(SelfprofError::NotActive);
        };
        session.stop_collecting()
    }

    /// Saves the collected data into a snapshot. Through the command channel
    /// this blocks until the tool confirms the snapshot, so the files exist
    /// on return; collection is stopped afterwards.
    pub fn save_data(&self) -> SelfprofResult<()> {
        let mut slot = self.sessions.slot();
        let Some(session) = slot.as_mut() else {
            return Err(SelfprofError::NotActive);
        };
        session.save_data(None)?;
        lock_ledger(&self.ledger).sync(session.collected_index_files());
        Ok(())
    }

    /// Discards the collected data; collection is stopped afterwards.
    pub fn drop_data(&self) -> SelfprofResult<()> {
        let mut slot = self.sessions.slot();
        let Some(session) = slot.as_mut() else {
            return Err(SelfprofError::NotActive);
        };
        session.drop_data()
    }

    /// Detaches and waits for the runner to exit, returning the collected
    /// index files. The active-session slot is released whatever the
    /// outcome; the collected files stay listed for later packaging.
    pub fn detach(&self) -> SelfprofResult<Vec<PathBuf>> {
        let mut slot = self.sessions.slot();
        let Some(mut session) = slot.take() else {
            return Err(SelfprofError::NotActive);
        };

        let result = session
            .disengage()
            .and_then(|()| session.await_finished());
        if result.is_err() {
            session.kill_tool();
        }

        let mut ledger = lock_ledger(&self.ledger);
        ledger.sync(session.collected_index_files());
        let visible = ledger.visible();
        result.map(|()| visible)
    }

    /// Index files of every collected snapshot (one per save), excluding
    /// entries removed by a delete-after-pack.
    pub fn collected_index_files(&self) -> SelfprofResult<Vec<PathBuf>> {
        if !self.attached_once.load(Ordering::SeqCst) {
            return Err(SelfprofError::NotActive);
        }
        let slot = self.sessions.slot();
        let mut ledger = lock_ledger(&self.ledger);
        if let Some(session) = &*slot {
            ledger.sync(session.collected_index_files());
        }
        Ok(ledger.visible())
    }

    /// Packs every not-yet-packed snapshot into one zip. Returns `None` when
    /// nothing new was collected since the last call.
    pub fn archive_collected(&self, delete_sources: bool) -> SelfprofResult<Option<PathBuf>> {
        if !self.attached_once.load(Ordering::SeqCst) {
            return Err(SelfprofError::NotActive);
        }
        let slot = self.sessions.slot();
        let mut ledger = lock_ledger(&self.ledger);
        if let Some(session) = &*slot {
            ledger.sync(session.collected_index_files());
        }
        ledger.archive(delete_sources)
    }
}

fn build_arguments(config: &TimelineConfig, use_api: bool) -> Vec<String> {
    let mut arguments = vec![
        "attach".to_string(),
        config.common.target_pid().to_string(),
        "--service-input=stdin".to_string(),
        "--service-output=On".to_string(),
        "--collect-data-from-start=Off".to_string(),
    ];
    if use_api {
        arguments.push("--use-api".to_string());
    }
    if let Some(log_file) = &config.common.log_file {
        arguments.push(format!("--log-file={}", log_file.display()));
        arguments.push("--debug-logging".to_string());
    }
    if config.overwrite {
        arguments.push("--overwrite".to_string());
    }
    if let Some(file) = &config.snapshot_file {
        arguments.push(format!("--save-to={}", file.display()));
    }
    if let Some(dir) = &config.snapshot_dir {
        arguments.push(format!("--save-to={}", dir.display()));
    }
    arguments.extend(config.common.extra_arguments.iter().cloned());
    arguments
}

fn lock_ledger(ledger: &Mutex<SnapshotLedger>) -> std::sync::MutexGuard<'_, SnapshotLedger> {
    ledger.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
