//! Session lifecycle: control-mode selection, state machine, active-session slot.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::{
    ApiBinding, ApiMode, ConsoleTool, ConsoleToolOptions, ProfilerApi, SelfprofError,
    SelfprofResult, SnapshotSink,
};

/// Lifecycle of one attach-to-detach engagement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    Collecting,
    Stopped,
    Finished,
}

/// The protocol verbs of one tool's command channel. Flag and verb spellings
/// are a stable contract with the external binary's version line; each
/// facade supplies its own set.
#[derive(Debug, Clone, Copy)]
pub struct CommandSet {
    pub start: &'static str,
    pub stop: &'static str,
    pub save: &'static str,
    pub drop: &'static str,
    pub detach: &'static str,
    /// Responses completing a save; a save blocks until one arrives so the
    /// output file exists on return. Empty means saves do not block.
    pub save_responses: &'static [&'static str],
}

/// How the session is driven after attach. Chosen once, never renegotiated.
pub(crate) enum SessionControl {
    Api(Arc<dyn ProfilerApi>),
    Commands(CommandSet),
}

/// Resolves the control channel from the configured preference and the
/// facade's api binding. In auto mode an installed api wins, with a silent
/// fallback to protocol commands; requiring the api fails when none is
/// installed.
pub(crate) fn resolve_control(
    mode: ApiMode,
    binding: &ApiBinding,
) -> SelfprofResult<Option<Arc<dyn ProfilerApi>>> {
    match mode {
        ApiMode::Forbid => Ok(None),
        ApiMode::Auto => {
            let bound = binding.bound();
            if bound.is_none() {
                tracing::debug!("no profiler api installed, using protocol commands");
            }
            Ok(bound)
        }
        ApiMode::Require => binding
            .bound()
            .map(Some)
            .ok_or(SelfprofError::ApiUnavailable),
    }
}

/// Everything needed to spawn the runner and wait for the connection.
pub(crate) struct AttachSpec {
    pub executable: PathBuf,
    pub arguments: Vec<String>,
    pub prefix: &'static str,
    pub presentable_name: &'static str,
    pub api: Option<Arc<dyn ProfilerApi>>,
    pub commands: CommandSet,
    pub workspace_file: Option<PathBuf>,
    pub timeout: Duration,
}

/// Spawns the runner and performs the connect wait. A failed attach kills
/// the half-connected child so nothing lingers.
pub(crate) fn attach(spec: AttachSpec) -> SelfprofResult<Session> {
    let sink = Arc::new(SnapshotSink::new());

    let ready_check = spec.api.clone().map(|api| {
        Box::new(move || api.is_ready()) as Box<dyn Fn() -> bool + Send + Sync>
    });
    let options = ConsoleToolOptions {
        prefix: spec.prefix.to_string(),
        presentable_name: spec.presentable_name.to_string(),
        ready_check,
        processor: Some(sink.clone()),
        api_controlled: spec.api.is_some(),
    };

    let tool = Arc::new(ConsoleTool::start(
        &spec.executable,
        &spec.arguments,
        options,
    )?);
    if let Err(err) = tool.await_connected(Some(spec.timeout)) {
        tool.kill();
        return Err(err);
    }

    let control = match spec.api {
        Some(api) => SessionControl::Api(api),
        None => SessionControl::Commands(spec.commands),
    };
    Ok(Session {
        tool,
        control,
        sink,
        workspace_file: spec.workspace_file,
        timeout: spec.timeout,
        state: SessionState::Connected,
    })
}

/// One live engagement with a runner process.
pub struct Session {
    tool: Arc<ConsoleTool>,
    control: SessionControl,
    sink: Arc<SnapshotSink>,
    workspace_file: Option<PathBuf>,
    timeout: Duration,
    state: SessionState,
}

impl Session {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn workspace_file(&self) -> Option<&Path> {
        self.workspace_file.as_deref()
    }

    pub(crate) fn collected_index_files(&self) -> Vec<PathBuf> {
        self.sink.collected()
    }

    pub(crate) fn start_collecting(&mut self) -> SelfprofResult<()> {
        match &self.control {
            SessionControl::Api(api) => api.start(),
            SessionControl::Commands(commands) => self.tool.send(commands.start, &[])?,
        }
        self.state = SessionState::Collecting;
        Ok(())
    }

    pub(crate) fn stop_collecting(&mut self) -> SelfprofResult<()> {
        match &self.control {
            SessionControl::Api(api) => api.stop(),
            SessionControl::Commands(commands) => self.tool.send(commands.stop, &[])?,
        }
        self.state = SessionState::Stopped;
        Ok(())
    }

    /// Saves collected data. Through the command channel this blocks until
    /// the tool confirms the snapshot, and returns the index file the
    /// response reported; through the in-process api the call is synchronous
    /// by construction and nothing extra is awaited.
    pub(crate) fn save_data(&mut self, name: Option<&str>) -> SelfprofResult<Option<PathBuf>> {
        let recorded_before = self.sink.count();
        match &self.control {
            SessionControl::Api(api) => api.save_data(),
            SessionControl::Commands(commands) => {
                let mut args: Vec<(&str, Option<&str>)> = Vec::new();
                if let Some(value) = name {
                    args.push(("name", Some(value)));
                }
                self.tool.send(commands.save, &args)?;
                if !commands.save_responses.is_empty() {
                    self.tool.await_response(commands.save_responses, None)?;
                }
            }
        }
        self.state = SessionState::Stopped;
        Ok(self.sink.nth(recorded_before))
    }

    pub(crate) fn drop_data(&mut self) -> SelfprofResult<()> {
        match &self.control {
            SessionControl::Api(api) => api.drop_data(),
            SessionControl::Commands(commands) => self.tool.send(commands.drop, &[])?,
        }
        self.state = SessionState::Stopped;
        Ok(())
    }

    /// Sends the disengage signal. The session is Finished from this point
    /// even if the signal failed; the exit wait is a separate step so the
    /// caller can always release the active-session slot.
    pub(crate) fn disengage(&mut self) -> SelfprofResult<()> {
        self.state = SessionState::Finished;
        match &self.control {
            SessionControl::Api(api) => {
                api.detach();
                Ok(())
            }
            SessionControl::Commands(commands) => self.tool.send(commands.detach, &[]),
        }
    }

    pub(crate) fn await_finished(&self) -> SelfprofResult<()> {
        self.tool.await_finished(Some(self.timeout))
    }

    pub(crate) fn kill_tool(&self) {
        self.tool.kill();
    }
}

/// Holder of the single active session per facade. An explicit object (not
/// process-global state) so independent facades and tests do not interfere.
#[derive(Default)]
pub struct SessionManager {
    current: Mutex<Option<Session>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        match &*self.slot() {
            Some(session) => session.state(),
            None => SessionState::Disconnected,
        }
    }

    pub(crate) fn slot(&self) -> MutexGuard<'_, Option<Session>> {
        self.current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
