//! Memory snapshot facade: attach/get-snapshot/detach around the memory
//! console profiler.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::{CommonOptions, console_tools_version, timestamped_output_name};
use crate::session::{self, AttachSpec, CommandSet};
use crate::{
    ApiMode, ConsoleTool, ConsoleToolOptions, DownloadHandle, EnsureRequest, SelfprofError,
    SelfprofResult, SessionManager, SessionState, Settings, ToolArtifact, ToolResolver,
    capability::ApiBinding,
};

const PREFIX: &str = "##dotMemory";
const PRESENTABLE_NAME: &str = "dotMemory console profiler";

const COMMANDS: CommandSet = CommandSet {
    start: "start",
    stop: "stop",
    save: "get-snapshot",
    drop: "drop",
    detach: "disconnect",
    save_responses: &["snapshot-saved", "get-snapshot-error"],
};

fn runner_file_name() -> &'static str {
    if cfg!(windows) { "dotMemory.exe" } else { "dotmemory" }
}

/// Memory profiling configuration, consumed by one attach or one-shot call.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfig {
    common: CommonOptions,
    workspace_file: Option<PathBuf>,
    workspace_dir: Option<PathBuf>,
    overwrite: bool,
    log_level: Option<&'static str>,
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path of the workspace file (the snapshot storage). Mutually exclusive
    /// with `save_to_dir`.
    pub fn save_to_file(mut self, path: impl Into<PathBuf>, overwrite: bool) -> SelfprofResult<Self> {
        if self.workspace_dir.is_some() {
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
        self.workspace_file = Some(path);
        self.overwrite = overwrite;
        Ok(self)
    }

    /// Directory for the workspace file; the name is auto-generated. The
    /// directory must already exist.
    pub fn save_to_dir(mut self, dir: impl Into<PathBuf>) -> SelfprofResult<Self> {
        if self.workspace_file.is_some() {
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
        self.workspace_dir = Some(dir);
        Ok(self)
    }

    pub fn use_log_level_trace(mut self) -> Self {
        self.log_level = Some("Trace");
        self
    }

    pub fn use_log_level_verbose(mut self) -> Self {
        self.log_level = Some("Verbose");
        self
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

    fn workspace_path(&self) -> SelfprofResult<PathBuf> {
        if let Some(file) = &self.workspace_file {
            return Ok(file.clone());
        }
        let name = timestamped_output_name("dmw")?;
        match &self.workspace_dir {
            Some(dir) => Ok(dir.join(name)),
            None => Ok(std::env::temp_dir().join(name)),
        }
    }
}

/// Drives memory snapshotting of the current (or a target) process through
/// the external memory profiler. One session at most is active per facade
/// instance; independent instances share no state.
pub struct MemoryProfiler {
    settings: Settings,
    resolver: ToolResolver,
    binding: ApiBinding,
    sessions: SessionManager,
}

impl Default for MemoryProfiler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProfiler {
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Self {
        let artifact = ToolArtifact {
            name: "dotMemory".to_string(),
            version_pin: console_tools_version(),
            package_id: "JetBrains.dotMemory.Console".to_string(),
            runner_file_name: runner_file_name().to_string(),
            estimated_size: 20 * 1024 * 1024,
        };
        Self {
            settings,
            resolver: ToolResolver::new(artifact),
            binding: ApiBinding::new(),
            sessions: SessionManager::new(),
        }
    }

    /// Installation slot for the in-process memory profiler api.
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

    /// Attaches the profiler. The session stays active until `detach`.
    pub fn attach(&self, config: MemoryConfig) -> SelfprofResult<()> {
        let mut slot = self.sessions.slot();
        if slot.is_some() {
            return Err(SelfprofError::AlreadyActive);
        }

        let runner = self.resolver.runner_path()?;
        let workspace = config.workspace_path()?;
        let api = session::resolve_control(config.common.api_mode, &self.binding)?;
        let arguments = build_arguments("attach", &config, &workspace, api.is_some());

        let session = session::attach(AttachSpec {
            executable: runner,
            arguments,
            prefix: PREFIX,
            presentable_name: PRESENTABLE_NAME,
            api,
            commands: COMMANDS,
            workspace_file: Some(workspace),
            timeout: config.common.effective_timeout(&self.settings),
        })?;
        *slot = Some(session);
        Ok(())
    }

    /// Collects one memory snapshot. Through the command channel this blocks
    /// until the tool confirms the save, then returns the path it reported;
    /// through the in-process api the workspace path is returned directly.
    pub fn get_snapshot(&self, name: Option<&str>) -> SelfprofResult<PathBuf> {
        let mut slot = self.sessions.slot();
        let Some(session) = slot.as_mut() else {
            return Err(SelfprofError::NotActive);
        };

        let recorded = session.save_data(name)?;
        recorded
            .or_else(|| session.workspace_file().map(Path::to_path_buf))
            .ok_or_else(|| {
                SelfprofError::InvalidState("no snapshot output path was recorded".to_string())
            })
    }

    /// Detaches and waits for the runner to exit. The active-session slot is
    /// released whatever the outcome, so a failed detach never wedges the
    /// facade.
    pub fn detach(&self) -> SelfprofResult<PathBuf> {
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

        let workspace = session
            .workspace_file()
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                SelfprofError::InvalidState("the session has no workspace file".to_string())
            });
        result?;
        workspace
    }

    /// One-shot snapshot without a prior attach: runs the tool to completion
    /// and returns the workspace path. Never uses the in-process api.
    pub fn get_snapshot_once(&self, config: MemoryConfig) -> SelfprofResult<PathBuf> {
        let slot = self.sessions.slot();
        if slot.is_some() {
            return Err(SelfprofError::AlreadyActive);
        }

        let runner = self.resolver.runner_path()?;
        let workspace = config.workspace_path()?;
        let arguments = build_arguments("get-snapshot", &config, &workspace, false);

        let tool = ConsoleTool::start(
            &runner,
            &arguments,
            ConsoleToolOptions {
                prefix: PREFIX.to_string(),
                presentable_name: PRESENTABLE_NAME.to_string(),
                ..ConsoleToolOptions::default()
            },
        )?;
        tool.await_finished(Some(config.common.effective_timeout(&self.settings)))?;
        Ok(workspace)
    }
}

fn build_arguments(
    verb: &str,
    config: &MemoryConfig,
    workspace: &Path,
    use_api: bool,
) -> Vec<String> {
    let mut arguments = Vec::new();
    if let Some(level) = config.log_level {
        arguments.push(format!("--log-level={level}"));
    }
    if let Some(log_file) = &config.common.log_file {
        arguments.push(format!("--log-file={}", log_file.display()));
    }
    arguments.push(verb.to_string());
    arguments.push(config.common.target_pid().to_string());
    arguments.push(format!("-f={}", workspace.display()));
    if config.overwrite {
        arguments.push("--overwrite".to_string());
    }
    if use_api {
        arguments.push("--use-api".to_string());
    }
    arguments.extend(config.common.extra_arguments.iter().cloned());
    arguments
}
