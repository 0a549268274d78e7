//! Versioned runner artifact cache, download coalescing, and unpacking.

use uuid::Uuid;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::transport::POLL_INTERVAL;
use crate::{
    CancelToken, NoProgress, Platform, Progress, RegistryApi, SelfprofError, SelfprofResult,
    SemanticVersion, SubProgress, platform, registry,
};

const READY_MARKER: &str = ".ready";
const TOOLS_PREFIX: &str = "tools/";
const DOWNLOAD_WEIGHT: f64 = 0.8;
const UNPACK_WEIGHT: f64 = 1.0 - DOWNLOAD_WEIGHT;

/// A downloadable external tool, constructed once per facade and immutable
/// afterwards.
#[derive(Debug, Clone)]
pub struct ToolArtifact {
    /// Logical id, also the cache folder name (e.g. `dotMemory`).
    pub name: String,
    /// Pinned major.minor; the registry's latest matching patch is used.
    pub version_pin: SemanticVersion,
    /// Registry package name, qualified with the runtime id at download time.
    pub package_id: String,
    /// Platform-dependent runner executable name.
    pub runner_file_name: String,
    /// Fallback size for progress weighting when the registry omits the
    /// content length.
    pub estimated_size: u64,
}

/// Inputs for one `ensure_ready` call. Everything is optional; defaults are
/// the public registry, the OS cache root, and no progress reporting.
#[derive(Default)]
pub struct EnsureRequest {
    pub progress: Option<Arc<dyn Progress>>,
    pub registry_url: Option<String>,
    pub registry_api: Option<RegistryApi>,
    pub dest_dir: Option<PathBuf>,
    pub cancel: Option<CancelToken>,
}

/// Completion slot shared between the download thread and any number of
/// waiters. `None` means still running.
#[derive(Clone)]
pub struct DownloadHandle {
    inner: Arc<DownloadShared>,
}

struct DownloadShared {
    tool: String,
    outcome: Mutex<Option<SelfprofResult<()>>>,
}

impl DownloadHandle {
    fn pending(tool: &str) -> Self {
        Self {
            inner: Arc::new(DownloadShared {
                tool: tool.to_string(),
                outcome: Mutex::new(None),
            }),
        }
    }

    fn ready(tool: &str) -> Self {
        let handle = Self::pending(tool);
        handle.complete(Ok(()));
        handle
    }

    fn complete(&self, result: SelfprofResult<()>) {
        *lock(&self.inner.outcome) = Some(result);
    }

    pub fn is_finished(&self) -> bool {
        lock(&self.inner.outcome).is_some()
    }

    /// Polls the completion slot at the fixed interval until the task ends or
    /// the timeout elapses. `None` waits forever. Timeout surfaces as
    /// `NotReady`; a failed task hands every waiter the failure.
    pub fn wait(&self, timeout: Option<std::time::Duration>) -> SelfprofResult<()> {
        let start = Instant::now();
        loop {
            if let Some(result) = lock(&self.inner.outcome).as_ref() {
                return match result {
                    Ok(()) => Ok(()),
                    Err(err) => Err(clone_for_waiter(err)),
                };
            }
            if let Some(limit) = timeout
                && start.elapsed() >= limit
            {
                return Err(SelfprofError::NotReady(self.inner.tool.clone()));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

/// The failure of a shared download task is observed by every waiter;
/// variants that can come out of the download path are rebuilt by value.
fn clone_for_waiter(err: &SelfprofError) -> SelfprofError {
    match err {
        SelfprofError::Cancelled => SelfprofError::Cancelled,
        SelfprofError::DownloadFailed { url, source } => SelfprofError::DownloadFailed {
            url: url.clone(),
            source: source.to_string().into(),
        },
        SelfprofError::PackageMalformed(msg) => SelfprofError::PackageMalformed(msg.clone()),
        SelfprofError::PlatformUnsupported(msg) => SelfprofError::PlatformUnsupported(msg.clone()),
        SelfprofError::Zip(msg) => SelfprofError::Zip(msg.clone()),
        SelfprofError::Io(io) => SelfprofError::Io(std::io::Error::new(io.kind(), io.to_string())),
        other => SelfprofError::Io(std::io::Error::other(other.to_string())),
    }
}

/// Resolves one artifact to a runnable local path, downloading at most once.
pub struct ToolResolver {
    artifact: ToolArtifact,
    state: Mutex<ResolverState>,
}

#[derive(Default)]
struct ResolverState {
    task: Option<DownloadHandle>,
    dest_hint: Option<PathBuf>,
}

impl ToolResolver {
    pub fn new(artifact: ToolArtifact) -> Self {
        Self {
            artifact,
            state: Mutex::new(ResolverState::default()),
        }
    }

    pub fn artifact(&self) -> &ToolArtifact {
        &self.artifact
    }

    /// Makes sure a matching runner is available locally, starting a
    /// background download when it is not. A second call while a download is
    /// running joins the same task instead of starting another; a finished
    /// failed task is retried from scratch.
    pub fn ensure_ready(&self, request: EnsureRequest) -> SelfprofResult<DownloadHandle> {
        let mut state = lock(&self.state);

        if let Some(task) = &state.task
            && !task.is_finished()
        {
            tracing::debug!(tool = %self.artifact.name, "download task already running");
            return Ok(task.clone());
        }

        state.task = None;
        state.dest_hint = request.dest_dir.clone();

        if self.find_runner(request.dest_dir.as_deref())?.is_some() {
            tracing::debug!(tool = %self.artifact.name, "runner found, no download needed");
            let handle = DownloadHandle::ready(&self.artifact.name);
            state.task = Some(handle.clone());
            return Ok(handle);
        }

        tracing::info!(tool = %self.artifact.name, "runner not found, starting download");
        let handle = DownloadHandle::pending(&self.artifact.name);
        state.task = Some(handle.clone());

        let artifact = self.artifact.clone();
        let registry_api = request.registry_api.unwrap_or(RegistryApi::V3);
        let registry_url = request
            .registry_url
            .unwrap_or_else(|| registry_api.default_url().to_string());
        let root = request.dest_dir.unwrap_or_else(default_cache_root);
        let progress: Arc<dyn Progress> = request
            .progress
            .unwrap_or_else(|| Arc::new(NoProgress));
        let cancel = request.cancel.unwrap_or_default();

        let task = handle.clone();
        std::thread::Builder::new()
            .name(format!("selfprof-download-{}", self.artifact.name))
            .spawn(move || {
                let result =
                    download_and_unpack(&artifact, &registry_url, registry_api, &root, &*progress, &cancel);
                if let Err(err) = &result {
                    tracing::warn!(tool = %artifact.name, "download failed: {err}");
                }
                task.complete(result);
            })?;

        Ok(handle)
    }

    /// Path of the resolved runner. Requires a prior `ensure_ready` whose
    /// task has completed; only a short poll is performed here, never a full
    /// wait.
    pub fn runner_path(&self) -> SelfprofResult<PathBuf> {
        let (task, hint) = {
            let state = lock(&self.state);
            let Some(task) = state.task.clone() else {
                return Err(SelfprofError::NotReady(self.artifact.name.clone()));
            };
            (task, state.dest_hint.clone())
        };

        task.wait(Some(POLL_INTERVAL))?;

        self.find_runner(hint.as_deref())?.ok_or_else(|| {
            SelfprofError::InvalidState(format!(
                "the {} runner was not found after download",
                self.artifact.name
            ))
        })
    }

    /// Probes, in order: the explicit destination hint, the directory next to
    /// the running executable, and the default cache root. Hint and cache
    /// probes use the versioned layout and require the ready sentinel.
    fn find_runner(&self, hint: Option<&Path>) -> SelfprofResult<Option<PathBuf>> {
        let qualifier = platform::host()?.runtime_qualifier();

        if let Some(hint) = hint
            && let Some(path) = self.probe_root(hint, &qualifier)?
        {
            return Ok(Some(path));
        }

        if let Ok(exe) = std::env::current_exe()
            && let Some(dir) = exe.parent()
        {
            let nearby = dir.join(&self.artifact.runner_file_name);
            tracing::trace!(path = %nearby.display(), "probing nearby runner");
            if nearby.is_file() {
                return Ok(Some(nearby));
            }
        }

        self.probe_root(&default_cache_root(), &qualifier)
    }

    fn probe_root(&self, root: &Path, qualifier: &str) -> SelfprofResult<Option<PathBuf>> {
        let tool_dir = root.join(&self.artifact.name);
        let entries = match std::fs::read_dir(&tool_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut candidates = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(ver) = SemanticVersion::parse(&name)
                && ver.pin_matches(&self.artifact.version_pin)
            {
                candidates.push((ver, name));
            }
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, name) in candidates {
            let version_dir = tool_dir.join(&name);
            let runner = version_dir.join(qualifier).join(&self.artifact.runner_file_name);
            tracing::trace!(path = %runner.display(), "probing cached runner");
            if version_dir.join(READY_MARKER).is_file() && runner.is_file() {
                return Ok(Some(runner));
            }
        }
        Ok(None)
    }
}

fn default_cache_root() -> PathBuf {
    let base = if cfg!(windows) {
        std::env::var_os("LOCALAPPDATA").map(PathBuf::from)
    } else {
        std::env::var_os("XDG_CACHE_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache")))
    };
    base.unwrap_or_else(std::env::temp_dir).join("selfprof")
}

fn download_and_unpack(
    artifact: &ToolArtifact,
    registry_url: &str,
    registry_api: RegistryApi,
    root: &Path,
    progress: &dyn Progress,
    cancel: &CancelToken,
) -> SelfprofResult<()> {
    let host = platform::host()?;
    let qualifier = host.runtime_qualifier();
    let package_id = format!("{}.{}", artifact.package_id, qualifier);

    let resolved = registry::resolve(registry_url, registry_api, &package_id, &artifact.version_pin)?;
    tracing::info!(
        tool = %artifact.name,
        version = %resolved.version,
        url = %resolved.content_url,
        "resolved package"
    );

    let version_dir = root.join(&artifact.name).join(&resolved.version);
    let ready_marker = version_dir.join(READY_MARKER);
    if ready_marker.is_file() {
        tracing::debug!(tool = %artifact.name, version = %resolved.version, "already downloaded");
        return Ok(());
    }
    std::fs::create_dir_all(&version_dir)?;

    let archive_path = version_dir.join(format!("{}.{}.nupkg", package_id, Uuid::new_v4()));
    let download_progress = SubProgress::new(progress, DOWNLOAD_WEIGHT);
    let result = registry::download_to_file(
        &resolved.content_url,
        &archive_path,
        artifact.estimated_size,
        &download_progress,
        cancel,
    )
    .and_then(|()| {
        let unpack_progress = SubProgress::new(progress, UNPACK_WEIGHT);
        unpack_tools(
            &archive_path,
            &version_dir.join(&qualifier),
            &unpack_progress,
            host.platform,
        )
    });

    // The archive is transient either way; the sentinel is only written after
    // a fully successful unpack so interrupted runs stay not-ready.
    std::fs::remove_file(&archive_path).ok();
    result?;

    std::fs::File::create(&ready_marker)?;
    tracing::info!(tool = %artifact.name, version = %resolved.version, "runner ready");
    Ok(())
}

fn unpack_tools(
    archive_path: &Path,
    dest: &Path,
    progress: &dyn Progress,
    platform: Platform,
) -> SelfprofResult<()> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let tool_entries: Vec<String> = archive
        .file_names()
        .filter(|name| {
            name.len() > TOOLS_PREFIX.len()
                && name
                    .get(..TOOLS_PREFIX.len())
                    .is_some_and(|prefix| prefix.eq_ignore_ascii_case(TOOLS_PREFIX))
        })
        .map(String::from)
        .collect();
    if tool_entries.is_empty() {
        return Err(SelfprofError::PackageMalformed(
            "no tools/ folder inside the package".to_string(),
        ));
    }

    let mut total_size = 0u64;
    for name in &tool_entries {
        total_size += archive.by_name(name)?.size();
    }
    let total_size = total_size.max(1);

    for name in &tool_entries {
        let rel = &name[TOOLS_PREFIX.len()..];
        if rel.split('/').any(|part| part == "..") {
            return Err(SelfprofError::PackageMalformed(format!(
                "entry escapes the package root: {name}"
            )));
        }

        let dst = dest.join(rel);
        if name.ends_with('/') {
            std::fs::create_dir_all(&dst)?;
            continue;
        }
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut entry = archive.by_name(name)?;
        tracing::trace!(entry = name.as_str(), dst = %dst.display(), "unpacking");
        let mut out = std::fs::File::create(&dst)?;
        std::io::copy(&mut entry, &mut out)?;

        if platform != Platform::Windows {
            make_executable(&dst)?;
        }

        progress.advance(100.0 * entry.size() as f64 / total_size as f64);
    }

    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
