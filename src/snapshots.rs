//! Collected snapshot bookkeeping: recording, listing, zip packaging.

use globset::Glob;
use time::OffsetDateTime;
use time::macros::format_description;
use walkdir::WalkDir;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::{ResponseProcessor, SelfprofError, SelfprofResult, protocol, transport};

/// Records the index file reported by every `snapshot-saved` message, in
/// arrival order. Installed as the transport's response processor so the
/// recording happens inline with output reading.
#[derive(Default)]
pub struct SnapshotSink {
    index_files: Mutex<Vec<PathBuf>>,
}

impl SnapshotSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collected(&self) -> Vec<PathBuf> {
        lock(&self.index_files).clone()
    }

    pub(crate) fn count(&self) -> usize {
        lock(&self.index_files).len()
    }

    pub(crate) fn nth(&self, index: usize) -> Option<PathBuf> {
        lock(&self.index_files).get(index).cloned()
    }
}

impl ResponseProcessor for SnapshotSink {
    fn process(&self, command: &str, args: Option<&str>) {
        if !command.eq_ignore_ascii_case("snapshot-saved") {
            return;
        }
        let Some(args) = args else {
            return;
        };
        if let Some(filename) = protocol::string_field(args, "filename") {
            tracing::debug!(filename = filename.as_str(), "snapshot recorded");
            lock(&self.index_files).push(PathBuf::from(filename));
        }
    }
}

/// Facade-level bookkeeping of collected index files, carried across a
/// session's detach. Entries are never removed: packaging marks a prefix as
/// packed and optionally hides deleted entries from listings, so already
/// packed files cannot be requested twice.
#[derive(Default)]
pub struct SnapshotLedger {
    index_files: Vec<PathBuf>,
    hidden: HashSet<PathBuf>,
    packed_count: usize,
}

impl SnapshotLedger {
    /// Called at attach: a new engagement starts with empty bookkeeping.
    pub fn reset(&mut self) {
        self.index_files.clear();
        self.hidden.clear();
        self.packed_count = 0;
    }

    /// Replaces the list with the sink's current view. Appending saves only
    /// grow the list, so the packed prefix stays valid.
    pub fn sync(&mut self, collected: Vec<PathBuf>) {
        self.index_files = collected;
    }

    /// Index files not hidden by a delete-after-pack.
    pub fn visible(&self) -> Vec<PathBuf> {
        self.index_files
            .iter()
            .filter(|f| !self.hidden.contains(*f))
            .cloned()
            .collect()
    }

    /// Packs every not-yet-packed snapshot (index file plus its sibling
    /// artifacts) into one zip next to the first packed index file. Returns
    /// `None` when there is nothing new to pack.
    pub fn archive(&mut self, delete_sources: bool) -> SelfprofResult<Option<PathBuf>> {
        if self.packed_count >= self.index_files.len() {
            return Ok(None);
        }

        let first = &self.index_files[self.packed_count];
        let directory = parent_or_cwd(first);
        let stem = first
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "snapshots".to_string());
        let zip_path = unique_archive_path(&directory, &stem)?;

        let mut packed_files = Vec::new();
        let mut packed_index_files = Vec::new();

        let out = std::fs::File::create(&zip_path)?;
        let mut zip = zip::ZipWriter::new(out);
        let options = zip::write::SimpleFileOptions::default();

        for index_file in &self.index_files[self.packed_count..] {
            packed_index_files.push(index_file.clone());
            for file in snapshot_files(index_file)? {
                let entry_name = file
                    .file_name()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                tracing::debug!(file = %file.display(), "packing");
                zip.start_file(entry_name, options)?;
                let mut input = std::fs::File::open(&file)?;
                std::io::copy(&mut input, &mut zip)?;
                packed_files.push(file);
            }
        }
        zip.finish()?;

        if delete_sources {
            for file in &packed_files {
                std::fs::remove_file(file).ok();
            }
            self.hidden.extend(packed_index_files);
        }

        self.packed_count = self.index_files.len();
        Ok(Some(zip_path))
    }
}

/// All files belonging to one snapshot: the index file itself plus every
/// sibling named `<index-file-name>.*` in the same directory.
pub fn snapshot_files(index_file: &Path) -> SelfprofResult<Vec<PathBuf>> {
    let directory = parent_or_cwd(index_file);
    let name = index_file
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let matcher = Glob::new(&format!("{name}.*"))
        .map_err(|e| SelfprofError::InvalidArgument(format!("invalid snapshot pattern: {e}")))?
        .compile_matcher();

    let mut out = Vec::new();
    if index_file.is_file() {
        out.push(index_file.to_path_buf());
    }
    for entry in WalkDir::new(&directory).max_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| {
            let msg = e.to_string();
            SelfprofError::Io(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other(msg)),
            )
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if matcher.is_match(Path::new(&entry.file_name())) {
            out.push(entry.path().to_path_buf());
        }
    }
    out.sort();
    out.dedup();
    Ok(out)
}

fn parent_or_cwd(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn unique_archive_path(directory: &Path, stem: &str) -> SelfprofResult<PathBuf> {
    let format =
        format_description!("[year]-[month]-[day]T[hour]-[minute]-[second].[subsecond digits:3]");
    for _ in 0..10 {
        let stamp = OffsetDateTime::now_utc().format(&format)?;
        let candidate = directory.join(format!("{stem}-{stamp}.zip"));
        if !candidate.exists() {
            return Ok(candidate);
        }
        std::thread::sleep(transport::POLL_INTERVAL);
    }
    Err(SelfprofError::Io(std::io::Error::other(
        "unable to pick a unique archive file name",
    )))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
