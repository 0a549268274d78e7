//! Selfprof core library: download, launch, and drive an external console
//! profiler against the running application, and collect what it produces.

mod artifact;
mod cancel;
mod capability;
mod common;
pub mod elf;
mod error;
mod memory;
mod platform;
mod progress;
pub mod protocol;
mod registry;
mod semver;
mod session;
mod settings;
mod snapshots;
mod timeline;
mod transport;

pub use artifact::{DownloadHandle, EnsureRequest, ToolArtifact, ToolResolver};
pub use cancel::CancelToken;
pub use capability::{ApiBinding, ApiMode, ProfilerApi};
pub use error::{SelfprofError, SelfprofResult, ToolOutput};
pub use memory::{MemoryConfig, MemoryProfiler};
pub use platform::{Architecture, HostInfo, LibcFlavor, Platform, host};
pub use progress::{NoProgress, Progress, SubProgress};
pub use registry::{RegistryApi, ResolvedPackage};
pub use semver::SemanticVersion;
pub use session::{CommandSet, Session, SessionManager, SessionState};
pub use settings::Settings;
pub use snapshots::{SnapshotLedger, SnapshotSink, snapshot_files};
pub use timeline::{TimelineConfig, TimelineProfiler};
pub use transport::{ConsoleTool, ConsoleToolOptions, MatchedResponse, ResponseProcessor};
