//! Crate-wide error types.

use thiserror::Error;

use std::fmt;

pub type SelfprofResult<T> = Result<T, SelfprofError>;

/// Output captured from the console tool's standard streams, attached to
/// timeout and exit failures so they can be diagnosed without a re-run.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl fmt::Display for ToolOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "*** standard error ***")?;
        for line in &self.stderr {
            writeln!(f, "{line}")?;
        }
        writeln!(f)?;
        writeln!(f, "*** standard output ***")?;
        for line in &self.stdout {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SelfprofError {
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("the {0} runner is not ready: call ensure_ready and let it finish")]
    NotReady(String),

    #[error("the in-process profiler api is not available")]
    ApiUnavailable,

    #[error("a profiling session is already active")]
    AlreadyActive,

    #[error("no profiling session is active")]
    NotActive,

    #[error("unable to start {tool}: {source}")]
    LaunchFailed {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("the {tool} {what}; see details below\n{output}")]
    Timeout {
        tool: String,
        what: String,
        output: ToolOutput,
    },

    #[error("the {tool} exited with code {code}; see details below\n{output}")]
    NonZeroExit {
        tool: String,
        code: i32,
        output: ToolOutput,
    },

    #[error("download failed from {url}: {source}")]
    DownloadFailed {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("package malformed: {0}")]
    PackageMalformed(String),

    #[error("the download was cancelled")]
    Cancelled,

    #[error("unsupported platform: {0}")]
    PlatformUnsupported(String),

    #[error("zip error: {0}")]
    Zip(String),

    #[error("time format error: {0}")]
    TimeFormat(#[from] time::error::Format),
}

impl From<zip::result::ZipError> for SelfprofError {
    fn from(value: zip::result::ZipError) -> Self {
        Self::Zip(value.to_string())
    }
}
