//! Options shared by both facade configurations.

use time::OffsetDateTime;
use time::macros::format_description;

use std::path::PathBuf;
use std::time::Duration;

use crate::{ApiMode, SelfprofError, SelfprofResult, SemanticVersion, Settings};

/// Major.minor of the console tool packages both facades download. Patch
/// releases are resolved against the registry at download time.
pub(crate) fn console_tools_version() -> SemanticVersion {
    SemanticVersion::new(2022, 1)
}

/// Configuration fields every facade carries.
#[derive(Debug, Clone, Default)]
pub(crate) struct CommonOptions {
    /// Target process id; the current process when unset.
    pub pid: Option<u32>,
    pub api_mode: ApiMode,
    api_mode_chosen: bool,
    pub log_file: Option<PathBuf>,
    pub extra_arguments: Vec<String>,
    timeout: Option<Duration>,
}

impl CommonOptions {
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    /// Per-config timeout, falling back to the facade settings.
    pub fn effective_timeout(&self, settings: &Settings) -> Duration {
        self.timeout
            .unwrap_or_else(|| Duration::from_millis(settings.tool_timeout_ms))
    }

    /// `use_api` and `do_not_use_api` are mutually exclusive; the conflict is
    /// reported at set time, not at attach.
    pub fn choose_api_mode(&mut self, mode: ApiMode) -> SelfprofResult<()> {
        if self.api_mode_chosen {
            return Err(SelfprofError::InvalidArgument(
                "use_api and do_not_use_api are mutually exclusive".to_string(),
            ));
        }
        self.api_mode = mode;
        self.api_mode_chosen = true;
        Ok(())
    }

    pub fn target_pid(&self) -> u32 {
        self.pid.unwrap_or_else(std::process::id)
    }
}

/// Default output file name: `<process-name>.<timestamp>.<extension>`.
pub(crate) fn timestamped_output_name(extension: &str) -> SelfprofResult<String> {
    let process = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "process".to_string());
    let format =
        format_description!("[year]-[month]-[day]T[hour]-[minute]-[second].[subsecond digits:3]");
    let stamp = OffsetDateTime::now_utc().format(&format)?;
    Ok(format!("{process}.{stamp}.{extension}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_mode_can_only_be_chosen_once() {
        let mut options = CommonOptions::default();
        options.choose_api_mode(ApiMode::Require).expect("first choice");
        let err = options
            .choose_api_mode(ApiMode::Forbid)
            .expect_err("second choice must fail");
        assert!(matches!(err, SelfprofError::InvalidArgument(_)));
        assert_eq!(options.api_mode, ApiMode::Require);
    }

    #[test]
    fn output_names_carry_the_extension() {
        let name = timestamped_output_name("dmw").expect("name");
        assert!(name.ends_with(".dmw"));
        assert!(name.contains('.'));
    }
}
