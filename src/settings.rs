//! `selfprof.toml` settings loading.

use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};

use crate::RegistryApi;

/// Ambient overrides for the facades. All fields are optional; the built-in
/// defaults match the public registry and the OS cache directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Settings {
    /// Registry base URL. `None` selects the default URL of `registry_api`.
    #[serde(default)]
    pub registry_url: Option<String>,

    /// Registry resolution flow.
    #[serde(default = "default_registry_api")]
    pub registry_api: RegistryApi,

    /// Root directory for downloaded runners. `None` selects the OS cache dir.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Default timeout for tool waits, in milliseconds.
    #[serde(default = "default_tool_timeout_ms")]
    pub tool_timeout_ms: u64,
}

fn default_registry_api() -> RegistryApi {
    RegistryApi::V3
}

fn default_tool_timeout_ms() -> u64 {
    30_000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            registry_url: None,
            registry_api: default_registry_api(),
            cache_dir: None,
            tool_timeout_ms: default_tool_timeout_ms(),
        }
    }
}

impl Settings {
    pub fn load_optional(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(s) => match toml::from_str::<Settings>(&s) {
                Ok(settings) => settings,
                Err(err) => {
                    tracing::warn!("failed to parse settings {}: {err}", path.display());
                    Self::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                tracing::warn!("failed to read settings {}: {err}", path.display());
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn missing_file_yields_defaults() {
        let path = std::env::temp_dir().join(format!("selfprof-settings-{}.toml", Uuid::new_v4()));
        let settings = Settings::load_optional(&path);
        assert_eq!(settings.tool_timeout_ms, 30_000);
        assert!(settings.registry_url.is_none());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let path = std::env::temp_dir().join(format!("selfprof-settings-{}.toml", Uuid::new_v4()));
        std::fs::write(&path, "registry_url = \"http://localhost:9999/v3/index.json\"\n")
            .expect("write settings");
        let settings = Settings::load_optional(&path);
        assert_eq!(
            settings.registry_url.as_deref(),
            Some("http://localhost:9999/v3/index.json")
        );
        assert_eq!(settings.tool_timeout_ms, 30_000);
        std::fs::remove_file(&path).ok();
    }
}
