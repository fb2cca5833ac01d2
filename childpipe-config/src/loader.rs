use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{CONFIG_FILE_NAME, CONFIG_PATH_ENV};
use crate::logging::LoggingConfig;
use crate::supervisor::SupervisorConfig;

/// Root of `childpipe.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChildpipeConfig {
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ChildpipeConfig {
    pub fn validate(&self) -> Result<()> {
        self.supervisor
            .validate()
            .context("Invalid supervisor configuration")
    }
}

/// Resolves, parses, and validates the configuration file.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: ChildpipeConfig,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration from the default locations.
    ///
    /// `CHILDPIPE_CONFIG_PATH` wins when set; otherwise `childpipe.toml` in the
    /// current directory is used if present, and built-in defaults if not.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var(CONFIG_PATH_ENV).ok();
        Self::resolve(explicit.as_deref(), &std::env::current_dir()?)
    }

    /// Load configuration from a specific file. The file must exist.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: ChildpipeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Failed to validate config file: {}", path.display()))?;

        debug!(path = %path.display(), "loaded configuration");
        Ok(Self {
            config,
            config_path: Some(path.to_path_buf()),
        })
    }

    fn resolve(explicit: Option<&str>, workspace: &Path) -> Result<Self> {
        if let Some(config_path) = explicit {
            let trimmed = config_path.trim();
            if !trimmed.is_empty() {
                return Self::load_from_file(trimmed).with_context(|| {
                    format!(
                        "Failed to load configuration from {}={}",
                        CONFIG_PATH_ENV, trimmed
                    )
                });
            }
        }

        let candidate = workspace.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Self::load_from_file(candidate);
        }

        Ok(Self {
            config: ChildpipeConfig::default(),
            config_path: None,
        })
    }

    pub fn config(&self) -> &ChildpipeConfig {
        &self.config
    }

    pub fn into_config(self) -> ChildpipeConfig {
        self.config
    }

    /// File the configuration came from, if any.
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::LineEnding;
    use assert_fs::TempDir;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let workspace = TempDir::new().expect("failed to create temp dir");
        let manager = ConfigManager::resolve(None, workspace.path()).expect("defaults");
        assert_eq!(manager.config(), &ChildpipeConfig::default());
        assert!(manager.config_path().is_none());
    }

    #[test]
    fn workspace_file_is_picked_up() {
        let workspace = TempDir::new().expect("failed to create temp dir");
        let path = workspace.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            r#"
[supervisor]
grace_period_ms = 250
code_page = "windows-1252"
line_ending = "crlf"

[logging]
level = "debug"
"#,
        )
        .expect("failed to write config");

        let manager = ConfigManager::resolve(None, workspace.path()).expect("workspace config");
        let config = manager.config();
        assert_eq!(config.supervisor.grace_period_ms, 250);
        assert_eq!(config.supervisor.code_page, "windows-1252");
        assert_eq!(config.supervisor.line_ending, LineEnding::CrLf);
        assert_eq!(config.supervisor.poll_interval_ms, 10);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(manager.config_path(), Some(path.as_path()));
    }

    #[test]
    fn explicit_path_overrides_workspace() {
        let workspace = TempDir::new().expect("failed to create temp dir");
        fs::write(
            workspace.path().join(CONFIG_FILE_NAME),
            "[supervisor]\ngrace_period_ms = 5\n",
        )
        .expect("failed to write workspace config");

        let explicit = workspace.path().join("custom.toml");
        fs::write(&explicit, "[supervisor]\ngrace_period_ms = 7\n")
            .expect("failed to write explicit config");

        let manager = ConfigManager::resolve(explicit.to_str(), workspace.path())
            .expect("explicit config");
        assert_eq!(manager.config().supervisor.grace_period_ms, 7);
    }

    #[test]
    fn blank_explicit_path_is_ignored() {
        let workspace = TempDir::new().expect("failed to create temp dir");
        let manager = ConfigManager::resolve(Some("  "), workspace.path()).expect("defaults");
        assert!(manager.config_path().is_none());
    }

    #[test]
    fn invalid_values_are_reported_with_the_path() {
        let workspace = TempDir::new().expect("failed to create temp dir");
        let path = workspace.path().join("bad.toml");
        fs::write(&path, "[supervisor]\npoll_interval_ms = 0\n").expect("failed to write config");

        let err = ConfigManager::load_from_file(&path).expect_err("zero poll interval");
        let message = format!("{err:#}");
        assert!(message.contains("bad.toml"));
        assert!(message.contains("poll_interval_ms"));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let workspace = TempDir::new().expect("failed to create temp dir");
        let missing = workspace.path().join("nope.toml");
        let result = ConfigManager::resolve(missing.to_str(), workspace.path());
        assert!(result.is_err());
    }
}
