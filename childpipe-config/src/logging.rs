use serde::{Deserialize, Serialize};

use crate::constants::defaults;

/// Tracing filter settings used by the `childpipe` binary.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Targets the level applies to. Everything else stays at `warn`.
    #[serde(default = "default_log_targets")]
    pub targets: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            targets: default_log_targets(),
        }
    }
}

impl LoggingConfig {
    /// Render as an `EnvFilter` directive string, e.g. `warn,childpipe=info`.
    pub fn filter_directives(&self) -> String {
        let level = self.level.trim();
        let mut directives = vec!["warn".to_string()];
        directives.extend(
            self.targets
                .iter()
                .map(|target| target.trim())
                .filter(|target| !target.is_empty())
                .map(|target| format!("{target}={level}")),
        );
        directives.join(",")
    }
}

fn default_log_level() -> String {
    defaults::LOG_LEVEL.to_string()
}

fn default_log_targets() -> Vec<String> {
    defaults::LOG_TARGETS
        .iter()
        .map(|target| (*target).to_string())
        .collect()
}
