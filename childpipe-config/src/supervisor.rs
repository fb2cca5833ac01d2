use std::time::Duration;

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

use crate::constants::{SYSTEM_CODE_PAGE, defaults};

/// Line terminator appended to every line written to the child.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LineEnding {
    #[default]
    Lf,
    CrLf,
}

impl LineEnding {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
        }
    }
}

/// Timing and transcoding knobs for a supervised child.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SupervisorConfig {
    /// How long teardown waits for a voluntary exit before forcing one.
    #[serde(default = "SupervisorConfig::default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Sleep between availability checks while draining and waiting.
    #[serde(default = "SupervisorConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Extra time allowed for the drainer to reach end-of-stream after exit.
    #[serde(default = "SupervisorConfig::default_drain_settle_ms")]
    pub drain_settle_ms: u64,

    /// Upper bound on bytes consumed per read.
    #[serde(default = "SupervisorConfig::default_max_read_chunk")]
    pub max_read_chunk: usize,

    /// Encoding label, Windows code page number, or `system`.
    #[serde(default = "SupervisorConfig::default_code_page")]
    pub code_page: String,

    #[serde(default)]
    pub line_ending: LineEnding,

    /// Exit code requested when teardown has to force termination.
    #[serde(default = "SupervisorConfig::default_forced_exit_code")]
    pub forced_exit_code: i32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: Self::default_grace_period_ms(),
            poll_interval_ms: Self::default_poll_interval_ms(),
            drain_settle_ms: Self::default_drain_settle_ms(),
            max_read_chunk: Self::default_max_read_chunk(),
            code_page: Self::default_code_page(),
            line_ending: LineEnding::default(),
            forced_exit_code: Self::default_forced_exit_code(),
        }
    }
}

impl SupervisorConfig {
    const fn default_grace_period_ms() -> u64 {
        defaults::GRACE_PERIOD_MS
    }

    const fn default_poll_interval_ms() -> u64 {
        defaults::POLL_INTERVAL_MS
    }

    const fn default_drain_settle_ms() -> u64 {
        defaults::DRAIN_SETTLE_MS
    }

    const fn default_max_read_chunk() -> usize {
        defaults::MAX_READ_CHUNK
    }

    fn default_code_page() -> String {
        SYSTEM_CODE_PAGE.to_string()
    }

    const fn default_forced_exit_code() -> i32 {
        defaults::FORCED_EXIT_CODE
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_settle(&self) -> Duration {
        Duration::from_millis(self.drain_settle_ms)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.poll_interval_ms > 0,
            "supervisor.poll_interval_ms must be at least 1"
        );
        ensure!(
            self.max_read_chunk > 0,
            "supervisor.max_read_chunk must be at least 1"
        );
        ensure!(
            !self.code_page.trim().is_empty(),
            "supervisor.code_page must not be empty (use \"{}\" for the platform default)",
            SYSTEM_CODE_PAGE
        );
        Ok(())
    }
}
