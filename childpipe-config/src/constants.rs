/// Environment variable naming an explicit configuration file.
pub const CONFIG_PATH_ENV: &str = "CHILDPIPE_CONFIG_PATH";

/// File looked up in the working directory when no explicit path is given.
pub const CONFIG_FILE_NAME: &str = "childpipe.toml";

/// Code page value that resolves to the platform's active code page.
pub const SYSTEM_CODE_PAGE: &str = "system";

pub mod defaults {
    pub const GRACE_PERIOD_MS: u64 = 1_000;
    pub const POLL_INTERVAL_MS: u64 = 10;
    pub const DRAIN_SETTLE_MS: u64 = 500;
    pub const MAX_READ_CHUNK: usize = 64 * 1024;
    pub const FORCED_EXIT_CODE: i32 = 1;
    pub const LOG_LEVEL: &str = "info";
    pub const LOG_TARGETS: &[&str] = &["childpipe", "childpipe_core"];
}
