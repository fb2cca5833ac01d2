//! Configuration for the childpipe supervisor.
//!
//! Settings live in a TOML file with a `[supervisor]` table and a `[logging]`
//! table. Every field has a default, so an empty or missing file is valid.
//! [`ConfigManager`] resolves which file to read.

pub mod constants;
pub mod loader;
pub mod logging;
pub mod supervisor;

pub use loader::{ChildpipeConfig, ConfigManager};
pub use logging::LoggingConfig;
pub use supervisor::{LineEnding, SupervisorConfig};
