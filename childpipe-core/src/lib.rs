//! Supervise a single child process over anonymous pipes.
//!
//! The child's stdout and stderr are merged onto one pipe that a worker thread
//! drains without blocking, decoding the bytes with a configurable code page
//! and handing the text to an [`OutputSink`]. Lines written through the
//! supervisor are encoded with the same code page and fed to the child's stdin.
//!
//! ```no_run
//! use childpipe_config::SupervisorConfig;
//! use childpipe_core::{LaunchSpec, ProcessSupervisor, WaitOutcome};
//!
//! # fn main() -> childpipe_core::Result<()> {
//! let spec = LaunchSpec::from_argv(["cat"]);
//! let supervisor = ProcessSupervisor::spawn(&spec, &SupervisorConfig::default())?;
//! supervisor.write_input("hello")?;
//! supervisor.close_input()?;
//! if supervisor.wait(None)? == WaitOutcome::Exited {
//!     println!("exit code {}", supervisor.exit_code()?);
//! }
//! supervisor.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod drain;
pub mod error;
pub mod launcher;
pub mod pipe;
pub mod process_group;
pub mod sink;
pub mod supervisor;
pub mod writer;

pub use codec::{StreamDecoder, TextCodec};
pub use drain::{DrainOptions, DrainShared, DrainState, DrainTask, OutputDrainer, StepOutcome};
pub use error::{Result, SupervisorError};
pub use launcher::{EnvPolicy, LaunchSpec, ProcessHandle, executable_dir, launch};
pub use pipe::DuplexPipe;
pub use sink::{BufferSink, OutputSink, TeeSink, TracingSink};
pub use supervisor::{ProcessSupervisor, SupervisorStatus, TeardownReport, WaitOutcome};
pub use writer::InputWriter;
