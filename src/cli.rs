use std::path::PathBuf;

use clap::Parser;

/// Input sent to the demo child when none is given on the command line.
pub const DEFAULT_DEMO_INPUT: &str = "this_is_message_from_parent_process";

/// Arguments passed to the demo child, exercising quoting of embedded spaces.
pub const DEMO_CHILD_ARGS: [&str; 3] = ["aa a", "bb", "b"];

#[derive(Debug, Parser)]
#[command(name = "childpipe")]
#[command(about = "Run a child process over anonymous pipes and relay its output")]
#[command(version)]
pub struct Cli {
    /// Configuration file (defaults to CHILDPIPE_CONFIG_PATH, then ./childpipe.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Code page used for the child's input and output (label, number, or "system")
    #[arg(long, value_name = "CP")]
    pub code_page: Option<String>,

    /// Grace period in milliseconds before teardown forces termination
    #[arg(long, value_name = "MS")]
    pub grace_ms: Option<u64>,

    /// Give up waiting for the child after this many milliseconds
    #[arg(long, value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Line to send to the child's stdin (can be repeated)
    #[arg(long = "input", value_name = "TEXT")]
    pub inputs: Vec<String>,

    /// Close the child's stdin after sending input
    #[arg(long)]
    pub close_input: bool,

    /// Kill the child when the wait times out instead of leaving it to teardown
    #[arg(long)]
    pub kill_on_timeout: bool,

    /// Command to run; without one the bundled childpipe-echo helper is launched
    #[arg(last = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl Cli {
    pub fn is_demo(&self) -> bool {
        self.command.is_empty()
    }

    /// Lines to feed the child, falling back to the demo message for the
    /// bundled helper.
    pub fn input_lines(&self) -> Vec<String> {
        if self.inputs.is_empty() && self.is_demo() {
            vec![DEFAULT_DEMO_INPUT.to_string()]
        } else {
            self.inputs.clone()
        }
    }
}
