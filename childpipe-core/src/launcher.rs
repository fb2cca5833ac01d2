//! Launching the supervised child with its stdio bound to pipe ends.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use os_pipe::{PipeReader, PipeWriter};
use tracing::{debug, info};

use crate::error::{Result, SupervisorError};
use crate::process_group;

/// Environment handed to the child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EnvPolicy {
    /// Inherit the parent's environment unchanged.
    #[default]
    Inherit,
    /// Inherit, then set or override the given variables.
    Overlay(HashMap<String, String>),
    /// Start from an empty environment containing only the given variables.
    Replace(HashMap<String, String>),
}

/// Immutable description of the program to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    command_line: String,
    working_dir: Option<PathBuf>,
    env: EnvPolicy,
}

impl LaunchSpec {
    /// A full command line: the program followed by its arguments, quoted the
    /// way the platform's argument parser expects.
    pub fn new(command_line: impl Into<String>) -> Self {
        Self {
            command_line: command_line.into(),
            working_dir: None,
            env: EnvPolicy::Inherit,
        }
    }

    /// Build the command line from an argument vector, quoting as needed.
    pub fn from_argv<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let parts: Vec<String> = argv
            .into_iter()
            .map(|arg| quote_arg(arg.as_ref()))
            .collect();
        Self::new(parts.join(" "))
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set one variable on top of the inherited (or replaced) environment.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        match &mut self.env {
            EnvPolicy::Inherit => {
                let mut vars = HashMap::new();
                vars.insert(key.into(), value.into());
                self.env = EnvPolicy::Overlay(vars);
            }
            EnvPolicy::Overlay(vars) | EnvPolicy::Replace(vars) => {
                vars.insert(key.into(), value.into());
            }
        }
        self
    }

    pub fn env_policy(mut self, env: EnvPolicy) -> Self {
        self.env = env;
        self
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn working_directory(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    pub fn env(&self) -> &EnvPolicy {
        &self.env
    }

    fn build_command(&self) -> io::Result<Command> {
        let mut command = program_command(&self.command_line)?;

        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        match &self.env {
            EnvPolicy::Inherit => {}
            EnvPolicy::Overlay(vars) => {
                command.envs(vars);
            }
            EnvPolicy::Replace(vars) => {
                command.env_clear();
                command.envs(vars);
            }
        }

        Ok(command)
    }
}

impl fmt::Display for LaunchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line)
    }
}

/// A live child process. The OS handle is released when this is dropped.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    child: Child,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }
}

/// Start `spec` with stdout and stderr writing into `stdout_write_end` and stdin
/// reading from `stdin_read_end`.
///
/// Both ends are consumed: the parent's copies are closed as soon as the child
/// holds its own, so end-of-stream is observed once the child (and anything it
/// spawned) exits. On failure the ends are closed as well; the caller still owns
/// and must release the opposite ends.
pub fn launch(
    spec: &LaunchSpec,
    stdout_write_end: PipeWriter,
    stdin_read_end: PipeReader,
) -> Result<ProcessHandle> {
    let launch_error = |source: io::Error| SupervisorError::Launch {
        command: spec.command_line.clone(),
        source,
    };

    info!("Launch: {}", spec.command_line);

    let stderr_write_end = stdout_write_end
        .try_clone()
        .map_err(|source| SupervisorError::PipeCreation { source })?;

    let mut command = spec.build_command().map_err(launch_error)?;
    command
        .stdin(Stdio::from(stdin_read_end))
        .stdout(Stdio::from(stdout_write_end))
        .stderr(Stdio::from(stderr_write_end));

    configure_platform(&mut command);

    let spawned = command.spawn();
    // Dropping the command closes the parent's copies of the child-side ends.
    drop(command);
    let child = spawned.map_err(launch_error)?;

    let pid = child.id();
    debug!(pid, "child process started");
    Ok(ProcessHandle { pid, child })
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn configure_platform(command: &mut Command) {
    use std::os::unix::process::CommandExt;

    unsafe {
        command.pre_exec(process_group::set_process_group);
    }
}

#[cfg(windows)]
fn configure_platform(command: &mut Command) {
    use std::os::windows::process::CommandExt;

    command.creation_flags(winapi::um::winbase::CREATE_NO_WINDOW);
}

#[cfg(not(any(unix, windows)))]
fn configure_platform(_command: &mut Command) {}

#[cfg(not(windows))]
fn program_command(command_line: &str) -> io::Result<Command> {
    let argv = shell_words::split(command_line)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;
    let mut command = Command::new(program);
    command.args(args);
    Ok(command)
}

/// Windows children parse their own command line, so only the program token
/// is split off and the remainder is passed through untouched.
#[cfg(windows)]
fn program_command(command_line: &str) -> io::Result<Command> {
    use std::os::windows::process::CommandExt;

    let (program, rest) = split_program(command_line)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;
    let mut command = Command::new(program);
    if !rest.is_empty() {
        command.raw_arg(rest);
    }
    Ok(command)
}

#[cfg(any(windows, test))]
fn split_program(command_line: &str) -> Option<(&str, &str)> {
    let line = command_line.trim_start();
    if line.is_empty() {
        return None;
    }
    let (program, rest) = if let Some(quoted) = line.strip_prefix('"') {
        match quoted.find('"') {
            Some(end) => (&quoted[..end], &quoted[end + 1..]),
            None => (quoted, ""),
        }
    } else {
        match line.find(char::is_whitespace) {
            Some(end) => (&line[..end], &line[end..]),
            None => (line, ""),
        }
    };
    Some((program, rest.trim_start()))
}

#[cfg(not(windows))]
fn quote_arg(arg: &str) -> String {
    shell_words::quote(arg).into_owned()
}

#[cfg(windows)]
fn quote_arg(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
        return arg.to_string();
    }
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    let mut backslashes = 0usize;
    for ch in arg.chars() {
        match ch {
            '\\' => backslashes += 1,
            '"' => {
                quoted.extend(std::iter::repeat_n('\\', backslashes * 2 + 1));
                quoted.push('"');
                backslashes = 0;
                continue;
            }
            _ => {}
        }
        if ch != '\\' {
            quoted.extend(std::iter::repeat_n('\\', backslashes));
            backslashes = 0;
            quoted.push(ch);
        }
    }
    quoted.extend(std::iter::repeat_n('\\', backslashes * 2));
    quoted.push('"');
    quoted
}

/// Directory containing the running executable, used to find sibling helpers.
pub fn executable_dir() -> io::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "executable has no parent dir"))
}
