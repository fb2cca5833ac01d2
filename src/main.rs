//! childpipe - run a child over anonymous pipes and relay its output.
//!
//! Thin binary entry point: loads configuration, applies command-line
//! overrides, and drives a single `ProcessSupervisor` to completion.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use childpipe_config::{ChildpipeConfig, ConfigManager, LoggingConfig};
use childpipe_core::{LaunchSpec, ProcessSupervisor, WaitOutcome, executable_dir};
use clap::Parser;

mod cli;

use cli::{Cli, DEMO_CHILD_ARGS};

const ECHO_HELPER: &str = "childpipe-echo";

fn main() -> Result<ExitCode> {
    let args = Cli::parse();

    let config = load_config(&args)?;
    initialize_tracing(&config.logging);

    let spec = launch_spec(&args)?;
    let supervisor = ProcessSupervisor::spawn_with_sink(&spec, &config.supervisor, write_stdout)
        .with_context(|| format!("failed to start `{spec}`"))?;

    for line in args.input_lines() {
        supervisor
            .write_input(&line)
            .with_context(|| format!("failed to send `{line}` to the child"))?;
    }
    if args.close_input {
        supervisor.close_input()?;
    }

    let timeout = args.timeout_ms.map(Duration::from_millis);
    let mut outcome = supervisor.wait(timeout)?;
    if outcome == WaitOutcome::TimedOut && args.kill_on_timeout {
        tracing::warn!(pid = supervisor.pid(), "wait timed out; killing child");
        if !supervisor.kill(config.supervisor.forced_exit_code)? {
            tracing::warn!(pid = supervisor.pid(), "kill request was refused");
        }
        outcome = supervisor.wait(None)?;
    }

    let exit_code = match outcome {
        WaitOutcome::Exited => Some(supervisor.exit_code()?),
        WaitOutcome::TimedOut => None,
    };
    let report = supervisor.shutdown()?;
    if report.forced {
        tracing::warn!(
            "child was force terminated after {} ms",
            report.grace_waited.as_millis()
        );
    }

    let code = exit_code
        .or(report.exit_code)
        .unwrap_or(config.supervisor.forced_exit_code);
    tracing::info!("child finished with exit code {}", code);
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX)))
}

fn load_config(args: &Cli) -> Result<ChildpipeConfig> {
    let manager = match &args.config {
        Some(path) => ConfigManager::load_from_file(path)?,
        None => ConfigManager::load()?,
    };
    let mut config = manager.into_config();

    if let Some(code_page) = &args.code_page {
        config.supervisor.code_page = code_page.clone();
    }
    if let Some(grace_ms) = args.grace_ms {
        config.supervisor.grace_period_ms = grace_ms;
    }
    config
        .validate()
        .context("invalid configuration after applying command-line overrides")?;
    Ok(config)
}

fn launch_spec(args: &Cli) -> Result<LaunchSpec> {
    if !args.is_demo() {
        return Ok(LaunchSpec::from_argv(&args.command));
    }

    let helper = echo_helper_path()?;
    let argv = std::iter::once(helper.to_string_lossy().into_owned())
        .chain(DEMO_CHILD_ARGS.iter().map(|arg| (*arg).to_string()));
    Ok(LaunchSpec::from_argv(argv))
}

fn echo_helper_path() -> Result<PathBuf> {
    let dir = executable_dir().context("failed to locate the childpipe executable")?;
    let helper = dir.join(format!("{ECHO_HELPER}{}", std::env::consts::EXE_SUFFIX));
    if !helper.is_file() {
        anyhow::bail!(
            "{} not found next to childpipe; pass a command after `--` instead",
            helper.display()
        );
    }
    Ok(helper)
}

fn write_stdout(chunk: &str) {
    if let Err(err) = relay(&mut io::stdout().lock(), chunk) {
        tracing::debug!("failed to relay child output: {}", err);
    }
}

fn relay(out: &mut impl Write, chunk: &str) -> io::Result<()> {
    out.write_all(chunk.as_bytes())?;
    out.flush()
}

fn initialize_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(logging.filter_directives()));

    let initialized = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
    if initialized.is_ok() {
        tracing::debug!("tracing enabled: {}", logging.filter_directives());
    }
}
