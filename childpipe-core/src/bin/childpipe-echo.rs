//! Helper child used by the demo binary and the integration tests.
//!
//! Behaviour is selected through environment variables:
//!
//! - `CHILDPIPE_ECHO_MODE`: `word` (default), `lines`, or `hang`
//! - `CHILDPIPE_ECHO_GREETINGS`: greeting lines to print first (default 10)
//! - `CHILDPIPE_ECHO_DELAY_MS`: pause after each greeting (default 100)
//! - `CHILDPIPE_ECHO_HANG_MS`: how long `hang` sleeps (default 60000)
//! - `CHILDPIPE_ECHO_EXIT_CODE`: exit code (default 2)

use std::io::{self, BufRead, Read, Write};
use std::process::ExitCode;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};

const DEFAULT_GREETINGS: u64 = 10;
const DEFAULT_DELAY_MS: u64 = 100;
const DEFAULT_HANG_MS: u64 = 60_000;
const DEFAULT_EXIT_CODE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Word,
    Lines,
    Hang,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "word" => Ok(Self::Word),
            "lines" => Ok(Self::Lines),
            "hang" => Ok(Self::Hang),
            other => bail!("unknown CHILDPIPE_ECHO_MODE `{other}`"),
        }
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("invalid {name}=`{value}`")),
        Err(_) => Ok(default),
    }
}

fn main() -> Result<ExitCode> {
    let mode: Mode = std::env::var("CHILDPIPE_ECHO_MODE")
        .unwrap_or_default()
        .parse()?;
    let greetings: u64 = env_or("CHILDPIPE_ECHO_GREETINGS", DEFAULT_GREETINGS)?;
    let delay = Duration::from_millis(env_or("CHILDPIPE_ECHO_DELAY_MS", DEFAULT_DELAY_MS)?);
    let hang = Duration::from_millis(env_or("CHILDPIPE_ECHO_HANG_MS", DEFAULT_HANG_MS)?);
    let exit_code: u8 = env_or("CHILDPIPE_ECHO_EXIT_CODE", DEFAULT_EXIT_CODE)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();

    writeln!(out, "childpipe-echo started (pid {})", std::process::id())?;
    let args: Vec<String> = std::env::args().collect();
    writeln!(out, "argc = {}", args.len())?;
    for (index, arg) in args.iter().enumerate() {
        writeln!(out, "argv[{index}] = {arg}")?;
    }
    out.flush()?;

    for round in 1..=greetings {
        writeln!(out, "Hello from child ({round}/{greetings})")?;
        out.flush()?;
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }

    match mode {
        Mode::Word => echo_word(&mut out)?,
        Mode::Lines => echo_lines(&mut out)?,
        Mode::Hang => thread::sleep(hang),
    }

    writeln!(out, "End")?;
    out.flush()?;
    Ok(ExitCode::from(exit_code))
}

/// Read one whitespace-delimited token and echo it with its code points.
fn echo_word(out: &mut impl Write) -> Result<()> {
    let mut raw = Vec::new();
    for byte in io::stdin().lock().bytes() {
        let byte = byte.context("reading stdin")?;
        if byte.is_ascii_whitespace() {
            if raw.is_empty() {
                continue;
            }
            break;
        }
        raw.push(byte);
    }

    let word = String::from_utf8_lossy(&raw);
    writeln!(out, "Received: {word}")?;
    let code_points: Vec<String> = word
        .chars()
        .map(|ch| format!("{:#06x}", u32::from(ch)))
        .collect();
    writeln!(out, "Code points: {}", code_points.join(" "))?;
    Ok(())
}

/// Echo every stdin line until end-of-input.
fn echo_lines(out: &mut impl Write) -> Result<()> {
    for line in io::stdin().lock().lines() {
        let line = line.context("reading stdin")?;
        writeln!(out, "Echo: {line}")?;
        out.flush()?;
    }
    Ok(())
}
