//! Owns one supervised child: its process handle, both pipes, the input
//! writer, and the output drainer.
//!
//! Every operation takes `&self`, so a supervisor behind an `Arc` can be fed
//! from several threads while another waits on it. Teardown runs at most once,
//! through [`ProcessSupervisor::shutdown`] or on drop:
//!
//! 1. a still-running child gets the grace period to exit, then is force
//!    terminated and reaped;
//! 2. the drainer is stopped and joined;
//! 3. both pipes are closed;
//! 4. the process handle is released.
//!
//! Terminating before the drainer has consumed everything can truncate the last
//! chunk of output. Teardown latency stays bounded by the grace period instead.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use childpipe_config::SupervisorConfig;
use os_pipe::PipeReader;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::codec::TextCodec;
use crate::drain::{DrainOptions, DrainShared, DrainState, OutputDrainer};
use crate::error::{Result, SupervisorError};
use crate::launcher::{LaunchSpec, ProcessHandle, launch};
use crate::pipe::DuplexPipe;
use crate::process_group::{exit_code_from_status, force_terminate};
use crate::sink::{OutputSink, TracingSink};
use crate::writer::InputWriter;

const SHUT_DOWN: &str = "supervisor has been shut down";

/// Result of [`ProcessSupervisor::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited,
    TimedOut,
}

/// Point-in-time view of a supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorStatus {
    pub pid: u32,
    pub running: bool,
    pub exit_code: Option<i32>,
    pub drain_state: DrainState,
    pub bytes_drained: u64,
}

/// What teardown had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownReport {
    /// The child outlived the grace period and was force terminated.
    pub forced: bool,
    /// Time spent waiting for a voluntary exit.
    pub grace_waited: Duration,
    /// Exit code of the child, when it could be collected.
    pub exit_code: Option<i32>,
}

enum ProcessSlot {
    Running(ProcessHandle),
    Exited {
        handle: ProcessHandle,
        exit_code: i32,
    },
    Released,
}

struct ProcessState {
    slot: ProcessSlot,
    /// Exit code requested through a forced kill, if one was issued.
    killed_with: Option<i32>,
    /// `wait` has reported `Exited` at least once.
    exit_observed: bool,
}

impl ProcessState {
    /// Reap the child without blocking. Returns whether it has exited.
    fn poll_exit(&mut self) -> Result<bool> {
        let handle = match &mut self.slot {
            ProcessSlot::Running(handle) => handle,
            ProcessSlot::Exited { .. } => return Ok(true),
            ProcessSlot::Released => return Ok(true),
        };

        match handle.child_mut().try_wait() {
            Ok(Some(status)) => {
                let exit_code = exit_code_from_status(status, self.killed_with);
                self.record_exit(exit_code);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(source) => Err(SupervisorError::Wait { source }),
        }
    }

    fn record_exit(&mut self, exit_code: i32) {
        self.slot = match std::mem::replace(&mut self.slot, ProcessSlot::Released) {
            ProcessSlot::Running(handle) => {
                info!(pid = handle.pid(), exit_code, "child exited");
                ProcessSlot::Exited { handle, exit_code }
            }
            other => other,
        };
    }

    fn exit_code(&self) -> Option<i32> {
        match &self.slot {
            ProcessSlot::Exited { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    fn is_released(&self) -> bool {
        matches!(self.slot, ProcessSlot::Released)
    }
}

/// A running child wired to an input writer and an output drainer.
pub struct ProcessSupervisor {
    pid: u32,
    config: SupervisorConfig,
    process: Mutex<ProcessState>,
    input: InputWriter,
    drainer: Mutex<Option<OutputDrainer>>,
    drain: Arc<DrainShared>,
    /// Keeps the output read end once the drainer hands it back.
    output_pipe: Mutex<DuplexPipe>,
}

impl fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("pid", &self.pid)
            .field("drain_state", &self.drain.state())
            .finish()
    }
}

impl ProcessSupervisor {
    /// Launch `spec` and log its output through `tracing`.
    pub fn spawn(spec: &LaunchSpec, config: &SupervisorConfig) -> Result<Self> {
        Self::spawn_with_sink(spec, config, TracingSink)
    }

    /// Launch `spec` and deliver its decoded output to `sink`.
    ///
    /// Validates `config`, creates both pipes, launches the child, and starts
    /// the drainer. If any step fails, everything created so far is released
    /// before returning.
    pub fn spawn_with_sink(
        spec: &LaunchSpec,
        config: &SupervisorConfig,
        sink: impl OutputSink,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|err| SupervisorError::InvalidConfig(format!("{err:#}")))?;
        let codec = TextCodec::from_label(&config.code_page)?;

        let mut output_pipe = DuplexPipe::create()?;
        let mut input_pipe = DuplexPipe::create()?;

        let stdout_write_end = required_end(output_pipe.take_write_end())?;
        let stdin_read_end = required_end(input_pipe.take_read_end())?;
        let mut handle = launch(spec, stdout_write_end, stdin_read_end)?;
        let pid = handle.pid();

        let ends = required_end(input_pipe.take_write_end()).and_then(|writer| {
            required_end(output_pipe.take_read_end()).map(|reader| (writer, reader))
        });
        let (stdin_write_end, stdout_read_end) = match ends {
            Ok(ends) => ends,
            Err(err) => {
                abandon_child(&mut handle);
                return Err(err);
            }
        };

        let input = InputWriter::new(stdin_write_end, codec, config.line_ending);
        let mut drainer = OutputDrainer::new(
            format!("childpipe-drain-{pid}"),
            stdout_read_end,
            codec,
            Box::new(sink),
            DrainOptions {
                poll_interval: config.poll_interval(),
                max_read_chunk: config.max_read_chunk,
            },
        );
        if let Err(err) = drainer.start() {
            input.close();
            abandon_child(&mut handle);
            return Err(err);
        }

        debug!(pid, codec = codec.name(), "supervisor started");
        Ok(Self {
            pid,
            config: config.clone(),
            process: Mutex::new(ProcessState {
                slot: ProcessSlot::Running(handle),
                killed_with: None,
                exit_observed: false,
            }),
            input,
            drain: drainer.shared(),
            drainer: Mutex::new(Some(drainer)),
            output_pipe: Mutex::new(output_pipe),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Send one line to the child's stdin.
    pub fn write_input(&self, text: &str) -> Result<()> {
        self.ensure_live("write input")?;
        self.input.write_line(text)
    }

    /// Close the child's stdin so it reads end-of-input. Idempotent.
    pub fn close_input(&self) -> Result<()> {
        self.ensure_live("close input")?;
        self.input.close();
        Ok(())
    }

    /// Block until the child exits or `timeout` elapses; `None` waits forever.
    ///
    /// After the exit is observed this also waits for the drainer to consume
    /// what the pipe still holds, bounded by the timeout and by the configured
    /// drain settle period.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<WaitOutcome> {
        let started = Instant::now();
        let deadline = timeout.map(|timeout| started + timeout);
        let poll_interval = self.config.poll_interval();

        loop {
            {
                let mut state = self.process.lock();
                if state.is_released() {
                    return Err(SupervisorError::invalid_state("wait", SHUT_DOWN));
                }
                if state.poll_exit()? {
                    break;
                }
            }

            let now = Instant::now();
            let sleep_for = match deadline {
                Some(deadline) if now >= deadline => return Ok(WaitOutcome::TimedOut),
                Some(deadline) => poll_interval.min(deadline - now),
                None => poll_interval,
            };
            thread::sleep(sleep_for);
        }

        let settle_deadline = Instant::now() + self.config.drain_settle();
        let drain_deadline = match deadline {
            Some(deadline) => deadline.min(settle_deadline),
            None => settle_deadline,
        };
        if let Some(drainer) = self.drainer.lock().as_ref()
            && !drainer.wait_stopped(drain_deadline)
        {
            debug!(
                pid = self.pid,
                "output still open after exit; a descendant may hold the pipe"
            );
        }

        self.process.lock().exit_observed = true;
        Ok(WaitOutcome::Exited)
    }

    /// Force-terminate the child. Returns `true` if it is gone or the
    /// termination request succeeded, `false` if the OS refused it.
    ///
    /// On an already exited child this does nothing and succeeds, however many
    /// times it is called.
    pub fn kill(&self, exit_code: i32) -> Result<bool> {
        let mut state = self.process.lock();
        if state.is_released() {
            return Err(SupervisorError::invalid_state("kill", SHUT_DOWN));
        }
        if state.poll_exit()? {
            return Ok(true);
        }
        // Already signalled but not reaped yet; the first requested code stands.
        if state.killed_with.is_some() {
            return Ok(true);
        }

        let ProcessSlot::Running(handle) = &mut state.slot else {
            return Ok(true);
        };
        match force_terminate(handle.child_mut(), exit_code) {
            Ok(()) => {
                info!(pid = self.pid, exit_code, "child force terminated");
                state.killed_with = Some(exit_code);
                Ok(true)
            }
            Err(err) => {
                warn!(pid = self.pid, "failed to terminate child: {}", err);
                Ok(false)
            }
        }
    }

    /// Exit code of the child. Only available once `wait` reported `Exited`.
    pub fn exit_code(&self) -> Result<i32> {
        let state = self.process.lock();
        if state.is_released() {
            return Err(SupervisorError::invalid_state("read exit code", SHUT_DOWN));
        }
        match state.exit_code() {
            Some(code) if state.exit_observed => Ok(code),
            _ => Err(SupervisorError::invalid_state(
                "read exit code",
                "exit has not been observed by wait",
            )),
        }
    }

    /// Snapshot of the child and drainer.
    ///
    /// A drain failure other than end-of-stream is returned as an error by the
    /// first call after it happened.
    pub fn status(&self) -> Result<SupervisorStatus> {
        let mut state = self.process.lock();
        if state.is_released() {
            return Err(SupervisorError::invalid_state("query status", SHUT_DOWN));
        }
        if let Some(source) = self.drain.take_failure() {
            return Err(SupervisorError::Drain { source });
        }

        let running = !state.poll_exit()?;
        Ok(SupervisorStatus {
            pid: self.pid,
            running,
            exit_code: state.exit_code(),
            drain_state: self.drain.state(),
            bytes_drained: self.drain.bytes_read(),
        })
    }

    /// Tear the child down. Fails with `InvalidState` if already torn down.
    pub fn shutdown(&self) -> Result<TeardownReport> {
        let mut state = self.process.lock();
        if state.is_released() {
            return Err(SupervisorError::invalid_state("shut down", SHUT_DOWN));
        }

        let mut report = TeardownReport {
            forced: false,
            grace_waited: Duration::ZERO,
            exit_code: state.exit_code(),
        };

        if matches!(state.slot, ProcessSlot::Running(_)) {
            let exited = self.grace_wait(&mut state, &mut report);
            if !exited {
                self.force_and_reap(&mut state);
                report.forced = true;
            }
            report.exit_code = state.exit_code();
        }

        let reader = self.drainer.lock().take().and_then(|mut drainer| {
            let reader = drainer.stop_and_join();
            if let Some(source) = self.drain.take_failure() {
                warn!(pid = self.pid, "output drain failed before teardown: {}", source);
            }
            reader
        });

        self.input.close();
        close_output(&mut self.output_pipe.lock(), reader);

        state.slot = ProcessSlot::Released;
        debug!(
            pid = self.pid,
            forced = report.forced,
            grace_waited_ms = report.grace_waited.as_millis() as u64,
            "supervisor torn down"
        );
        Ok(report)
    }

    /// Poll for a voluntary exit for at most the grace period.
    fn grace_wait(&self, state: &mut ProcessState, report: &mut TeardownReport) -> bool {
        let started = Instant::now();
        let deadline = started + self.config.grace_period();
        let poll_interval = self.config.poll_interval();

        let exited = loop {
            match state.poll_exit() {
                Ok(true) => break true,
                Ok(false) => {}
                Err(err) => {
                    warn!(pid = self.pid, "grace wait failed: {}", err);
                    break false;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                break false;
            }
            thread::sleep(poll_interval.min(deadline - now));
        };

        report.grace_waited = started.elapsed();
        exited
    }

    fn force_and_reap(&self, state: &mut ProcessState) {
        let exit_code = self.config.forced_exit_code;
        let ProcessSlot::Running(handle) = &mut state.slot else {
            return;
        };

        warn!(
            pid = self.pid,
            grace_ms = self.config.grace_period_ms,
            "child outlived grace period; forcing termination"
        );
        if let Err(err) = force_terminate(handle.child_mut(), exit_code) {
            warn!(pid = self.pid, "failed to terminate child: {}", err);
        }
        state.killed_with = Some(exit_code);

        match handle.child_mut().wait() {
            Ok(status) => {
                let code = exit_code_from_status(status, state.killed_with);
                state.record_exit(code);
            }
            Err(err) => warn!(pid = self.pid, "failed to reap child: {}", err),
        }
    }

    fn ensure_live(&self, operation: &'static str) -> Result<()> {
        if self.process.lock().is_released() {
            return Err(SupervisorError::invalid_state(operation, SHUT_DOWN));
        }
        Ok(())
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if self.process.get_mut().is_released() {
            return;
        }
        if let Err(err) = self.shutdown() {
            warn!(pid = self.pid, "teardown on drop failed: {}", err);
        }
    }
}

fn required_end<T>(end: Option<T>) -> Result<T> {
    end.ok_or_else(|| {
        SupervisorError::invalid_state("wire child stdio", "fresh pipe is missing an end")
    })
}

/// Kill and reap a child whose supervisor could not be completed.
fn abandon_child(handle: &mut ProcessHandle) {
    let child = handle.child_mut();
    if let Err(err) = child.kill() {
        debug!("failed to kill abandoned child: {}", err);
    }
    if let Err(err) = child.wait() {
        debug!("failed to reap abandoned child: {}", err);
    }
}

fn close_output(pipe: &mut DuplexPipe, reader: Option<PipeReader>) {
    if let Some(reader) = reader {
        pipe.restore_read_end(reader);
    }
    pipe.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::BufferSink;

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            grace_period_ms: 200,
            poll_interval_ms: 5,
            code_page: "utf-8".to_string(),
            ..Default::default()
        }
    }

    #[cfg(unix)]
    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::from_argv(["/bin/sh", "-c", script])
    }

    #[test]
    fn unknown_code_page_fails_before_launch() {
        let config = SupervisorConfig {
            code_page: "not-a-real-encoding".to_string(),
            ..fast_config()
        };
        let err = ProcessSupervisor::spawn(&LaunchSpec::new("child"), &config)
            .expect_err("bad code page");
        assert!(matches!(err, SupervisorError::UnknownCodePage(_)));
    }

    #[test]
    fn launch_failure_is_propagated() {
        let spec = LaunchSpec::new("/definitely/not/a/real/program-childpipe");
        let err = ProcessSupervisor::spawn(&spec, &fast_config()).expect_err("missing program");
        assert!(matches!(err, SupervisorError::Launch { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn exit_code_requires_observed_exit() -> Result<()> {
        let sink = BufferSink::new();
        let supervisor =
            ProcessSupervisor::spawn_with_sink(&sh("echo hi; exit 3"), &fast_config(), sink.clone())?;
        assert!(supervisor.exit_code().is_err());

        assert_eq!(
            supervisor.wait(Some(Duration::from_secs(10)))?,
            WaitOutcome::Exited
        );
        assert_eq!(supervisor.exit_code()?, 3);
        assert_eq!(sink.contents(), "hi\n");

        let status = supervisor.status()?;
        assert!(!status.running);
        assert_eq!(status.exit_code, Some(3));
        assert_eq!(status.drain_state, DrainState::Stopped);
        assert_eq!(status.bytes_drained, 3);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn killed_child_reports_requested_code() -> Result<()> {
        let supervisor =
            ProcessSupervisor::spawn_with_sink(&sh("sleep 30"), &fast_config(), BufferSink::new())?;
        assert_eq!(supervisor.wait(Some(Duration::ZERO))?, WaitOutcome::TimedOut);

        assert!(supervisor.kill(42)?);
        assert_eq!(
            supervisor.wait(Some(Duration::from_secs(10)))?,
            WaitOutcome::Exited
        );
        assert_eq!(supervisor.exit_code()?, 42);
        assert!(supervisor.kill(7)?);
        assert_eq!(supervisor.exit_code()?, 42);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn repeated_kill_before_reap_keeps_first_code() -> Result<()> {
        let supervisor =
            ProcessSupervisor::spawn_with_sink(&sh("sleep 30"), &fast_config(), BufferSink::new())?;

        assert!(supervisor.kill(42)?);
        assert!(supervisor.kill(7)?);
        assert_eq!(supervisor.wait(None)?, WaitOutcome::Exited);
        assert_eq!(supervisor.exit_code()?, 42);
        Ok(())
    }

    #[test]
    fn invalid_config_is_rejected_before_launch() {
        let config = SupervisorConfig {
            poll_interval_ms: 0,
            ..fast_config()
        };
        let err = ProcessSupervisor::spawn(&LaunchSpec::new("child"), &config)
            .expect_err("zero poll interval");
        match err {
            SupervisorError::InvalidConfig(message) => {
                assert!(message.contains("poll_interval_ms"), "{message}");
            }
            other => panic!("expected invalid config, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn operations_after_shutdown_are_invalid() -> Result<()> {
        let supervisor =
            ProcessSupervisor::spawn_with_sink(&sh("exit 0"), &fast_config(), BufferSink::new())?;
        let report = supervisor.shutdown()?;
        assert!(!report.forced);
        assert_eq!(report.exit_code, Some(0));

        assert!(supervisor.wait(None).is_err_and(|err| err.is_invalid_state()));
        assert!(supervisor.kill(1).is_err_and(|err| err.is_invalid_state()));
        assert!(supervisor.write_input("x").is_err_and(|err| err.is_invalid_state()));
        assert!(supervisor.status().is_err_and(|err| err.is_invalid_state()));
        assert!(supervisor.exit_code().is_err_and(|err| err.is_invalid_state()));
        assert!(supervisor.shutdown().is_err_and(|err| err.is_invalid_state()));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn shutdown_forces_a_child_that_ignores_the_grace_period() -> Result<()> {
        let config = fast_config();
        let supervisor =
            ProcessSupervisor::spawn_with_sink(&sh("sleep 30"), &config, BufferSink::new())?;
        let started = Instant::now();
        let report = supervisor.shutdown()?;

        assert!(report.forced);
        assert!(report.grace_waited >= config.grace_period());
        assert!(report.grace_waited < config.grace_period() + Duration::from_millis(100));
        assert_eq!(report.exit_code, Some(config.forced_exit_code));
        assert!(started.elapsed() < Duration::from_secs(5));
        Ok(())
    }
}
