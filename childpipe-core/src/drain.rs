//! Non-blocking drain of the child's merged stdout/stderr.
//!
//! [`DrainTask`] is the resumable state machine: every [`step`](DrainTask::step)
//! polls the pipe once without blocking and emits whatever was buffered.
//! [`OutputDrainer`] drives a task from a dedicated worker thread, sleeping one
//! poll interval whenever the pipe is empty. A caller that cannot use threads
//! can step a task itself instead.
//!
//! State only moves forward: `Idle -> Running -> Stopping -> Stopped`.

use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use os_pipe::PipeReader;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::codec::{StreamDecoder, TextCodec};
use crate::error::{Result, SupervisorError};
use crate::pipe::{bytes_available, is_end_of_stream};
use crate::sink::OutputSink;

/// Upper bound on reads performed by the final sweep, so a child that keeps
/// writing cannot hold a stop request open.
const FINAL_SWEEP_CHUNKS: usize = 64;

/// Lifecycle of an output drainer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum DrainState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl DrainState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for DrainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Tuning knobs for a drain loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainOptions {
    pub poll_interval: Duration,
    pub max_read_chunk: usize,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            max_read_chunk: 64 * 1024,
        }
    }
}

/// State shared between a drain task and whoever controls it.
#[derive(Debug, Default)]
pub struct DrainShared {
    state: AtomicU8,
    stop_requested: AtomicBool,
    failure: Mutex<Option<io::Error>>,
    bytes_read: AtomicU64,
}

impl DrainShared {
    pub fn state(&self) -> DrainState {
        DrainState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next` unless the state is already at or past it.
    fn advance(&self, next: DrainState) {
        self.state.fetch_max(next as u8, Ordering::AcqRel);
    }

    /// Ask the task to stop at its next poll boundary. Closes nothing.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Take the recorded read failure, if any. Reported once.
    pub fn take_failure(&self) -> Option<io::Error> {
        self.failure.lock().take()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }
}

/// Outcome of a single [`DrainTask::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing was buffered; poll again later.
    Pending,
    /// This many bytes were read and emitted.
    Emitted(usize),
    /// The task reached `Stopped`.
    Finished,
}

/// The drain state machine over one pipe read end.
pub struct DrainTask {
    reader: PipeReader,
    decoder: StreamDecoder,
    sink: Box<dyn OutputSink>,
    shared: Arc<DrainShared>,
    buffer: Vec<u8>,
    max_read_chunk: usize,
}

impl fmt::Debug for DrainTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrainTask")
            .field("state", &self.shared.state())
            .field("decoder", &self.decoder)
            .finish()
    }
}

impl DrainTask {
    pub fn new(
        reader: PipeReader,
        codec: TextCodec,
        sink: Box<dyn OutputSink>,
        max_read_chunk: usize,
    ) -> Self {
        Self {
            reader,
            decoder: codec.stream_decoder(),
            sink,
            shared: Arc::new(DrainShared::default()),
            buffer: Vec::new(),
            max_read_chunk: max_read_chunk.max(1),
        }
    }

    pub fn shared(&self) -> Arc<DrainShared> {
        Arc::clone(&self.shared)
    }

    pub fn state(&self) -> DrainState {
        self.shared.state()
    }

    /// Poll the pipe once without blocking.
    pub fn step(&mut self) -> StepOutcome {
        match self.state() {
            DrainState::Stopped => return StepOutcome::Finished,
            DrainState::Idle => self.shared.advance(DrainState::Running),
            DrainState::Running | DrainState::Stopping => {}
        }

        if self.shared.stop_requested() {
            debug!("output drain stop requested");
            self.finish();
            return StepOutcome::Finished;
        }

        match self.read_available() {
            Ok(0) => StepOutcome::Pending,
            Ok(read) => StepOutcome::Emitted(read),
            Err(err) if is_end_of_stream(&err) => {
                debug!("output pipe reached end of stream");
                self.finish();
                StepOutcome::Finished
            }
            Err(err) => {
                warn!("output drain read failed: {}", err);
                *self.shared.failure.lock() = Some(err);
                self.flush_decoder();
                self.shared.advance(DrainState::Stopped);
                StepOutcome::Finished
            }
        }
    }

    /// Read and emit whatever is buffered right now. Returns the byte count.
    fn read_available(&mut self) -> io::Result<usize> {
        let available = bytes_available(&self.reader)?;
        if available == 0 {
            return Ok(0);
        }

        // Never ask for more than is buffered, so the read cannot block.
        let wanted = available.min(self.max_read_chunk);
        if self.buffer.len() < wanted {
            self.buffer.resize(wanted, 0);
        }

        let read = loop {
            match self.reader.read(&mut self.buffer[..wanted]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::BrokenPipe)),
                Ok(read) => break read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        };

        self.shared
            .bytes_read
            .fetch_add(read as u64, Ordering::Relaxed);
        let text = self.decoder.decode_chunk(&self.buffer[..read]);
        if !text.is_empty() {
            self.sink.emit(&text);
        }
        Ok(read)
    }

    /// Stopping: one last non-blocking sweep of what is still buffered, then
    /// Stopped.
    fn finish(&mut self) {
        self.shared.advance(DrainState::Stopping);
        for _ in 0..FINAL_SWEEP_CHUNKS {
            match self.read_available() {
                Ok(0) => break,
                Ok(_) => continue,
                Err(err) if is_end_of_stream(&err) => break,
                Err(err) => {
                    warn!("output drain final read failed: {}", err);
                    *self.shared.failure.lock() = Some(err);
                    break;
                }
            }
        }
        self.flush_decoder();
        self.shared.advance(DrainState::Stopped);
    }

    fn flush_decoder(&mut self) {
        let tail = self.decoder.finish();
        if !tail.is_empty() {
            self.sink.emit(&tail);
        }
    }

    /// Give back the pipe end once the task is done with it.
    pub fn into_reader(self) -> PipeReader {
        self.reader
    }
}

enum DrainerSlot {
    Idle(DrainTask),
    Running(JoinHandle<DrainTask>),
    Joined,
}

/// Runs a [`DrainTask`] on a dedicated worker thread.
pub struct OutputDrainer {
    name: String,
    options: DrainOptions,
    shared: Arc<DrainShared>,
    slot: DrainerSlot,
}

impl fmt::Debug for OutputDrainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputDrainer")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl OutputDrainer {
    pub fn new(
        name: impl Into<String>,
        reader: PipeReader,
        codec: TextCodec,
        sink: Box<dyn OutputSink>,
        options: DrainOptions,
    ) -> Self {
        let task = DrainTask::new(reader, codec, sink, options.max_read_chunk);
        Self {
            name: name.into(),
            options,
            shared: task.shared(),
            slot: DrainerSlot::Idle(task),
        }
    }

    pub fn state(&self) -> DrainState {
        self.shared.state()
    }

    pub fn shared(&self) -> Arc<DrainShared> {
        Arc::clone(&self.shared)
    }

    /// Idle -> Running: spawn the worker thread.
    pub fn start(&mut self) -> Result<()> {
        let mut task = match std::mem::replace(&mut self.slot, DrainerSlot::Joined) {
            DrainerSlot::Idle(task) => task,
            other => {
                self.slot = other;
                return Err(SupervisorError::invalid_state(
                    "start output drain",
                    "drainer was already started",
                ));
            }
        };

        task.shared.advance(DrainState::Running);
        let poll_interval = self.options.poll_interval;
        let spawned = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                loop {
                    match task.step() {
                        StepOutcome::Pending => thread::sleep(poll_interval),
                        StepOutcome::Emitted(_) => {}
                        StepOutcome::Finished => break,
                    }
                }
                debug!(
                    "output drain finished ({} bytes)",
                    task.shared.bytes_read()
                );
                task
            });

        match spawned {
            Ok(handle) => {
                self.slot = DrainerSlot::Running(handle);
                Ok(())
            }
            Err(source) => {
                self.shared.advance(DrainState::Stopped);
                Err(SupervisorError::DrainStart { source })
            }
        }
    }

    /// Block until the worker reaches `Stopped` on its own or `deadline` passes.
    /// Returns whether it stopped.
    pub fn wait_stopped(&self, deadline: Instant) -> bool {
        loop {
            if self.state() == DrainState::Stopped {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(self.options.poll_interval.min(deadline - now));
        }
    }

    /// Flip the stop flag and join the worker. No read happens after this
    /// returns. Hands the pipe end back to the owner; `None` if it was already
    /// handed back.
    pub fn stop_and_join(&mut self) -> Option<PipeReader> {
        self.shared.request_stop();
        match std::mem::replace(&mut self.slot, DrainerSlot::Joined) {
            DrainerSlot::Idle(task) => {
                task.shared.advance(DrainState::Stopped);
                Some(task.into_reader())
            }
            DrainerSlot::Running(handle) => match handle.join() {
                Ok(task) => Some(task.into_reader()),
                Err(_) => {
                    warn!("output drain thread '{}' panicked", self.name);
                    self.shared.advance(DrainState::Stopped);
                    None
                }
            },
            DrainerSlot::Joined => None,
        }
    }
}

impl Drop for OutputDrainer {
    fn drop(&mut self) {
        drop(self.stop_and_join());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::BufferSink;
    use std::io::Write;

    fn pipe() -> (PipeReader, os_pipe::PipeWriter) {
        os_pipe::pipe().expect("pipe")
    }

    #[test]
    fn step_emits_buffered_bytes_and_detects_end_of_stream() {
        let (reader, mut writer) = pipe();
        let sink = BufferSink::new();
        let mut task = DrainTask::new(reader, TextCodec::utf8(), Box::new(sink.clone()), 1024);

        assert_eq!(task.state(), DrainState::Idle);
        assert_eq!(task.step(), StepOutcome::Pending);
        assert_eq!(task.state(), DrainState::Running);

        writer.write_all(b"hello").expect("write");
        assert_eq!(task.step(), StepOutcome::Emitted(5));
        assert_eq!(sink.contents(), "hello");

        drop(writer);
        assert_eq!(task.step(), StepOutcome::Finished);
        assert_eq!(task.state(), DrainState::Stopped);
        assert_eq!(task.step(), StepOutcome::Finished);
        assert!(task.shared().take_failure().is_none());
    }

    #[test]
    fn reads_are_bounded_by_chunk_limit() {
        let (reader, mut writer) = pipe();
        let sink = BufferSink::new();
        let mut task = DrainTask::new(reader, TextCodec::utf8(), Box::new(sink.clone()), 4);

        writer.write_all(b"abcdefghij").expect("write");
        assert_eq!(task.step(), StepOutcome::Emitted(4));
        assert_eq!(task.step(), StepOutcome::Emitted(4));
        assert_eq!(task.step(), StepOutcome::Emitted(2));
        assert_eq!(sink.contents(), "abcdefghij");
    }

    #[test]
    fn stop_request_performs_final_sweep() {
        let (reader, mut writer) = pipe();
        let sink = BufferSink::new();
        let mut task = DrainTask::new(reader, TextCodec::utf8(), Box::new(sink.clone()), 2);

        writer.write_all(b"left over").expect("write");
        task.shared().request_stop();
        assert_eq!(task.step(), StepOutcome::Finished);
        assert_eq!(task.state(), DrainState::Stopped);
        assert_eq!(sink.contents(), "left over");
    }

    #[test]
    fn split_characters_survive_chunking() {
        let (reader, mut writer) = pipe();
        let sink = BufferSink::new();
        // Chunk size 1 splits every multi-byte character.
        let mut task = DrainTask::new(reader, TextCodec::utf8(), Box::new(sink.clone()), 1);

        writer.write_all("안녕".as_bytes()).expect("write");
        drop(writer);
        while task.step() != StepOutcome::Finished {}
        assert_eq!(sink.contents(), "안녕");
    }

    #[test]
    fn state_never_moves_backwards() {
        let shared = DrainShared::default();
        shared.advance(DrainState::Stopping);
        shared.advance(DrainState::Running);
        assert_eq!(shared.state(), DrainState::Stopping);
        shared.advance(DrainState::Stopped);
        shared.advance(DrainState::Idle);
        assert_eq!(shared.state(), DrainState::Stopped);
    }

    #[test]
    fn worker_thread_drains_until_writer_closes() {
        let (reader, mut writer) = pipe();
        let sink = BufferSink::new();
        let mut drainer = OutputDrainer::new(
            "childpipe-drain-test",
            reader,
            TextCodec::utf8(),
            Box::new(sink.clone()),
            DrainOptions::default(),
        );
        assert_eq!(drainer.state(), DrainState::Idle);
        drainer.start().expect("start");
        assert!(drainer.start().is_err());

        writer.write_all(b"line one\nline two\n").expect("write");
        drop(writer);

        assert!(drainer.wait_stopped(Instant::now() + Duration::from_secs(5)));
        assert_eq!(sink.contents(), "line one\nline two\n");
        assert!(drainer.stop_and_join().is_some());
        assert!(drainer.stop_and_join().is_none());
    }

    #[test]
    fn stop_and_join_returns_promptly_while_writer_is_open() {
        let (reader, _writer) = pipe();
        let mut drainer = OutputDrainer::new(
            "childpipe-drain-test",
            reader,
            TextCodec::utf8(),
            Box::new(BufferSink::new()),
            DrainOptions::default(),
        );
        drainer.start().expect("start");
        let started = Instant::now();
        assert!(drainer.stop_and_join().is_some());
        assert_eq!(drainer.state(), DrainState::Stopped);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn unstarted_drainer_hands_back_reader() {
        let (reader, _writer) = pipe();
        let mut drainer = OutputDrainer::new(
            "childpipe-drain-test",
            reader,
            TextCodec::utf8(),
            Box::new(BufferSink::new()),
            DrainOptions::default(),
        );
        assert!(drainer.stop_and_join().is_some());
        assert_eq!(drainer.state(), DrainState::Stopped);
    }
}
