//! Destinations for decoded child output.

use std::sync::Arc;

use parking_lot::Mutex;

/// Receives decoded output chunks in pipe order.
///
/// Chunk boundaries follow whatever the pipe had buffered at poll time; they are
/// not aligned to the child's writes or to line breaks.
pub trait OutputSink: Send + 'static {
    fn emit(&mut self, chunk: &str);
}

impl<F> OutputSink for F
where
    F: FnMut(&str) + Send + 'static,
{
    fn emit(&mut self, chunk: &str) {
        self(chunk);
    }
}

/// Logs each chunk as an `info` event on the `childpipe::output` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl OutputSink for TracingSink {
    fn emit(&mut self, chunk: &str) {
        tracing::info!(target: "childpipe::output", "Output:\n{}", chunk);
    }
}

/// Accumulates everything into a shared string.
#[derive(Debug, Default, Clone)]
pub struct BufferSink {
    buffer: Arc<Mutex<String>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything received so far.
    pub fn contents(&self) -> String {
        self.buffer.lock().clone()
    }

    /// Take everything received so far, leaving the buffer empty.
    pub fn take(&self) -> String {
        std::mem::take(&mut *self.buffer.lock())
    }
}

impl OutputSink for BufferSink {
    fn emit(&mut self, chunk: &str) {
        self.buffer.lock().push_str(chunk);
    }
}

/// Forwards every chunk to two sinks.
#[derive(Debug, Clone)]
pub struct TeeSink<A, B> {
    first: A,
    second: B,
}

impl<A, B> TeeSink<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

impl<A: OutputSink, B: OutputSink> OutputSink for TeeSink<A, B> {
    fn emit(&mut self, chunk: &str) {
        self.first.emit(chunk);
        self.second.emit(chunk);
    }
}
