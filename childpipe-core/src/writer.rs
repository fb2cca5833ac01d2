//! Feeding text into the child's stdin.
//!
//! Writes are serialized by a mutex, so lines submitted from several threads
//! reach the child whole and in lock order. A write blocks while the pipe buffer
//! is full; a child that never reads its stdin can therefore stall the caller.

use std::io::{self, Write};

use childpipe_config::LineEnding;
use os_pipe::PipeWriter;
use parking_lot::Mutex;
use tracing::debug;

use crate::codec::TextCodec;
use crate::error::{Result, SupervisorError};

/// Encodes text and writes it into the parent-to-child pipe.
#[derive(Debug)]
pub struct InputWriter {
    endpoint: Mutex<Option<PipeWriter>>,
    codec: TextCodec,
    line_ending: LineEnding,
}

impl InputWriter {
    pub fn new(endpoint: PipeWriter, codec: TextCodec, line_ending: LineEnding) -> Self {
        Self {
            endpoint: Mutex::new(Some(endpoint)),
            codec,
            line_ending,
        }
    }

    /// Append the line terminator, encode, and write the whole line.
    pub fn write_line(&self, text: &str) -> Result<()> {
        debug!("Input: {}", text);
        let mut line = String::with_capacity(text.len() + 2);
        line.push_str(text);
        line.push_str(self.line_ending.as_str());
        let bytes = self.codec.encode(&line);
        self.write_bytes(&bytes)
    }

    /// Write raw bytes without any terminator or transcoding.
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.endpoint.lock();
        let endpoint = guard.as_mut().ok_or(SupervisorError::ClosedPipe)?;
        write_fully(endpoint, bytes)?;
        endpoint.flush().map_err(|source| SupervisorError::Io {
            action: "flushing child stdin",
            source,
        })
    }

    /// Release the endpoint so the child reads end-of-input. Idempotent.
    pub fn close(&self) {
        if self.endpoint.lock().take().is_some() {
            debug!("child stdin closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.endpoint.lock().is_none()
    }
}

fn write_fully<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    let expected = bytes.len();
    let mut written = 0usize;
    while written < expected {
        match writer.write(&bytes[written..]) {
            Ok(0) => {
                return Err(SupervisorError::PartialWrite {
                    written,
                    expected,
                    source: None,
                });
            }
            Ok(count) => written += count,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) if written == 0 && err.kind() == io::ErrorKind::BrokenPipe => {
                return Err(SupervisorError::ClosedPipe);
            }
            Err(source) if written == 0 => {
                return Err(SupervisorError::Io {
                    action: "writing child stdin",
                    source,
                });
            }
            Err(source) => {
                return Err(SupervisorError::PartialWrite {
                    written,
                    expected,
                    source: Some(source),
                });
            }
        }
    }
    Ok(())
}
