//! Anonymous one-direction pipes shared between the supervisor and its child.
//!
//! Both ends are created close-on-exec (non-inheritable on Windows). An end only
//! becomes visible to a child when it is moved into that child's `Stdio`, so
//! unrelated children spawned concurrently never receive a copy.

use std::io;

use os_pipe::{PipeReader, PipeWriter};

use crate::error::{Result, SupervisorError};

/// A matched read/write pair carrying one direction of traffic.
#[derive(Debug)]
pub struct DuplexPipe {
    read_end: Option<PipeReader>,
    write_end: Option<PipeWriter>,
}

impl DuplexPipe {
    /// Allocate a connected pipe.
    pub fn create() -> Result<Self> {
        let (read_end, write_end) =
            os_pipe::pipe().map_err(|source| SupervisorError::PipeCreation { source })?;
        Ok(Self {
            read_end: Some(read_end),
            write_end: Some(write_end),
        })
    }

    pub fn read_end(&self) -> Option<&PipeReader> {
        self.read_end.as_ref()
    }

    pub fn write_end(&self) -> Option<&PipeWriter> {
        self.write_end.as_ref()
    }

    /// Move the read end out, e.g. to hand it to a child or a drain task.
    pub fn take_read_end(&mut self) -> Option<PipeReader> {
        self.read_end.take()
    }

    /// Move the write end out, e.g. to hand it to a child or an input writer.
    pub fn take_write_end(&mut self) -> Option<PipeWriter> {
        self.write_end.take()
    }

    /// Put back a read end that was lent out with [`take_read_end`](Self::take_read_end).
    pub fn restore_read_end(&mut self, read_end: PipeReader) {
        self.read_end = Some(read_end);
    }

    /// Release both ends. Calling this more than once is a no-op.
    pub fn close(&mut self) {
        drop(self.read_end.take());
        drop(self.write_end.take());
    }

    pub fn is_closed(&self) -> bool {
        self.read_end.is_none() && self.write_end.is_none()
    }
}

impl Drop for DuplexPipe {
    fn drop(&mut self) {
        self.close();
    }
}

/// Number of bytes that can be read from `reader` right now without blocking.
///
/// Once every writer is gone and nothing is buffered, this reports an error of
/// kind [`io::ErrorKind::BrokenPipe`], which callers treat as end-of-stream.
#[cfg(unix)]
#[allow(unsafe_code)]
pub fn bytes_available(reader: &PipeReader) -> io::Result<usize> {
    use std::os::unix::io::AsRawFd;

    let fd = reader.as_raw_fd();
    let mut poll_fd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    // Zero timeout: only sample the current readiness.
    let rc = unsafe { libc::poll(&mut poll_fd, 1, 0) };
    if rc == -1 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err);
    }
    if poll_fd.revents & libc::POLLNVAL != 0 {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }

    let mut available: libc::c_int = 0;
    if unsafe { libc::ioctl(fd, libc::FIONREAD, &mut available) } == -1 {
        return Err(io::Error::last_os_error());
    }

    if available == 0 && poll_fd.revents & (libc::POLLHUP | libc::POLLERR) != 0 {
        return Err(io::Error::from(io::ErrorKind::BrokenPipe));
    }

    Ok(usize::try_from(available).unwrap_or(0))
}

/// Number of bytes that can be read from `reader` right now without blocking.
///
/// `PeekNamedPipe` fails with `ERROR_BROKEN_PIPE` once the write side is gone,
/// which maps to [`io::ErrorKind::BrokenPipe`].
#[cfg(windows)]
#[allow(unsafe_code)]
pub fn bytes_available(reader: &PipeReader) -> io::Result<usize> {
    use std::os::windows::io::AsRawHandle;
    use std::ptr;

    let handle = reader.as_raw_handle();
    let mut available: u32 = 0;
    let ok = unsafe {
        winapi::um::namedpipeapi::PeekNamedPipe(
            handle.cast(),
            ptr::null_mut(),
            0,
            ptr::null_mut(),
            &mut available,
            ptr::null_mut(),
        )
    };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(available as usize)
}

/// Whether a read failure only means the other side went away.
pub fn is_end_of_stream(error: &io::Error) -> bool {
    if matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof
    ) {
        return true;
    }

    #[cfg(unix)]
    {
        error.raw_os_error() == Some(libc::EBADF)
    }

    #[cfg(windows)]
    {
        matches!(
            error.raw_os_error(),
            Some(code) if code == winapi::shared::winerror::ERROR_INVALID_HANDLE as i32
                || code == winapi::shared::winerror::ERROR_BROKEN_PIPE as i32
        )
    }

    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn create_yields_both_ends() -> Result<()> {
        let pipe = DuplexPipe::create()?;
        assert!(pipe.read_end().is_some());
        assert!(pipe.write_end().is_some());
        assert!(!pipe.is_closed());
        Ok(())
    }

    #[test]
    fn close_is_idempotent() -> Result<()> {
        let mut pipe = DuplexPipe::create()?;
        pipe.close();
        assert!(pipe.is_closed());
        pipe.close();
        assert!(pipe.is_closed());
        assert!(pipe.take_read_end().is_none());
        Ok(())
    }

    #[test]
    fn bytes_flow_in_order() -> anyhow::Result<()> {
        let mut pipe = DuplexPipe::create()?;
        let mut writer = pipe.take_write_end().expect("write end");
        writer.write_all(b"first ")?;
        writer.write_all(b"second")?;
        drop(writer);

        let mut reader = pipe.take_read_end().expect("read end");
        let mut received = String::new();
        reader.read_to_string(&mut received)?;
        assert_eq!(received, "first second");
        Ok(())
    }

    #[test]
    fn bytes_available_tracks_buffer() -> anyhow::Result<()> {
        let mut pipe = DuplexPipe::create()?;
        let mut writer = pipe.take_write_end().expect("write end");
        let reader = pipe.read_end().expect("read end");

        assert_eq!(bytes_available(reader)?, 0);
        writer.write_all(b"hello")?;
        assert_eq!(bytes_available(reader)?, 5);
        Ok(())
    }

    #[test]
    fn drained_pipe_without_writers_is_end_of_stream() -> anyhow::Result<()> {
        let mut pipe = DuplexPipe::create()?;
        let mut writer = pipe.take_write_end().expect("write end");
        writer.write_all(b"tail")?;
        drop(writer);

        let mut reader = pipe.take_read_end().expect("read end");
        // Buffered bytes are still reported after the writer is gone.
        assert_eq!(bytes_available(&reader)?, 4);
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf)?;

        let err = bytes_available(&reader).expect_err("writer closed");
        assert!(is_end_of_stream(&err), "unexpected error: {err}");
        Ok(())
    }

    #[test]
    fn restore_read_end_reinstates_ownership() -> Result<()> {
        let mut pipe = DuplexPipe::create()?;
        let reader = pipe.take_read_end().expect("read end");
        assert!(pipe.read_end().is_none());
        pipe.restore_read_end(reader);
        assert!(pipe.read_end().is_some());
        Ok(())
    }
}
