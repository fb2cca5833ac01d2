//! OS-specific helpers for reliable child termination.
//!
//! - `set_process_group` runs in `pre_exec` so the child leads its own process
//!   group; forced termination then reaches grandchildren that may still hold
//!   the output pipe open.
//! - `kill_process_group` sends SIGKILL to that whole group.
//! - `terminate_process` (Windows) ends a process with a caller-chosen exit code.
//! - `exit_code_from_status` folds signal terminations into a single integer.

use std::io;
use std::process::{Child, ExitStatus};

/// Put the calling process into its own process group.
///
/// Intended for use in `pre_exec` so the child becomes the group leader.
#[cfg(unix)]
#[allow(unsafe_code)]
pub fn set_process_group() -> io::Result<()> {
    let result = unsafe { libc::setpgid(0, 0) };
    if result == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// SIGKILL every process in a group. A group that no longer exists is not an
/// error.
#[cfg(unix)]
#[allow(unsafe_code)]
pub fn kill_process_group(process_group_id: u32) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(process_group_id)
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let result = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if result == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

/// Terminate `child` with the given exit code.
#[cfg(windows)]
#[allow(unsafe_code)]
pub fn terminate_process(child: &Child, exit_code: i32) -> io::Result<()> {
    use std::os::windows::io::AsRawHandle;

    let handle = child.as_raw_handle();
    let success = unsafe {
        winapi::um::processthreadsapi::TerminateProcess(handle.cast(), exit_code as u32)
    };
    if success == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Force-terminate a running child.
///
/// On Unix the whole process group receives SIGKILL and the requested exit code
/// is only recorded by the caller; on Windows it becomes the real exit code.
pub fn force_terminate(child: &mut Child, exit_code: i32) -> io::Result<()> {
    #[cfg(unix)]
    {
        let _ = exit_code;
        match kill_process_group(child.id()) {
            Ok(()) => Ok(()),
            // The group may be gone while the leader is still unreaped.
            Err(_) => child.kill(),
        }
    }

    #[cfg(windows)]
    {
        terminate_process(child, exit_code)
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = exit_code;
        child.kill()
    }
}

/// Integer exit code for a finished child. Signal terminations map to
/// `128 + signal` unless `killed_with` carries the code requested through a
/// forced kill issued by the supervisor.
pub fn exit_code_from_status(status: ExitStatus, killed_with: Option<i32>) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;

        match (status.signal(), killed_with) {
            (Some(libc::SIGKILL), Some(requested)) => requested,
            (Some(signal), _) => 128 + signal,
            (None, requested) => requested.unwrap_or(-1),
        }
    }

    #[cfg(not(unix))]
    {
        killed_with.unwrap_or(-1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_kill_nonexistent_process_group() {
        // ESRCH is folded into Ok.
        assert!(kill_process_group(2_000_000_000).is_ok());
    }

    #[cfg(unix)]
    #[test]
    #[allow(unsafe_code)]
    fn test_kill_process_group_reaches_group_leader() -> io::Result<()> {
        use std::os::unix::process::{CommandExt, ExitStatusExt};
        use std::process::Command;

        let mut command = Command::new("/bin/sh");
        command.args(["-c", "sleep 30"]);
        unsafe {
            command.pre_exec(set_process_group);
        }
        let mut child = command.spawn()?;

        kill_process_group(child.id())?;
        let status = child.wait()?;
        assert_eq!(status.signal(), Some(libc::SIGKILL));
        assert_eq!(exit_code_from_status(status, Some(42)), 42);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_code_from_signal() {
        use std::os::unix::process::ExitStatusExt;

        // Raw wait status for "terminated by SIGKILL".
        let killed = ExitStatus::from_raw(libc::SIGKILL);
        assert_eq!(exit_code_from_status(killed, None), 128 + libc::SIGKILL);
        assert_eq!(exit_code_from_status(killed, Some(7)), 7);

        // Raw wait status for "exited with code 2".
        let exited = ExitStatus::from_raw(2 << 8);
        assert_eq!(exit_code_from_status(exited, Some(7)), 2);
    }
}
