//! Process-group helpers for reliable child cleanup.
//!
//! Scanner invocations routinely spawn their own children (`bash -c`
//! pipelines, wrapper scripts), so termination must target the whole group:
//! the child is made a group leader in `pre_exec` and signals go through
//! `killpg`. On non-Unix platforms these helpers degrade to no-ops.

use std::io;

/// Signal sent when terminating a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    Term,
    Kill,
}

#[cfg(unix)]
impl KillSignal {
    fn as_libc_signal(self) -> libc::c_int {
        match self {
            KillSignal::Term => libc::SIGTERM,
            KillSignal::Kill => libc::SIGKILL,
        }
    }
}

/// Put the calling process into its own process group.
///
/// Intended for use in `pre_exec` so the child becomes the group leader.
#[cfg(unix)]
pub fn set_process_group() -> io::Result<()> {
    if unsafe { libc::setpgid(0, 0) } == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(not(unix))]
pub fn set_process_group() -> io::Result<()> {
    Ok(())
}

/// Send a signal to the process group of `pid` (best-effort).
///
/// A vanished group (ESRCH) is not an error: the work is already done.
#[cfg(unix)]
pub fn signal_process_group(pid: u32, signal: KillSignal) -> io::Result<()> {
    let pid = pid as libc::pid_t;
    let pgid = unsafe { libc::getpgid(pid) };
    if pgid == -1 {
        return Ok(());
    }
    if unsafe { libc::killpg(pgid, signal.as_libc_signal()) } == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn signal_process_group(_pid: u32, _signal: KillSignal) -> io::Result<()> {
    Ok(())
}

/// SIGTERM the group, give it a grace period, then SIGKILL whatever is left.
pub async fn terminate_process_group(pid: u32, grace: std::time::Duration) {
    let _ = signal_process_group(pid, KillSignal::Term);
    tokio::time::sleep(grace).await;
    let _ = signal_process_group(pid, KillSignal::Kill);
}
