//! Raw `ptrace(2)` and `waitpid(2)` calls.
//!
//! Everything here must run on the tracer thread: the kernel ties a tracee
//! to the thread that seized it, not to the process.

use std::io;

use libc::{c_int, c_long, pid_t};

use crate::error::{MantleError, MantleResult};

/// Issue a ptrace request and turn `-1` into an error.
///
/// Only requests whose result is not data (no `PEEK*`) go through here, so
/// `-1` always means failure.
macro_rules! ptrace_call {
    ($request:expr, $tid:expr, $addr:expr, $data:expr) => {{
        #[allow(unsafe_code)]
        // SAFETY: the caller passes pointers to live buffers of the size the
        // request expects; everything else is a plain integer.
        let result = unsafe { libc::ptrace($request, $tid, $addr as u64, $data as u64) };
        $crate::platform::linux::ptrace::check(stringify!($request), $tid, result)
    }};
}

pub(crate) use ptrace_call;

/// Convert a raw ptrace result.
pub(crate) fn check(request: &'static str, tid: pid_t, result: c_long) -> MantleResult<c_long>
{
    if result == -1 {
        return Err(os_error(request, tid, io::Error::last_os_error()));
    }
    Ok(result)
}

/// Map an OS error of `request` on `tid` to an engine error.
pub(crate) fn os_error(request: &str, tid: pid_t, err: io::Error) -> MantleError
{
    match err.raw_os_error() {
        Some(libc::ESRCH) => MantleError::ProcessNotFound(tid.unsigned_abs()),
        Some(libc::EPERM) => MantleError::PermissionDenied(format!(
            "{request} on {tid}: {err} (check /proc/sys/kernel/yama/ptrace_scope)"
        )),
        _ => MantleError::Io(io::Error::new(err.kind(), format!("{request} on {tid}: {err}"))),
    }
}

/// Decoded `waitpid` status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitStatus
{
    /// Exited normally with a code.
    Exited(i32),
    /// Terminated by a signal.
    Signaled(i32),
    /// Stopped; `event` is the `PTRACE_EVENT_*` in bits 16..24, or 0.
    Stopped
    {
        signal: i32,
        event: i32,
    },
}

impl WaitStatus
{
    pub(crate) fn decode(status: c_int) -> MantleResult<Self>
    {
        if libc::WIFEXITED(status) {
            Ok(Self::Exited(libc::WEXITSTATUS(status)))
        } else if libc::WIFSIGNALED(status) {
            Ok(Self::Signaled(libc::WTERMSIG(status)))
        } else if libc::WIFSTOPPED(status) {
            Ok(Self::Stopped {
                signal: libc::WSTOPSIG(status),
                event: (status >> 16) & 0xff,
            })
        } else {
            Err(MantleError::invariant(format!("waitpid returned unexpected status 0x{status:x}")))
        }
    }

    /// `true` once the thread is gone.
    pub(crate) const fn is_gone(self) -> bool
    {
        matches!(self, Self::Exited(_) | Self::Signaled(_))
    }
}

fn wait(tid: pid_t, flags: c_int) -> MantleResult<Option<(pid_t, WaitStatus)>>
{
    let mut status: c_int = 0;
    #[allow(unsafe_code)]
    // SAFETY: `status` outlives the call.
    let waited = unsafe { libc::waitpid(tid, &mut status, flags | libc::__WALL) };
    if waited == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ECHILD) {
            return Err(MantleError::NotAttached);
        }
        return Err(os_error("waitpid", tid, err));
    }
    if waited == 0 {
        return Ok(None);
    }
    Ok(Some((waited, WaitStatus::decode(status)?)))
}

/// Next status of any tracee, without blocking.
pub(crate) fn wait_any() -> MantleResult<Option<(pid_t, WaitStatus)>>
{
    wait(-1, libc::WNOHANG)
}

/// Block until `tid` changes state.
pub(crate) fn wait_thread(tid: pid_t) -> MantleResult<WaitStatus>
{
    match wait(tid, 0)? {
        Some((_, status)) => Ok(status),
        None => Err(MantleError::invariant(format!("blocking waitpid({tid}) returned nothing"))),
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn decodes_exit_and_ptrace_event_stops()
    {
        assert_eq!(WaitStatus::decode(3 << 8).ok(), Some(WaitStatus::Exited(3)));
        assert_eq!(WaitStatus::decode(libc::SIGKILL).ok(), Some(WaitStatus::Signaled(libc::SIGKILL)));

        let clone = (libc::PTRACE_EVENT_CLONE << 16) | (libc::SIGTRAP << 8) | 0x7f;
        assert_eq!(
            WaitStatus::decode(clone).ok(),
            Some(WaitStatus::Stopped {
                signal: libc::SIGTRAP,
                event: libc::PTRACE_EVENT_CLONE,
            })
        );
        assert!(WaitStatus::Exited(0).is_gone());
    }
}
