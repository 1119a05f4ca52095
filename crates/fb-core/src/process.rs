//! Host-local process liveness.
//!
//! The sanity check only ever asks about pids registered on *its own* host,
//! so a plain existence probe is enough. On Unix this is `kill(pid, 0)`,
//! which sends no signal. `EPERM` means the process exists but belongs to
//! another user, so it counts as alive.
//!
//! On non-Unix platforms the probe reports every pid as alive: without a
//! probe nothing may be reaped, and stale rows still age out through the
//! expiration delay.

/// Answers "does this pid currently exist on the local host?"
pub trait ProcessProbe: Send + Sync {
    fn exists(&self, pid: u32) -> bool;
}

/// Probe backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcessProbe;

impl ProcessProbe for OsProcessProbe {
    fn exists(&self, pid: u32) -> bool {
        is_pid_alive(pid)
    }
}

impl<F> ProcessProbe for F
where
    F: Fn(u32) -> bool + Send + Sync,
{
    fn exists(&self, pid: u32) -> bool {
        self(pid)
    }
}

/// Check whether an OS process with the given PID is alive.
pub fn is_pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        pid_alive_unix(pid)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

#[cfg(unix)]
fn pid_alive_unix(pid: u32) -> bool {
    let Ok(pid_t) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // pid 0 and negative values address process groups, not a process
    if pid_t <= 0 {
        return false;
    }
    // SAFETY: kill with sig=0 never sends a signal; it only checks PID existence.
    let result = unsafe { libc::kill(pid_t, 0) };
    if result == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
