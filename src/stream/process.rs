//! Spawned child processes shared between session components
//!
//! The bridge and player handles are held by their owners and by the
//! cleanup registry at the same time, so the `Child` sits behind a mutex.
//! Every operation here is safe on an already-reaped process.

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::process::Child;
use tracing::{debug, warn};

const REAP_POLL: Duration = Duration::from_millis(50);

/// How a termination request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// Process was gone before we signalled it
    AlreadyExited,
    /// Exited within the grace period after SIGTERM
    Terminated,
    /// Needed SIGKILL
    Killed,
}

/// A child process with a cloneable, lock-protected handle
#[derive(Clone)]
pub struct ManagedProcess {
    label: &'static str,
    pid: u32,
    child: Arc<Mutex<Child>>,
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("label", &self.label)
            .field("pid", &self.pid)
            .finish()
    }
}

impl ManagedProcess {
    /// Wrap a freshly spawned child; `None` if it already exited and lost its PID
    pub fn new(label: &'static str, child: Child) -> Option<Self> {
        let pid = child.id()?;
        Some(Self {
            label,
            pid,
            child: Arc::new(Mutex::new(child)),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Exit status if the process has exited (reaps it)
    pub fn exit_status(&self) -> Option<ExitStatus> {
        let mut child = self.child.lock();
        match child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                debug!(pid = self.pid, error = %e, "try_wait failed, treating as exited");
                None
            }
        }
    }

    pub fn is_running(&self) -> bool {
        let mut child = self.child.lock();
        matches!(child.try_wait(), Ok(None))
    }

    /// Wait for exit without holding the lock across await points
    pub async fn wait_exit(&self, poll: Duration) -> Option<ExitStatus> {
        loop {
            {
                let mut child = self.child.lock();
                match child.try_wait() {
                    Ok(Some(status)) => return Some(status),
                    Ok(None) => {}
                    Err(_) => return None,
                }
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL and reap
    ///
    /// Blocking; the cleanup registry runs it off the async runtime.
    pub fn terminate_blocking(&self, grace: Duration) -> TerminateOutcome {
        let mut child = self.child.lock();
        if !matches!(child.try_wait(), Ok(None)) {
            return TerminateOutcome::AlreadyExited;
        }

        debug!(pid = self.pid, label = self.label, "sending SIGTERM");
        send_terminate(self.pid);

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if !matches!(child.try_wait(), Ok(None)) {
                return TerminateOutcome::Terminated;
            }
            std::thread::sleep(REAP_POLL);
        }

        warn!(pid = self.pid, label = self.label, "did not exit after SIGTERM, killing");
        if let Err(e) = child.start_kill() {
            debug!(pid = self.pid, error = %e, "start_kill failed");
        }
        // SIGKILL cannot be ignored; reap so no zombie outlives the session
        for _ in 0..40 {
            if !matches!(child.try_wait(), Ok(None)) {
                break;
            }
            std::thread::sleep(REAP_POLL);
        }
        TerminateOutcome::Killed
    }
}

/// Polite termination request
#[cfg(unix)]
pub fn send_terminate(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
pub fn send_terminate(_pid: u32) {}

/// Forced termination of a process we do not own a handle for
#[cfg(unix)]
pub fn send_kill(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
pub fn send_kill(_pid: u32) {}

/// Whether any process with this PID exists (signal 0 probe)
#[cfg(unix)]
pub fn pid_exists(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    // EPERM: exists but owned by someone else
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_exists(pid: u32) -> bool {
    let mut sys = sysinfo::System::new();
    sys.refresh_processes();
    sys.process(sysinfo::Pid::from_u32(pid)).is_some()
}

/// Terminate a foreign PID: SIGTERM, poll, then SIGKILL
pub fn terminate_pid_blocking(pid: u32, grace: Duration) -> TerminateOutcome {
    if !pid_exists(pid) {
        return TerminateOutcome::AlreadyExited;
    }
    send_terminate(pid);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !pid_exists(pid) {
            return TerminateOutcome::Terminated;
        }
        std::thread::sleep(REAP_POLL);
    }
    send_kill(pid);
    TerminateOutcome::Killed
}
