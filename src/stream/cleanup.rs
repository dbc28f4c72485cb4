//! Session teardown
//!
//! Everything a session creates is registered here as it is created. One
//! teardown routine serves every exit path (normal completion, errors,
//! interrupts, panics through the guard) and may run any number of times:
//! each resource is released at most once.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::stream::process::{terminate_pid_blocking, ManagedProcess, TerminateOutcome};

enum Tracked {
    Child(ManagedProcess, Duration),
    Pid(u32, Duration),
}

#[derive(Default)]
struct Resources {
    /// Stopped in reverse order: last started, first stopped
    processes: Vec<Tracked>,
    files: Vec<PathBuf>,
    dirs: Vec<PathBuf>,
    terminal_altered: bool,
    runs: u32,
}

/// What one teardown pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub processes: Vec<(u32, TerminateOutcome)>,
    pub removed_paths: usize,
    pub terminal_restored: bool,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
            && self.removed_paths == 0
            && !self.terminal_restored
    }
}

/// Shared registry of session resources
#[derive(Clone, Default)]
pub struct CleanupRegistry {
    resources: Arc<Mutex<Resources>>,
    /// Serializes whole teardown passes
    teardown: Arc<Mutex<()>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_process(&self, process: ManagedProcess, grace: Duration) {
        debug!(pid = process.pid(), label = process.label(), "registered for cleanup");
        self.resources
            .lock()
            .processes
            .push(Tracked::Child(process, grace));
    }

    /// A process we did not spawn (e.g. a forked player); duplicates are ignored
    pub fn register_pid(&self, pid: u32, grace: Duration) {
        let mut res = self.resources.lock();
        let known = res.processes.iter().any(|t| match t {
            Tracked::Child(p, _) => p.pid() == pid,
            Tracked::Pid(p, _) => *p == pid,
        });
        if !known {
            debug!(pid, "foreign pid registered for cleanup");
            res.processes.push(Tracked::Pid(pid, grace));
        }
    }

    pub fn register_file(&self, path: impl Into<PathBuf>) {
        self.resources.lock().files.push(path.into());
    }

    pub fn register_dir(&self, path: impl Into<PathBuf>) {
        self.resources.lock().dirs.push(path.into());
    }

    /// Terminal state (cursor, raw mode) must be restored on teardown
    pub fn mark_terminal_altered(&self) {
        self.resources.lock().terminal_altered = true;
    }

    /// Number of teardown passes so far
    pub fn runs(&self) -> u32 {
        self.resources.lock().runs
    }

    /// Release everything registered; blocks for process grace periods
    pub fn run_blocking(&self) -> CleanupReport {
        let _serial = self.teardown.lock();
        let taken = {
            let mut res = self.resources.lock();
            res.runs += 1;
            Resources {
                processes: std::mem::take(&mut res.processes),
                files: std::mem::take(&mut res.files),
                dirs: std::mem::take(&mut res.dirs),
                terminal_altered: std::mem::replace(&mut res.terminal_altered, false),
                runs: res.runs,
            }
        };

        let mut report = CleanupReport {
            processes: stop_all(taken.processes),
            ..Default::default()
        };

        for file in &taken.files {
            match std::fs::remove_file(file) {
                Ok(()) => report.removed_paths += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %file.display(), error = %e, "could not remove file"),
            }
        }
        for dir in &taken.dirs {
            match std::fs::remove_dir_all(dir) {
                Ok(()) => report.removed_paths += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %dir.display(), error = %e, "could not remove directory"),
            }
        }

        if taken.terminal_altered {
            restore_terminal();
            report.terminal_restored = true;
        }

        if !report.is_empty() {
            debug!(run = taken.runs, ?report, "cleanup finished");
        }
        report
    }

    /// Stop registered processes only, leaving files for a later full pass
    pub fn stop_processes_blocking(&self) -> Vec<(u32, TerminateOutcome)> {
        let _serial = self.teardown.lock();
        let processes = std::mem::take(&mut self.resources.lock().processes);
        stop_all(processes)
    }

    pub async fn stop_processes(&self) -> Vec<(u32, TerminateOutcome)> {
        let registry = self.clone();
        tokio::task::spawn_blocking(move || registry.stop_processes_blocking())
            .await
            .unwrap_or_default()
    }

    /// `run_blocking` off the async runtime
    pub async fn run(&self) -> CleanupReport {
        let registry = self.clone();
        tokio::task::spawn_blocking(move || registry.run_blocking())
            .await
            .unwrap_or_default()
    }

    /// Guard that runs teardown when dropped
    pub fn guard(&self) -> CleanupGuard {
        CleanupGuard {
            registry: self.clone(),
        }
    }
}

/// Runs the registry's teardown on drop (early returns, panics)
pub struct CleanupGuard {
    registry: CleanupRegistry,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.registry.run_blocking();
    }
}

fn stop_all(processes: Vec<Tracked>) -> Vec<(u32, TerminateOutcome)> {
    processes
        .into_iter()
        .rev()
        .map(|tracked| {
            let (pid, outcome) = match tracked {
                Tracked::Child(process, grace) => (process.pid(), process.terminate_blocking(grace)),
                Tracked::Pid(pid, grace) => (pid, terminate_pid_blocking(pid, grace)),
            };
            if outcome != TerminateOutcome::AlreadyExited {
                info!(pid, ?outcome, "process stopped");
            }
            (pid, outcome)
        })
        .collect()
}

/// Show the cursor and leave raw mode if something left it on
fn restore_terminal() {
    use crossterm::{cursor, execute, terminal};

    if terminal::is_raw_mode_enabled().unwrap_or(false) {
        if let Err(e) = terminal::disable_raw_mode() {
            debug!(error = %e, "could not leave raw mode");
        }
    }
    if let Err(e) = execute!(std::io::stderr(), cursor::Show) {
        debug!(error = %e, "could not show cursor");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_files_removed_once() {
        let dir = tempfile::tempdir().unwrap();
        let status = dir.path().join("status");
        let scratch = dir.path().join("scratch");
        std::fs::write(&status, "x").unwrap();
        std::fs::create_dir_all(scratch.join("sub")).unwrap();

        let registry = CleanupRegistry::new();
        registry.register_file(&status);
        registry.register_file(dir.path().join("never-created"));
        registry.register_dir(&scratch);

        let first = registry.run_blocking();
        assert_eq!(first.removed_paths, 2);
        assert!(!status.exists());
        assert!(!scratch.exists());

        let second = registry.run_blocking();
        assert!(second.is_empty());
        assert_eq!(registry.runs(), 2);
    }

    #[test]
    fn test_guard_runs_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("bridge.log");
        std::fs::write(&file, "x").unwrap();
        let registry = CleanupRegistry::new();
        registry.register_file(&file);
        {
            let _guard = registry.guard();
        }
        assert!(!file.exists());
    }

    #[test]
    fn test_dead_foreign_pid_is_harmless() {
        let registry = CleanupRegistry::new();
        // Above the kernel pid_max ceiling
        registry.register_pid(99_999_999, Duration::from_millis(10));
        registry.register_pid(99_999_999, Duration::from_millis(10));
        let report = registry.run_blocking();
        assert_eq!(report.processes, vec![(99_999_999, TerminateOutcome::AlreadyExited)]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_processes_stopped_last_first() {
        use tokio::process::Command;

        let spawn = |label| {
            let child = Command::new("sleep").arg("30").spawn().unwrap();
            ManagedProcess::new(label, child).unwrap()
        };
        let bridge = spawn("bridge");
        let player = spawn("player");

        let registry = CleanupRegistry::new();
        registry.register_process(bridge.clone(), Duration::from_secs(2));
        registry.register_process(player.clone(), Duration::from_secs(2));

        let report = registry.run().await;
        let pids: Vec<u32> = report.processes.iter().map(|(pid, _)| *pid).collect();
        assert_eq!(pids, vec![player.pid(), bridge.pid()]);
        assert!(!bridge.is_running());
        assert!(!player.is_running());

        assert!(registry.run().await.processes.is_empty());
    }
}
