//! Player liveness tracking
//!
//! Players fork and re-exec, so the PID we spawned is not proof of anything
//! once it exits. Each [`LivenessProbe`] is one way of finding a living
//! player; the monitor asks them in order and only declares the player gone
//! when all of them agree twice in a row.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use sysinfo::System;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::stream::process::ManagedProcess;
use crate::stream::sleep_or_cancel;

/// A living player process as seen by one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sighting {
    pub strategy: &'static str,
    pub pid: u32,
}

/// One strategy for locating a living player process
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    fn strategy(&self) -> &'static str;

    /// PID of a living player process, if this strategy can see one
    async fn probe(&self) -> Option<u32>;
}

// =============================================================================
// Probes
// =============================================================================

/// The exact process we spawned
pub struct PidProbe {
    process: ManagedProcess,
}

impl PidProbe {
    pub fn new(process: ManagedProcess) -> Self {
        Self { process }
    }
}

#[async_trait]
impl LivenessProbe for PidProbe {
    fn strategy(&self) -> &'static str {
        "pid"
    }

    async fn probe(&self) -> Option<u32> {
        self.process.is_running().then(|| self.process.pid())
    }
}

/// Any process with a player name started since the launch
pub struct ProcessNameProbe {
    names: Vec<String>,
    /// Seconds since the epoch; older processes are someone else's player
    started_after: u64,
    exclude: Vec<u32>,
}

impl ProcessNameProbe {
    pub fn new(names: Vec<String>, launched_at: SystemTime, exclude: Vec<u32>) -> Self {
        let started_after = launched_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs().saturating_sub(1))
            .unwrap_or(0);
        Self {
            names,
            started_after,
            exclude,
        }
    }
}

#[async_trait]
impl LivenessProbe for ProcessNameProbe {
    fn strategy(&self) -> &'static str {
        "process-name"
    }

    async fn probe(&self) -> Option<u32> {
        let names = self.names.clone();
        let started_after = self.started_after;
        let exclude = self.exclude.clone();

        tokio::task::spawn_blocking(move || {
            let mut sys = System::new();
            sys.refresh_processes();
            sys.processes()
                .iter()
                .filter(|(pid, _)| !exclude.contains(&pid.as_u32()))
                .filter(|(_, proc_)| proc_.start_time() >= started_after)
                .find(|(_, proc_)| names.iter().any(|n| proc_.name() == n.as_str()))
                .map(|(pid, _)| pid.as_u32())
        })
        .await
        .ok()
        .flatten()
    }
}

/// Any process holding the video file open (via `lsof`)
pub struct OpenFileProbe {
    target: PathBuf,
    exclude: Vec<u32>,
}

impl OpenFileProbe {
    /// `exclude` should hold the bridge PID, which always has the file open
    pub fn new(target: impl Into<PathBuf>, mut exclude: Vec<u32>) -> Self {
        exclude.push(std::process::id());
        Self {
            target: target.into(),
            exclude,
        }
    }
}

#[async_trait]
impl LivenessProbe for OpenFileProbe {
    fn strategy(&self) -> &'static str {
        "open-file"
    }

    async fn probe(&self) -> Option<u32> {
        let output = Command::new("lsof")
            .arg("-t")
            .arg("--")
            .arg(&self.target)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await
            .ok()?;
        parse_lsof_pids(&String::from_utf8_lossy(&output.stdout))
            .into_iter()
            .find(|pid| !self.exclude.contains(pid))
    }
}

/// PIDs from `lsof -t` output, one per line
pub fn parse_lsof_pids(output: &str) -> Vec<u32> {
    output
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect()
}

// =============================================================================
// Player Monitor
// =============================================================================

/// Polling cadence and the safety net
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    /// Re-check delay before trusting an "all gone" result
    pub confirm_delay: Duration,
    /// Hard cap on polls; the player is terminated when it is reached
    pub safety_polls: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            confirm_delay: Duration::from_secs(1),
            safety_polls: 4 * 60 * 60,
        }
    }
}

/// Why monitoring stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerExit {
    /// No probe could find the player, twice
    Exited,
    /// Poll cap reached with the player still alive
    SafetyTimeout,
    /// Session cancelled from outside
    Cancelled,
}

pub struct PlayerMonitor {
    settings: MonitorSettings,
    probes: Vec<Box<dyn LivenessProbe>>,
}

impl PlayerMonitor {
    /// Probes are consulted in the given order
    pub fn new(settings: MonitorSettings, probes: Vec<Box<dyn LivenessProbe>>) -> Self {
        Self { settings, probes }
    }

    /// First probe that sees a living player
    pub async fn find_alive(&self) -> Option<Sighting> {
        for probe in &self.probes {
            if let Some(pid) = probe.probe().await {
                return Some(Sighting {
                    strategy: probe.strategy(),
                    pid,
                });
            }
        }
        None
    }

    /// Poll until the player is gone
    ///
    /// `on_sighting` fires whenever the living PID changes, starting with the
    /// first confirmation that the player is up.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        mut on_sighting: impl FnMut(Sighting),
    ) -> PlayerExit {
        let mut last_pid = None;

        for _ in 0..self.settings.safety_polls {
            let sighting = match self.find_alive().await {
                Some(s) => Some(s),
                None => {
                    // Fork handoff: the parent may be gone before the child is visible
                    if sleep_or_cancel(self.settings.confirm_delay, cancel).await.is_err() {
                        return PlayerExit::Cancelled;
                    }
                    self.find_alive().await
                }
            };

            let Some(sighting) = sighting else {
                info!(last_pid = ?last_pid, "player exited");
                return PlayerExit::Exited;
            };

            if last_pid != Some(sighting.pid) {
                debug!(pid = sighting.pid, strategy = sighting.strategy, "player alive");
                last_pid = Some(sighting.pid);
                on_sighting(sighting);
            }

            if sleep_or_cancel(self.settings.poll_interval, cancel).await.is_err() {
                return PlayerExit::Cancelled;
            }
        }

        warn!(polls = self.settings.safety_polls, "player safety timeout reached");
        PlayerExit::SafetyTimeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Alive for a fixed number of probes, then gone
    struct CountdownProbe {
        remaining: Arc<AtomicU32>,
        pid: u32,
    }

    #[async_trait]
    impl LivenessProbe for CountdownProbe {
        fn strategy(&self) -> &'static str {
            "countdown"
        }

        async fn probe(&self) -> Option<u32> {
            let left = self.remaining.load(Ordering::SeqCst);
            if left == 0 {
                return None;
            }
            self.remaining.store(left - 1, Ordering::SeqCst);
            Some(self.pid)
        }
    }

    struct Never;

    #[async_trait]
    impl LivenessProbe for Never {
        fn strategy(&self) -> &'static str {
            "never"
        }

        async fn probe(&self) -> Option<u32> {
            None
        }
    }

    fn fast() -> MonitorSettings {
        MonitorSettings {
            poll_interval: Duration::from_millis(5),
            confirm_delay: Duration::from_millis(5),
            safety_polls: 100,
        }
    }

    #[test]
    fn test_parse_lsof_pids() {
        assert_eq!(parse_lsof_pids("123\n456\n"), vec![123, 456]);
        assert!(parse_lsof_pids("").is_empty());
    }

    #[tokio::test]
    async fn test_exits_when_all_probes_agree() {
        let monitor = PlayerMonitor::new(
            fast(),
            vec![
                Box::new(CountdownProbe {
                    remaining: Arc::new(AtomicU32::new(3)),
                    pid: 42,
                }),
                Box::new(Never),
            ],
        );
        let mut seen = Vec::new();
        let exit = monitor.run(&CancellationToken::new(), |s| seen.push(s)).await;
        assert_eq!(exit, PlayerExit::Exited);
        assert_eq!(seen, vec![Sighting { strategy: "countdown", pid: 42 }]);
    }

    #[tokio::test]
    async fn test_fallback_probe_reports_forked_pid() {
        let monitor = PlayerMonitor::new(
            fast(),
            vec![
                Box::new(CountdownProbe {
                    remaining: Arc::new(AtomicU32::new(1)),
                    pid: 10,
                }),
                Box::new(CountdownProbe {
                    remaining: Arc::new(AtomicU32::new(4)),
                    pid: 11,
                }),
            ],
        );
        let mut pids = Vec::new();
        let exit = monitor.run(&CancellationToken::new(), |s| pids.push(s.pid)).await;
        assert_eq!(exit, PlayerExit::Exited);
        assert_eq!(pids, vec![10, 11]);
    }

    #[tokio::test]
    async fn test_safety_timeout() {
        let monitor = PlayerMonitor::new(
            MonitorSettings {
                safety_polls: 3,
                ..fast()
            },
            vec![Box::new(CountdownProbe {
                remaining: Arc::new(AtomicU32::new(u32::MAX)),
                pid: 7,
            })],
        );
        let exit = monitor.run(&CancellationToken::new(), |_| {}).await;
        assert_eq!(exit, PlayerExit::SafetyTimeout);
    }

    #[tokio::test]
    async fn test_cancel_stops_monitoring() {
        let monitor = PlayerMonitor::new(
            MonitorSettings {
                poll_interval: Duration::from_secs(60),
                ..fast()
            },
            vec![Box::new(CountdownProbe {
                remaining: Arc::new(AtomicU32::new(u32::MAX)),
                pid: 7,
            })],
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(monitor.run(&cancel, |_| {}).await, PlayerExit::Cancelled);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pid_probe_follows_real_process() {
        let child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let process = ManagedProcess::new("test", child).unwrap();
        let probe = PidProbe::new(process.clone());
        assert_eq!(probe.probe().await, Some(process.pid()));

        process.terminate_blocking(Duration::from_secs(2));
        assert_eq!(probe.probe().await, None);
    }
}
