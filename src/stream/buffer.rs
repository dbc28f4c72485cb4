//! Buffer readiness monitoring and the published status record
//!
//! `BufferTracker` holds the readiness rules and is pure; `BufferMonitor`
//! drives it from file-size polls and publishes every tick through the
//! `StatusPublisher` (the status file read by the UI layer).

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::models::{format_bytes, BufferState, StatusRecord};
use crate::stream::bridge::BridgeProcess;
use crate::stream::sleep_or_cancel;

/// Readiness thresholds and polling limits
#[derive(Debug, Clone)]
pub struct BufferSettings {
    /// Bytes considered enough for a smooth start
    pub target_bytes: u64,
    pub poll_interval: Duration,
    /// Unchanged-size polls after which a full buffer is accepted as ready
    pub stall_polls: u32,
    /// Overall cap; on expiry we proceed with whatever is buffered
    pub max_wait: Duration,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            target_bytes: 50 * 1024 * 1024,
            poll_interval: Duration::from_secs(1),
            stall_polls: 10,
            max_wait: Duration::from_secs(300),
        }
    }
}

impl BufferSettings {
    /// Iteration cap derived from the overall wait
    pub fn max_polls(&self) -> u32 {
        let interval = self.poll_interval.as_millis().max(1);
        let polls = self.max_wait.as_millis().div_ceil(interval);
        polls.clamp(1, u32::MAX as u128) as u32
    }
}

/// Result of one observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferVerdict {
    Waiting,
    /// Target reached while the download is alive
    Ready,
    /// Target reached, growth paused for `stall_polls` polls
    StallAccepted,
}

/// How buffering ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOutcome {
    Ready,
    StallAccepted,
    /// Wait cap hit; playback starts on a partial buffer
    TimedOut,
    /// Bridge exited mid-buffer; playback starts on what is on disk
    BridgeExited,
}

/// Pure readiness rules over successive file-size observations
#[derive(Debug, Clone)]
pub struct BufferTracker {
    target_bytes: u64,
    stall_polls: u32,
    last_size: Option<u64>,
    unchanged_polls: u32,
}

impl BufferTracker {
    pub fn new(target_bytes: u64, stall_polls: u32) -> Self {
        Self {
            target_bytes,
            stall_polls,
            last_size: None,
            unchanged_polls: 0,
        }
    }

    /// Bytes gained since the previous observation
    pub fn delta(&self, size: u64) -> u64 {
        self.last_size.map(|prev| size.saturating_sub(prev)).unwrap_or(0)
    }

    /// Feed one poll. The first observation is only a baseline.
    pub fn observe(&mut self, size: u64, connected_peers: u32) -> BufferVerdict {
        let grew = match self.last_size {
            Some(prev) => size > prev,
            None => false,
        };
        if self.last_size.is_some() && !grew {
            self.unchanged_polls += 1;
        } else {
            self.unchanged_polls = 0;
        }
        self.last_size = Some(size);

        if size < self.target_bytes {
            return BufferVerdict::Waiting;
        }
        // A full file that is neither growing nor served by peers is ready only
        // by stall acceptance (see "Stall acceptance" in DESIGN.md).
        if grew || connected_peers > 0 {
            return BufferVerdict::Ready;
        }
        if self.unchanged_polls >= self.stall_polls {
            return BufferVerdict::StallAccepted;
        }
        BufferVerdict::Waiting
    }

    pub fn unchanged_polls(&self) -> u32 {
        self.unchanged_polls
    }
}

// =============================================================================
// Status Publisher
// =============================================================================

/// Single writer of the status record and its file
pub struct StatusPublisher {
    path: PathBuf,
    record: StatusRecord,
}

impl StatusPublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            record: StatusRecord::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self) -> &StatusRecord {
        &self.record
    }

    /// Mutate the record and rewrite the file
    pub fn update(&mut self, f: impl FnOnce(&mut StatusRecord)) {
        f(&mut self.record);
        self.publish();
    }

    /// Move the state machine forward and publish; backward moves are refused
    pub fn advance(&mut self, next: BufferState) -> bool {
        let from = self.record.state;
        if !self.record.advance(next) {
            warn!(%from, to = %next, "refusing backward state transition");
            return false;
        }
        if from != next {
            debug!(%from, to = %next, "state transition");
        }
        self.publish();
        true
    }

    /// Rewrite the whole file (temp file + rename, so readers never see half a line)
    pub fn publish(&self) {
        let tmp = self.path.with_extension("tmp");
        let line = format!("{}\n", self.record.to_line());
        let result = std::fs::write(&tmp, line).and_then(|_| std::fs::rename(&tmp, &self.path));
        if let Err(e) = result {
            debug!(path = %self.path.display(), error = %e, "status file not written");
        }
    }

    /// Read whatever record is currently published at `path`
    pub fn read(path: &Path) -> Option<StatusRecord> {
        let content = std::fs::read_to_string(path).ok()?;
        StatusRecord::parse_line(content.lines().next()?)
    }
}

// =============================================================================
// Buffer Monitor
// =============================================================================

/// Polls the main video's size until playback can start
pub struct BufferMonitor {
    settings: BufferSettings,
}

impl BufferMonitor {
    pub fn new(settings: BufferSettings) -> Self {
        Self { settings }
    }

    /// Poll until ready, stall-accepted, or the wait cap expires
    ///
    /// `on_tick` sees every published record (CLI progress display).
    pub async fn run(
        &self,
        video: &Path,
        bridge: &BridgeProcess,
        status: &mut StatusPublisher,
        cancel: &CancellationToken,
        mut on_tick: impl FnMut(&StatusRecord),
    ) -> Result<BufferOutcome, SessionError> {
        let target = self.settings.target_bytes;
        let interval_secs = self.settings.poll_interval.as_secs_f64().max(0.001);
        let mut tracker = BufferTracker::new(target, self.settings.stall_polls);
        status.advance(BufferState::Buffering);

        for _ in 0..self.settings.max_polls() {
            let size = std::fs::metadata(video).map(|m| m.len()).unwrap_or(0);
            let telemetry = bridge.telemetry();
            let speed = (tracker.delta(size) as f64 / interval_secs) as u64;
            let verdict = tracker.observe(size, telemetry.connected_peers);

            status.update(|r| {
                r.set_buffered(size, target);
                r.speed_bytes_per_sec = speed;
                r.connected_peers = telemetry.connected_peers;
                r.total_peers = telemetry.total_peers;
            });
            on_tick(status.record());

            match verdict {
                BufferVerdict::Ready => {
                    info!(buffered = %format_bytes(size), "buffer ready");
                    status.advance(BufferState::Ready);
                    return Ok(BufferOutcome::Ready);
                }
                BufferVerdict::StallAccepted => {
                    info!(
                        buffered = %format_bytes(size),
                        polls = tracker.unchanged_polls(),
                        "download stalled with a full buffer, starting anyway"
                    );
                    status.advance(BufferState::Ready);
                    return Ok(BufferOutcome::StallAccepted);
                }
                BufferVerdict::Waiting => {}
            }

            if !bridge.process().is_running() {
                warn!(buffered = %format_bytes(size), "bridge exited while buffering");
                status.advance(BufferState::Ready);
                return Ok(BufferOutcome::BridgeExited);
            }

            sleep_or_cancel(self.settings.poll_interval, cancel).await?;
        }

        warn!(
            wait_secs = self.settings.max_wait.as_secs(),
            progress = status.record().progress_pct,
            "buffer wait expired, starting playback on a partial buffer"
        );
        status.advance(BufferState::Ready);
        Ok(BufferOutcome::TimedOut)
    }
}
