//! Streaming infrastructure
//!
//! - Source: magnet/torrent-file normalization
//! - Bridge: torrent-to-HTTP bridge process and its output
//! - Locator/Buffer: content discovery and buffer readiness
//! - Subtitles: subtitle discovery next to the video
//! - Player/Monitor: player launch and fork-aware liveness
//! - History: resumable watch positions
//! - Cleanup: idempotent session teardown

pub mod bridge;
pub mod buffer;
pub mod cleanup;
pub mod history;
pub mod locator;
pub mod monitor;
pub mod player;
pub mod process;
pub mod source;
pub mod subtitles;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::SessionError;

pub use bridge::{BridgeProcess, BridgeSettings};
pub use buffer::{BufferMonitor, BufferOutcome, BufferSettings, StatusPublisher};
pub use cleanup::CleanupRegistry;
pub use history::{WatchHistoryStore, WatchRecorder};
pub use locator::{ContentLocator, DiscoverySettings};
pub use monitor::{MonitorSettings, PlayerExit, PlayerMonitor};
pub use player::{Player, PlayerKind};
pub use source::{normalize, NormalizedSource};
pub use subtitles::{SubtitleResolver, SubtitleSettings};

/// The single suspension point of every polling loop
pub async fn sleep_or_cancel(interval: Duration, cancel: &CancellationToken) -> Result<(), SessionError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SessionError::Interrupted),
        _ = tokio::time::sleep(interval) => Ok(()),
    }
}
