//! Watch history: resumable positions keyed by content hash
//!
//! The store is one JSON object on disk, rewritten through a temp file and
//! a rename so concurrent readers never see a truncated document.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::HistoryError;
use crate::models::{MediaMeta, WatchHistoryEntry};
use crate::stream::player::{PlaybackPosition, Player};

/// Positions shorter than this resume from the start
pub const MIN_RESUME_SECONDS: u64 = 10;

pub type WatchHistory = BTreeMap<String, WatchHistoryEntry>;

/// JSON-file watch history
#[derive(Debug, Clone)]
pub struct WatchHistoryStore {
    path: PathBuf,
}

impl WatchHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.config/termflix/watch_history.json`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".config")
            .join("termflix")
            .join("watch_history.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whole history; a missing file is an empty history
    pub fn load(&self) -> Result<WatchHistory, HistoryError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(WatchHistory::new()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(WatchHistory::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, history: &WatchHistory) -> Result<(), HistoryError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(history)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Create or replace the entry for `content_hash`
    pub fn save_watch_progress(
        &self,
        content_hash: &str,
        position_seconds: u64,
        duration_seconds: u64,
        title: &str,
        meta: &MediaMeta,
    ) -> Result<WatchHistoryEntry, HistoryError> {
        if duration_seconds == 0 {
            return Err(HistoryError::NoDuration);
        }
        let mut history = self.load()?;
        let entry = WatchHistoryEntry::new(title, position_seconds, duration_seconds, meta, Utc::now());
        history.insert(content_hash.to_lowercase(), entry.clone());
        self.save(&history)?;
        Ok(entry)
    }

    pub fn get(&self, content_hash: &str) -> Result<Option<WatchHistoryEntry>, HistoryError> {
        Ok(self.load()?.remove(&content_hash.to_lowercase()))
    }

    /// Last recorded position, or 0 when there is none (or the store is unreadable)
    pub fn get_watch_position(&self, content_hash: &str) -> u64 {
        match self.get(content_hash) {
            Ok(entry) => entry.map(|e| e.last_position_seconds).unwrap_or(0),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "watch history unreadable");
                0
            }
        }
    }

    /// Where playback should start: finished or barely-started content restarts
    pub fn resume_offset(&self, content_hash: &str) -> u64 {
        match self.get(content_hash) {
            Ok(Some(entry)) if entry.completed => 0,
            Ok(Some(entry)) if entry.last_position_seconds < MIN_RESUME_SECONDS => 0,
            Ok(Some(entry)) => entry.last_position_seconds,
            Ok(None) => 0,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "watch history unreadable");
                0
            }
        }
    }

    /// All entries, most recently watched first
    pub fn entries(&self) -> Result<Vec<(String, WatchHistoryEntry)>, HistoryError> {
        let mut entries: Vec<_> = self.load()?.into_iter().collect();
        entries.sort_by(|a, b| b.1.last_watched_at.cmp(&a.1.last_watched_at));
        Ok(entries)
    }
}

// =============================================================================
// Watch Recorder
// =============================================================================

/// Captures the final playback position and writes it to the store
pub struct WatchRecorder {
    store: WatchHistoryStore,
}

impl WatchRecorder {
    pub fn new(store: WatchHistoryStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &WatchHistoryStore {
        &self.store
    }

    /// Resume state first, then the player log for whatever is still missing
    pub fn extract_position(
        player: &dyn Player,
        state_dir: &Path,
        media: &str,
        log_path: &Path,
    ) -> PlaybackPosition {
        let saved = PlaybackPosition {
            position_seconds: player.saved_position(state_dir, media),
            duration_seconds: None,
        };
        let logged = std::fs::read(log_path)
            .map(|bytes| player.parse_log(&String::from_utf8_lossy(&bytes)))
            .unwrap_or_default();
        debug!(?saved, ?logged, "playback position sources");
        saved.or(logged)
    }

    /// Keep `last` at the player's most recent complete answer; never returns,
    /// so race it against the liveness monitor
    pub async fn track_position(
        player: &dyn Player,
        interval: Duration,
        last: &mut PlaybackPosition,
    ) -> Infallible {
        loop {
            if let Some(position) = player.query_position().await {
                if position.complete().is_some() {
                    *last = position;
                }
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Persist the session's final position; failures are logged, never returned
    pub fn record(
        &self,
        content_hash: &str,
        title: &str,
        meta: &MediaMeta,
        position: PlaybackPosition,
    ) -> Option<WatchHistoryEntry> {
        let Some((pos, dur)) = position.complete() else {
            debug!(?position, "no usable playback position, history unchanged");
            return None;
        };
        match self.store.save_watch_progress(content_hash, pos, dur, title, meta) {
            Ok(entry) => {
                info!(
                    hash = content_hash,
                    position = pos,
                    duration = dur,
                    percentage = entry.percentage,
                    "watch progress saved"
                );
                Some(entry)
            }
            Err(e) => {
                warn!(path = %self.store.path().display(), error = %e, "failed to save watch progress");
                None
            }
        }
    }
}
