//! Data structures shared across a streaming session
//!
//! - **Session**: the unit of work for one stream
//! - **Buffer**: readiness state machine and the published status record
//! - **History**: resumable watch-history entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Watch percentage at which an entry counts as completed
pub const COMPLETED_PERCENTAGE: f64 = 95.0;

// =============================================================================
// Session Models
// =============================================================================

/// What the catalog collaborator hands over along with the source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaMeta {
    pub title: Option<String>,
    pub quality: Option<String>,
    pub size: Option<String>,
}

/// One streaming session, owned by the orchestrator for its whole lifetime
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub source: String,
    pub content_hash: String,
    pub bridge_pid: Option<u32>,
    pub player_pid: Option<u32>,
    pub video_path: Option<PathBuf>,
    pub subtitle_path: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub meta: MediaMeta,
}

impl Session {
    /// Create a session for an already-normalized source
    pub fn new(source: impl Into<String>, content_hash: impl Into<String>, meta: MediaMeta) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            content_hash: content_hash.into(),
            bridge_pid: None,
            player_pid: None,
            video_path: None,
            subtitle_path: None,
            started_at: Utc::now(),
            meta,
        }
    }

    /// Title for history and display, falling back to the video file name
    pub fn display_title(&self) -> String {
        if let Some(title) = self.meta.title.as_deref().filter(|t| !t.trim().is_empty()) {
            return title.to_string();
        }
        self.video_path
            .as_ref()
            .and_then(|p| p.file_stem())
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.content_hash.clone())
    }
}

/// A candidate media file inside the bridge's content directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFile {
    pub path: PathBuf,
    pub size: u64,
}

// =============================================================================
// Buffer State Machine
// =============================================================================

/// Readiness state of a session, published for observers
///
/// Only moves forward: Starting → Analyzing → Buffering → Ready → Playing.
/// Failed is terminal and reachable from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BufferState {
    /// Bridge spawned, no content path yet
    Starting,
    /// Content path known, looking for the main video
    Analyzing,
    /// Main video selected, waiting for enough bytes
    Buffering,
    /// Enough data to start the player
    Ready,
    /// Player confirmed alive
    Playing,
    /// Unrecoverable
    Failed,
}

impl BufferState {
    fn rank(&self) -> u8 {
        match self {
            BufferState::Starting => 0,
            BufferState::Analyzing => 1,
            BufferState::Buffering => 2,
            BufferState::Ready => 3,
            BufferState::Playing => 4,
            BufferState::Failed => u8::MAX,
        }
    }

    /// Whether moving from `self` to `next` is allowed
    pub fn can_advance_to(&self, next: BufferState) -> bool {
        if *self == BufferState::Failed {
            return false;
        }
        next == BufferState::Failed || next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BufferState::Starting => "STARTING",
            BufferState::Analyzing => "ANALYZING",
            BufferState::Buffering => "BUFFERING",
            BufferState::Ready => "READY",
            BufferState::Playing => "PLAYING",
            BufferState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BufferState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STARTING" => Ok(BufferState::Starting),
            "ANALYZING" => Ok(BufferState::Analyzing),
            "BUFFERING" => Ok(BufferState::Buffering),
            "READY" => Ok(BufferState::Ready),
            "PLAYING" => Ok(BufferState::Playing),
            "FAILED" => Ok(BufferState::Failed),
            other => Err(format!("unknown buffer state '{}'", other)),
        }
    }
}

/// Buffering progress as seen by observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub progress_pct: u8,
    pub speed_bytes_per_sec: u64,
    pub connected_peers: u32,
    pub total_peers: u32,
    pub buffered_bytes: u64,
    pub state: BufferState,
    pub stream_url: Option<String>,
    pub bridge_pid: Option<u32>,
}

impl Default for StatusRecord {
    fn default() -> Self {
        Self {
            progress_pct: 0,
            speed_bytes_per_sec: 0,
            connected_peers: 0,
            total_peers: 0,
            buffered_bytes: 0,
            state: BufferState::Starting,
            stream_url: None,
            bridge_pid: None,
        }
    }
}

impl StatusRecord {
    /// Record buffered bytes and derive the clamped progress
    pub fn set_buffered(&mut self, buffered_bytes: u64, target_bytes: u64) {
        self.buffered_bytes = buffered_bytes;
        self.progress_pct = progress_pct(buffered_bytes, target_bytes);
    }

    /// Move to `next` if the transition graph allows it
    pub fn advance(&mut self, next: BufferState) -> bool {
        if self.state == next {
            return true;
        }
        if self.state.can_advance_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    /// Single-line wire form:
    /// `progress|speedBytes|connectedPeers|totalPeers|bufferedBytes|state|streamUrl|bridgePid`
    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}",
            self.progress_pct,
            self.speed_bytes_per_sec,
            self.connected_peers,
            self.total_peers,
            self.buffered_bytes,
            self.state,
            self.stream_url.as_deref().unwrap_or(""),
            self.bridge_pid.map(|p| p.to_string()).unwrap_or_default(),
        )
    }

    /// Parse the single-line wire form back into a record
    pub fn parse_line(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split('|').collect();
        if fields.len() != 8 {
            return None;
        }
        let progress: u8 = fields[0].parse().ok()?;
        Some(Self {
            progress_pct: progress.min(100),
            speed_bytes_per_sec: fields[1].parse().ok()?,
            connected_peers: fields[2].parse().ok()?,
            total_peers: fields[3].parse().ok()?,
            buffered_bytes: fields[4].parse().ok()?,
            state: fields[5].parse().ok()?,
            stream_url: Some(fields[6]).filter(|s| !s.is_empty()).map(str::to_string),
            bridge_pid: fields[7].parse().ok(),
        })
    }
}

impl fmt::Display for StatusRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}% ({} buffered) @ {} - {}/{} peers",
            self.state,
            self.progress_pct,
            format_bytes(self.buffered_bytes),
            format_speed(self.speed_bytes_per_sec),
            self.connected_peers,
            self.total_peers
        )
    }
}

/// Buffer readiness as a percentage, never above 100
pub fn progress_pct(buffered_bytes: u64, target_bytes: u64) -> u8 {
    if target_bytes == 0 {
        return 100;
    }
    let pct = (buffered_bytes as u128 * 100) / target_bytes as u128;
    pct.min(100) as u8
}

// =============================================================================
// Watch History Models
// =============================================================================

/// Persisted resume point for one piece of content, keyed by content hash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchHistoryEntry {
    pub title: String,
    pub last_position_seconds: u64,
    pub duration_seconds: u64,
    pub percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    pub last_watched_at: DateTime<Utc>,
    pub completed: bool,
}

impl WatchHistoryEntry {
    /// Build an entry, deriving percentage and completion from position/duration
    pub fn new(
        title: impl Into<String>,
        position_seconds: u64,
        duration_seconds: u64,
        meta: &MediaMeta,
        watched_at: DateTime<Utc>,
    ) -> Self {
        let percentage = watch_percentage(position_seconds, duration_seconds);
        Self {
            title: title.into(),
            last_position_seconds: position_seconds,
            duration_seconds,
            percentage,
            quality: meta.quality.clone(),
            size: meta.size.clone(),
            last_watched_at: watched_at,
            completed: percentage >= COMPLETED_PERCENTAGE,
        }
    }
}

impl fmt::Display for WatchHistoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = if self.completed { " ✓" } else { "" };
        write!(
            f,
            "{} - {} / {} ({:.0}%){}",
            self.title,
            format_clock(self.last_position_seconds),
            format_clock(self.duration_seconds),
            self.percentage,
            mark
        )
    }
}

/// `clamp(position * 100 / duration, 0, 100)`; zero duration yields 0
pub fn watch_percentage(position_seconds: u64, duration_seconds: u64) -> f64 {
    if duration_seconds == 0 {
        return 0.0;
    }
    (position_seconds as f64 * 100.0 / duration_seconds as f64).clamp(0.0, 100.0)
}

// =============================================================================
// Formatting Helpers
// =============================================================================

/// Format a byte count for display
pub fn format_bytes(bytes: u64) -> String {
    let gb = bytes as f64 / (1024.0 * 1024.0 * 1024.0);
    if gb >= 1.0 {
        format!("{:.2} GB", gb)
    } else {
        let mb = bytes as f64 / (1024.0 * 1024.0);
        format!("{:.1} MB", mb)
    }
}

/// Format a download speed for display
pub fn format_speed(bytes_per_sec: u64) -> String {
    let mb_per_sec = bytes_per_sec as f64 / (1024.0 * 1024.0);
    format!("{:.1} MB/s", mb_per_sec)
}

/// Format seconds as H:MM:SS
pub fn format_clock(seconds: u64) -> String {
    format!(
        "{}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // BufferState Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_state_moves_forward_only() {
        let mut record = StatusRecord::default();
        assert!(record.advance(BufferState::Analyzing));
        assert!(record.advance(BufferState::Buffering));
        assert!(!record.advance(BufferState::Starting));
        assert_eq!(record.state, BufferState::Buffering);
        assert!(record.advance(BufferState::Ready));
        assert!(record.advance(BufferState::Playing));
        assert!(!record.advance(BufferState::Buffering));
    }

    #[test]
    fn test_failed_is_terminal_and_reachable_from_anywhere() {
        for state in [
            BufferState::Starting,
            BufferState::Analyzing,
            BufferState::Buffering,
            BufferState::Ready,
            BufferState::Playing,
        ] {
            assert!(state.can_advance_to(BufferState::Failed));
        }
        assert!(!BufferState::Failed.can_advance_to(BufferState::Ready));
    }

    #[test]
    fn test_state_skips_are_forward() {
        assert!(BufferState::Starting.can_advance_to(BufferState::Buffering));
        assert!(!BufferState::Ready.can_advance_to(BufferState::Analyzing));
    }

    // -------------------------------------------------------------------------
    // StatusRecord Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_progress_never_exceeds_100() {
        let target = 50 * 1024 * 1024;
        assert_eq!(progress_pct(0, target), 0);
        assert_eq!(progress_pct(target / 2, target), 50);
        assert_eq!(progress_pct(target, target), 100);
        assert_eq!(progress_pct(target * 7, target), 100);
        assert_eq!(progress_pct(u64::MAX, target), 100);
        assert_eq!(progress_pct(10, 0), 100);
    }

    #[test]
    fn test_status_line_format() {
        let record = StatusRecord {
            progress_pct: 42,
            speed_bytes_per_sec: 1048576,
            connected_peers: 5,
            total_peers: 12,
            buffered_bytes: 22020096,
            state: BufferState::Buffering,
            stream_url: Some("http://127.0.0.1:8888/".into()),
            bridge_pid: Some(4242),
        };
        assert_eq!(
            record.to_line(),
            "42|1048576|5|12|22020096|BUFFERING|http://127.0.0.1:8888/|4242"
        );
        assert_eq!(StatusRecord::parse_line(&record.to_line()), Some(record));
    }

    #[test]
    fn test_status_line_rejects_garbage() {
        assert!(StatusRecord::parse_line("").is_none());
        assert!(StatusRecord::parse_line("1|2|3").is_none());
        assert!(StatusRecord::parse_line("x|0|0|0|0|READY||").is_none());
    }

    #[test]
    fn test_status_line_empty_optionals() {
        let record = StatusRecord::parse_line("0|0|0|0|0|STARTING||\n").unwrap();
        assert!(record.stream_url.is_none());
        assert!(record.bridge_pid.is_none());
    }

    // -------------------------------------------------------------------------
    // WatchHistoryEntry Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_percentage_and_completion() {
        let cases = [
            (0u64, 100u64, 0.0, false),
            (50, 100, 50.0, false),
            (94, 100, 94.0, false),
            (95, 100, 95.0, true),
            (100, 100, 100.0, true),
            (250, 100, 100.0, true),
        ];
        for (pos, dur, pct, done) in cases {
            let entry = WatchHistoryEntry::new("t", pos, dur, &MediaMeta::default(), Utc::now());
            assert_eq!(entry.percentage, pct, "pos={} dur={}", pos, dur);
            assert_eq!(entry.completed, done, "pos={} dur={}", pos, dur);
        }
    }

    #[test]
    fn test_zero_duration_is_zero_percent() {
        assert_eq!(watch_percentage(120, 0), 0.0);
    }

    #[test]
    fn test_display_title_fallbacks() {
        let mut session = Session::new("magnet:?xt=urn:btih:abc", "abc", MediaMeta::default());
        assert_eq!(session.display_title(), "abc");
        session.video_path = Some(PathBuf::from("/tmp/x/Big.Movie.2019.mkv"));
        assert_eq!(session.display_title(), "Big.Movie.2019");
        session.meta.title = Some("Big Movie".into());
        assert_eq!(session.display_title(), "Big Movie");
    }

    #[test]
    fn test_format_clock() {
        assert_eq!(format_clock(0), "0:00:00");
        assert_eq!(format_clock(3725), "1:02:05");
    }
}
