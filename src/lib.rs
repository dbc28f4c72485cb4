//! termflix - stream torrents straight into a local media player
//!
//! Drives an external torrent-to-HTTP bridge, decides when enough of the
//! video is on disk, runs mpv or VLC on it, remembers where you stopped and
//! tears everything down exactly once however the session ends.
//!
//! # Modules
//!
//! - `session` - the orchestrator for one stream
//! - `stream` - bridge, content discovery, buffering, player and cleanup pieces
//! - `models` - session, status record and watch-history data
//! - `config` / `cli` / `commands` - the command-line front end

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod session;
pub mod stream;

// Re-export commonly used types
pub use error::{HistoryError, SessionError};
pub use models::{BufferState, MediaMeta, Session, StatusRecord, WatchHistoryEntry};
pub use session::{SessionEvent, SessionOutcome, SessionSettings, StreamRequest, StreamSession};
