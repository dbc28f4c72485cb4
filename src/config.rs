//! Configuration management for termflix
//!
//! Handles config file loading and conversion into session settings.
//! Config is stored at ~/.config/termflix/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::{PlayerSettings, SessionSettings};
use crate::stream::bridge::BridgeSettings;
use crate::stream::buffer::BufferSettings;
use crate::stream::history::WatchHistoryStore;
use crate::stream::locator::DiscoverySettings;
use crate::stream::monitor::MonitorSettings;
use crate::stream::player::PlayerKind;
use crate::stream::subtitles::SubtitleSettings;

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bridge: BridgeConfig,
    pub discovery: DiscoveryConfig,
    pub buffer: BufferConfig,
    pub subtitles: SubtitlesConfig,
    pub player: PlayerConfig,
    pub paths: PathsConfig,
}

/// Torrent-to-HTTP bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub command: String,
    /// Where the bridge materializes content (default: <tmp>/torrent-stream)
    pub content_prefix: Option<PathBuf>,
    pub startup_grace_ms: u64,
    pub terminate_grace_ms: u64,
    /// 0 picks a free port
    pub port: u16,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: "peerflix".to_string(),
            content_prefix: None,
            startup_grace_ms: 2000,
            terminate_grace_ms: 3000,
            port: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub poll_interval_ms: u64,
    pub path_attempts: u32,
    pub video_attempts: u32,
    pub min_video_bytes: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            path_attempts: 25,
            video_attempts: 30,
            min_video_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub target_bytes: u64,
    pub poll_interval_ms: u64,
    pub stall_polls: u32,
    pub max_wait_secs: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            target_bytes: 50 * 1024 * 1024,
            poll_interval_ms: 1000,
            stall_polls: 10,
            max_wait_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubtitlesConfig {
    pub enabled: bool,
    pub wait_secs: u64,
    /// Preferred language tags as they appear in file names
    pub languages: Vec<String>,
}

impl Default for SubtitlesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            wait_secs: 15,
            languages: vec!["eng".to_string(), "en".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub preferred: Option<PlayerKind>,
    /// Explicit player binary
    pub command: Option<PathBuf>,
    pub poll_interval_ms: u64,
    pub confirm_delay_ms: u64,
    /// Polls before a still-running player is terminated
    pub safety_polls: u32,
    pub terminate_grace_ms: u64,
    pub use_stream_url: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        let monitor = MonitorSettings::default();
        Self {
            preferred: None,
            command: None,
            poll_interval_ms: monitor.poll_interval.as_millis() as u64,
            confirm_delay_ms: monitor.confirm_delay.as_millis() as u64,
            safety_polls: monitor.safety_polls,
            terminate_grace_ms: 3000,
            use_stream_url: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Default: ~/.config/termflix/watch_history.json
    pub history_file: Option<PathBuf>,
    /// Default: <tmp>/termflix_stream_status
    pub status_file: Option<PathBuf>,
    /// Logs and per-session scratch (default: <tmp>/termflix)
    pub state_dir: Option<PathBuf>,
}

impl Config {
    /// Get config file path (~/.config/termflix/config.toml)
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("termflix").join("config.toml"))
    }

    /// Config from the default path; defaults when there is no file
    pub fn load() -> Result<Self> {
        match Self::path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Config from `path`. A missing file gives defaults; an unreadable or
    /// invalid one is an error the caller reports before falling back.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn history_file(&self) -> PathBuf {
        self.paths
            .history_file
            .clone()
            .unwrap_or_else(WatchHistoryStore::default_path)
    }

    pub fn status_file(&self) -> PathBuf {
        self.paths
            .status_file
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("termflix_stream_status"))
    }

    pub fn state_dir(&self) -> PathBuf {
        self.paths
            .state_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("termflix"))
    }

    /// Resolve into the settings a session runs with
    pub fn session_settings(&self) -> SessionSettings {
        let ms = Duration::from_millis;
        SessionSettings {
            bridge: BridgeSettings {
                command: self.bridge.command.clone(),
                content_prefix: self
                    .bridge
                    .content_prefix
                    .clone()
                    .unwrap_or_else(|| std::env::temp_dir().join("torrent-stream")),
                port: self.bridge.port,
                file_index: None,
                log_path: None,
            },
            bridge_startup_grace: ms(self.bridge.startup_grace_ms),
            bridge_terminate_grace: ms(self.bridge.terminate_grace_ms),
            discovery: DiscoverySettings {
                poll_interval: ms(self.discovery.poll_interval_ms),
                path_attempts: self.discovery.path_attempts,
                video_attempts: self.discovery.video_attempts,
                min_video_bytes: self.discovery.min_video_bytes,
            },
            buffer: BufferSettings {
                target_bytes: self.buffer.target_bytes,
                poll_interval: ms(self.buffer.poll_interval_ms),
                stall_polls: self.buffer.stall_polls,
                max_wait: Duration::from_secs(self.buffer.max_wait_secs),
            },
            subtitles: SubtitleSettings {
                enabled: self.subtitles.enabled,
                wait: Duration::from_secs(self.subtitles.wait_secs),
                languages: self.subtitles.languages.clone(),
                ..Default::default()
            },
            player: PlayerSettings {
                preferred: self.player.preferred,
                command: self.player.command.clone(),
                monitor: MonitorSettings {
                    poll_interval: ms(self.player.poll_interval_ms),
                    confirm_delay: ms(self.player.confirm_delay_ms),
                    safety_polls: self.player.safety_polls,
                },
                terminate_grace: ms(self.player.terminate_grace_ms),
                use_stream_url: self.player.use_stream_url,
                ..Default::default()
            },
            resume: true,
            history_file: self.history_file(),
            status_file: self.status_file(),
            state_dir: self.state_dir(),
        }
    }
}
