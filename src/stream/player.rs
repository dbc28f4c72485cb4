//! Local players - mpv/VLC launch and playback-position recovery
//!
//! Each supported player implements [`Player`]: how to find it, how to spell
//! its flags, and how to read back where the user stopped watching.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info};

use crate::stream::process::ManagedProcess;

/// Supported local players
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PlayerKind {
    /// mpv media player (default)
    #[default]
    Mpv,
    /// VLC media player
    Vlc,
}

impl PlayerKind {
    /// Command name looked up on PATH
    pub fn command(&self) -> &'static str {
        match self {
            PlayerKind::Mpv => "mpv",
            PlayerKind::Vlc => "vlc",
        }
    }

    /// Binary inside the macOS application bundle
    pub fn app_bundle(&self) -> &'static str {
        match self {
            PlayerKind::Mpv => "/Applications/mpv.app/Contents/MacOS/mpv",
            PlayerKind::Vlc => "/Applications/VLC.app/Contents/MacOS/VLC",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            PlayerKind::Mpv => "mpv",
            PlayerKind::Vlc => "VLC",
        }
    }
}

impl std::fmt::Display for PlayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Errors from local player operations
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("Player '{0}' not found. Install it first.")]
    NotFound(String),
    #[error("Failed to start player: {0}")]
    StartFailed(#[from] std::io::Error),
}

/// What to play and how
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    /// Local file path or stream URL
    pub media: String,
    pub subtitle: Option<PathBuf>,
    /// Resume offset in seconds (0 = from the start)
    pub start_at: u64,
    pub title: Option<String>,
}

/// Position recovered after playback; either half may be unknown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackPosition {
    pub position_seconds: Option<u64>,
    pub duration_seconds: Option<u64>,
}

impl PlaybackPosition {
    /// Fill gaps in `self` from `other`
    pub fn or(self, other: PlaybackPosition) -> PlaybackPosition {
        PlaybackPosition {
            position_seconds: self.position_seconds.or(other.position_seconds),
            duration_seconds: self.duration_seconds.or(other.duration_seconds),
        }
    }

    /// Both values, if both are positive
    pub fn complete(&self) -> Option<(u64, u64)> {
        match (self.position_seconds, self.duration_seconds) {
            (Some(pos), Some(dur)) if pos > 0 && dur > 0 => Some((pos, dur)),
            _ => None,
        }
    }
}

/// A media player the session can drive
#[async_trait]
pub trait Player: Send + Sync {
    fn kind(&self) -> PlayerKind;

    /// Resolved executable
    fn program(&self) -> &Path;

    /// Process names the player may run under, including forked helpers
    fn process_names(&self) -> Vec<String>;

    /// Full argument list for a launch. `state_dir` is private to the session.
    fn args(&self, request: &LaunchRequest, state_dir: &Path) -> Vec<String>;

    /// Method 1: the player's own persisted resume state for `media`
    fn saved_position(&self, state_dir: &Path, media: &str) -> Option<u64>;

    /// Method 2: last elapsed/total marker in the captured player output
    fn parse_log(&self, log: &str) -> PlaybackPosition {
        parse_time_markers(log)
    }

    /// Method 2 for players that only report time when asked, polled while
    /// the player runs. `None` when the player has no such interface.
    async fn query_position(&self) -> Option<PlaybackPosition> {
        None
    }
}

fn program_names(program: &Path, defaults: &[&str]) -> Vec<String> {
    let mut names: Vec<String> = defaults.iter().map(|s| s.to_string()).collect();
    if let Some(name) = program.file_name().map(|n| n.to_string_lossy().to_string()) {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

// =============================================================================
// mpv
// =============================================================================

pub struct Mpv {
    program: PathBuf,
}

impl Mpv {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn watch_later_dir(state_dir: &Path) -> PathBuf {
        state_dir.join("watch_later")
    }
}

#[async_trait]
impl Player for Mpv {
    fn kind(&self) -> PlayerKind {
        PlayerKind::Mpv
    }

    fn program(&self) -> &Path {
        &self.program
    }

    fn process_names(&self) -> Vec<String> {
        program_names(&self.program, &["mpv"])
    }

    fn args(&self, request: &LaunchRequest, state_dir: &Path) -> Vec<String> {
        let mut args = vec![request.media.clone()];
        if let Some(sub) = &request.subtitle {
            args.push(format!("--sub-file={}", sub.display()));
        }
        if request.start_at > 0 {
            args.push(format!("--start={}", request.start_at));
        }
        if let Some(title) = &request.title {
            args.push(format!("--force-media-title={}", title));
        }
        args.push("--force-window=immediate".to_string());
        args.push("--save-position-on-quit".to_string());
        args.push(format!(
            "--watch-later-directory={}",
            Self::watch_later_dir(state_dir).display()
        ));
        args
    }

    fn saved_position(&self, state_dir: &Path, _media: &str) -> Option<u64> {
        let dir = Self::watch_later_dir(state_dir);
        let newest = std::fs::read_dir(&dir)
            .ok()?
            .filter_map(Result::ok)
            .filter(|e| e.path().is_file())
            .max_by_key(|e| e.metadata().and_then(|m| m.modified()).ok())?;
        let content = std::fs::read_to_string(newest.path()).ok()?;
        parse_watch_later(&content)
    }
}

/// `start=<seconds>` from an mpv watch-later file
pub fn parse_watch_later(content: &str) -> Option<u64> {
    content
        .lines()
        .find_map(|line| line.trim().strip_prefix("start="))
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v as u64)
}

// =============================================================================
// VLC
// =============================================================================

pub struct Vlc {
    program: PathBuf,
    /// Local port of the rc control interface
    rc_port: Option<u16>,
    /// Qt interface settings holding `[RecentsMRL]`
    recents_file: Option<PathBuf>,
}

const RC_TIMEOUT: Duration = Duration::from_millis(500);

impl Vlc {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            rc_port: free_local_port(),
            recents_file: default_recents_file(),
        }
    }

    pub fn with_rc_port(mut self, port: Option<u16>) -> Self {
        self.rc_port = port;
        self
    }

    pub fn with_recents_file(mut self, path: Option<PathBuf>) -> Self {
        self.recents_file = path;
        self
    }

    async fn rc_exchange(port: u16) -> std::io::Result<String> {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
        stream.write_all(b"get_time\nget_length\n").await?;

        let mut reply = String::new();
        let mut buf = [0u8; 512];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            reply.push_str(&String::from_utf8_lossy(&buf[..n]));
            if parse_rc_times(&reply).duration_seconds.is_some() {
                break;
            }
        }
        Ok(reply)
    }
}

#[async_trait]
impl Player for Vlc {
    fn kind(&self) -> PlayerKind {
        PlayerKind::Vlc
    }

    fn program(&self) -> &Path {
        &self.program
    }

    fn process_names(&self) -> Vec<String> {
        program_names(&self.program, &["vlc", "VLC"])
    }

    fn args(&self, request: &LaunchRequest, _state_dir: &Path) -> Vec<String> {
        let mut args = vec![request.media.clone()];
        if let Some(sub) = &request.subtitle {
            args.push("--sub-file".to_string());
            args.push(sub.display().to_string());
        }
        if request.start_at > 0 {
            args.push(format!("--start-time={}", request.start_at));
        }
        if let Some(title) = &request.title {
            args.push(format!("--meta-title={}", title));
        }
        // Don't show filename overlay
        args.push("--no-video-title-show".to_string());
        args.push("--play-and-exit".to_string());
        if let Some(port) = self.rc_port {
            args.push("--extraintf=rc".to_string());
            args.push(format!("--rc-host=127.0.0.1:{}", port));
        }
        args
    }

    fn saved_position(&self, _state_dir: &Path, media: &str) -> Option<u64> {
        let content = std::fs::read_to_string(self.recents_file.as_ref()?).ok()?;
        parse_recents(&content, media)
    }

    async fn query_position(&self) -> Option<PlaybackPosition> {
        let port = self.rc_port?;
        match tokio::time::timeout(RC_TIMEOUT, Self::rc_exchange(port)).await {
            Ok(Ok(reply)) => Some(parse_rc_times(&reply)),
            Ok(Err(e)) => {
                debug!(port, error = %e, "vlc rc not reachable");
                None
            }
            Err(_) => None,
        }
    }
}

fn free_local_port() -> Option<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).ok()?;
    listener.local_addr().ok().map(|a| a.port())
}

fn default_recents_file() -> Option<PathBuf> {
    if cfg!(target_os = "macos") {
        dirs::preference_dir().map(|d| d.join("org.videolan.vlc").join("vlc-qt-interface.conf"))
    } else {
        dirs::config_dir().map(|d| d.join("vlc").join("vlc-qt-interface.conf"))
    }
}

/// Resume point (seconds) VLC stored for `media` under `[RecentsMRL]`
///
/// `list=` holds MRLs and `times=` the matching positions in milliseconds.
pub fn parse_recents(conf: &str, media: &str) -> Option<u64> {
    let mut in_recents = false;
    let (mut list, mut times) = (None, None);
    for line in conf.lines().map(str::trim) {
        if line.starts_with('[') {
            in_recents = line == "[RecentsMRL]";
        } else if in_recents {
            if let Some(v) = line.strip_prefix("list=") {
                list = Some(v);
            } else if let Some(v) = line.strip_prefix("times=") {
                times = Some(v);
            }
        }
    }

    let index = qt_list(list?).position(|mrl| mrl_matches(mrl, media))?;
    let ms: u64 = qt_list(times?).nth(index)?.parse().ok()?;
    (ms > 0).then_some(ms / 1000)
}

fn qt_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(", ").map(|v| v.trim().trim_matches('"'))
}

fn mrl_matches(mrl: &str, media: &str) -> bool {
    if mrl == media {
        return true;
    }
    mrl.strip_prefix("file://")
        .and_then(|path| urlencoding::decode(path).ok())
        .is_some_and(|path| path == media)
}

/// `get_time` / `get_length` replies from the rc interface, in that order
pub fn parse_rc_times(reply: &str) -> PlaybackPosition {
    let mut numbers = reply
        .lines()
        .map(|line| line.trim().trim_start_matches('>').trim())
        .filter(|line| !line.is_empty() && line.bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|line| line.parse::<u64>().ok());
    PlaybackPosition {
        position_seconds: numbers.next(),
        duration_seconds: numbers.next(),
    }
}

// =============================================================================
// Log Parsing
// =============================================================================

/// Last `HH:MM:SS / HH:MM:SS` pair in player output (mpv status line style)
pub fn parse_time_markers(log: &str) -> PlaybackPosition {
    static MARKER: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = MARKER
        .get_or_init(|| Regex::new(r"(\d{1,2}:\d{2}:\d{2})(?:\.\d+)?\s*/\s*(\d{1,2}:\d{2}:\d{2})").ok())
        .as_ref()
    else {
        return PlaybackPosition::default();
    };

    re.captures_iter(log)
        .last()
        .map(|caps| PlaybackPosition {
            position_seconds: caps.get(1).and_then(|m| parse_clock(m.as_str())),
            duration_seconds: caps.get(2).and_then(|m| parse_clock(m.as_str())),
        })
        .unwrap_or_default()
}

/// `H:MM:SS` to seconds
pub fn parse_clock(clock: &str) -> Option<u64> {
    let mut parts = clock.split(':').map(|p| p.parse::<u64>().ok());
    let h = parts.next()??;
    let m = parts.next()??;
    let s = parts.next()??;
    if parts.next().is_some() || m >= 60 || s >= 60 {
        return None;
    }
    Some(h * 3600 + m * 60 + s)
}

// =============================================================================
// Capability Lookup & Launch
// =============================================================================

/// Locate `kind`: installed binary first, then the platform app bundle
pub async fn locate(kind: PlayerKind) -> Option<PathBuf> {
    if let Some(path) = which(kind.command()).await {
        return Some(path);
    }
    if cfg!(target_os = "macos") {
        let bundle = Path::new(kind.app_bundle());
        if bundle.exists() {
            return Some(bundle.to_path_buf());
        }
    }
    None
}

async fn which(command: &str) -> Option<PathBuf> {
    let output = Command::new("which")
        .arg(command)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!path.is_empty()).then(|| PathBuf::from(path))
}

/// Build the `Player` for a kind at a resolved program path
pub fn player_for(kind: PlayerKind, program: PathBuf) -> Box<dyn Player> {
    match kind {
        PlayerKind::Mpv => Box::new(Mpv::new(program)),
        PlayerKind::Vlc => Box::new(Vlc::new(program)),
    }
}

/// Pick a player: explicit command override, else preferred kind, else any
pub async fn detect_player(
    preferred: Option<PlayerKind>,
    command: Option<&Path>,
) -> Result<Box<dyn Player>, PlayerError> {
    if let Some(cmd) = command {
        let program = if cmd.components().count() > 1 {
            cmd.is_file().then(|| cmd.to_path_buf())
        } else {
            which(&cmd.to_string_lossy()).await
        };
        let program = program.ok_or_else(|| PlayerError::NotFound(cmd.display().to_string()))?;
        let kind = preferred.unwrap_or_else(|| infer_kind(&program));
        return Ok(player_for(kind, program));
    }

    let mut order = vec![preferred.unwrap_or_default()];
    for kind in [PlayerKind::Mpv, PlayerKind::Vlc] {
        if !order.contains(&kind) {
            order.push(kind);
        }
    }

    for kind in order {
        if let Some(program) = locate(kind).await {
            debug!(player = %kind, program = %program.display(), "player located");
            return Ok(player_for(kind, program));
        }
    }
    Err(PlayerError::NotFound("mpv or VLC".to_string()))
}

fn infer_kind(program: &Path) -> PlayerKind {
    let name = program
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if name.contains("vlc") {
        PlayerKind::Vlc
    } else {
        PlayerKind::Mpv
    }
}

/// Spawn the player with its output captured into `log_path`
pub fn launch(
    player: &dyn Player,
    request: &LaunchRequest,
    state_dir: &Path,
    log_path: &Path,
) -> Result<ManagedProcess, PlayerError> {
    std::fs::create_dir_all(state_dir)?;
    let log = File::create(log_path)?;
    let log_err = log.try_clone()?;

    let args = player.args(request, state_dir);
    debug!(program = %player.program().display(), ?args, "launching player");

    let child = Command::new(player.program())
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PlayerError::NotFound(player.program().display().to_string())
            } else {
                PlayerError::StartFailed(e)
            }
        })?;

    let process = ManagedProcess::new("player", child).ok_or_else(|| {
        PlayerError::StartFailed(std::io::Error::new(
            std::io::ErrorKind::Other,
            "player exited before it could be tracked",
        ))
    })?;
    info!(player = %player.kind(), pid = process.pid(), "player started");
    Ok(process)
}
