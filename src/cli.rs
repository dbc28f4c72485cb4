//! CLI - Command Line Interface for termflix
//!
//! One streaming session per invocation, plus a few read-only helpers.
//! Every command can emit JSON for scripting.
//!
//! # Examples
//!
//! ```bash
//! # Stream a magnet with metadata from the catalog
//! termflix stream "magnet:?xt=urn:btih:..." --title "Big Buck Bunny" --quality 1080p
//!
//! # Inspect what the bridge will be given
//! termflix normalize ./movie.torrent --json
//!
//! # Watch history and live buffer status
//! termflix history --limit 5
//! termflix status
//! ```

use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::io::IsTerminal;
use std::path::PathBuf;

use crate::stream::player::PlayerKind;

// =============================================================================
// Exit Codes
// =============================================================================

/// Exit codes for CLI operations (semantic for scripting)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Success
    Success = 0,
    /// General error
    Error = 1,
    /// Invalid arguments or source
    InvalidArgs = 2,
    /// Bridge could not start or rejected the torrent
    BridgeFailed = 3,
    /// No content path or video file appeared
    ContentNotFound = 4,
    /// No usable media player
    NoPlayer = 5,
    /// Interrupted by a signal
    Interrupted = 130,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> i32 {
        code as i32
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> std::process::ExitCode {
        std::process::ExitCode::from(code as u8)
    }
}

// =============================================================================
// Main CLI Structure
// =============================================================================

/// termflix - stream torrents straight into mpv or VLC
#[derive(Parser, Debug)]
#[command(
    name = "termflix",
    version,
    about = "Stream torrents to a local media player",
    long_about = "Runs a torrent-to-HTTP bridge, waits for enough of the video to \
                  buffer, plays it in mpv or VLC and remembers where you stopped.",
    after_help = "EXAMPLES:\n\
                  termflix stream \"magnet:?xt=urn:btih:...\"   Stream a magnet link\n\
                  termflix stream movie.torrent --player vlc   Stream a torrent file in VLC\n\
                  termflix history                             Recently watched\n\
                  termflix status --json                       Current buffer status"
)]
pub struct Cli {
    /// Output format as JSON (default for non-TTY)
    #[arg(long, short = 'j', global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Log verbosity on stderr (-v info, -vv debug, -vvv trace)
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Check if JSON output should be used
    pub fn should_json(&self) -> bool {
        self.json || !std::io::stdout().is_terminal()
    }
}

// =============================================================================
// Subcommands
// =============================================================================

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stream a magnet link or torrent file
    #[command(visible_alias = "s")]
    Stream(StreamCmd),

    /// Show the bridge argument and content hash for a source
    #[command(visible_alias = "n")]
    Normalize(NormalizeCmd),

    /// List watch history
    #[command(visible_alias = "h")]
    History(HistoryCmd),

    /// Show the current buffer status record
    Status(StatusCmd),
}

/// Stream command arguments
#[derive(Args, Debug)]
pub struct StreamCmd {
    /// Magnet URI or path to a .torrent file
    pub source: String,

    /// Title for display and watch history
    #[arg(long, short = 't')]
    pub title: Option<String>,

    /// Quality label (e.g. 1080p)
    #[arg(long, short = 'Q')]
    pub quality: Option<String>,

    /// Size label (e.g. "1.4 GB")
    #[arg(long, short = 's')]
    pub size: Option<String>,

    /// Media player to use
    #[arg(long, short = 'p', value_enum)]
    pub player: Option<PlayerKind>,

    /// Don't look for subtitles
    #[arg(long)]
    pub no_subtitles: bool,

    /// Start from the beginning even if there is a saved position
    #[arg(long)]
    pub no_resume: bool,

    /// Play this file index from a multi-file torrent
    #[arg(long, short = 'i')]
    pub file_index: Option<u32>,
}

/// Normalize command arguments
#[derive(Args, Debug)]
pub struct NormalizeCmd {
    /// Magnet URI or path to a .torrent file
    pub source: String,
}

/// History command arguments
#[derive(Args, Debug)]
pub struct HistoryCmd {
    /// Show a single content hash
    #[arg(long)]
    pub hash: Option<String>,

    /// Maximum entries to show
    #[arg(long, short = 'l', default_value = "20")]
    pub limit: usize,
}

/// Status command arguments
#[derive(Args, Debug)]
pub struct StatusCmd {}

// =============================================================================
// JSON Output Types
// =============================================================================

/// Generic JSON output wrapper with status
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonOutput<T: Serialize> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "is_zero")]
    pub exit_code: i32,
}

fn is_zero(n: &i32) -> bool {
    *n == 0
}

impl<T: Serialize> JsonOutput<T> {
    /// Create success output with data
    pub fn success(data: T) -> Self {
        Self {
            data: Some(data),
            error: None,
            exit_code: 0,
        }
    }

    /// Create error output (no data)
    pub fn error_msg(msg: impl Into<String>, code: ExitCode) -> JsonOutput<()> {
        JsonOutput::<()> {
            data: None,
            error: Some(msg.into()),
            exit_code: code.into(),
        }
    }
}

/// Normalize response
#[derive(Debug, Serialize, Deserialize)]
pub struct NormalizeResponse {
    pub bridge_arg: String,
    pub content_hash: String,
    pub kind: String,
}

/// Stream session summary
#[derive(Debug, Serialize, Deserialize)]
pub struct StreamResponse {
    pub status: &'static str,
    pub title: String,
    pub content_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
}

// =============================================================================
// Output Helpers
// =============================================================================

/// Output handler for consistent formatting
pub struct Output {
    pub json: bool,
    pub quiet: bool,
}

impl Output {
    pub fn new(cli: &Cli) -> Self {
        Self {
            json: cli.should_json(),
            quiet: cli.quiet,
        }
    }

    /// Print success data
    pub fn print<T: Serialize>(&self, data: T) -> anyhow::Result<()> {
        if self.json {
            let output = JsonOutput::success(data);
            println!("{}", serde_json::to_string_pretty(&output)?);
        } else {
            // For non-JSON, caller should handle formatting
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        Ok(())
    }

    /// Print error and return exit code
    pub fn error(&self, msg: impl Into<String>, code: ExitCode) -> ExitCode {
        let msg = msg.into();
        if self.json {
            let output = JsonOutput::<()>::error_msg(&msg, code);
            if let Ok(json) = serde_json::to_string_pretty(&output) {
                eprintln!("{}", json);
            }
        } else if !self.quiet {
            eprintln!("Error: {}", msg);
        }
        code
    }

    /// Print info message (suppressed in quiet mode)
    pub fn info(&self, msg: impl std::fmt::Display) {
        if !self.quiet && !self.json {
            eprintln!("{}", msg);
        }
    }

    /// Whether live progress lines should be drawn
    pub fn interactive(&self) -> bool {
        !self.quiet && !self.json && std::io::stderr().is_terminal()
    }
}

// =============================================================================
// Tests
// =============================================================================
