//! CLI Command Handlers
//!
//! Implements all CLI commands on top of the library.
//! Each handler takes CLI args and Output, returns ExitCode.

use std::io::Write;

use crossterm::{cursor, execute, terminal};

use crate::cli::{
    ExitCode, HistoryCmd, NormalizeCmd, NormalizeResponse, Output, StatusCmd, StreamCmd,
    StreamResponse,
};
use crate::config::Config;
use crate::error::SessionError;
use crate::models::{format_bytes, format_clock, format_speed, BufferState, MediaMeta, StatusRecord};
use crate::session::{SessionEvent, StreamRequest, StreamSession};
use crate::stream::buffer::StatusPublisher;
use crate::stream::history::WatchHistoryStore;
use crate::stream::source::{normalize, SourceKind};

const PROGRESS_WIDTH: usize = 30;

// =============================================================================
// Stream Command
// =============================================================================

pub async fn stream_cmd(cmd: StreamCmd, config: &Config, output: &Output) -> ExitCode {
    let mut settings = config.session_settings();
    if cmd.player.is_some() {
        settings.player.preferred = cmd.player;
    }
    if cmd.no_subtitles {
        settings.subtitles.enabled = false;
    }
    if cmd.no_resume {
        settings.resume = false;
    }
    settings.bridge.file_index = cmd.file_index;
    let bridge_command = settings.bridge.command.clone();

    let session = StreamSession::new(settings);
    let live = output.interactive();
    if live {
        session.registry().mark_terminal_altered();
        let _ = execute!(std::io::stderr(), cursor::Hide);
    }

    let request = StreamRequest {
        source: cmd.source,
        meta: MediaMeta {
            title: cmd.title,
            quality: cmd.quality,
            size: cmd.size,
        },
    };

    output.info("Starting torrent bridge...");
    let result = session
        .run(request, |event| report_event(event, output, live))
        .await;

    match result {
        Ok(outcome) => {
            let title = outcome.session.display_title();
            if let Some(entry) = &outcome.history {
                output.info(format!(
                    "Saved position {} of {} ({:.0}%)",
                    format_clock(entry.last_position_seconds),
                    format_clock(entry.duration_seconds),
                    entry.percentage
                ));
            }
            if output.json {
                let response = StreamResponse {
                    status: if outcome.interrupted() { "interrupted" } else { "finished" },
                    title,
                    content_hash: outcome.session.content_hash.clone(),
                    video: outcome.session.video_path.clone(),
                    subtitle: outcome.session.subtitle_path.clone(),
                    position: outcome.history.as_ref().map(|h| h.last_position_seconds),
                    duration: outcome.history.as_ref().map(|h| h.duration_seconds),
                    percentage: outcome.history.as_ref().map(|h| h.percentage),
                };
                if let Err(e) = output.print(response) {
                    return output.error(e.to_string(), ExitCode::Error);
                }
            }
            if outcome.interrupted() {
                ExitCode::Interrupted
            } else {
                ExitCode::Success
            }
        }
        Err(SessionError::Interrupted) => {
            output.info("Interrupted, session cleaned up.");
            ExitCode::Interrupted
        }
        Err(e) => {
            for line in e.diagnostics() {
                output.info(format!("  {}", line));
            }
            output.error(describe_error(&e, &bridge_command), e.exit_code())
        }
    }
}

fn describe_error(err: &SessionError, bridge_command: &str) -> String {
    match err {
        SessionError::BridgeSpawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
            format!("{0} not found. Install with: npm install -g {0}", bridge_command)
        }
        SessionError::PlayerLaunchFailure(msg) => {
            format!("{}. Install mpv (https://mpv.io) or VLC.", msg)
        }
        other => other.to_string(),
    }
}

fn report_event(event: SessionEvent<'_>, output: &Output, live: bool) {
    match event {
        SessionEvent::State(BufferState::Analyzing) => output.info("Content found, looking for the video..."),
        SessionEvent::State(BufferState::Buffering) => output.info("Buffering..."),
        SessionEvent::State(BufferState::Ready) => {
            if live {
                eprintln!();
            }
            output.info("Buffer ready.");
        }
        SessionEvent::State(_) => {}
        SessionEvent::Buffer(record) => {
            if live {
                eprint!("\r{}", render_progress(record));
                let _ = execute!(std::io::stderr(), terminal::Clear(terminal::ClearType::UntilNewLine));
                let _ = std::io::stderr().flush();
            }
        }
        SessionEvent::VideoSelected(video) => output.info(format!(
            "Video: {} ({})",
            video
                .path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            format_bytes(video.size)
        )),
        SessionEvent::Subtitle(path) => output.info(format!("Subtitles: {}", path.display())),
        SessionEvent::Resuming(at) => output.info(format!("Resuming from {}", format_clock(at))),
        SessionEvent::PlayerStarted { player, pid } => {
            output.info(format!("Playing in {} (pid {}). Close the player to stop.", player, pid))
        }
    }
}

/// One-line buffer progress: bar, percentage, speed, peers, bytes
pub fn render_progress(record: &StatusRecord) -> String {
    let filled = (record.progress_pct as usize * PROGRESS_WIDTH) / 100;
    format!(
        "Buffering [{}{}] {:>3}%  {}  {}/{} peers  {}",
        "#".repeat(filled),
        "-".repeat(PROGRESS_WIDTH - filled),
        record.progress_pct,
        format_speed(record.speed_bytes_per_sec),
        record.connected_peers,
        record.total_peers,
        format_bytes(record.buffered_bytes)
    )
}

// =============================================================================
// Normalize Command
// =============================================================================

pub async fn normalize_cmd(cmd: NormalizeCmd, output: &Output) -> ExitCode {
    match normalize(&cmd.source) {
        Ok(source) => {
            let kind = match &source.kind {
                SourceKind::Magnet => "magnet".to_string(),
                SourceKind::TorrentFile(_) => "torrent-file".to_string(),
            };
            if output.json {
                let response = NormalizeResponse {
                    bridge_arg: source.bridge_arg,
                    content_hash: source.content_hash,
                    kind,
                };
                if let Err(e) = output.print(response) {
                    return output.error(e.to_string(), ExitCode::Error);
                }
            } else {
                println!("{}", source.content_hash);
                println!("{}", source.bridge_arg);
            }
            ExitCode::Success
        }
        Err(e) => output.error(e.to_string(), e.exit_code()),
    }
}

// =============================================================================
// History Command
// =============================================================================

pub async fn history_cmd(cmd: HistoryCmd, config: &Config, output: &Output) -> ExitCode {
    let store = WatchHistoryStore::new(config.history_file());
    let mut entries = match store.entries() {
        Ok(entries) => entries,
        Err(e) => return output.error(e.to_string(), ExitCode::Error),
    };
    if let Some(hash) = &cmd.hash {
        let hash = hash.to_lowercase();
        entries.retain(|(key, _)| *key == hash);
    }
    entries.truncate(cmd.limit);

    if output.json {
        let map: serde_json::Map<String, serde_json::Value> = entries
            .into_iter()
            .filter_map(|(key, entry)| Some((key, serde_json::to_value(entry).ok()?)))
            .collect();
        if let Err(e) = output.print(map) {
            return output.error(e.to_string(), ExitCode::Error);
        }
        return ExitCode::Success;
    }

    if entries.is_empty() {
        output.info("No watch history yet.");
    }
    for (hash, entry) in entries {
        println!("{}  {}", short_hash(&hash), entry);
    }
    ExitCode::Success
}

/// First eight characters of a history key, for the plain listing
fn short_hash(key: &str) -> String {
    key.chars().take(8).collect()
}

// =============================================================================
// Status Command
// =============================================================================

pub async fn status_cmd(_cmd: StatusCmd, config: &Config, output: &Output) -> ExitCode {
    let path = config.status_file();
    let Some(record) = StatusPublisher::read(&path) else {
        return output.error("No active stream", ExitCode::Error);
    };

    if output.json {
        if let Err(e) = output.print(&record) {
            return output.error(e.to_string(), ExitCode::Error);
        }
    } else {
        println!("{}", record.state);
        println!("{}", render_progress(&record));
        if let Some(url) = &record.stream_url {
            println!("{}", url);
        }
    }
    ExitCode::Success
}
