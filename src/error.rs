//! Session error taxonomy
//!
//! Every failure a streaming session can end in. All of them are resolved
//! by the orchestrator's cleanup path; only the exit code leaves the session.

use std::path::PathBuf;

use thiserror::Error;

use crate::cli::ExitCode;

/// Errors that end a streaming session
#[derive(Debug, Error)]
pub enum SessionError {
    /// Neither a well-formed magnet nor an existing torrent file
    #[error("Invalid source: {0}")]
    SourceInvalid(String),

    /// The bridge exited right after start with a metadata-parse error
    #[error("{message}")]
    BridgeStartFailure { message: String, output: String },

    /// The bridge binary could not be spawned at all
    #[error("Failed to start bridge '{command}': {source}")]
    BridgeSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The bridge never revealed where content is materializing
    #[error("Bridge did not report a content path after {attempts} attempts")]
    PathDiscoveryTimeout { attempts: u32 },

    /// Content path exists but no playable video showed up
    #[error("No video file found in {} after {attempts} attempts", dir.display())]
    VideoNotFound {
        dir: PathBuf,
        attempts: u32,
        listing: Vec<String>,
    },

    /// No supported player is installed, or it failed to spawn
    #[error("No usable media player: {0}")]
    PlayerLaunchFailure(String),

    /// User cancellation (signal)
    #[error("Interrupted by user")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Exit code surfaced to the caller
    pub fn exit_code(&self) -> ExitCode {
        match self {
            SessionError::SourceInvalid(_) => ExitCode::InvalidArgs,
            SessionError::BridgeStartFailure { .. } | SessionError::BridgeSpawn { .. } => {
                ExitCode::BridgeFailed
            }
            SessionError::PathDiscoveryTimeout { .. } | SessionError::VideoNotFound { .. } => {
                ExitCode::ContentNotFound
            }
            SessionError::PlayerLaunchFailure(_) => ExitCode::NoPlayer,
            SessionError::Interrupted => ExitCode::Interrupted,
            SessionError::Io(_) => ExitCode::Error,
        }
    }

    /// Extra lines worth showing the user when this error ends a session
    pub fn diagnostics(&self) -> Vec<String> {
        match self {
            SessionError::BridgeStartFailure { output, .. } => {
                output.lines().map(str::to_string).collect()
            }
            SessionError::VideoNotFound { listing, .. } => listing.clone(),
            _ => Vec::new(),
        }
    }
}

/// Watch-history store failures (logged, never fatal to a session)
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Watch history I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Watch history is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Cannot record progress without a positive duration")]
    NoDuration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            SessionError::SourceInvalid("x".into()).exit_code(),
            ExitCode::InvalidArgs
        );
        assert_eq!(
            SessionError::PathDiscoveryTimeout { attempts: 25 }.exit_code(),
            ExitCode::ContentNotFound
        );
        assert_eq!(SessionError::Interrupted.exit_code(), ExitCode::Interrupted);
        assert_eq!(i32::from(ExitCode::Interrupted), 130);
    }

    #[test]
    fn test_video_not_found_carries_listing() {
        let err = SessionError::VideoNotFound {
            dir: PathBuf::from("/tmp/torrent-stream/abc"),
            attempts: 30,
            listing: vec!["a.nfo (120 B)".into(), "sample.mkv (200 KB)".into()],
        };
        assert_eq!(err.diagnostics().len(), 2);
        assert!(err.to_string().contains("/tmp/torrent-stream/abc"));
    }
}
