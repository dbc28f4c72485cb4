//! Content discovery inside the bridge's working directory
//!
//! Two bounded polling phases: wait for the bridge to reveal a content path
//! that exists on disk, then wait for a qualifying video file inside it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::SessionError;
use crate::models::{format_bytes, VideoFile};
use crate::stream::bridge::BridgeProcess;
use crate::stream::sleep_or_cancel;

/// Extensions treated as playable video
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "mov", "wmv", "flv", "webm", "m4v", "ts", "mpg", "mpeg",
];

/// Polling limits for both discovery phases
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub poll_interval: Duration,
    pub path_attempts: u32,
    pub video_attempts: u32,
    /// Files below this size are metadata or samples
    pub min_video_bytes: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            path_attempts: 25,
            video_attempts: 30,
            min_video_bytes: 1024 * 1024,
        }
    }
}

/// Finds where content lands and which file is the main title
pub struct ContentLocator {
    settings: DiscoverySettings,
}

impl ContentLocator {
    pub fn new(settings: DiscoverySettings) -> Self {
        Self { settings }
    }

    /// Wait until the bridge names an existing content directory
    ///
    /// `fallback` is checked too: the bridge's conventional per-hash directory.
    pub async fn discover_path(
        &self,
        bridge: &BridgeProcess,
        fallback: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, SessionError> {
        for attempt in 1..=self.settings.path_attempts {
            if let Some(path) = bridge.telemetry().content_path {
                if path.exists() {
                    let dir = content_dir(&path);
                    info!(path = %dir.display(), attempt, "content path discovered");
                    return Ok(dir);
                }
            }
            if let Some(dir) = fallback.filter(|d| d.is_dir()) {
                info!(path = %dir.display(), attempt, "content path found by hash");
                return Ok(dir.to_path_buf());
            }
            debug!(attempt, "content path not known yet");
            sleep_or_cancel(self.settings.poll_interval, cancel).await?;
        }

        Err(SessionError::PathDiscoveryTimeout {
            attempts: self.settings.path_attempts,
        })
    }

    /// Wait until a video file passing the size filter appears; pick the largest
    pub async fn find_video(
        &self,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<VideoFile, SessionError> {
        for attempt in 1..=self.settings.video_attempts {
            if let Some(video) = largest_video(dir, self.settings.min_video_bytes) {
                info!(
                    path = %video.path.display(),
                    size = %format_bytes(video.size),
                    attempt,
                    "main video selected"
                );
                return Ok(video);
            }
            sleep_or_cancel(self.settings.poll_interval, cancel).await?;
        }

        Err(SessionError::VideoNotFound {
            dir: dir.to_path_buf(),
            attempts: self.settings.video_attempts,
            listing: list_files(dir),
        })
    }
}

/// Directory to search: the path itself, or its parent when it names a file
fn content_dir(path: &Path) -> PathBuf {
    if path.is_file() {
        path.parent().map(Path::to_path_buf).unwrap_or_else(|| path.to_path_buf())
    } else {
        path.to_path_buf()
    }
}

pub fn is_video(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.iter().any(|v| e.eq_ignore_ascii_case(v)))
        .unwrap_or(false)
}

/// Largest video under `dir` (recursively) of at least `min_bytes`
pub fn largest_video(dir: &Path, min_bytes: u64) -> Option<VideoFile> {
    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file() && is_video(e.path()))
        .filter_map(|e| {
            let size = e.metadata().ok()?.len();
            (size >= min_bytes).then(|| VideoFile {
                path: e.into_path(),
                size,
            })
        })
        .max_by_key(|v| v.size)
}

/// Full recursive listing with sizes, for diagnostics
pub fn list_files(dir: &Path) -> Vec<String> {
    let mut listing: Vec<String> = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let size = e.metadata().map(|m| m.len()).unwrap_or(0);
            let rel = e.path().strip_prefix(dir).unwrap_or(e.path());
            format!("{} ({})", rel.display(), format_bytes(size))
        })
        .collect();
    listing.sort();
    listing
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_sized(path: &Path, size: usize) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, vec![0u8; size]).unwrap();
    }

    #[test]
    fn test_largest_video_wins() {
        let dir = tempfile::tempdir().unwrap();
        write_sized(&dir.path().join("Movie/movie.mkv"), 3 * 1024 * 1024);
        write_sized(&dir.path().join("Movie/extras/featurette.mp4"), 2 * 1024 * 1024);
        write_sized(&dir.path().join("Movie/poster.jpg"), 5 * 1024 * 1024);

        let video = largest_video(dir.path(), 1024 * 1024).unwrap();
        assert!(video.path.ends_with("Movie/movie.mkv"));
        assert_eq!(video.size, 3 * 1024 * 1024);
    }

    #[test]
    fn test_small_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write_sized(&dir.path().join("sample.mkv"), 100 * 1024);
        assert!(largest_video(dir.path(), 1024 * 1024).is_none());
    }

    #[test]
    fn test_is_video_case_insensitive() {
        assert!(is_video(Path::new("a/B.MKV")));
        assert!(is_video(Path::new("a/b.m4v")));
        assert!(!is_video(Path::new("a/b.srt")));
        assert!(!is_video(Path::new("a/mkv")));
    }

    #[test]
    fn test_listing_is_relative_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write_sized(&dir.path().join("b.nfo"), 10);
        write_sized(&dir.path().join("a/c.txt"), 10);
        let listing = list_files(dir.path());
        assert_eq!(listing.len(), 2);
        assert!(listing[0].starts_with("a/c.txt"));
        assert!(listing[1].starts_with("b.nfo"));
    }

    #[tokio::test]
    async fn test_find_video_reports_listing_on_timeout() {
        let dir = tempfile::tempdir().unwrap();
        write_sized(&dir.path().join("info.nfo"), 10);
        let locator = ContentLocator::new(DiscoverySettings {
            poll_interval: Duration::from_millis(5),
            video_attempts: 3,
            ..Default::default()
        });

        let err = locator
            .find_video(dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            SessionError::VideoNotFound { attempts, listing, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(listing.len(), 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_interrupts_polling() {
        let dir = tempfile::tempdir().unwrap();
        let locator = ContentLocator::new(DiscoverySettings {
            poll_interval: Duration::from_secs(60),
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = locator.find_video(dir.path(), &cancel).await.unwrap_err();
        assert!(matches!(err, SessionError::Interrupted));
    }
}
