//! Subtitle discovery inside the content directory
//!
//! Torrents often ship subtitles next to the video. Once content is located
//! we poll for them for a bounded time and hand the player an absolute path
//! it can take as a single argument. Never fatal: no subtitle, no problem.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::stream::sleep_or_cancel;

/// Extensions treated as subtitle files
pub const SUBTITLE_EXTENSIONS: &[&str] = &["srt", "vtt", "ass", "ssa", "sub", "idx"];

/// Subtitle search behaviour
#[derive(Debug, Clone)]
pub struct SubtitleSettings {
    pub enabled: bool,
    /// Upper bound on how long we look
    pub wait: Duration,
    pub poll_interval: Duration,
    /// Preferred language tags as they appear in file names (e.g. "eng", "en")
    pub languages: Vec<String>,
}

impl Default for SubtitleSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            wait: Duration::from_secs(15),
            poll_interval: Duration::from_secs(1),
            languages: vec!["eng".to_string(), "en".to_string()],
        }
    }
}

/// A subtitle file found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtitleCandidate {
    pub path: PathBuf,
    pub size: u64,
}

/// A subtitle ready to hand to the player
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSubtitle {
    pub path: PathBuf,
    /// True when the file was copied into the session scratch directory
    pub copied: bool,
}

pub struct SubtitleResolver {
    settings: SubtitleSettings,
}

impl SubtitleResolver {
    pub fn new(settings: SubtitleSettings) -> Self {
        Self { settings }
    }

    /// Poll `dir` for a usable subtitle for `video`, up to the configured wait
    pub async fn resolve(
        &self,
        dir: PathBuf,
        video: PathBuf,
        scratch: PathBuf,
        cancel: CancellationToken,
    ) -> Option<ResolvedSubtitle> {
        if !self.settings.enabled {
            return None;
        }

        let interval_ms = self.settings.poll_interval.as_millis().max(1);
        let polls = self.settings.wait.as_millis().div_ceil(interval_ms).max(1);
        let video_stem = stem_lower(&video);

        for _ in 0..polls {
            let candidates = find_subtitles(&dir);
            if let Some(best) = pick_best(&candidates, &video_stem, &self.settings.languages) {
                match prepare(&best.path, &scratch) {
                    Ok(resolved) => {
                        info!(path = %resolved.path.display(), "subtitle resolved");
                        return Some(resolved);
                    }
                    Err(e) => {
                        debug!(path = %best.path.display(), error = %e, "subtitle not usable");
                    }
                }
            }
            if sleep_or_cancel(self.settings.poll_interval, &cancel).await.is_err() {
                return None;
            }
        }

        info!("no subtitles found, playing without");
        None
    }
}

fn stem_lower(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

pub fn is_subtitle(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUBTITLE_EXTENSIONS.iter().any(|s| e.eq_ignore_ascii_case(s)))
        .unwrap_or(false)
}

/// Every subtitle file under `dir`, recursively
pub fn find_subtitles(dir: &Path) -> Vec<SubtitleCandidate> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file() && is_subtitle(e.path()))
        .map(|e| SubtitleCandidate {
            size: e.metadata().map(|m| m.len()).unwrap_or(0),
            path: e.into_path(),
        })
        .collect()
}

/// Best non-empty candidate: stem match, then language match, then size
pub fn pick_best<'a>(
    candidates: &'a [SubtitleCandidate],
    video_stem: &str,
    languages: &[String],
) -> Option<&'a SubtitleCandidate> {
    candidates
        .iter()
        .filter(|c| c.size > 0)
        .max_by_key(|c| {
            let stem = stem_lower(&c.path);
            let stem_match = !video_stem.is_empty() && stem.starts_with(video_stem);
            let lang_match = languages.iter().any(|lang| {
                let lang = lang.to_lowercase();
                stem.split(|ch: char| !ch.is_ascii_alphanumeric())
                    .any(|token| token == lang)
            });
            (stem_match, lang_match, c.size)
        })
}

/// Whether a file name can go on a player command line untouched
fn is_player_safe(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Absolute path for the player; awkward names are copied to `scratch`
pub fn prepare(path: &Path, scratch: &Path) -> std::io::Result<ResolvedSubtitle> {
    let absolute = std::fs::canonicalize(path)?;
    let name = absolute
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    if is_player_safe(&name) {
        return Ok(ResolvedSubtitle {
            path: absolute,
            copied: false,
        });
    }

    let ext = absolute
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| "srt".to_string());
    std::fs::create_dir_all(scratch)?;
    let target = scratch.join(format!("subtitle.{}", ext));
    std::fs::copy(&absolute, &target)?;
    Ok(ResolvedSubtitle {
        path: target,
        copied: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn candidate(path: &str, size: u64) -> SubtitleCandidate {
        SubtitleCandidate {
            path: PathBuf::from(path),
            size,
        }
    }

    #[test]
    fn test_is_subtitle() {
        for ok in ["a.srt", "a.VTT", "a.ass", "a.ssa", "a.sub", "a.idx"] {
            assert!(is_subtitle(Path::new(ok)), "{}", ok);
        }
        assert!(!is_subtitle(Path::new("a.mkv")));
        assert!(!is_subtitle(Path::new("srt")));
    }

    #[test]
    fn test_pick_best_prefers_non_empty() {
        let subs = vec![candidate("/d/empty.srt", 0), candidate("/d/other.srt", 10)];
        let best = pick_best(&subs, "movie", &[]).unwrap();
        assert_eq!(best.path, PathBuf::from("/d/other.srt"));
        assert!(pick_best(&[candidate("/d/a.srt", 0)], "movie", &[]).is_none());
    }

    #[test]
    fn test_pick_best_prefers_matching_stem_then_language() {
        let subs = vec![
            candidate("/d/Subs/2_Spanish.srt", 90_000),
            candidate("/d/Subs/3_eng.srt", 50_000),
            candidate("/d/movie.2019.1080p.srt", 40_000),
        ];
        let langs = vec!["eng".to_string()];
        let best = pick_best(&subs, "movie.2019.1080p", &langs).unwrap();
        assert_eq!(best.path, PathBuf::from("/d/movie.2019.1080p.srt"));

        let best = pick_best(&subs[..2], "movie.2019.1080p", &langs).unwrap();
        assert_eq!(best.path, PathBuf::from("/d/Subs/3_eng.srt"));
    }

    #[test]
    fn test_prepare_keeps_safe_names() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("movie.en.srt");
        fs::write(&sub, "1\n00:00:01,000 --> 00:00:02,000\nHi\n").unwrap();

        let resolved = prepare(&sub, &dir.path().join("scratch")).unwrap();
        assert!(!resolved.copied);
        assert!(resolved.path.is_absolute());
    }

    #[test]
    fn test_prepare_copies_awkward_names() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("Movie (2019), English [SDH].SRT");
        fs::write(&sub, "1\n00:00:01,000 --> 00:00:02,000\nHi\n").unwrap();
        let scratch = dir.path().join("scratch");

        let resolved = prepare(&sub, &scratch).unwrap();
        assert!(resolved.copied);
        assert_eq!(resolved.path, scratch.join("subtitle.srt"));
        assert!(resolved.path.exists());
    }

    #[tokio::test]
    async fn test_resolve_gives_up_after_wait() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = SubtitleResolver::new(SubtitleSettings {
            wait: Duration::from_millis(30),
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        });
        let found = resolver
            .resolve(
                dir.path().to_path_buf(),
                dir.path().join("movie.mkv"),
                dir.path().join("scratch"),
                CancellationToken::new(),
            )
            .await;
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_resolve_finds_subtitle() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("movie.srt"), "1\n").unwrap();
        let resolver = SubtitleResolver::new(SubtitleSettings::default());
        let found = resolver
            .resolve(
                dir.path().to_path_buf(),
                dir.path().join("movie.mkv"),
                dir.path().join("scratch"),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(found.path.ends_with("movie.srt"));
    }
}
