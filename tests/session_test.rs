//! Streaming session scenario tests
//!
//! Runs whole sessions against small shell scripts standing in for the
//! torrent bridge and the media player.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use termflix::models::{BufferState, MediaMeta};
use termflix::session::{SessionEvent, SessionSettings, StreamRequest, StreamSession};
use termflix::stream::buffer::BufferSettings;
use termflix::stream::history::WatchHistoryStore;
use termflix::stream::locator::DiscoverySettings;
use termflix::stream::monitor::{MonitorSettings, PlayerExit};
use termflix::stream::process::{pid_exists, send_kill};
use termflix::stream::subtitles::SubtitleSettings;
use termflix::SessionError;

const MAGNET: &str = "magnet:?xt=urn:btih:ABCDEF0123456789ABCDEF0123456789ABCDEF01&dn=Test+Movie";
const HASH: &str = "abcdef0123456789abcdef0123456789abcdef01";

// =============================================================================
// Fixtures
// =============================================================================

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// Bridge that reveals a content dir holding a 2 MB video and a subtitle
fn working_bridge(root: &Path) -> PathBuf {
    let content = root.join("torrent-stream").join(HASH);
    script(
        root,
        "bridge_ok.sh",
        &format!(
            r#"echo "$1" > "{root}/bridge_arg"
echo $$ > "{root}/bridge_pid"
mkdir -p "{content}/Test Movie"
echo "info path {content}"
echo "downloading from 5/10 peers"
printf '1\n00:00:01,000 --> 00:00:02,000\nHi\n' > "{content}/Test Movie/movie.srt"
head -c 2097152 /dev/zero > "{content}/Test Movie/movie.mkv"
exec sleep 60"#,
            root = root.display(),
            content = content.display()
        ),
    )
}

/// Bridge that never says where content is
fn silent_bridge(root: &Path) -> PathBuf {
    script(
        root,
        "bridge_silent.sh",
        &format!(
            r#"echo $$ > "{root}/bridge_pid"
echo "listening on port $3"
exec sleep 60"#,
            root = root.display()
        ),
    )
}

/// Player that records its arguments, prints an mpv-style status line and quits
fn quitting_player(root: &Path) -> PathBuf {
    script(
        root,
        "player_ok.sh",
        &format!(
            r#"for arg in "$@"; do echo "$arg"; done > "{root}/player_args"
echo "AV: 00:01:40 / 00:10:00 (16%)"
sleep 0.3"#,
            root = root.display()
        ),
    )
}

/// Player that stays up until something kills it
fn lingering_player(root: &Path) -> PathBuf {
    script(
        root,
        "player_wait.sh",
        &format!(
            r#"echo $$ > "{root}/player_pid"
exec sleep 30"#,
            root = root.display()
        ),
    )
}

/// Player that reports a position, then keeps playing until stopped
fn playing_player(root: &Path) -> PathBuf {
    script(
        root,
        "player_playing.sh",
        &format!(
            r#"echo $$ > "{root}/player_pid"
echo "AV: 00:01:40 / 00:10:00 (16%)"
exec sleep 30"#,
            root = root.display()
        ),
    )
}

fn settings(root: &Path, bridge: &Path, player: &Path) -> SessionSettings {
    let mut s = SessionSettings::default();
    s.bridge.command = bridge.display().to_string();
    s.bridge.content_prefix = root.join("torrent-stream");
    s.bridge_startup_grace = Duration::from_millis(100);
    s.bridge_terminate_grace = Duration::from_secs(1);
    s.discovery = DiscoverySettings {
        poll_interval: Duration::from_millis(50),
        path_attempts: 60,
        video_attempts: 60,
        min_video_bytes: 1024 * 1024,
    };
    s.buffer = BufferSettings {
        target_bytes: 1024 * 1024,
        poll_interval: Duration::from_millis(50),
        stall_polls: 5,
        max_wait: Duration::from_secs(5),
    };
    s.subtitles = SubtitleSettings {
        wait: Duration::from_millis(500),
        poll_interval: Duration::from_millis(50),
        ..Default::default()
    };
    s.player.command = Some(player.to_path_buf());
    s.player.monitor = MonitorSettings {
        poll_interval: Duration::from_millis(100),
        confirm_delay: Duration::from_millis(100),
        safety_polls: 600,
    };
    s.player.terminate_grace = Duration::from_secs(1);
    s.history_file = root.join("history.json");
    s.status_file = root.join("status");
    s.state_dir = root.join("state");
    s
}

fn request() -> StreamRequest {
    StreamRequest {
        source: MAGNET.to_string(),
        meta: MediaMeta {
            title: Some("Test Movie".to_string()),
            quality: Some("1080p".to_string()),
            size: Some("2 MB".to_string()),
        },
    }
}

fn read_pid(path: &Path) -> u32 {
    std::fs::read_to_string(path).unwrap().trim().parse().unwrap()
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_full_session_plays_resumes_and_records() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let s = settings(root, &working_bridge(root), &quitting_player(root));

    WatchHistoryStore::new(&s.history_file)
        .save_watch_progress(HASH, 600, 5400, "Test Movie", &MediaMeta::default())
        .unwrap();

    let session = StreamSession::new(s.clone());
    let mut states = Vec::new();
    let mut max_progress = 0u8;
    let outcome = session
        .run(request(), |event| match event {
            SessionEvent::State(state) => states.push(state),
            SessionEvent::Buffer(record) => max_progress = max_progress.max(record.progress_pct),
            _ => {}
        })
        .await
        .unwrap();

    // Normalized, lower-cased source reached the bridge
    let bridge_arg = std::fs::read_to_string(root.join("bridge_arg")).unwrap();
    assert!(bridge_arg.starts_with(&format!("magnet:?xt=urn:btih:{}", HASH)));

    assert_eq!(
        states,
        vec![
            BufferState::Analyzing,
            BufferState::Buffering,
            BufferState::Ready,
            BufferState::Playing
        ]
    );
    assert!(max_progress <= 100);
    assert_eq!(outcome.player_exit, PlayerExit::Exited);
    assert!(outcome.session.video_path.unwrap().ends_with("movie.mkv"));

    let args = std::fs::read_to_string(root.join("player_args")).unwrap();
    assert!(args.lines().next().unwrap().ends_with("movie.mkv"));
    assert!(args.lines().any(|a| a == "--start=600"));
    assert!(args.lines().any(|a| a.starts_with("--sub-file=") && a.ends_with("movie.srt")));

    let entry = outcome.history.unwrap();
    assert_eq!(entry.last_position_seconds, 100);
    assert_eq!(entry.duration_seconds, 600);
    assert_eq!(entry.quality.as_deref(), Some("1080p"));
    assert_eq!(WatchHistoryStore::new(&s.history_file).get_watch_position(HASH), 100);

    // Teardown
    assert!(!pid_exists(read_pid(&root.join("bridge_pid"))));
    assert!(!s.status_file.exists());
    assert_eq!(std::fs::read_dir(&s.state_dir).unwrap().count(), 0);
}

#[tokio::test]
async fn test_path_discovery_timeout_never_launches_player() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let mut s = settings(root, &silent_bridge(root), &quitting_player(root));
    s.discovery.path_attempts = 4;

    let session = StreamSession::new(s.clone());
    let mut states = Vec::new();
    let err = session
        .run(request(), |event| {
            if let SessionEvent::State(state) = event {
                states.push(state);
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::PathDiscoveryTimeout { attempts: 4 }));
    assert_eq!(states, vec![BufferState::Failed]);
    assert!(!root.join("player_args").exists());
    assert!(!s.status_file.exists());
    assert!(!pid_exists(read_pid(&root.join("bridge_pid"))));
}

#[tokio::test]
async fn test_bridge_rejecting_torrent_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let bridge = script(
        root,
        "bridge_bad.sh",
        r#"echo "Error: Invalid data: Missing delimiter \"e\"" >&2
exit 1"#,
    );
    let session = StreamSession::new(settings(root, &bridge, &quitting_player(root)));

    let err = session.run(request(), |_| {}).await.unwrap_err();
    match &err {
        SessionError::BridgeStartFailure { message, output } => {
            assert!(message.contains("not compatible"));
            assert!(output.contains("Invalid data"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!err.diagnostics().is_empty());
    assert!(!root.join("player_args").exists());
}

#[tokio::test]
async fn test_externally_killed_player_is_detected_quickly() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let s = settings(&root, &working_bridge(&root), &lingering_player(&root));
    let session = StreamSession::new(s.clone());

    let pid_file = root.join("player_pid");
    let killer = tokio::spawn(async move {
        let deadline = Instant::now() + Duration::from_secs(20);
        while !pid_file.exists() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        send_kill(read_pid(&pid_file));
        Instant::now()
    });

    let outcome = session.run(request(), |_| {}).await.unwrap();
    let finished = Instant::now();
    let killed_at = killer.await.unwrap();

    assert_eq!(outcome.player_exit, PlayerExit::Exited);
    assert!(finished.duration_since(killed_at) < Duration::from_secs(2));
    assert!(!pid_exists(read_pid(&root.join("bridge_pid"))));
}

#[tokio::test]
async fn test_cancel_during_buffering_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let content = root.join("torrent-stream").join(HASH);
    // Video large enough to select but far below the buffer target, never growing
    let bridge = script(
        root,
        "bridge_slow.sh",
        &format!(
            r#"echo $$ > "{root}/bridge_pid"
mkdir -p "{content}"
head -c 1572864 /dev/zero > "{content}/movie.mkv"
exec sleep 60"#,
            root = root.display(),
            content = content.display()
        ),
    );
    let mut s = settings(root, &bridge, &quitting_player(root));
    s.buffer.target_bytes = 500 * 1024 * 1024;
    s.buffer.max_wait = Duration::from_secs(60);

    let session = StreamSession::new(s.clone());
    let cancel = session.cancel_token();
    let mut buffering = false;
    let run = session.run(request(), |event| {
        if let SessionEvent::State(BufferState::Buffering) = event {
            buffering = true;
        }
    });
    let stop = async {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(run, stop);

    assert!(matches!(result, Err(SessionError::Interrupted)));
    assert!(buffering);
    assert!(!root.join("player_args").exists());
    assert!(!s.status_file.exists());
    assert!(!pid_exists(read_pid(&root.join("bridge_pid"))));
}

#[tokio::test]
async fn test_missing_player_fails_before_bridge_starts() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let s = settings(root, &working_bridge(root), &root.join("no-such-player"));

    let session = StreamSession::new(s);
    let err = session.run(request(), |_| {}).await.unwrap_err();
    assert!(matches!(err, SessionError::PlayerLaunchFailure(_)));
    assert!(!root.join("bridge_pid").exists());
    assert_eq!(session.registry().runs(), 1);
}

#[tokio::test]
async fn test_invalid_source_still_restores_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let session = StreamSession::new(settings(root, &working_bridge(root), &quitting_player(root)));
    session.registry().mark_terminal_altered();

    let mut req = request();
    req.source = "garbage".to_string();
    let err = session.run(req, |_| {}).await.unwrap_err();

    assert!(matches!(err, SessionError::SourceInvalid(_)));
    assert_eq!(session.registry().runs(), 1);
    // Terminal restore was consumed by that pass
    assert!(session.registry().run_blocking().is_empty());
    assert!(!root.join("bridge_pid").exists());
}

#[tokio::test]
async fn test_cancel_during_playback_records_position() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let s = settings(root, &working_bridge(root), &playing_player(root));
    let session = StreamSession::new(s.clone());
    let cancel = session.cancel_token();

    // Interrupt once the player is up and has printed its position
    let pid_file = root.join("player_pid");
    let interrupter = tokio::spawn(async move {
        let deadline = Instant::now() + Duration::from_secs(20);
        while !pid_file.exists() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
        cancel.cancel();
    });

    let mut states = Vec::new();
    let outcome = session
        .run(request(), |event| {
            if let SessionEvent::State(state) = event {
                states.push(state);
            }
        })
        .await
        .unwrap();
    interrupter.await.unwrap();

    assert_eq!(states.last(), Some(&BufferState::Playing));
    assert_eq!(outcome.player_exit, PlayerExit::Cancelled);
    assert!(outcome.interrupted());

    let entry = outcome.history.unwrap();
    assert_eq!(entry.last_position_seconds, 100);
    assert_eq!(entry.duration_seconds, 600);
    assert_eq!(WatchHistoryStore::new(&s.history_file).get_watch_position(HASH), 100);

    assert!(!pid_exists(read_pid(&root.join("player_pid"))));
    assert!(!pid_exists(read_pid(&root.join("bridge_pid"))));
    assert!(!s.status_file.exists());
}
