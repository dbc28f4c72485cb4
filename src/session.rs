//! Streaming session orchestrator
//!
//! Drives one stream from source to teardown:
//! normalize → bridge → content → (subtitles ∥ buffer) → player → monitor →
//! watch history → cleanup. Every path out of [`StreamSession::run`],
//! including errors and interrupts, goes through the same cleanup registry.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::models::{BufferState, MediaMeta, Session, StatusRecord, VideoFile, WatchHistoryEntry};
use crate::stream::bridge::{BridgeProcess, BridgeSettings};
use crate::stream::buffer::{BufferMonitor, BufferOutcome, BufferSettings, StatusPublisher};
use crate::stream::cleanup::CleanupRegistry;
use crate::stream::history::{WatchHistoryStore, WatchRecorder};
use crate::stream::locator::{ContentLocator, DiscoverySettings};
use crate::stream::monitor::{
    LivenessProbe, MonitorSettings, OpenFileProbe, PidProbe, PlayerExit, PlayerMonitor,
    ProcessNameProbe,
};
use crate::stream::player::{self, LaunchRequest, PlaybackPosition, Player, PlayerKind};
use crate::stream::source::{normalize, NormalizedSource};
use crate::stream::subtitles::{SubtitleResolver, SubtitleSettings};

// =============================================================================
// Settings
// =============================================================================

/// Player selection and supervision
#[derive(Debug, Clone)]
pub struct PlayerSettings {
    pub preferred: Option<PlayerKind>,
    /// Explicit player binary, bypassing detection
    pub command: Option<PathBuf>,
    pub monitor: MonitorSettings,
    pub terminate_grace: Duration,
    /// Hand the player the bridge's HTTP URL instead of the local file
    pub use_stream_url: bool,
    pub stream_probe_timeout: Duration,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            preferred: None,
            command: None,
            monitor: MonitorSettings::default(),
            terminate_grace: Duration::from_secs(3),
            use_stream_url: false,
            stream_probe_timeout: Duration::from_secs(10),
        }
    }
}

/// Everything a session needs to know, already resolved from config
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub bridge: BridgeSettings,
    pub bridge_startup_grace: Duration,
    pub bridge_terminate_grace: Duration,
    pub discovery: DiscoverySettings,
    pub buffer: BufferSettings,
    pub subtitles: SubtitleSettings,
    pub player: PlayerSettings,
    /// Start from the last recorded position
    pub resume: bool,
    pub history_file: PathBuf,
    pub status_file: PathBuf,
    /// Parent of the per-session scratch directory
    pub state_dir: PathBuf,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let tmp = std::env::temp_dir();
        Self {
            bridge: BridgeSettings {
                command: "peerflix".to_string(),
                content_prefix: tmp.join("torrent-stream"),
                port: 0,
                file_index: None,
                log_path: None,
            },
            bridge_startup_grace: Duration::from_secs(2),
            bridge_terminate_grace: Duration::from_secs(3),
            discovery: DiscoverySettings::default(),
            buffer: BufferSettings::default(),
            subtitles: SubtitleSettings::default(),
            player: PlayerSettings::default(),
            resume: true,
            history_file: WatchHistoryStore::default_path(),
            status_file: tmp.join("termflix_stream_status"),
            state_dir: tmp.join("termflix"),
        }
    }
}

// =============================================================================
// Requests, Events, Outcomes
// =============================================================================

/// What the catalog collaborator hands over to start a stream
#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    pub source: String,
    pub meta: MediaMeta,
}

/// Progress notifications for whoever is displaying the session
#[derive(Debug)]
pub enum SessionEvent<'a> {
    State(BufferState),
    Buffer(&'a StatusRecord),
    VideoSelected(&'a VideoFile),
    Subtitle(&'a Path),
    Resuming(u64),
    PlayerStarted { player: PlayerKind, pid: u32 },
}

/// How a session that reached playback ended
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session: Session,
    pub buffer: BufferOutcome,
    pub player_exit: PlayerExit,
    /// Entry written to the watch history, if a position was recovered
    pub history: Option<WatchHistoryEntry>,
}

impl SessionOutcome {
    pub fn interrupted(&self) -> bool {
        self.player_exit == PlayerExit::Cancelled
    }
}

// =============================================================================
// Session
// =============================================================================

pub struct StreamSession {
    settings: SessionSettings,
    cancel: CancellationToken,
    registry: CleanupRegistry,
}

impl StreamSession {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            settings,
            cancel: CancellationToken::new(),
            registry: CleanupRegistry::new(),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Cancelling this token interrupts the session at its next poll
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn registry(&self) -> &CleanupRegistry {
        &self.registry
    }

    /// Run one session to completion
    pub async fn run(
        &self,
        request: StreamRequest,
        mut on_event: impl FnMut(SessionEvent<'_>),
    ) -> Result<SessionOutcome, SessionError> {
        // Both checks happen before anything is spawned
        let (source, player) = match self.preflight(&request.source).await {
            Ok(checked) => checked,
            Err(e) => {
                warn!(error = %e, "session rejected before start");
                self.registry.run().await;
                return Err(e);
            }
        };

        let mut session = Session::new(request.source, source.content_hash.clone(), request.meta);
        info!(
            session = %session.id,
            hash = %session.content_hash,
            player = %player.kind(),
            "session starting"
        );

        let guard = self.registry.guard();
        let signals = spawn_signal_watcher(self.cancel.clone());

        let scratch = self.settings.state_dir.join(format!("session-{}", session.id));
        self.registry.register_dir(&scratch);
        let mut status = StatusPublisher::new(&self.settings.status_file);
        self.registry.register_file(status.path());
        self.registry.register_file(status.path().with_extension("tmp"));

        let result = match std::fs::create_dir_all(&scratch) {
            Ok(()) => {
                status.publish();
                self.drive(&mut session, &source, player.as_ref(), &scratch, &mut status, &mut on_event)
                    .await
            }
            Err(e) => Err(e.into()),
        };

        match &result {
            Ok(outcome) => info!(
                session = %session.id,
                exit = ?outcome.player_exit,
                "session finished"
            ),
            Err(SessionError::Interrupted) => info!(session = %session.id, "session interrupted"),
            Err(e) => {
                warn!(session = %session.id, error = %e, "session failed");
                status.advance(BufferState::Failed);
                on_event(SessionEvent::State(BufferState::Failed));
            }
        }

        self.registry.run().await;
        signals.abort();
        drop(guard);
        result
    }

    async fn preflight(
        &self,
        source: &str,
    ) -> Result<(NormalizedSource, Box<dyn Player>), SessionError> {
        let source = normalize(source)?;
        let player = player::detect_player(
            self.settings.player.preferred,
            self.settings.player.command.as_deref(),
        )
        .await
        .map_err(|e| SessionError::PlayerLaunchFailure(e.to_string()))?;
        Ok((source, player))
    }

    async fn drive(
        &self,
        session: &mut Session,
        source: &NormalizedSource,
        player: &dyn Player,
        scratch: &Path,
        status: &mut StatusPublisher,
        on_event: &mut impl FnMut(SessionEvent<'_>),
    ) -> Result<SessionOutcome, SessionError> {
        let cancel = &self.cancel;
        let settings = &self.settings;

        // Bridge
        let bridge_settings = BridgeSettings {
            log_path: Some(scratch.join("bridge.log")),
            ..settings.bridge.clone()
        };
        let bridge = BridgeProcess::start(&bridge_settings, &source.bridge_arg).await?;
        self.registry
            .register_process(bridge.process().clone(), settings.bridge_terminate_grace);
        session.bridge_pid = Some(bridge.pid());
        status.update(|r| {
            r.bridge_pid = Some(bridge.pid());
            r.stream_url = Some(bridge.stream_url());
        });
        bridge.check_started(settings.bridge_startup_grace, cancel).await?;

        // Content
        let locator = ContentLocator::new(settings.discovery.clone());
        let fallback = settings.bridge.content_prefix.join(&source.content_hash);
        let dir = locator.discover_path(&bridge, Some(&fallback), cancel).await?;
        status.advance(BufferState::Analyzing);
        on_event(SessionEvent::State(BufferState::Analyzing));

        let video = locator.find_video(&dir, cancel).await?;
        session.video_path = Some(video.path.clone());
        on_event(SessionEvent::VideoSelected(&video));

        // Subtitles run alongside buffering
        let resolver = SubtitleResolver::new(settings.subtitles.clone());
        let subtitle_task = {
            let (dir, video_path, subs, cancel) =
                (dir.clone(), video.path.clone(), scratch.join("subs"), cancel.clone());
            tokio::spawn(async move { resolver.resolve(dir, video_path, subs, cancel).await })
        };

        on_event(SessionEvent::State(BufferState::Buffering));
        let buffered = BufferMonitor::new(settings.buffer.clone())
            .run(&video.path, &bridge, status, cancel, |r| on_event(SessionEvent::Buffer(r)))
            .await;
        let buffered = match buffered {
            Ok(outcome) => outcome,
            Err(e) => {
                subtitle_task.abort();
                return Err(e);
            }
        };
        on_event(SessionEvent::State(BufferState::Ready));

        let subtitle = subtitle_task.await.ok().flatten();
        if let Some(sub) = &subtitle {
            on_event(SessionEvent::Subtitle(&sub.path));
        }
        session.subtitle_path = subtitle.map(|s| s.path);

        // Resume point
        let store = WatchHistoryStore::new(&settings.history_file);
        let start_at = if settings.resume {
            store.resume_offset(&session.content_hash)
        } else {
            0
        };
        if start_at > 0 {
            info!(position = start_at, "resuming playback");
            on_event(SessionEvent::Resuming(start_at));
        }

        // Player
        let request = LaunchRequest {
            media: self.choose_media(&bridge, &video).await,
            subtitle: session.subtitle_path.clone(),
            start_at,
            title: Some(session.display_title()),
        };
        let player_state = scratch.join("player");
        let player_log = scratch.join("player.log");
        let launched_at = SystemTime::now();
        let process = player::launch(player, &request, &player_state, &player_log)
            .map_err(|e| SessionError::PlayerLaunchFailure(e.to_string()))?;
        self.registry
            .register_process(process.clone(), settings.player.terminate_grace);
        session.player_pid = Some(process.pid());

        let probes: Vec<Box<dyn LivenessProbe>> = vec![
            Box::new(PidProbe::new(process.clone())),
            Box::new(ProcessNameProbe::new(
                player.process_names(),
                launched_at,
                vec![bridge.pid()],
            )),
            Box::new(OpenFileProbe::new(&video.path, vec![bridge.pid()])),
        ];
        let monitor = PlayerMonitor::new(settings.player.monitor.clone(), probes);

        let registry = self.registry.clone();
        let grace = settings.player.terminate_grace;
        let kind = player.kind();
        let mut playing = false;
        let mut live = PlaybackPosition::default();
        let watch = monitor.run(cancel, |sighting| {
            if !playing {
                playing = true;
                status.advance(BufferState::Playing);
                on_event(SessionEvent::State(BufferState::Playing));
                on_event(SessionEvent::PlayerStarted {
                    player: kind,
                    pid: sighting.pid,
                });
            }
            if sighting.pid != process.pid() {
                debug!(pid = sighting.pid, via = sighting.strategy, "player handed off to another process");
                registry.register_pid(sighting.pid, grace);
            }
        });
        let track = WatchRecorder::track_position(player, settings.player.monitor.poll_interval, &mut live);
        let player_exit = tokio::select! {
            exit = watch => exit,
            never = track => match never {},
        };

        // Player and bridge must be gone before their final state is read
        self.registry.stop_processes().await;

        let position =
            WatchRecorder::extract_position(player, &player_state, &request.media, &player_log).or(live);
        let history = WatchRecorder::new(store).record(
            &session.content_hash,
            &session.display_title(),
            &session.meta,
            position,
        );

        Ok(SessionOutcome {
            session: session.clone(),
            buffer: buffered,
            player_exit,
            history,
        })
    }

    /// Local file path, or the bridge URL when configured and answering
    async fn choose_media(&self, bridge: &BridgeProcess, video: &VideoFile) -> String {
        let local = video.path.display().to_string();
        if !self.settings.player.use_stream_url {
            return local;
        }
        let url = bridge.stream_url();
        if probe_stream(&url, self.settings.player.stream_probe_timeout, &self.cancel).await {
            url
        } else {
            warn!(%url, "stream URL not answering, playing the local file");
            local
        }
    }
}

/// HEAD the stream URL until it answers or `timeout` passes
pub async fn probe_stream(url: &str, timeout: Duration, cancel: &CancellationToken) -> bool {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new());

    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        match client.head(url).send().await {
            Ok(resp) if resp.status().is_success() || resp.status().as_u16() == 206 => {
                debug!(%url, "stream answering");
                return true;
            }
            Ok(resp) => debug!(%url, status = %resp.status(), "stream not ready"),
            Err(e) => debug!(%url, error = %e, "stream not reachable"),
        }
        if crate::stream::sleep_or_cancel(Duration::from_millis(500), cancel)
            .await
            .is_err()
        {
            return false;
        }
    }
    false
}

/// Cancel the session on SIGINT, SIGTERM or SIGHUP
pub fn spawn_signal_watcher(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            signal = wait_for_signal() => {
                info!(signal, "received signal, stopping session");
                cancel.cancel();
            }
        }
    })
}

async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
        (Ok(mut term), Ok(mut hup)) => tokio::select! {
            _ = ctrl_c() => "SIGINT",
            _ = term.recv() => "SIGTERM",
            _ = hup.recv() => "SIGHUP",
        },
        _ => {
            ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    ctrl_c().await;
    "ctrl-c"
}
