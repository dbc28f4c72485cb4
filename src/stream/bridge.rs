//! Torrent-to-HTTP bridge process (peerflix-class tools)
//!
//! Spawns the bridge against a normalized source on a local port, captures
//! everything it prints, and parses that output for the content path and
//! peer counts as it arrives.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::stream::process::ManagedProcess;

/// Output fragments that mean the bridge could not parse the torrent
const FATAL_MARKERS: &[&str] = &[
    "invalid data",
    "bencode error",
    "invalid torrent",
    "not a valid torrent",
    "unexpected end of",
];

/// How the bridge is launched
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Bridge executable (name on PATH or absolute path)
    pub command: String,
    /// Temp-directory prefix under which the bridge materializes content
    pub content_prefix: PathBuf,
    /// Fixed port, or 0 for an ephemeral one
    pub port: u16,
    pub file_index: Option<u32>,
    /// Copy of everything the bridge prints, for diagnosis
    pub log_path: Option<PathBuf>,
}

/// What we learned from the bridge's output so far
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeTelemetry {
    pub content_path: Option<PathBuf>,
    pub connected_peers: u32,
    pub total_peers: u32,
}

#[derive(Default)]
struct BridgeShared {
    output: Mutex<String>,
    telemetry: Mutex<BridgeTelemetry>,
}

/// A running bridge process
pub struct BridgeProcess {
    process: ManagedProcess,
    port: u16,
    shared: Arc<BridgeShared>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl BridgeProcess {
    /// Spawn the bridge: `bridge <source> -p <port> [-i <fileIndex>]`
    pub async fn start(settings: &BridgeSettings, bridge_arg: &str) -> Result<Self, SessionError> {
        let port = pick_port(settings.port)?;

        let mut cmd = Command::new(&settings.command);
        cmd.arg(bridge_arg).arg("-p").arg(port.to_string());
        if let Some(idx) = settings.file_index {
            cmd.arg("-i").arg(idx.to_string());
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| SessionError::BridgeSpawn {
            command: settings.command.clone(),
            source,
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let process = ManagedProcess::new("bridge", child).ok_or_else(|| {
            SessionError::BridgeStartFailure {
                message: format!("{} exited before it could be tracked", settings.command),
                output: String::new(),
            }
        })?;

        info!(pid = process.pid(), port, command = %settings.command, "bridge started");

        let shared = Arc::new(BridgeShared::default());
        let mut readers = Vec::new();
        if let Some(out) = stdout {
            readers.push(spawn_reader(out, shared.clone(), settings.clone()));
        }
        if let Some(err) = stderr {
            readers.push(spawn_reader(err, shared.clone(), settings.clone()));
        }

        Ok(Self {
            process,
            port,
            shared,
            readers: Mutex::new(readers),
        })
    }

    /// After a grace period, fail if the bridge already died
    ///
    /// A metadata-parse death is an incompatibility between this torrent and
    /// this bridge; callers must not retry it.
    pub async fn check_started(
        &self,
        grace: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        tokio::select! {
            _ = cancel.cancelled() => return Err(SessionError::Interrupted),
            _ = tokio::time::sleep(grace) => {}
        }

        let Some(status) = self.process.exit_status() else {
            return Ok(());
        };

        self.drain_readers(Duration::from_millis(500)).await;
        let output = self.output();
        let message = match detect_fatal(&output) {
            Some(marker) => format!(
                "The bridge could not parse this torrent's metadata ('{}'). \
                 This torrent is not compatible with the bridge; try another source.",
                marker
            ),
            None => format!("Bridge exited immediately ({})", status),
        };
        warn!(%status, "bridge died during startup");
        Err(SessionError::BridgeStartFailure { message, output })
    }

    /// Wait for the output readers to hit EOF (bridge already exited)
    async fn drain_readers(&self, timeout: Duration) {
        let handles: Vec<_> = self.readers.lock().drain(..).collect();
        for handle in handles {
            let _ = tokio::time::timeout(timeout, handle).await;
        }
    }

    /// Everything captured so far (stdout and stderr interleaved)
    pub fn output(&self) -> String {
        self.shared.output.lock().clone()
    }

    pub fn telemetry(&self) -> BridgeTelemetry {
        self.shared.telemetry.lock().clone()
    }

    pub fn process(&self) -> &ManagedProcess {
        &self.process
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// HTTP URL the bridge serves the selected file on
    pub fn stream_url(&self) -> String {
        format!("http://127.0.0.1:{}/", self.port)
    }
}

impl Drop for BridgeProcess {
    fn drop(&mut self) {
        for handle in self.readers.lock().drain(..) {
            handle.abort();
        }
    }
}

fn pick_port(configured: u16) -> Result<u16, SessionError> {
    if configured != 0 {
        return Ok(configured);
    }
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

fn spawn_reader<R>(mut reader: R, shared: Arc<BridgeShared>, settings: BridgeSettings) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut log = match &settings.log_path {
            Some(path) => tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map_err(|e| debug!(path = %path.display(), error = %e, "bridge log unavailable"))
                .ok(),
            None => None,
        };

        let mut buf = [0u8; 4096];
        let mut pending = String::new();
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let chunk = String::from_utf8_lossy(&buf[..n]);
            shared.output.lock().push_str(&chunk);
            if let Some(file) = log.as_mut() {
                let _ = file.write_all(&buf[..n]).await;
            }

            // Progress lines are redrawn with \r, so split on both
            pending.push_str(&chunk);
            while let Some(idx) = pending.find(['\n', '\r']) {
                let line: String = pending.drain(..=idx).collect();
                observe_line(&line, &shared, &settings.content_prefix);
            }
        }
        if !pending.is_empty() {
            observe_line(&pending, &shared, &settings.content_prefix);
        }
    })
}

fn observe_line(line: &str, shared: &BridgeShared, prefix: &Path) {
    let line = strip_ansi(line);
    if line.trim().is_empty() {
        return;
    }
    let mut telemetry = shared.telemetry.lock();
    if let Some(path) = extract_content_path(&line, prefix) {
        if telemetry.content_path.as_ref() != Some(&path) {
            debug!(path = %path.display(), "bridge reported content path");
            telemetry.content_path = Some(path);
        }
    }
    if let Some((connected, total)) = parse_peers(&line) {
        telemetry.connected_peers = connected;
        telemetry.total_peers = total;
    }
}

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

/// Remove terminal escape sequences from bridge output
pub fn strip_ansi(line: &str) -> String {
    static ANSI: OnceLock<Option<Regex>> = OnceLock::new();
    match cached(&ANSI, r"\x1b\[[0-9;?]*[ -/]*[@-~]") {
        Some(re) => re.replace_all(line, "").to_string(),
        None => line.to_string(),
    }
}

/// First absolute path in `line` that lives under `prefix`
pub fn extract_content_path(line: &str, prefix: &Path) -> Option<PathBuf> {
    static PATH: OnceLock<Option<Regex>> = OnceLock::new();
    let re = cached(&PATH, r#"/[^\s'"`]+"#)?;

    re.find_iter(line)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ':', ')', ']']))
        .map(PathBuf::from)
        .find(|p| p.starts_with(prefix) && p != prefix)
}

/// Peer counts as `(connected, total)`
///
/// Understands `3/12 peers`, `3 of 12 peers` and a bare `7 peers`.
pub fn parse_peers(line: &str) -> Option<(u32, u32)> {
    static RATIO: OnceLock<Option<Regex>> = OnceLock::new();
    static SINGLE: OnceLock<Option<Regex>> = OnceLock::new();

    if let Some(caps) = cached(&RATIO, r"(?i)(\d+)\s*(?:/|of)\s*(\d+)\s*peers?\b")?.captures(line) {
        let connected = caps.get(1)?.as_str().parse().ok()?;
        let total = caps.get(2)?.as_str().parse().ok()?;
        return Some((connected, total));
    }
    let caps = cached(&SINGLE, r"(?i)(\d+)\s+peers?\b|peers?\s*[:=]\s*(\d+)")?.captures(line)?;
    let n: u32 = caps.get(1).or_else(|| caps.get(2))?.as_str().parse().ok()?;
    Some((n, n))
}

/// Which fatal-parse marker, if any, appears in the captured output
pub fn detect_fatal(output: &str) -> Option<&'static str> {
    let lower = output.to_lowercase();
    FATAL_MARKERS.iter().copied().find(|m| lower.contains(m))
}
