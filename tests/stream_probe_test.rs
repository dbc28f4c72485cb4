//! HTTP stream readiness probe tests

use std::time::{Duration, Instant};

use termflix::session::probe_stream;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_probe_accepts_answering_stream() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("HEAD", "/0")
        .with_status(200)
        .with_header("content-type", "video/x-matroska")
        .create_async()
        .await;

    let url = format!("{}/0", server.url());
    assert!(probe_stream(&url, Duration::from_secs(5), &CancellationToken::new()).await);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_probe_gives_up_after_timeout() {
    let mut server = mockito::Server::new_async().await;
    server.mock("HEAD", "/0").with_status(404).create_async().await;

    let url = format!("{}/0", server.url());
    let started = Instant::now();
    assert!(!probe_stream(&url, Duration::from_millis(800), &CancellationToken::new()).await);
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn test_probe_stops_when_cancelled() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    // Nothing listens here; cancellation ends the probe after the first attempt
    let started = Instant::now();
    assert!(!probe_stream("http://127.0.0.1:9/0", Duration::from_secs(30), &cancel).await);
    assert!(started.elapsed() < Duration::from_secs(5));
}
