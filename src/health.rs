//! Readiness probe for a running server.
//!
//! `llama-server` answers `GET /health` with 200 once the model is loaded. The probe polls
//! that endpoint on a fixed interval and reports the first success to the event loop.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::Event;

pub const PROBE_INTERVAL: Duration = Duration::from_secs(1);
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

pub fn health_url(base_url: &str) -> String {
    format!("{}/health", base_url.trim_end_matches('/'))
}

fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(format!("llamarack/{}", env!("CARGO_PKG_VERSION")))
        .timeout(PROBE_TIMEOUT)
        .no_proxy()
        .build()
        .context("failed to build health probe client")
}

/// One request; `true` only for HTTP 200.
pub async fn probe_once(client: &reqwest::Client, url: &str) -> bool {
    match client.get(url).send().await {
        Ok(response) => response.status() == reqwest::StatusCode::OK,
        Err(err) => {
            tracing::trace!(url, error = %err, "health probe failed");
            false
        }
    }
}

/// Polls `url` until it answers 200. Runs until then, so callers abort it on stop.
pub async fn wait_until_ready(client: &reqwest::Client, url: &str, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if probe_once(client, url).await {
            return;
        }
    }
}

/// Starts probing the server of run `run`. Abort the handle when the run ends.
pub fn spawn_probe(base_url: String, run: u64, tx: mpsc::Sender<Event>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let client = match build_client() {
            Ok(client) => client,
            Err(err) => {
                tracing::warn!(error = %err, "health probe disabled");
                return;
            }
        };
        let url = health_url(&base_url);
        tracing::debug!(%url, run, "health probe started");
        wait_until_ready(&client, &url, PROBE_INTERVAL).await;
        tracing::info!(%url, run, "server reported healthy");
        let _ = tx.send(Event::ServerReady { run }).await;
    })
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;

    use super::*;

    // Serves `responses` one connection at a time, then stops.
    fn serve(responses: Vec<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for response in responses {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{}", addr)
    }

    const OK: &str =
        "HTTP/1.1 200 OK\r\nContent-Length: 15\r\nConnection: close\r\n\r\n{\"status\":\"ok\"}";
    const LOADING: &str =
        "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

    #[test]
    fn health_url_appends_path() {
        assert_eq!(health_url("http://127.0.0.1:8080"), "http://127.0.0.1:8080/health");
        assert_eq!(health_url("http://localhost:9/"), "http://localhost:9/health");
    }

    #[tokio::test]
    async fn probe_requires_status_200() {
        let client = build_client().unwrap();
        let base = serve(vec![LOADING, OK]);
        let url = health_url(&base);
        assert!(!probe_once(&client, &url).await);
        assert!(probe_once(&client, &url).await);
    }

    #[tokio::test]
    async fn probe_fails_when_nothing_listens() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = build_client().unwrap();
        assert!(!probe_once(&client, &format!("http://127.0.0.1:{}/health", port)).await);
    }

    #[tokio::test]
    async fn waits_through_loading_responses() {
        let client = build_client().unwrap();
        let base = serve(vec![LOADING, LOADING, OK]);
        let url = health_url(&base);
        tokio::time::timeout(
            Duration::from_secs(5),
            wait_until_ready(&client, &url, Duration::from_millis(20)),
        )
        .await
        .expect("probe never saw the server become ready");
    }

    #[tokio::test]
    async fn spawned_probe_reports_run() {
        let base = serve(vec![OK]);
        let (tx, mut rx) = mpsc::channel(4);
        let handle = spawn_probe(base, 7, tx);
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(Event::ServerReady { run: 7 })));
        handle.await.unwrap();
    }
}
