// crates/manifold-server/src/downstream/sse.rs
// Remote transport: POST to send, server-sent event stream to receive

use crate::error::Result;
use futures::StreamExt;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// An event stream silent for longer than this (heartbeat comments
/// included) is considered dead.
const HEARTBEAT_WINDOW: Duration = Duration::from_secs(30);

pub struct SseTransport {
    client: reqwest::Client,
    url: String,
    auth_header: Option<String>,
    inbound: mpsc::Receiver<Value>,
    stream_task: tokio::task::JoinHandle<()>,
}

impl SseTransport {
    /// Subscribe to the event stream immediately; outgoing frames POST
    /// to the same endpoint and replies arrive as `data:` events.
    pub fn open(url: String, auth_header: Option<String>) -> Self {
        // Connect timeout only: the stream is long-lived, so a read
        // timeout would kill healthy idle connections.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let (inbound_tx, inbound) = mpsc::channel(64);
        let stream_task = tokio::spawn(run_stream(
            client.clone(),
            url.clone(),
            auth_header.clone(),
            inbound_tx,
        ));

        Self {
            client,
            url,
            auth_header,
            inbound,
            stream_task,
        }
    }

    pub async fn send(&self, frame: Value) -> Result<()> {
        let mut request = self.client.post(&self.url).json(&frame);
        if let Some(auth) = &self.auth_header {
            request = request.header("Authorization", auth.clone());
        }
        let url = self.url.clone();
        tokio::spawn(async move {
            match request.send().await {
                Ok(response) if !response.status().is_success() => {
                    debug!("SSE POST to {url} returned {}", response.status());
                }
                Ok(_) => {}
                Err(e) => debug!("SSE POST to {url} failed: {e}"),
            }
        });
        Ok(())
    }

    pub async fn recv(&mut self) -> Option<Value> {
        self.inbound.recv().await
    }

    pub fn close(&mut self) {
        self.stream_task.abort();
        self.inbound.close();
    }
}

/// Subscribe and pump `data:` events into the inbound queue. Returning
/// drops the sender, which the connection observes as a dead transport.
async fn run_stream(
    client: reqwest::Client,
    url: String,
    auth_header: Option<String>,
    inbound_tx: mpsc::Sender<Value>,
) {
    let mut request = client.get(&url).header("Accept", "text/event-stream");
    if let Some(auth) = &auth_header {
        request = request.header("Authorization", auth.clone());
    }

    let response = match request.send().await {
        Ok(r) if r.status().is_success() => r,
        Ok(r) => {
            warn!("SSE subscribe to {url} returned {}", r.status());
            return;
        }
        Err(e) => {
            warn!("SSE subscribe to {url} failed: {e}");
            return;
        }
    };

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    loop {
        let bytes = match tokio::time::timeout(HEARTBEAT_WINDOW, stream.next()).await {
            Err(_) => {
                warn!("SSE stream from {url} silent for {HEARTBEAT_WINDOW:?}, closing");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                debug!("SSE stream from {url} errored: {e}");
                return;
            }
            Ok(Some(Ok(bytes))) => bytes,
        };

        buffer.push_str(&String::from_utf8_lossy(&bytes));

        // Events are blank-line separated; anything after the last
        // separator is an incomplete event kept for the next chunk
        while let Some(boundary) = buffer.find("\n\n") {
            let event: String = buffer.drain(..boundary + 2).collect();
            if let Some(frame) = parse_event(&event) {
                if inbound_tx.send(frame).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Extract the JSON payload of one SSE event. Multi-line `data:`
/// fields are joined with newlines; comment lines (heartbeats) and
/// other fields are ignored.
fn parse_event(event: &str) -> Option<Value> {
    let data: Vec<&str> = event
        .lines()
        .filter_map(|line| {
            line.strip_prefix("data:")
                .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        })
        .collect();
    if data.is_empty() {
        return None;
    }
    let payload = data.join("\n");
    match serde_json::from_str(&payload) {
        Ok(frame) => Some(frame),
        Err(e) => {
            debug!("Discarding non-JSON SSE event: {e}");
            None
        }
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.stream_task.abort();
    }
}
