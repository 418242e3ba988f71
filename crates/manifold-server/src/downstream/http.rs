// crates/manifold-server/src/downstream/http.rs
// Remote transport: one HTTP POST per JSON-RPC envelope

use crate::error::{ManifoldError, Result};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Synthesized error code for transport-level POST failures, so the
/// connection task can fail the right waiter.
const TRANSPORT_ERROR: i64 = -32001;

pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    auth_header: Option<String>,
    inbound_tx: mpsc::Sender<Value>,
    inbound: mpsc::Receiver<Value>,
}

impl HttpTransport {
    pub fn open(url: String, auth_header: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let (inbound_tx, inbound) = mpsc::channel(64);
        Self {
            client,
            url,
            auth_header,
            inbound_tx,
            inbound,
        }
    }

    /// POST the frame in a detached task; the correlated reply (or a
    /// synthesized transport error carrying the same id) lands on the
    /// inbound queue. Notifications expect no body and report nothing.
    pub async fn send(&self, frame: Value) -> Result<()> {
        let id = frame.get("id").cloned();
        let mut request = self.client.post(&self.url).json(&frame);
        if let Some(auth) = &self.auth_header {
            request = request.header("Authorization", auth.clone());
        }
        let inbound_tx = self.inbound_tx.clone();
        let url = self.url.clone();

        tokio::spawn(async move {
            let outcome = async {
                let response = request.send().await?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(ManifoldError::Upstream {
                        message: format!("POST {url} returned {status}: {body}"),
                        payload: None,
                    });
                }
                if id.is_none() {
                    return Ok(None);
                }
                let body: Value = response.json().await?;
                Ok(Some(body))
            }
            .await;

            match outcome {
                Ok(Some(reply)) => {
                    let _ = inbound_tx.send(reply).await;
                }
                Ok(None) => {}
                Err(e) => {
                    debug!("HTTP transport error: {e}");
                    if let Some(id) = id {
                        let _ = inbound_tx
                            .send(json!({
                                "jsonrpc": "2.0",
                                "id": id,
                                "error": {
                                    "code": TRANSPORT_ERROR,
                                    "message": format!("transport failure: {e}"),
                                }
                            }))
                            .await;
                    }
                }
            }
        });

        Ok(())
    }

    pub async fn recv(&mut self) -> Option<Value> {
        self.inbound.recv().await
    }

    pub fn close(&mut self) {
        self.inbound.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_host_synthesizes_error_reply() {
        let mut transport =
            HttpTransport::open("http://127.0.0.1:1/mcp".to_string(), None);
        transport
            .send(json!({"jsonrpc": "2.0", "id": 9, "method": "tools/list"}))
            .await
            .unwrap();

        let reply = transport.recv().await.unwrap();
        assert_eq!(reply["id"], 9);
        assert_eq!(reply["error"]["code"], TRANSPORT_ERROR);
    }

    #[tokio::test]
    async fn test_notification_failure_is_silent() {
        let mut transport =
            HttpTransport::open("http://127.0.0.1:1/mcp".to_string(), None);
        transport
            .send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await
            .unwrap();

        // No synthesized reply for notifications; the queue stays empty
        let waited =
            tokio::time::timeout(Duration::from_millis(300), transport.recv()).await;
        assert!(waited.is_err());
    }
}
