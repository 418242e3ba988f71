// crates/manifold-server/src/downstream/transport.rs
// Uniform frame transport over stdio subprocess / HTTP POST / SSE

use super::http::HttpTransport;
use super::sse::SseTransport;
use super::stdio::StdioTransport;
use crate::config::{DownstreamDefinition, DownstreamEntry, RemoteTransport};
use crate::error::Result;
use serde_json::Value;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// One bidirectional JSON-RPC frame stream to a downstream.
///
/// Every variant presents the same surface: `send` a frame (never
/// blocking on remote I/O), `recv` the next incoming frame (`None`
/// when the transport died), `close` for teardown. Correlation of
/// ids to replies happens one layer up, in the connection task.
pub enum Transport {
    Stdio(StdioTransport),
    Http(HttpTransport),
    Sse(SseTransport),
    /// In-memory pair, the injection point for tests and loopback.
    Channel(ChannelTransport),
}

impl Transport {
    /// Open a transport for a profile entry.
    pub fn connect(entry: &DownstreamEntry, logs_dir: PathBuf) -> Result<Self> {
        match &entry.definition {
            DownstreamDefinition::Process { command, args, env } => Ok(Transport::Stdio(
                StdioTransport::spawn(&entry.name, command, args, env, logs_dir)?,
            )),
            DownstreamDefinition::Remote {
                url,
                transport,
                auth,
            } => {
                let auth_header = auth.header_value();
                match transport {
                    RemoteTransport::Http => {
                        Ok(Transport::Http(HttpTransport::open(url.clone(), auth_header)))
                    }
                    RemoteTransport::Sse => {
                        Ok(Transport::Sse(SseTransport::open(url.clone(), auth_header)))
                    }
                }
            }
        }
    }

    /// Wrap an in-memory channel pair.
    pub fn from_channels(outbound: mpsc::Sender<Value>, inbound: mpsc::Receiver<Value>) -> Self {
        Transport::Channel(ChannelTransport { outbound, inbound })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Transport::Stdio(_) => "stdio",
            Transport::Http(_) => "http",
            Transport::Sse(_) => "sse",
            Transport::Channel(_) => "channel",
        }
    }

    /// Queue one outgoing frame. An error means the transport is dead.
    pub async fn send(&self, frame: Value) -> Result<()> {
        match self {
            Transport::Stdio(t) => t.send(frame).await,
            Transport::Http(t) => t.send(frame).await,
            Transport::Sse(t) => t.send(frame).await,
            Transport::Channel(t) => t.send(frame).await,
        }
    }

    /// Next incoming frame; `None` once the transport is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        match self {
            Transport::Stdio(t) => t.recv().await,
            Transport::Http(t) => t.recv().await,
            Transport::Sse(t) => t.recv().await,
            Transport::Channel(t) => t.inbound.recv().await,
        }
    }

    pub async fn close(&mut self) {
        match self {
            Transport::Stdio(t) => t.close().await,
            Transport::Http(t) => t.close(),
            Transport::Sse(t) => t.close(),
            Transport::Channel(_) => {}
        }
    }
}

/// In-memory transport over an mpsc pair.
pub struct ChannelTransport {
    outbound: mpsc::Sender<Value>,
    inbound: mpsc::Receiver<Value>,
}

impl ChannelTransport {
    async fn send(&self, frame: Value) -> Result<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| crate::ManifoldError::Upstream {
                message: "transport closed".into(),
                payload: None,
            })
    }
}
