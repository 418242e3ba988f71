// crates/manifold-server/src/downstream/connection.rs
// One owning task per downstream connection, correlating ids to waiters

use super::protocol::{self, Frame, RpcError};
use super::transport::Transport;
use crate::error::{ManifoldError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Drain window for in-flight requests at shutdown.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

enum Command {
    Request {
        id: i64,
        frame: Value,
        reply: oneshot::Sender<Result<Value>>,
    },
    Notify {
        frame: Value,
    },
    /// Deadline expired upstream; drop the waiter so a late reply is
    /// discarded instead of leaking.
    Cancel {
        id: i64,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Cheap cloneable handle to a running connection task.
///
/// The connection itself — transport, in-flight map — lives inside the
/// task; the handle only assigns ids and awaits replies.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub name: String,
    commands: mpsc::Sender<Command>,
    next_id: Arc<AtomicI64>,
    /// Millis since connection start of the last send/receive, for the
    /// idle reaper.
    activity: Arc<AtomicU64>,
    epoch: Instant,
}

impl ConnectionHandle {
    /// Spawn the owning task over an opened transport.
    pub fn spawn(name: String, transport: Transport) -> Self {
        let (commands, command_rx) = mpsc::channel(64);
        let handle = Self {
            name: name.clone(),
            commands,
            next_id: Arc::new(AtomicI64::new(1)),
            activity: Arc::new(AtomicU64::new(0)),
            epoch: Instant::now(),
        };
        tokio::spawn(run(name, transport, command_rx));
        handle
    }

    /// Send a request and await the correlated reply within the
    /// deadline. A JSON-RPC error reply surfaces as `Upstream` with
    /// the original error payload preserved.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = protocol::request(id, method, params);
        let (reply_tx, reply_rx) = oneshot::channel();

        self.commands
            .send(Command::Request {
                id,
                frame,
                reply: reply_tx,
            })
            .await
            .map_err(|_| self.closed_error())?;

        match tokio::time::timeout(deadline, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => {
                // Remove the waiter; the late reply, if any, is dropped
                let _ = self.commands.send(Command::Cancel { id }).await;
                Err(ManifoldError::Timeout(format!(
                    "{method} on '{}'",
                    self.name
                )))
            }
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let frame = protocol::notification(method, params);
        self.commands
            .send(Command::Notify { frame })
            .await
            .map_err(|_| self.closed_error())
    }

    /// Drain in-flight work (bounded by the grace window) and tear the
    /// transport down. Idempotent; returns once the task has exited.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Shutdown { done: done_tx })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }

    /// True when the owning task has exited (transport death included).
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Identity check: two handles for the same underlying connection.
    pub fn same_as(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.next_id, &other.next_id)
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.activity.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }

    /// Record caller activity. Health probes deliberately do not call
    /// this, so probe traffic never keeps an idle connection alive.
    pub fn touch(&self) {
        self.activity
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn closed_error(&self) -> ManifoldError {
        ManifoldError::Upstream {
            message: format!("connection to '{}' closed", self.name),
            payload: None,
        }
    }
}

/// The owning task: multiplexes commands and transport frames until
/// the transport dies or a shutdown is requested. Every waiter gets a
/// reply or a typed failure before the task exits.
async fn run(name: String, mut transport: Transport, mut commands: mpsc::Receiver<Command>) {
    let mut pending: HashMap<i64, oneshot::Sender<Result<Value>>> = HashMap::new();
    let mut shutdown_ack: Option<oneshot::Sender<()>> = None;

    let disconnect_reason = loop {
        tokio::select! {
            command = commands.recv() => match command {
                None => break "all handles dropped",
                Some(Command::Request { id, frame, reply }) => {
                    if let Err(e) = transport.send(frame).await {
                        let _ = reply.send(Err(e));
                        break "transport send failed";
                    }
                    pending.insert(id, reply);
                }
                Some(Command::Notify { frame }) => {
                    if transport.send(frame).await.is_err() {
                        break "transport send failed";
                    }
                }
                Some(Command::Cancel { id }) => {
                    pending.remove(&id);
                }
                Some(Command::Shutdown { done }) => {
                    shutdown_ack = Some(done);
                    break "shutdown requested";
                }
            },
            frame = transport.recv() => match frame {
                None => break "transport closed",
                Some(value) => dispatch(&name, &transport, &mut pending, value).await,
            },
        }
    };

    // Drain: in-flight requests may still complete within the grace
    // window when the transport is alive (shutdown path)
    if shutdown_ack.is_some() && !pending.is_empty() {
        let drain_deadline = tokio::time::sleep(DRAIN_GRACE);
        tokio::pin!(drain_deadline);
        while !pending.is_empty() {
            tokio::select! {
                _ = &mut drain_deadline => break,
                frame = transport.recv() => match frame {
                    None => break,
                    Some(value) => dispatch(&name, &transport, &mut pending, value).await,
                },
            }
        }
    }

    debug!(downstream = %name, reason = disconnect_reason, "Connection task exiting");

    for (_, waiter) in pending.drain() {
        let _ = waiter.send(Err(ManifoldError::Upstream {
            message: format!("connection to '{name}' closed ({disconnect_reason})"),
            payload: None,
        }));
    }

    transport.close().await;
    // Close the command side before acknowledging so is_closed() is
    // observable the moment shutdown() returns
    drop(commands);
    if let Some(ack) = shutdown_ack {
        let _ = ack.send(());
    }
}

async fn dispatch(
    name: &str,
    transport: &Transport,
    pending: &mut HashMap<i64, oneshot::Sender<Result<Value>>>,
    value: Value,
) {
    match protocol::classify(&value) {
        Some(Frame::Response { id, result }) => {
            let Some(waiter) = pending.remove(&id) else {
                // Cancelled or unknown id; the reply is dropped by design
                debug!(downstream = %name, id, "Discarding uncorrelated reply");
                return;
            };
            let outcome = result.map_err(rpc_to_error);
            let _ = waiter.send(outcome);
        }
        Some(Frame::Notification { method, .. }) => {
            debug!(downstream = %name, method = %method, "Downstream notification");
        }
        Some(Frame::Request { id, method }) => {
            // We are a plain client to downstreams; server-initiated
            // requests get a method-not-found reply
            warn!(downstream = %name, method = %method, "Rejecting server-initiated request");
            let _ = transport.send(protocol::method_not_found(id, &method)).await;
        }
        None => {
            warn!(downstream = %name, "Discarding unrecognizable frame");
        }
    }
}

fn rpc_to_error(error: RpcError) -> ManifoldError {
    let payload = serde_json::to_value(&error).ok();
    ManifoldError::Upstream {
        message: format!("{} (code {})", error.message, error.code),
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Transport pair wired to a scripted fake downstream.
    fn channel_pair() -> (Transport, mpsc::Receiver<Value>, mpsc::Sender<Value>) {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(16);
        (Transport::from_channels(out_tx, in_rx), out_rx, in_tx)
    }

    #[tokio::test]
    async fn test_request_reply_correlation() {
        let (transport, mut server_rx, server_tx) = channel_pair();
        let handle = ConnectionHandle::spawn("fake".into(), transport);

        let request_task = tokio::spawn({
            let handle = handle.clone();
            async move {
                handle
                    .request("tools/list", None, Duration::from_secs(5))
                    .await
            }
        });

        let seen = server_rx.recv().await.unwrap();
        assert_eq!(seen["method"], "tools/list");
        let id = seen["id"].as_i64().unwrap();

        // Reply out of order with an unrelated id first
        server_tx
            .send(json!({"jsonrpc": "2.0", "id": 999, "result": "stray"}))
            .await
            .unwrap();
        server_tx
            .send(json!({"jsonrpc": "2.0", "id": id, "result": {"tools": []}}))
            .await
            .unwrap();

        let result = request_task.await.unwrap().unwrap();
        assert_eq!(result, json!({"tools": []}));
    }

    #[tokio::test]
    async fn test_rpc_error_preserves_payload() {
        let (transport, mut server_rx, server_tx) = channel_pair();
        let handle = ConnectionHandle::spawn("fake".into(), transport);

        let request_task = tokio::spawn({
            let handle = handle.clone();
            async move {
                handle
                    .request("tools/call", Some(json!({"name": "x"})), Duration::from_secs(5))
                    .await
            }
        });

        let seen = server_rx.recv().await.unwrap();
        server_tx
            .send(json!({
                "jsonrpc": "2.0",
                "id": seen["id"],
                "error": {"code": -32602, "message": "bad params", "data": {"hint": "name"}}
            }))
            .await
            .unwrap();

        match request_task.await.unwrap() {
            Err(ManifoldError::Upstream { message, payload }) => {
                assert!(message.contains("bad params"));
                let payload = payload.unwrap();
                assert_eq!(payload["code"], -32602);
                assert_eq!(payload["data"]["hint"], "name");
            }
            other => panic!("expected Upstream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_cancels_waiter() {
        let (transport, mut server_rx, server_tx) = channel_pair();
        let handle = ConnectionHandle::spawn("slow".into(), transport);

        let result = handle
            .request("tools/call", None, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(ManifoldError::Timeout(_))));

        // The late reply must be discarded, not crash the task
        let seen = server_rx.recv().await.unwrap();
        server_tx
            .send(json!({"jsonrpc": "2.0", "id": seen["id"], "result": "late"}))
            .await
            .unwrap();

        // The connection still works for subsequent requests
        let next = tokio::spawn({
            let handle = handle.clone();
            async move { handle.request("ping", None, Duration::from_secs(5)).await }
        });
        let ping = server_rx.recv().await.unwrap();
        assert_eq!(ping["method"], "ping");
        server_tx
            .send(json!({"jsonrpc": "2.0", "id": ping["id"], "result": {}}))
            .await
            .unwrap();
        assert!(next.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_transport_death_fails_in_flight_waiters() {
        let (transport, mut server_rx, server_tx) = channel_pair();
        let handle = ConnectionHandle::spawn("dying".into(), transport);

        let request_task = tokio::spawn({
            let handle = handle.clone();
            async move {
                handle
                    .request("tools/call", None, Duration::from_secs(5))
                    .await
            }
        });
        let _ = server_rx.recv().await.unwrap();

        drop(server_tx); // transport dies with the request in flight

        match request_task.await.unwrap() {
            Err(ManifoldError::Upstream { message, .. }) => {
                assert!(message.contains("closed"));
            }
            other => panic!("expected Upstream error, got {other:?}"),
        }
        // Task exits; handle observes the closure
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_server_initiated_request_rejected() {
        let (transport, mut server_rx, server_tx) = channel_pair();
        let _handle = ConnectionHandle::spawn("pushy".into(), transport);

        server_tx
            .send(json!({"jsonrpc": "2.0", "id": "srv-1", "method": "sampling/createMessage"}))
            .await
            .unwrap();

        let reply = server_rx.recv().await.unwrap();
        assert_eq!(reply["id"], "srv-1");
        assert_eq!(reply["error"]["code"], protocol::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_shutdown_acknowledges() {
        let (transport, _server_rx, _server_tx) = channel_pair();
        let handle = ConnectionHandle::spawn("quiet".into(), transport);
        handle.shutdown().await;
        assert!(handle.is_closed());
    }
}
