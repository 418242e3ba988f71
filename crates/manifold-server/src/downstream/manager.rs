// crates/manifold-server/src/downstream/manager.rs
// Connection pool: lazy spawn, cooldown, health probing, shutdown

use super::connection::ConnectionHandle;
use super::protocol;
use super::transport::Transport;
use crate::config::{DownstreamEntry, Profile};
use crate::error::{ManifoldError, Result};
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, info, warn};

/// Handshake budget for initialize + initialized.
const INIT_TIMEOUT: Duration = Duration::from_secs(15);

/// tools/list budget during indexing.
const LIST_TOOLS_TIMEOUT: Duration = Duration::from_secs(30);

/// Health probe cadence and budget.
const HEALTH_INTERVAL: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive probe failures before the connection is closed.
const PROBE_STRIKES: u32 = 3;

/// Connections idle longer than this are drained and closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Cooldown backoff bounds (doubling, jittered ±20%).
const COOLDOWN_INITIAL_SECS: u64 = 10;
const COOLDOWN_MAX_SECS: u64 = 600;

/// Transient transport failures retried per call.
const TRANSIENT_RETRIES: usize = 2;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Whole-pool shutdown budget.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);

/// Opens a transport for a profile entry. The default spawns real
/// processes and HTTP clients; tests inject channel transports wired
/// to scripted downstreams.
pub type Connector = Arc<dyn Fn(&DownstreamEntry) -> Result<Transport> + Send + Sync>;

/// Tool row as advertised by a downstream's `tools/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Option<Value>,
}

#[derive(Debug, Clone)]
struct Cooldown {
    consecutive: u32,
    until: Instant,
    reason: String,
}

/// Owns every downstream connection. At most one live connection and
/// at most one concurrent spawn exist per downstream name; cooldown
/// state survives acquire attempts for the process lifetime.
#[derive(Clone)]
pub struct ConnectionManager {
    profile: Arc<Profile>,
    /// Upstream client identity, forwarded verbatim on every
    /// downstream `initialize`.
    client_info: Arc<RwLock<Value>>,
    connections: Arc<RwLock<HashMap<String, ConnectionHandle>>>,
    /// Per-name guards serializing spawn attempts.
    init_locks: Arc<AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
    cooldowns: Arc<AsyncMutex<HashMap<String, Cooldown>>>,
    connector: Connector,
}

impl ConnectionManager {
    pub fn new(profile: Arc<Profile>, logs_dir: PathBuf) -> Self {
        let connector: Connector =
            Arc::new(move |entry| Transport::connect(entry, logs_dir.clone()));
        Self::with_connector(profile, connector)
    }

    /// Construct with a custom transport factory (test seam).
    pub fn with_connector(profile: Arc<Profile>, connector: Connector) -> Self {
        Self {
            profile,
            client_info: Arc::new(RwLock::new(serde_json::json!({
                "name": "manifold",
                "version": env!("CARGO_PKG_VERSION"),
            }))),
            connections: Arc::new(RwLock::new(HashMap::new())),
            init_locks: Arc::new(AsyncMutex::new(HashMap::new())),
            cooldowns: Arc::new(AsyncMutex::new(HashMap::new())),
            connector,
        }
    }

    /// Replace the client identity sent to downstreams. Called once
    /// when the upstream's `initialize` arrives, before any spawn.
    pub async fn set_client_info(&self, client_info: Value) {
        *self.client_info.write().await = client_info;
    }

    /// Ready connection for a downstream, spawning lazily. Concurrent
    /// callers share one spawn; cooldown rejects early.
    pub async fn acquire(&self, name: &str) -> Result<ConnectionHandle> {
        if let Some((remaining, reason)) = self.cooldown_remaining(name).await {
            return Err(ManifoldError::Unavailable {
                name: name.to_string(),
                reason,
                retry_after_secs: remaining,
            });
        }

        if let Some(handle) = self.live_connection(name).await {
            return Ok(handle);
        }

        let entry = self
            .profile
            .get(name)
            .ok_or_else(|| ManifoldError::NotFound(format!("downstream '{name}' not configured")))?
            .clone();

        let lock = {
            let mut locks = self.init_locks.lock().await;
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        // Serialize spawning for this name; re-check both maps once
        // the guard is held in case another waiter finished first
        let _guard = lock.lock().await;
        if let Some(handle) = self.live_connection(name).await {
            return Ok(handle);
        }
        if let Some((remaining, reason)) = self.cooldown_remaining(name).await {
            return Err(ManifoldError::Unavailable {
                name: name.to_string(),
                reason,
                retry_after_secs: remaining,
            });
        }

        match self.connect_and_init(&entry).await {
            Ok(handle) => {
                self.clear_cooldown(name).await;
                self.connections
                    .write()
                    .await
                    .insert(name.to_string(), handle.clone());
                self.spawn_monitor(name.to_string(), handle.clone());
                info!(downstream = %name, "Connected");
                Ok(handle)
            }
            Err(e) => {
                let retry_after = self.enter_cooldown(name, &e.to_string()).await;
                warn!(downstream = %name, "Connection failed: {e}");
                Err(ManifoldError::Unavailable {
                    name: name.to_string(),
                    reason: e.to_string(),
                    retry_after_secs: retry_after,
                })
            }
        }
    }

    /// Send a request on a downstream's connection. `_meta`, when
    /// given, must already be embedded in `params` by the caller
    /// (see `protocol::call_tool_params`). Transient transport
    /// failures are retried within the deadline.
    pub async fn call(
        &self,
        name: &str,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<Value> {
        let started = Instant::now();
        let mut last_error: Option<ManifoldError> = None;

        for attempt in 0..=TRANSIENT_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BACKOFF * attempt as u32).await;
            }
            let Some(remaining) = deadline.checked_sub(started.elapsed()) else {
                return Err(last_error
                    .unwrap_or_else(|| ManifoldError::Timeout(format!("{method} on '{name}'"))));
            };

            let handle = self.acquire(name).await?;
            handle.touch();
            match handle.request(method, params.clone(), remaining).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let transport_reset = matches!(
                        &e,
                        ManifoldError::Upstream { payload: None, .. } | ManifoldError::Io(_)
                    );
                    if transport_reset {
                        // Dead connection; drop it so the retry respawns
                        self.remove_connection(name, &handle).await;
                        debug!(downstream = %name, attempt, "Transport reset: {e}");
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ManifoldError::Upstream {
            message: format!("call to '{name}' failed"),
            payload: None,
        }))
    }

    /// `tools/list` on a downstream, parsed into raw tool rows.
    pub async fn list_tools(&self, name: &str) -> Result<Vec<RawTool>> {
        let result = self
            .call(name, "tools/list", None, LIST_TOOLS_TIMEOUT)
            .await?;
        let tools = result
            .get("tools")
            .cloned()
            .ok_or_else(|| ManifoldError::Upstream {
                message: format!("'{name}' returned tools/list without a tools array"),
                payload: Some(result.clone()),
            })?;
        Ok(serde_json::from_value(tools)?)
    }

    /// Remaining cooldown for a downstream, if any.
    pub async fn cooldown_remaining(&self, name: &str) -> Option<(u64, String)> {
        let cooldowns = self.cooldowns.lock().await;
        let cooldown = cooldowns.get(name)?;
        let remaining = cooldown.until.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            // Expired: eligible for a fresh probe. The entry stays so
            // a repeat failure continues the backoff streak.
            return None;
        }
        Some((remaining.as_secs().max(1), cooldown.reason.clone()))
    }

    /// Record a failure and return the retry hint in seconds.
    pub async fn enter_cooldown(&self, name: &str, reason: &str) -> u64 {
        let mut cooldowns = self.cooldowns.lock().await;
        let consecutive = cooldowns.get(name).map(|c| c.consecutive).unwrap_or(0) + 1;
        let base = (COOLDOWN_INITIAL_SECS << (consecutive - 1).min(10)).min(COOLDOWN_MAX_SECS);
        // ±20% jitter avoids synchronized retry stampedes
        let jitter = rand::rng().random_range(0.8..=1.2);
        let secs = ((base as f64) * jitter).round().max(1.0) as u64;
        cooldowns.insert(
            name.to_string(),
            Cooldown {
                consecutive,
                until: Instant::now() + Duration::from_secs(secs),
                reason: reason.to_string(),
            },
        );
        secs
    }

    async fn clear_cooldown(&self, name: &str) {
        self.cooldowns.lock().await.remove(name);
    }

    async fn live_connection(&self, name: &str) -> Option<ConnectionHandle> {
        let handle = self.connections.read().await.get(name).cloned()?;
        if handle.is_closed() {
            self.remove_connection(name, &handle).await;
            return None;
        }
        Some(handle)
    }

    async fn remove_connection(&self, name: &str, stale: &ConnectionHandle) {
        let mut connections = self.connections.write().await;
        // Guard against evicting a replacement spawned in the meantime
        if let Some(current) = connections.get(name) {
            if current.same_as(stale) || current.is_closed() {
                connections.remove(name);
            }
        }
    }

    async fn connect_and_init(&self, entry: &DownstreamEntry) -> Result<ConnectionHandle> {
        let transport = (self.connector)(entry)?;
        debug!(downstream = %entry.name, transport = transport.label(), "Transport opened");
        let handle = ConnectionHandle::spawn(entry.name.clone(), transport);

        let client_info = self.client_info.read().await.clone();
        let params = protocol::initialize_params(&client_info);
        if let Err(e) = handle
            .request("initialize", Some(params), INIT_TIMEOUT)
            .await
        {
            handle.shutdown().await;
            return Err(e);
        }
        handle.notify("notifications/initialized", None).await?;
        handle.touch();
        Ok(handle)
    }

    /// Per-connection monitor: periodic liveness probe plus idle
    /// reaping. Three consecutive probe failures close the connection
    /// and start a cooldown.
    fn spawn_monitor(&self, name: String, handle: ConnectionHandle) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut strikes = 0u32;
            let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick

            loop {
                ticker.tick().await;
                if handle.is_closed() {
                    manager.remove_connection(&name, &handle).await;
                    break;
                }
                if handle.idle_for() > IDLE_TIMEOUT {
                    debug!(downstream = %name, "Idle timeout, draining connection");
                    manager.remove_connection(&name, &handle).await;
                    handle.shutdown().await;
                    break;
                }

                if probe(&handle, PROBE_TIMEOUT).await {
                    strikes = 0;
                } else {
                    strikes += 1;
                    debug!(downstream = %name, strikes, "Health probe failed");
                    if strikes >= PROBE_STRIKES {
                        warn!(downstream = %name, "Unhealthy, closing connection");
                        manager.remove_connection(&name, &handle).await;
                        handle.shutdown().await;
                        manager
                            .enter_cooldown(&name, "repeated health probe failures")
                            .await;
                        break;
                    }
                }
            }
        });
    }

    /// Drain and terminate every connection within the shutdown
    /// budget. After return no child of the aggregator remains.
    pub async fn shutdown(&self) {
        let handles: Vec<ConnectionHandle> = {
            let mut connections = self.connections.write().await;
            connections.drain().map(|(_, h)| h).collect()
        };
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "Shutting down downstream connections");
        let all = futures::future::join_all(handles.iter().map(|h| h.shutdown()));
        if tokio::time::timeout(SHUTDOWN_BUDGET, all).await.is_err() {
            warn!("Shutdown budget exceeded; remaining children were killed on drop");
        }
    }
}

/// Liveness probe for one connection. `ping` is optional in MCP, so a
/// downstream that silently drops it gets a second chance with
/// `tools/list` before the attempt counts as a failure. A structured
/// error reply to either method proves the peer is alive.
async fn probe(handle: &ConnectionHandle, timeout: Duration) -> bool {
    for method in ["ping", "tools/list"] {
        match handle.request(method, None, timeout).await {
            Ok(_) => return true,
            Err(ManifoldError::Upstream {
                payload: Some(_), ..
            }) => return true,
            Err(e) => {
                debug!(method, "Probe attempt failed: {e}");
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn test_profile(names: &[&str]) -> Arc<Profile> {
        let mut servers = serde_json::Map::new();
        for name in names {
            servers.insert(
                name.to_string(),
                json!({"command": "unused", "args": []}),
            );
        }
        Arc::new(Profile::from_value(&json!({"mcpServers": servers})).unwrap())
    }

    /// Connector whose downstreams answer initialize/ping/tools/list
    /// and echo tools/call params back as the result.
    fn scripted_connector(spawn_count: Arc<AtomicUsize>) -> Connector {
        Arc::new(move |entry| {
            spawn_count.fetch_add(1, Ordering::SeqCst);
            let (out_tx, mut out_rx) = mpsc::channel::<Value>(16);
            let (in_tx, in_rx) = mpsc::channel::<Value>(16);
            let name = entry.name.clone();
            tokio::spawn(async move {
                while let Some(frame) = out_rx.recv().await {
                    let Some(method) = frame.get("method").and_then(|m| m.as_str()) else {
                        continue;
                    };
                    let Some(id) = frame.get("id").cloned() else {
                        continue; // notification
                    };
                    let reply = match method {
                        "initialize" => json!({
                            "jsonrpc": "2.0", "id": id,
                            "result": {
                                "protocolVersion": "2025-06-18",
                                "capabilities": {},
                                "serverInfo": {"name": name, "version": "0.0.1"},
                                "echoClientInfo": frame["params"]["clientInfo"],
                            }
                        }),
                        "ping" => json!({"jsonrpc": "2.0", "id": id, "result": {}}),
                        "tools/list" => json!({
                            "jsonrpc": "2.0", "id": id,
                            "result": {"tools": [
                                {"name": "echo", "description": "Echo params", "inputSchema": {"type": "object"}}
                            ]}
                        }),
                        "tools/call" => json!({
                            "jsonrpc": "2.0", "id": id,
                            "result": {"params": frame["params"]}
                        }),
                        _ => json!({
                            "jsonrpc": "2.0", "id": id,
                            "error": {"code": -32601, "message": "method not found"}
                        }),
                    };
                    if in_tx.send(reply).await.is_err() {
                        break;
                    }
                }
            });
            Ok(Transport::from_channels(out_tx, in_rx))
        })
    }

    #[tokio::test]
    async fn test_concurrent_acquire_spawns_once() {
        let spawns = Arc::new(AtomicUsize::new(0));
        let manager = ConnectionManager::with_connector(
            test_profile(&["alpha"]),
            scripted_connector(spawns.clone()),
        );

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.acquire("alpha").await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        assert_eq!(spawns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_initialize_carries_upstream_client_info() {
        let captured: Arc<std::sync::Mutex<Option<Value>>> =
            Arc::new(std::sync::Mutex::new(None));
        let captured_in_connector = captured.clone();
        let connector: Connector = Arc::new(move |_entry| {
            let (out_tx, mut out_rx) = mpsc::channel::<Value>(16);
            let (in_tx, in_rx) = mpsc::channel::<Value>(16);
            let captured = captured_in_connector.clone();
            tokio::spawn(async move {
                while let Some(frame) = out_rx.recv().await {
                    let Some(id) = frame.get("id").cloned() else {
                        continue;
                    };
                    if frame["method"] == "initialize" {
                        *captured.lock().unwrap() =
                            Some(frame["params"]["clientInfo"].clone());
                    }
                    let _ = in_tx
                        .send(json!({"jsonrpc": "2.0", "id": id, "result": {}}))
                        .await;
                }
            });
            Ok(Transport::from_channels(out_tx, in_rx))
        });

        let manager = ConnectionManager::with_connector(test_profile(&["alpha"]), connector);
        let upstream_identity =
            json!({"name": "claude-desktop", "version": "9.9.9", "vendor": {"os": "mac"}});
        manager.set_client_info(upstream_identity.clone()).await;

        manager.acquire("alpha").await.unwrap();
        let seen = captured.lock().unwrap().clone().unwrap();
        assert_eq!(seen, upstream_identity, "clientInfo must pass through verbatim");
    }

    #[tokio::test]
    async fn test_unknown_downstream_is_not_found() {
        let spawns = Arc::new(AtomicUsize::new(0));
        let manager = ConnectionManager::with_connector(
            test_profile(&["alpha"]),
            scripted_connector(spawns),
        );
        assert!(matches!(
            manager.acquire("ghost").await,
            Err(ManifoldError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure_enters_cooldown() {
        let connector: Connector = Arc::new(|entry| {
            Err(ManifoldError::Spawn {
                name: entry.name.clone(),
                reason: "exec format error".into(),
            })
        });
        let manager = ConnectionManager::with_connector(test_profile(&["broken"]), connector);

        match manager.acquire("broken").await {
            Err(ManifoldError::Unavailable {
                retry_after_secs, ..
            }) => {
                assert!(retry_after_secs >= 8, "initial cooldown ~10s jittered ±20%");
            }
            Err(other) => panic!("expected Unavailable, got {other:?}"),
            Ok(_) => panic!("acquire of a broken downstream should fail"),
        }

        // Second acquire is rejected by the cooldown, without a spawn
        match manager.acquire("broken").await {
            Err(ManifoldError::Unavailable { reason, .. }) => {
                assert!(reason.contains("exec format error"));
            }
            Err(other) => panic!("expected Unavailable, got {other:?}"),
            Ok(_) => panic!("cooldown should reject the acquire"),
        }
    }

    #[tokio::test]
    async fn test_cooldown_backoff_doubles() {
        let spawns = Arc::new(AtomicUsize::new(0));
        let manager = ConnectionManager::with_connector(
            test_profile(&["flaky"]),
            scripted_connector(spawns),
        );
        let first = manager.enter_cooldown("flaky", "boom").await;
        let second = manager.enter_cooldown("flaky", "boom").await;
        let third = manager.enter_cooldown("flaky", "boom").await;
        assert!(first >= 8 && first <= 12);
        assert!(second >= 16 && second <= 24);
        assert!(third >= 32 && third <= 48);
    }

    #[tokio::test]
    async fn test_list_tools_parses_rows() {
        let spawns = Arc::new(AtomicUsize::new(0));
        let manager = ConnectionManager::with_connector(
            test_profile(&["alpha"]),
            scripted_connector(spawns),
        );
        let tools = manager.list_tools("alpha").await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
        assert_eq!(tools[0].description.as_deref(), Some("Echo params"));
        assert!(tools[0].input_schema.is_some());
    }

    /// Handle over a peer that answers `tools/list` but silently
    /// drops every other method (never replies, never errors).
    fn tools_list_only_handle() -> ConnectionHandle {
        let (out_tx, mut out_rx) = mpsc::channel::<Value>(16);
        let (in_tx, in_rx) = mpsc::channel::<Value>(16);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let Some(id) = frame.get("id").cloned() else {
                    continue;
                };
                if frame["method"] == "tools/list" {
                    let reply =
                        json!({"jsonrpc": "2.0", "id": id, "result": {"tools": []}});
                    if in_tx.send(reply).await.is_err() {
                        break;
                    }
                }
                // anything else: no reply at all
            }
        });
        ConnectionHandle::spawn("minimal".into(), Transport::from_channels(out_tx, in_rx))
    }

    #[tokio::test]
    async fn test_probe_falls_back_to_tools_list() {
        // A compliant downstream without the optional ping method must
        // not be counted unhealthy
        let handle = tools_list_only_handle();
        assert!(probe(&handle, Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_probe_structured_error_counts_alive() {
        let (out_tx, mut out_rx) = mpsc::channel::<Value>(16);
        let (in_tx, in_rx) = mpsc::channel::<Value>(16);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let Some(id) = frame.get("id").cloned() else {
                    continue;
                };
                let reply = json!({
                    "jsonrpc": "2.0", "id": id,
                    "error": {"code": -32601, "message": "method not found"}
                });
                if in_tx.send(reply).await.is_err() {
                    break;
                }
            }
        });
        let handle =
            ConnectionHandle::spawn("errors".into(), Transport::from_channels(out_tx, in_rx));
        assert!(probe(&handle, Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_probe_silence_on_both_methods_is_unhealthy() {
        let (out_tx, mut out_rx) = mpsc::channel::<Value>(16);
        let (in_tx, in_rx) = mpsc::channel::<Value>(16);
        tokio::spawn(async move {
            // Hold the reply side open but never answer anything
            let _in_tx = in_tx;
            while out_rx.recv().await.is_some() {}
        });
        let handle =
            ConnectionHandle::spawn("mute".into(), Transport::from_channels(out_tx, in_rx));
        assert!(!probe(&handle, Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_shutdown_closes_all() {
        let spawns = Arc::new(AtomicUsize::new(0));
        let manager = ConnectionManager::with_connector(
            test_profile(&["alpha", "beta"]),
            scripted_connector(spawns),
        );
        let a = manager.acquire("alpha").await.unwrap();
        let b = manager.acquire("beta").await.unwrap();
        manager.shutdown().await;
        assert!(a.is_closed());
        assert!(b.is_closed());
    }
}
