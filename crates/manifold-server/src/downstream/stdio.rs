// crates/manifold-server/src/downstream/stdio.rs
// Child-process transport: LF-delimited JSON-RPC over piped stdio

use super::logs::StderrLog;
use crate::error::{ManifoldError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Grace given to SIGTERM before escalating to SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(2);

pub struct StdioTransport {
    name: String,
    outbound: mpsc::Sender<Value>,
    inbound: mpsc::Receiver<Value>,
    child: Child,
}

impl StdioTransport {
    /// Spawn the configured command with its env merged over the
    /// parent environment. stdin/stdout carry protocol frames; stderr
    /// is pumped into the rotating per-downstream log and never mixes
    /// into the protocol stream.
    pub fn spawn(
        name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        logs_dir: PathBuf,
    ) -> Result<Self> {
        // The full spawn is logged so users can audit profile behavior
        warn!(
            downstream = %name,
            command = %command,
            args = ?args,
            env_vars = ?env.keys().collect::<Vec<_>>(),
            "Spawning downstream child process"
        );

        let mut cmd = Command::new(command);
        cmd.args(args);
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| ManifoldError::Spawn {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| ManifoldError::Spawn {
            name: name.to_string(),
            reason: "child stdin unavailable".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ManifoldError::Spawn {
            name: name.to_string(),
            reason: "child stdout unavailable".into(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| ManifoldError::Spawn {
            name: name.to_string(),
            reason: "child stderr unavailable".into(),
        })?;

        let (outbound, mut outbound_rx) = mpsc::channel::<Value>(64);
        let (inbound_tx, inbound) = mpsc::channel::<Value>(64);

        // Writer: one LF-terminated frame per outgoing message
        let writer_name = name.to_string();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(frame) = outbound_rx.recv().await {
                let mut line = frame.to_string();
                line.push('\n');
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    debug!(downstream = %writer_name, "stdin write failed: {e}");
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // Reader: parse LF-delimited frames; non-JSON lines are logged
        // and skipped rather than poisoning the stream
        let reader_name = name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(trimmed) {
                    Ok(frame) => {
                        if inbound_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(downstream = %reader_name, "Discarding non-JSON stdout line: {e}");
                    }
                }
            }
            // inbound_tx drops here; the connection sees a dead transport
        });

        // stderr pump into the rotating log
        let mut stderr_log = StderrLog::open(logs_dir, name);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                stderr_log.write_line(&line);
            }
        });

        Ok(Self {
            name: name.to_string(),
            outbound,
            inbound,
            child,
        })
    }

    pub async fn send(&self, frame: Value) -> Result<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| ManifoldError::Upstream {
                message: format!("stdio transport to '{}' closed", self.name),
                payload: None,
            })
    }

    pub async fn recv(&mut self) -> Option<Value> {
        self.inbound.recv().await
    }

    /// SIGTERM, wait out the grace period, then SIGKILL.
    pub async fn close(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // Safety: plain kill(2) on our own child's pid
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        match tokio::time::timeout(TERM_GRACE, self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                debug!(downstream = %self.name, "SIGTERM grace expired, killing");
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
            }
        }
    }
}
