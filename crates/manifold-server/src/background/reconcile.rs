// crates/manifold-server/src/background/reconcile.rs
// The indexer: probe changed downstreams, embed, patch the index

use crate::error::Result;
use crate::index::ToolRecord;
use crate::mcp::ManifoldServer;
use manifold_types::IndexingProgress;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Semaphore, watch};
use tracing::{debug, info, warn};

/// Downstreams probed concurrently. Bounded to avoid a thundering
/// herd of child spawns at startup.
const MAX_CONCURRENT_PROBES: usize = 4;

/// Cooldown hint when a probe failure carries none of its own.
const DEFAULT_RETRY_SECS: u64 = 10;

/// Reconcile the capability index against the profile: probe added
/// and changed downstreams with bounded parallelism, embed their tool
/// descriptions, patch the index, and persist. Progress is published
/// through the watch channel and ends with `None`.
pub async fn reconcile(
    server: ManifoldServer,
    progress: Arc<watch::Sender<Option<IndexingProgress>>>,
) {
    let plan = server.index.reconcile(&server.profile);
    if plan.is_noop() {
        debug!("Capability cache is warm; no downstream contact needed");
        let _ = progress.send(None);
        return;
    }

    info!(
        added = ?plan.added,
        changed = ?plan.changed,
        removed = ?plan.removed,
        "Reconciling capability index"
    );

    let work = plan.work();
    let total = work.len();
    let started_at = chrono::Utc::now();
    let _ = progress.send(Some(IndexingProgress {
        total,
        current: 0,
        current_downstream: None,
        started_at: started_at.to_rfc3339(),
        eta_seconds: None,
    }));

    let hashes = server.profile.downstream_hashes();
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_PROBES));
    let completed = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = work
        .into_iter()
        .map(|name| {
            let server = server.clone();
            let semaphore = semaphore.clone();
            let progress = progress.clone();
            let completed = completed.clone();
            let hash = hashes.get(&name).cloned().unwrap_or_default();
            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                progress.send_modify(|p| {
                    if let Some(p) = p.as_mut() {
                        p.current_downstream = Some(name.clone());
                    }
                });

                match probe(&server, &name).await {
                    Ok(records) => {
                        info!(downstream = %name, tools = records.len(), "Indexed");
                        server.index.patch(&name, hash, records);
                    }
                    Err(e) => {
                        // Prior records stay; the failure is reported
                        // through find metadata, not by suppression
                        let retry = e.retry_after_secs().unwrap_or(DEFAULT_RETRY_SECS);
                        warn!(downstream = %name, "Probe failed: {e}");
                        server.index.mark_failed(&name, &e.to_string(), retry);
                    }
                }

                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                let elapsed = (chrono::Utc::now() - started_at).num_seconds().max(0) as u64;
                progress.send_modify(|p| {
                    if let Some(p) = p.as_mut() {
                        // Monotonic: concurrent completions never move
                        // the counter backwards
                        p.current = p.current.max(done);
                        p.current_downstream = None;
                        if done > 0 && done < total {
                            p.eta_seconds =
                                Some(elapsed * (total - done) as u64 / done as u64);
                        }
                    }
                });
            })
        })
        .collect();

    futures::future::join_all(tasks).await;

    match server.index.save() {
        Ok(true) => debug!("Capability cache persisted"),
        Ok(false) => debug!("Capability cache unchanged on disk"),
        Err(e) => warn!("Failed to persist capability cache: {e}"),
    }
    let _ = progress.send(None);
}

/// One downstream: list its tools and embed their descriptions. An
/// empty tool list is a successful probe (ready, zero tools).
async fn probe(server: &ManifoldServer, name: &str) -> Result<Vec<ToolRecord>> {
    let raw_tools = server.connections.list_tools(name).await?;
    if raw_tools.is_empty() {
        return Ok(vec![]);
    }

    let texts: Vec<String> = raw_tools
        .iter()
        .map(|tool| match tool.description.as_deref() {
            Some(description) if !description.trim().is_empty() => description.to_string(),
            _ => tool.name.clone(),
        })
        .collect();
    let vectors = server.embeddings.embed_batch(&texts).await?;

    let now = chrono::Utc::now().to_rfc3339();
    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(raw_tools.len());
    for (tool, embedding) in raw_tools.into_iter().zip(vectors) {
        let display_name = ToolRecord::display_name(name, &tool.name);
        if !seen.insert(display_name.clone()) {
            warn!(tool = %display_name, "Duplicate tool name from downstream, skipping");
            continue;
        }
        records.push(ToolRecord {
            downstream: name.to_string(),
            local_name: tool.name,
            display_name,
            description: tool.description.unwrap_or_default(),
            input_schema: tool
                .input_schema
                .unwrap_or_else(|| serde_json::json!({"type": "object"})),
            embedding,
            tags: vec![],
            last_seen_at: now.clone(),
        });
    }
    Ok(records)
}
