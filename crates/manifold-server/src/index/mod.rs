// crates/manifold-server/src/index/mod.rs
// Capability index: in-memory snapshot, vector search, reconcile plan

mod store;

use crate::config::Profile;
use crate::embeddings::cosine_similarity;
use crate::error::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// One indexed tool. Primary key is `display_name`
/// (`<downstream>:<local>`), globally unique across the snapshot.
#[derive(Debug, Clone)]
pub struct ToolRecord {
    pub downstream: String,
    pub local_name: String,
    pub display_name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub embedding: Vec<f32>,
    pub tags: Vec<String>,
    /// RFC 3339 stamp of the last successful `tools/list` that saw it.
    pub last_seen_at: String,
}

impl ToolRecord {
    pub fn display_name(downstream: &str, local_name: &str) -> String {
        format!("{downstream}:{local_name}")
    }
}

/// Failure note for a downstream whose probe failed. Its previously
/// indexed records stay available.
#[derive(Debug, Clone)]
pub struct FailedDownstream {
    pub error: String,
    pub retry_after_secs: u64,
}

/// Immutable view of the index. Readers clone the `Arc`; the single
/// writer installs a replacement snapshot atomically.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub profile_hash: String,
    pub model_id: String,
    pub downstream_hashes: HashMap<String, String>,
    /// Sorted by display_name ascending.
    pub records: Vec<ToolRecord>,
    pub failed: HashMap<String, FailedDownstream>,
}

impl Snapshot {
    pub fn records_for(&self, downstream: &str) -> impl Iterator<Item = &ToolRecord> {
        self.records.iter().filter(move |r| r.downstream == downstream)
    }

    pub fn get(&self, display_name: &str) -> Option<&ToolRecord> {
        self.records
            .binary_search_by(|r| r.display_name.as_str().cmp(display_name))
            .ok()
            .map(|i| &self.records[i])
    }
}

/// Work plan from comparing the profile against the cached snapshot.
#[derive(Debug, Default, PartialEq)]
pub struct ReconcilePlan {
    pub added: Vec<String>,
    pub changed: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
}

impl ReconcilePlan {
    /// Downstreams that need probing.
    pub fn work(&self) -> Vec<String> {
        let mut work = self.added.clone();
        work.extend(self.changed.clone());
        work
    }

    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// A search hit with its cosine score.
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub record: ToolRecord,
    pub score: f32,
}

/// Persistent capability index. Single-writer, many-reader: all
/// mutation goes through `&self` methods that swap the snapshot;
/// disk writes are serialized by an internal mutex.
pub struct CapabilityIndex {
    csv_path: PathBuf,
    meta_path: PathBuf,
    profile_hash: String,
    model_id: String,
    snapshot: RwLock<Arc<Snapshot>>,
    dirty: AtomicBool,
    last_saved_digest: Mutex<Option<[u8; 32]>>,
}

impl CapabilityIndex {
    pub fn new(
        csv_path: PathBuf,
        meta_path: PathBuf,
        profile_hash: String,
        model_id: String,
    ) -> Self {
        let empty = Snapshot {
            profile_hash: profile_hash.clone(),
            model_id: model_id.clone(),
            ..Default::default()
        };
        Self {
            csv_path,
            meta_path,
            profile_hash,
            model_id,
            snapshot: RwLock::new(Arc::new(empty)),
            dirty: AtomicBool::new(false),
            last_saved_digest: Mutex::new(None),
        }
    }

    /// Load the cached snapshot from disk. A missing cache, a format
    /// mismatch, or a different embedding model all degrade to the
    /// empty snapshot (forcing a rebuild), never to an error.
    pub fn load(&self) -> bool {
        match store::load(&self.csv_path, &self.meta_path) {
            Ok(Some(loaded)) => {
                if loaded.model_id != self.model_id {
                    info!(
                        cached = %loaded.model_id,
                        current = %self.model_id,
                        "Embedding model changed; discarding cache for a full rebuild"
                    );
                    return false;
                }
                info!(
                    tools = loaded.records.len(),
                    downstreams = loaded.downstream_hashes.len(),
                    "Capability cache loaded"
                );
                self.install(loaded);
                true
            }
            Ok(None) => {
                debug!("No capability cache on disk");
                false
            }
            Err(e) => {
                warn!("Capability cache unreadable, rebuilding: {e}");
                false
            }
        }
    }

    /// Compare the profile against the snapshot: added, changed
    /// (hash differs), removed, unchanged. Records and hashes of
    /// removed downstreams are purged immediately so search never
    /// returns them.
    pub fn reconcile(&self, profile: &Profile) -> ReconcilePlan {
        let desired = profile.downstream_hashes();
        let snapshot = self.snapshot();

        let mut plan = ReconcilePlan::default();
        for entry in &profile.downstreams {
            match snapshot.downstream_hashes.get(&entry.name) {
                None => plan.added.push(entry.name.clone()),
                Some(cached) if *cached != desired[&entry.name] => {
                    plan.changed.push(entry.name.clone())
                }
                Some(_) => plan.unchanged.push(entry.name.clone()),
            }
        }
        for name in snapshot.downstream_hashes.keys() {
            if !desired.contains_key(name) {
                plan.removed.push(name.clone());
            }
        }
        plan.removed.sort();

        if !plan.removed.is_empty() {
            let mut next = self.snapshot_clone();
            next.records.retain(|r| desired.contains_key(&r.downstream));
            next.downstream_hashes
                .retain(|name, _| desired.contains_key(name));
            next.failed.retain(|name, _| desired.contains_key(name));
            self.install(next);
            self.dirty.store(true, Ordering::SeqCst);
        }

        plan
    }

    /// Replace all records of one downstream atomically and record its
    /// new config hash. Clears any failure note for it.
    pub fn patch(&self, downstream: &str, hash: String, records: Vec<ToolRecord>) {
        let mut next = self.snapshot_clone();
        next.records.retain(|r| r.downstream != downstream);
        next.records.extend(records);
        next.records
            .sort_by(|a, b| a.display_name.cmp(&b.display_name));
        next.downstream_hashes.insert(downstream.to_string(), hash);
        next.failed.remove(downstream);
        next.profile_hash = self.profile_hash.clone();
        self.install(next);
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Record a probe failure. Existing records and the previous
    /// config hash are kept, so already indexed tools stay findable
    /// and the downstream is re-probed on the next reconcile.
    pub fn mark_failed(&self, downstream: &str, error: &str, retry_after_secs: u64) {
        let mut next = self.snapshot_clone();
        next.failed.insert(
            downstream.to_string(),
            FailedDownstream {
                error: error.to_string(),
                retry_after_secs,
            },
        );
        self.install(next);
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Persist if dirty. Write-temp-then-rename; a byte-identical
    /// serialization is skipped entirely to avoid disk churn.
    /// Returns whether bytes hit the disk.
    pub fn save(&self) -> Result<bool> {
        if !self.dirty.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let snapshot = self.snapshot();
        let encoded = store::encode(&snapshot, &self.profile_hash, &self.model_id);
        let digest = encoded.digest();

        {
            #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable here
            let mut last = self.last_saved_digest.lock().unwrap();
            if last.as_ref() == Some(&digest) {
                self.dirty.store(false, Ordering::SeqCst);
                return Ok(false);
            }
            store::write(&self.csv_path, &self.meta_path, &encoded)?;
            *last = Some(digest);
        }
        self.dirty.store(false, Ordering::SeqCst);
        debug!(tools = snapshot.records.len(), "Capability cache saved");
        Ok(true)
    }

    /// Linear cosine scan over the snapshot. Top-k scored records,
    /// ties broken by display name ascending. The filter narrows
    /// candidates (e.g. to one downstream).
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&dyn Fn(&ToolRecord) -> bool>,
    ) -> Vec<ScoredRecord> {
        let snapshot = self.snapshot();
        let mut scored: Vec<ScoredRecord> = snapshot
            .records
            .iter()
            .filter(|r| filter.map(|f| f(r)).unwrap_or(true))
            .map(|r| ScoredRecord {
                score: cosine_similarity(query, &r.embedding),
                record: r.clone(),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.record.display_name.cmp(&b.record.display_name))
        });
        scored.truncate(k);
        scored
    }

    /// Current immutable snapshot for readers.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable here
        self.snapshot.read().unwrap().clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn snapshot_clone(&self) -> Snapshot {
        let current = self.snapshot();
        Snapshot {
            profile_hash: current.profile_hash.clone(),
            model_id: current.model_id.clone(),
            downstream_hashes: current.downstream_hashes.clone(),
            records: current.records.clone(),
            failed: current.failed.clone(),
        }
    }

    fn install(&self, snapshot: Snapshot) {
        #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable here
        let mut guard = self.snapshot.write().unwrap();
        *guard = Arc::new(snapshot);
    }
}
