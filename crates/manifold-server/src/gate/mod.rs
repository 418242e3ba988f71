// crates/manifold-server/src/gate/mod.rs
// Confirmation gate: semantic classifier for mutating tool calls

use crate::embeddings::{EmbeddingClient, cosine_similarity};
use crate::error::Result;
use crate::index::ToolRecord;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::debug;

/// Similarity at or above which a tool call needs confirmation.
pub const DEFAULT_THRESHOLD: f32 = 0.40;

/// Hyphenated operation tags describing mutating behavior. Embedded
/// once at startup into the pattern vector.
const MUTATING_TAGS: &str = "write-to-disk delete-files modify-files execute-shell-commands \
     http-post-requests send-email install-packages database-writes \
     system-configuration-changes kill-processes";

/// Advisory classifier sitting above the downstreams. It never
/// mutates arguments and never blocks tools scoring below the
/// threshold; flagged calls are held for approval only.
pub struct ConfirmationGate {
    pattern: Vec<f32>,
    threshold: f32,
    enabled: bool,
    /// Display names approved for this session.
    approved: Mutex<HashSet<String>>,
    /// Outstanding approval tokens: token -> display name.
    pending: Mutex<HashMap<String, String>>,
}

impl ConfirmationGate {
    pub async fn new(embeddings: &EmbeddingClient, enabled: bool) -> Result<Self> {
        Self::with_threshold(embeddings, enabled, DEFAULT_THRESHOLD).await
    }

    pub async fn with_threshold(
        embeddings: &EmbeddingClient,
        enabled: bool,
        threshold: f32,
    ) -> Result<Self> {
        let pattern = if enabled {
            embeddings.embed(MUTATING_TAGS).await?
        } else {
            vec![]
        };
        Ok(Self {
            pattern,
            threshold,
            enabled,
            approved: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Globally disabled gate; every call passes.
    pub fn disabled() -> Self {
        Self {
            pattern: vec![],
            threshold: DEFAULT_THRESHOLD,
            enabled: false,
            approved: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Similarity of the tool's description embedding against the
    /// mutating pattern, when the call needs confirmation. `None`
    /// means the call may proceed.
    pub fn requires_confirmation(&self, record: &ToolRecord) -> Option<f32> {
        if !self.enabled {
            return None;
        }
        if self.is_approved(&record.display_name) {
            return None;
        }
        let similarity = cosine_similarity(&self.pattern, &record.embedding);
        if similarity >= self.threshold {
            debug!(
                tool = %record.display_name,
                similarity,
                "Tool call flagged for confirmation"
            );
            Some(similarity)
        } else {
            None
        }
    }

    pub fn is_approved(&self, display_name: &str) -> bool {
        lock_set(&self.approved).contains(display_name)
    }

    /// Approve a tool for the rest of the session.
    pub fn approve(&self, display_name: &str) {
        lock_set(&self.approved).insert(display_name.to_string());
    }

    /// Mint a one-shot approval token for a flagged call. The caller
    /// re-invokes `run` with `approve: <token>` to proceed.
    pub fn issue_token(&self, display_name: &str) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        lock_map(&self.pending).insert(token.clone(), display_name.to_string());
        token
    }

    /// Redeem a token. On a match the tool joins the session
    /// approved-set and the token is consumed.
    pub fn redeem_token(&self, token: &str, display_name: &str) -> bool {
        let mut pending = lock_map(&self.pending);
        match pending.get(token) {
            Some(expected) if expected == display_name => {
                pending.remove(token);
                drop(pending);
                self.approve(display_name);
                true
            }
            _ => false,
        }
    }
}

#[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable here
fn lock_set(set: &Mutex<HashSet<String>>) -> std::sync::MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap()
}

#[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable here
fn lock_map(map: &Mutex<HashMap<String, String>>) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
    map.lock().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn record_for(embeddings: &EmbeddingClient, description: &str) -> ToolRecord {
        ToolRecord {
            downstream: "files".into(),
            local_name: "tool".into(),
            display_name: "files:tool".into(),
            description: description.to_string(),
            input_schema: json!({"type": "object"}),
            embedding: embeddings.embed(description).await.unwrap(),
            tags: vec![],
            last_seen_at: "2025-11-02T10:00:00Z".into(),
        }
    }

    #[tokio::test]
    async fn test_mutating_description_is_flagged() {
        let embeddings = EmbeddingClient::hashed();
        let gate = ConfirmationGate::new(&embeddings, true).await.unwrap();

        let mutating = record_for(&embeddings, "write to disk, delete files").await;
        let similarity = gate.requires_confirmation(&mutating);
        assert!(
            similarity.is_some(),
            "mutating description must be flagged"
        );
        assert!(similarity.unwrap() >= DEFAULT_THRESHOLD);
    }

    #[tokio::test]
    async fn test_benign_description_passes() {
        let embeddings = EmbeddingClient::hashed();
        let gate = ConfirmationGate::new(&embeddings, true).await.unwrap();

        let benign = record_for(&embeddings, "format a timestamp as ISO 8601").await;
        assert!(gate.requires_confirmation(&benign).is_none());
    }

    #[tokio::test]
    async fn test_approval_suppresses_the_gate() {
        let embeddings = EmbeddingClient::hashed();
        let gate = ConfirmationGate::new(&embeddings, true).await.unwrap();
        let mutating = record_for(&embeddings, "write to disk, delete files").await;

        assert!(gate.requires_confirmation(&mutating).is_some());
        gate.approve("files:tool");
        assert!(gate.requires_confirmation(&mutating).is_none());
    }

    #[tokio::test]
    async fn test_token_redeem_flow() {
        let embeddings = EmbeddingClient::hashed();
        let gate = ConfirmationGate::new(&embeddings, true).await.unwrap();

        let token = gate.issue_token("files:tool");
        assert!(!gate.redeem_token(&token, "other:tool"), "wrong tool");
        assert!(!gate.redeem_token("bogus", "files:tool"), "wrong token");
        assert!(gate.redeem_token(&token, "files:tool"));
        assert!(gate.is_approved("files:tool"));
        // One-shot: a second redeem fails
        assert!(!gate.redeem_token(&token, "files:tool"));
    }

    #[tokio::test]
    async fn test_disabled_gate_passes_everything() {
        let embeddings = EmbeddingClient::hashed();
        let gate = ConfirmationGate::disabled();
        let mutating = record_for(&embeddings, "write to disk, delete files").await;
        assert!(gate.requires_confirmation(&mutating).is_none());
    }
}
