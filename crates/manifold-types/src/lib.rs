// crates/manifold-types/src/lib.rs

//! Shared data contracts between the Manifold server and its clients.
//!
//! This crate provides the wire-level shapes returned by the `find`
//! and `run` tools:
//! - **Discovery results**: ranked tool hits with pagination metadata
//! - **Indexing progress**: cold-start visibility for callers
//! - **Confirmation payloads**: structured elicitation for gated calls
//!
//! These types carry no server-side state and no native-only
//! dependencies.

use serde::{Deserialize, Serialize};

// ===================================================
// DISCOVERY
// ===================================================

/// A single ranked hit from the `find` tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolHit {
    /// Globally unique display name, `<downstream>:<local-tool>`.
    pub tool: String,
    /// One-line description from the downstream's `tools/list`.
    pub description: String,
    /// Cosine similarity against the query, after dampening. 0 when
    /// the query was empty (enumeration).
    pub score: f32,
    /// Full JSON input schema. Present only at depth 2.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
}

/// One page of `find` results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindPage {
    pub tools: Vec<ToolHit>,
    pub page: usize,
    pub limit: usize,
    /// Total matching tools across all pages.
    pub total: usize,
    pub total_pages: usize,
    /// Populated while background reconciliation is still running, so
    /// an empty or partial page is distinguishable from "no tools".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indexing: Option<IndexingProgress>,
    /// Downstreams whose probe failed. Their cached tools are still
    /// listed above; this explains why newer ones may be missing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<DownstreamStatus>,
}

// ===================================================
// INDEXING PROGRESS
// ===================================================

/// Snapshot of the background indexer's progress.
///
/// Mutated only by the indexer; everyone else receives copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexingProgress {
    /// Downstreams scheduled for probing in this reconciliation.
    pub total: usize,
    /// Downstreams finished (indexed or failed).
    pub current: usize,
    /// The downstream currently being probed, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_downstream: Option<String>,
    /// RFC 3339 timestamp of reconciliation start.
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
}

impl IndexingProgress {
    pub fn is_done(&self) -> bool {
        self.current >= self.total
    }
}

// ===================================================
// DOWNSTREAM STATUS
// ===================================================

/// Indexing lifecycle state of one downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownstreamState {
    Unknown,
    Probing,
    Ready,
    Failed,
}

/// Per-downstream status surfaced in `find` metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamStatus {
    pub name: String,
    pub state: DownstreamState,
    pub tool_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

// ===================================================
// CONFIRMATION
// ===================================================

/// Structured payload returned when the confirmation gate intercepts
/// a `run` call. The caller either re-invokes `run` with
/// `approve: <token>` or abandons the call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub tool: String,
    pub description: String,
    /// Why the call was intercepted (e.g. "matches mutating-operation
    /// patterns").
    pub reason: String,
    /// One-shot token accepted by a repeat invocation.
    pub approval_token: String,
    /// Parameter descriptors the caller must supply, when the
    /// interception is about missing input rather than approval.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================================
    // FindPage tests
    // ============================================================================

    #[test]
    fn test_find_page_serialize_skips_empty_optionals() {
        let page = FindPage {
            tools: vec![ToolHit {
                tool: "files:read".to_string(),
                description: "Read a file".to_string(),
                score: 0.82,
                input_schema: None,
            }],
            page: 1,
            limit: 20,
            total: 1,
            total_pages: 1,
            indexing: None,
            failed: vec![],
        };
        let json = serde_json::to_string(&page).unwrap();
        assert!(json.contains("files:read"));
        assert!(!json.contains("input_schema"));
        assert!(!json.contains("indexing"));
        assert!(!json.contains("failed"));
    }

    #[test]
    fn test_indexing_progress_done() {
        let progress = IndexingProgress {
            total: 3,
            current: 3,
            current_downstream: None,
            started_at: "2025-11-02T10:00:00Z".to_string(),
            eta_seconds: None,
        };
        assert!(progress.is_done());
    }

    #[test]
    fn test_downstream_state_wire_form() {
        let json = serde_json::to_string(&DownstreamState::Ready).unwrap();
        assert_eq!(json, "\"ready\"");
        let state: DownstreamState = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(state, DownstreamState::Failed);
    }

    #[test]
    fn test_confirmation_request_round_trip() {
        let req = ConfirmationRequest {
            tool: "files:delete".to_string(),
            description: "Deletes files recursively".to_string(),
            reason: "matches mutating-operation patterns".to_string(),
            approval_token: "tok-1".to_string(),
            required: vec![],
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: ConfirmationRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tool, "files:delete");
        assert_eq!(back.approval_token, "tok-1");
        assert!(!json.contains("required"));
    }
}
