// crates/manifold-server/src/mcp/elicitation.rs
// MCP elicitation support — inline approval of gated tool calls.
//
// Graceful wrapper around rmcp's elicitation API. Call sites degrade
// to the token-based confirmation payload when the upstream client
// doesn't support elicitation.

use rmcp::model::{CreateElicitationRequestParams, ElicitationAction, ElicitationSchema};
use rmcp::service::{Peer, RoleServer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Timeout for elicitation requests (a human is deciding, be generous)
const ELICITATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Outcome of an elicitation request, distinguishing all cases.
#[derive(Debug)]
pub enum ElicitationOutcome {
    /// User accepted and provided data
    Accepted(serde_json::Value),
    /// User explicitly declined
    Declined,
    /// User cancelled / dismissed
    Cancelled,
    /// Client doesn't support elicitation
    NotSupported,
    /// Transport or timeout error (logged at warn, treated as decline)
    Failed(String),
}

impl ElicitationOutcome {
    pub fn into_value(self) -> Option<serde_json::Value> {
        match self {
            Self::Accepted(v) => Some(v),
            _ => None,
        }
    }
}

/// Wrapper around the upstream peer for elicitation requests.
#[derive(Clone)]
pub struct ElicitationClient {
    peer: Arc<RwLock<Option<Peer<RoleServer>>>>,
}

impl ElicitationClient {
    pub fn new(peer: Arc<RwLock<Option<Peer<RoleServer>>>>) -> Self {
        Self { peer }
    }

    /// Check if the connected client supports elicitation.
    pub async fn is_available(&self) -> bool {
        let guard = self.peer.read().await;
        guard
            .as_ref()
            .map(|p| p.supports_elicitation())
            .unwrap_or(false)
    }

    /// Send an elicitation request and map the result to an outcome.
    pub async fn request(
        &self,
        message: impl Into<String>,
        schema: ElicitationSchema,
    ) -> ElicitationOutcome {
        let guard = self.peer.read().await;
        let peer = match guard.as_ref() {
            Some(p) if p.supports_elicitation() => p,
            _ => return ElicitationOutcome::NotSupported,
        };

        let params = CreateElicitationRequestParams {
            meta: None,
            message: message.into(),
            requested_schema: schema,
        };

        match peer
            .create_elicitation_with_timeout(params, Some(ELICITATION_TIMEOUT))
            .await
        {
            Ok(result) => match result.action {
                ElicitationAction::Accept => match result.content {
                    Some(data) => ElicitationOutcome::Accepted(data),
                    None => ElicitationOutcome::Declined,
                },
                ElicitationAction::Decline => ElicitationOutcome::Declined,
                ElicitationAction::Cancel => ElicitationOutcome::Cancelled,
            },
            Err(e) => {
                let msg = format!("Elicitation request failed: {}", e);
                tracing::warn!("{}", msg);
                ElicitationOutcome::Failed(msg)
            }
        }
    }
}

/// Schema for approving a flagged tool call: a single bool.
pub fn approval_schema(tool: &str) -> ElicitationSchema {
    ElicitationSchema::builder()
        .title("Confirm tool call")
        .description(format!(
            "'{tool}' looks like it modifies state. Run it anyway?"
        ))
        .optional_bool("approve", false)
        .build_unchecked()
}

/// Ask the upstream user to approve a flagged call. `Some(true)` only
/// on an explicit accept with `approve: true`.
pub async fn request_approval(client: &ElicitationClient, tool: &str) -> Option<bool> {
    let outcome = client
        .request(
            format!("The tool '{tool}' appears to perform a mutating operation. Approve this call?"),
            approval_schema(tool),
        )
        .await;
    let data = outcome.into_value()?;
    data.get("approve").and_then(|v| v.as_bool())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_into_value() {
        let val = serde_json::json!({"approve": true});
        assert_eq!(
            ElicitationOutcome::Accepted(val.clone()).into_value(),
            Some(val)
        );
        assert_eq!(ElicitationOutcome::Declined.into_value(), None);
        assert_eq!(ElicitationOutcome::Cancelled.into_value(), None);
        assert_eq!(ElicitationOutcome::NotSupported.into_value(), None);
        assert_eq!(ElicitationOutcome::Failed("err".into()).into_value(), None);
    }

    #[test]
    fn test_approval_schema_has_bool_field() {
        let schema = approval_schema("files:delete");
        assert!(schema.properties.contains_key("approve"));
    }

    #[tokio::test]
    async fn test_no_peer_is_not_supported() {
        let client = ElicitationClient::new(Arc::new(RwLock::new(None)));
        assert!(!client.is_available().await);
        let outcome = client.request("test", approval_schema("a:b")).await;
        assert!(matches!(outcome, ElicitationOutcome::NotSupported));
    }
}
