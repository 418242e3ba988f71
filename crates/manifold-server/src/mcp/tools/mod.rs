// crates/manifold-server/src/mcp/tools/mod.rs
// The two aggregator tools and their result shaping

mod find;
mod run;

pub use find::find;
pub use run::run;

use crate::error::ManifoldError;
use rmcp::model::{CallToolResult, Content};
use serde::Serialize;

/// Successful tool result: pretty JSON text plus structured content.
pub(crate) fn success_json<T: Serialize>(value: &T) -> CallToolResult {
    let structured = serde_json::to_value(value).unwrap_or_default();
    let text = serde_json::to_string_pretty(&structured).unwrap_or_default();
    CallToolResult {
        content: vec![Content::text(text)],
        structured_content: Some(structured),
        is_error: Some(false),
        meta: None,
    }
}

/// Failure mapped to a tool-level error with a machine-readable kind
/// and hints. Exactly one kind per failure.
pub(crate) fn error_result(error: &ManifoldError) -> CallToolResult {
    let kind = match error {
        ManifoldError::InvalidArgument(_) => "invalid_argument",
        ManifoldError::NotFound(_) => "not_found",
        ManifoldError::Unavailable { .. } => "unavailable",
        ManifoldError::Timeout(_) => "timeout",
        ManifoldError::NeedsConfirmation(_) => "needs_confirmation",
        ManifoldError::Spawn { .. } => "unavailable",
        ManifoldError::Upstream { .. } => "upstream",
        _ => "internal",
    };
    let mut body = serde_json::json!({
        "error": {
            "kind": kind,
            "message": error.to_string(),
        }
    });
    if let Some(retry) = error.retry_after_secs() {
        body["error"]["retry_after_seconds"] = serde_json::json!(retry);
    }
    if let ManifoldError::Upstream {
        payload: Some(payload),
        ..
    } = error
    {
        // The downstream's original error payload, preserved verbatim
        body["error"]["payload"] = payload.clone();
    }
    let text = serde_json::to_string_pretty(&body).unwrap_or_default();
    CallToolResult {
        content: vec![Content::text(text)],
        structured_content: Some(body),
        is_error: Some(true),
        meta: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_result_carries_retry_hint() {
        let error = ManifoldError::Unavailable {
            name: "files".into(),
            reason: "spawn failed".into(),
            retry_after_secs: 12,
        };
        let result = error_result(&error);
        assert_eq!(result.is_error, Some(true));
        let body = result.structured_content.unwrap();
        assert_eq!(body["error"]["kind"], "unavailable");
        assert_eq!(body["error"]["retry_after_seconds"], 12);
    }

    #[test]
    fn test_error_result_preserves_upstream_payload() {
        let error = ManifoldError::Upstream {
            message: "boom".into(),
            payload: Some(serde_json::json!({"code": -32000, "message": "boom"})),
        };
        let result = error_result(&error);
        let body = result.structured_content.unwrap();
        assert_eq!(body["error"]["kind"], "upstream");
        assert_eq!(body["error"]["payload"]["code"], -32000);
    }
}
