// crates/manifold-server/src/mcp/tools/run.rs
// `run`: forward one tool call to its downstream

use super::success_json;
use crate::downstream::protocol;
use crate::error::{ManifoldError, Result};
use crate::index::ToolRecord;
use crate::mcp::elicitation;
use crate::mcp::requests::RunRequest;
use crate::mcp::ManifoldServer;
use manifold_types::ConfirmationRequest;
use rmcp::model::{CallToolResult, Content};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub async fn run(
    server: &ManifoldServer,
    request: RunRequest,
    meta: Option<Value>,
) -> Result<CallToolResult> {
    // The display name is parsed exactly once per request
    let (downstream, local_name) = parse_display_name(&request.tool)?;
    let entry = server.profile.get(downstream).ok_or_else(|| {
        ManifoldError::NotFound(format!("downstream '{downstream}' is not in the profile"))
    })?;
    if !request.parameters.is_object() {
        return Err(ManifoldError::InvalidArgument(
            "parameters must be a JSON object".into(),
        ));
    }

    if let Some(token) = &request.approve {
        if !server.gate.redeem_token(token, &request.tool) {
            return Err(ManifoldError::InvalidArgument(
                "approval token is invalid or already used".into(),
            ));
        }
    }

    let record = server.index.snapshot().get(&request.tool).cloned();
    if let Some(record) = &record {
        if let Some(similarity) = server.gate.requires_confirmation(record) {
            // Prefer asking inline when the client can elicit; fall
            // back to a token the caller echoes on re-invocation
            let client = server.elicitation();
            let approved = if client.is_available().await {
                elicitation::request_approval(&client, &request.tool)
                    .await
                    .unwrap_or(false)
            } else {
                false
            };
            if approved {
                server.gate.approve(&request.tool);
            } else {
                return Ok(confirmation_payload(server, record, similarity));
            }
        }
    }

    let params = protocol::call_tool_params(local_name, request.parameters.clone(), meta);

    if request.dry_run.unwrap_or(false) {
        debug!(tool = %request.tool, "Dry run");
        return Ok(success_json(&serde_json::json!({
            "dry_run": true,
            "downstream": downstream,
            "method": "tools/call",
            "would_send": params,
        })));
    }

    let deadline = Duration::from_secs(entry.call_timeout_secs());
    let result = server
        .connections
        .call(downstream, "tools/call", Some(params), deadline)
        .await?;
    Ok(forward(result))
}

fn parse_display_name(tool: &str) -> Result<(&str, &str)> {
    match tool.split_once(':') {
        Some((downstream, local)) if !downstream.is_empty() && !local.is_empty() => {
            Ok((downstream, local))
        }
        _ => Err(ManifoldError::InvalidArgument(format!(
            "tool must be '<downstream>:<tool>', got '{tool}'"
        ))),
    }
}

/// The downstream's reply propagated verbatim: same content, same
/// isError. A shape we cannot parse is passed along as text rather
/// than dropped.
fn forward(result: Value) -> CallToolResult {
    match serde_json::from_value::<CallToolResult>(result.clone()) {
        Ok(forwarded) => forwarded,
        Err(e) => {
            debug!("Downstream result did not parse as tools/call output: {e}");
            // The wire-level isError still passes through even when
            // the content shape does not match the typed model
            let is_error = result
                .get("isError")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            CallToolResult {
                content: vec![Content::text(result.to_string())],
                structured_content: Some(result),
                is_error: Some(is_error),
                meta: None,
            }
        }
    }
}

/// Structured elicitation payload for a flagged call. The downstream
/// is not contacted; the caller re-invokes with the approval token.
fn confirmation_payload(
    server: &ManifoldServer,
    record: &ToolRecord,
    similarity: f32,
) -> CallToolResult {
    let confirmation = ConfirmationRequest {
        tool: record.display_name.clone(),
        description: record.description.clone(),
        reason: format!(
            "description matches mutating-operation patterns (similarity {similarity:.2})"
        ),
        approval_token: server.gate.issue_token(&record.display_name),
        required: vec![],
    };
    let body = serde_json::json!({
        "needs_confirmation": confirmation,
        "hint": "re-invoke run with approve set to the approval_token to proceed",
    });
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
    use serde_json::json;

    #[test]
    fn test_forward_fallback_preserves_is_error() {
        // content is not a valid content list, so the typed parse
        // fails; the downstream's failure flag must survive anyway
        let odd = json!({"content": "not-a-content-list", "isError": true});
        let forwarded = forward(odd.clone());
        assert_eq!(forwarded.is_error, Some(true));
        assert_eq!(forwarded.structured_content, Some(odd));

        let odd_ok = json!({"content": {"also": "wrong"}});
        assert_eq!(forward(odd_ok).is_error, Some(false));
    }

    #[test]
    fn test_parse_display_name() {
        assert_eq!(parse_display_name("files:read").unwrap(), ("files", "read"));
        // Only the first colon splits; the rest belongs to the tool
        assert_eq!(
            parse_display_name("ns:tool:variant").unwrap(),
            ("ns", "tool:variant")
        );
        assert!(parse_display_name("no-colon").is_err());
        assert!(parse_display_name(":tool").is_err());
        assert!(parse_display_name("downstream:").is_err());
    }
}
