// crates/manifold-server/src/downstream/protocol.rs
// JSON-RPC 2.0 framing for the downstream client side

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision spoken to downstreams.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Error code for server-initiated requests we do not implement.
pub const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Classified incoming frame. A downstream may send correlated
/// responses, notifications, or (rarely) its own requests.
#[derive(Debug)]
pub enum Frame {
    Response {
        id: i64,
        result: std::result::Result<Value, RpcError>,
    },
    Notification {
        method: String,
        #[allow(dead_code)]
        params: Option<Value>,
    },
    Request {
        id: Value,
        method: String,
    },
}

/// Classify a parsed JSON value into a frame, or None when it is not
/// a recognizable JSON-RPC message.
pub fn classify(value: &Value) -> Option<Frame> {
    let obj = value.as_object()?;
    let has_id = obj.contains_key("id") && !obj["id"].is_null();
    let method = obj.get("method").and_then(|m| m.as_str());

    match (has_id, method) {
        (true, None) => {
            let id = obj.get("id")?.as_i64()?;
            if let Some(error) = obj.get("error") {
                let rpc_error: RpcError = serde_json::from_value(error.clone()).ok()?;
                Some(Frame::Response {
                    id,
                    result: Err(rpc_error),
                })
            } else {
                Some(Frame::Response {
                    id,
                    result: Ok(obj.get("result").cloned().unwrap_or(Value::Null)),
                })
            }
        }
        (true, Some(m)) => Some(Frame::Request {
            id: obj["id"].clone(),
            method: m.to_string(),
        }),
        (false, Some(m)) => Some(Frame::Notification {
            method: m.to_string(),
            params: obj.get("params").cloned(),
        }),
        (false, None) => None,
    }
}

pub fn request(id: i64, method: &str, params: Option<Value>) -> Value {
    let mut frame = json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "method": method,
    });
    if let Some(params) = params {
        frame["params"] = params;
    }
    frame
}

pub fn notification(method: &str, params: Option<Value>) -> Value {
    let mut frame = json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
    });
    if let Some(params) = params {
        frame["params"] = params;
    }
    frame
}

/// Error reply for server-initiated requests we do not serve.
pub fn method_not_found(id: Value, method: &str) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": METHOD_NOT_FOUND,
            "message": format!("method not supported by aggregator: {method}"),
        }
    })
}

/// `initialize` params carrying the upstream client's identity
/// verbatim. `client_info` is whatever the upstream advertised —
/// it is never rebuilt or substituted.
pub fn initialize_params(client_info: &Value) -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": client_info,
    })
}

/// `tools/call` params. `_meta`, when inherited from the upstream
/// call, is attached verbatim as a sibling of name/arguments.
pub fn call_tool_params(tool: &str, arguments: Value, meta: Option<Value>) -> Value {
    let mut params = json!({
        "name": tool,
        "arguments": arguments,
    });
    if let Some(meta) = meta {
        params["_meta"] = meta;
    }
    params
}
