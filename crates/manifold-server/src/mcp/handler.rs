// crates/manifold-server/src/mcp/handler.rs
// MCP ServerHandler implementation — protocol lifecycle methods

use super::ManifoldServer;
use super::requests::{FindRequest, RunRequest};
use super::tools;
use crate::error::ManifoldError;

use rmcp::{
    ErrorData, ServerHandler,
    model::{
        CallToolRequestParams, CallToolResult, InitializeRequestParams, InitializeResult,
        JsonObject, ListToolsResult, Meta, PaginatedRequestParams, ServerCapabilities,
        ServerInfo, Tool,
    },
    service::{RequestContext, RoleServer},
};
use serde_json::Value;

impl ServerHandler for ManifoldServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: rmcp::model::Implementation {
                name: "manifold".into(),
                title: Some("Manifold - one MCP server for all of them".into()),
                version: env!("CARGO_PKG_VERSION").into(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Manifold aggregates many MCP servers behind two tools: \
                 use find to discover capabilities by describing what you want to do, \
                 then run to invoke a discovered tool by its '<downstream>:<tool>' name."
                    .into(),
            ),
        }
    }

    /// Answered synchronously: the static advertisement goes out
    /// immediately while indexing continues in the background. The
    /// upstream identity is captured first so the very first
    /// downstream spawn already carries it.
    #[allow(clippy::manual_async_fn)]
    fn initialize(
        &self,
        request: InitializeRequestParams,
        context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<InitializeResult, ErrorData>> + Send + '_ {
        async move {
            tracing::info!(
                client = %request.client_info.name,
                version = %request.client_info.version,
                "Upstream client connected"
            );
            let client_info = serde_json::to_value(&request.client_info)
                .unwrap_or_else(|_| serde_json::json!({"name": "unknown", "version": "0.0.0"}));
            self.connections.set_client_info(client_info).await;
            self.capture_peer(&context.peer).await;
            self.start_reconciliation();
            Ok(self.get_info())
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, ErrorData>> + Send + '_ {
        std::future::ready(Ok(ListToolsResult {
            tools: advertised_tools(),
            next_cursor: None,
            meta: None,
        }))
    }

    #[allow(clippy::manual_async_fn)]
    fn call_tool(
        &self,
        request: CallToolRequestParams,
        context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, ErrorData>> + Send + '_ {
        async move {
            self.capture_peer(&context.peer).await;
            // Safety net for clients that race tool calls ahead of a
            // finished initialize; the guard makes this a no-op later
            self.start_reconciliation();

            let args = Value::Object(request.arguments.clone().unwrap_or_default());
            match request.name.as_ref() {
                "find" => match serde_json::from_value::<FindRequest>(args) {
                    Ok(parsed) => Ok(tools::find(self, parsed)
                        .await
                        .unwrap_or_else(|e| tools::error_result(&e))),
                    Err(e) => Ok(tools::error_result(&ManifoldError::InvalidArgument(
                        format!("find: {e}"),
                    ))),
                },
                "run" => match serde_json::from_value::<RunRequest>(args) {
                    Ok(parsed) => {
                        let meta = meta_value(&context.meta);
                        Ok(tools::run(self, parsed, meta)
                            .await
                            .unwrap_or_else(|e| tools::error_result(&e)))
                    }
                    Err(e) => Ok(tools::error_result(&ManifoldError::InvalidArgument(
                        format!("run: {e}"),
                    ))),
                },
                other => Err(ErrorData::invalid_params(
                    format!("unknown tool '{other}'; this server serves find and run"),
                    None,
                )),
            }
        }
    }
}

/// The static two-tool surface.
fn advertised_tools() -> Vec<Tool> {
    vec![
        Tool::new(
            "find",
            "Discover aggregated tools by describing what you want to do in natural language. \
             Returns ranked '<downstream>:<tool>' names; use depth 2 for full input schemas.",
            input_schema::<FindRequest>(),
        ),
        Tool::new(
            "run",
            "Invoke a tool discovered via find. Pass the '<downstream>:<tool>' name and an \
             arguments object matching its schema.",
            input_schema::<RunRequest>(),
        ),
    ]
}

fn input_schema<T: schemars::JsonSchema>() -> JsonObject {
    serde_json::to_value(schemars::schema_for!(T))
        .ok()
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default()
}

/// `_meta` of the incoming call as a plain JSON object, `None` when
/// absent. Whatever is here is forwarded to the downstream untouched.
fn meta_value(meta: &Meta) -> Option<Value> {
    if meta.is_empty() {
        return None;
    }
    Some(Value::Object(
        meta.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
    ))
}
