// crates/manifold-server/src/mcp/tools/find.rs
// `find`: semantic discovery over the aggregated tool surface

use super::success_json;
use crate::error::Result;
use crate::finder::{DEFAULT_LIMIT, DEFAULT_THRESHOLD, FinderQuery};
use crate::mcp::ManifoldServer;
use crate::mcp::requests::FindRequest;
use rmcp::model::CallToolResult;

pub async fn find(server: &ManifoldServer, request: FindRequest) -> Result<CallToolResult> {
    let query = FinderQuery {
        description: request.description,
        page: request.page.unwrap_or(1),
        limit: request.limit.unwrap_or(DEFAULT_LIMIT),
        depth: request.depth.unwrap_or(1),
        confidence_threshold: request.confidence_threshold.unwrap_or(DEFAULT_THRESHOLD),
    };

    // Attach progress while reconciliation is running so a thin page
    // reads as "still indexing", not "nothing matches"
    let indexing = server.indexing_progress().filter(|p| !p.is_done());
    let page = server.finder.find(query, indexing).await?;
    Ok(success_json(&page))
}
