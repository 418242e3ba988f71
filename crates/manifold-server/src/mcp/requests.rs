// crates/manifold-server/src/mcp/requests.rs
// Input shapes of the find/run tools

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize, schemars::JsonSchema)]
pub struct FindRequest {
    #[schemars(
        description = "What you want to do, in natural language. Separate multiple intents with |. Omit to enumerate every available tool."
    )]
    pub description: Option<String>,
    #[schemars(description = "Page number, starting at 1")]
    pub page: Option<usize>,
    #[schemars(description = "Results per page (1-100, default 20)")]
    pub limit: Option<usize>,
    #[schemars(description = "1 = name, description and score; 2 = also include the full input schema")]
    pub depth: Option<u8>,
    #[schemars(description = "Minimum similarity score in [0,1]; lower finds more, noisier results")]
    pub confidence_threshold: Option<f32>,
}

#[derive(Debug, Clone, Deserialize, schemars::JsonSchema)]
pub struct RunRequest {
    #[schemars(description = "Tool to invoke, as '<downstream>:<tool>' exactly as returned by find")]
    pub tool: String,
    #[schemars(description = "Arguments object matching the tool's input schema")]
    pub parameters: Value,
    #[schemars(description = "Validate and preview the call without contacting the downstream")]
    pub dry_run: Option<bool>,
    #[schemars(
        description = "Approval token from a previous needs-confirmation response, to proceed with a flagged call"
    )]
    pub approve: Option<String>,
}
