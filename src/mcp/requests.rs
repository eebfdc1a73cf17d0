// src/mcp/requests.rs
// MCP tool request types

use rmcp::schemars;
use serde::Deserialize;

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SearchRequest {
    #[schemars(description = "Search query text")]
    pub query: String,
    #[schemars(description = "Max results (1-20, default 5)")]
    pub limit: Option<usize>,
    #[schemars(description = "Minimum relevance score (default 0.6)")]
    pub min_score: Option<f64>,
    #[schemars(description = "Memory type filter: GLOBAL, QUICK or ARCHIVE")]
    pub memory_types: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct InjectRequest {
    #[schemars(description = "Original user prompt")]
    pub original_prompt: String,
    #[schemars(description = "Query text for retrieval (defaults to the original prompt)")]
    pub query_text: Option<String>,
    #[schemars(description = "Context hint to sharpen retrieval intent")]
    pub context_hint: Option<String>,
    #[schemars(description = "Injection mode: conservative, balanced or comprehensive")]
    pub injection_mode: Option<String>,
    #[schemars(description = "Token budget for the injected context")]
    pub max_tokens: Option<usize>,
    #[schemars(description = "Conversation scope for retrieval")]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct StatusRequest {}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct HealthRequest {
    #[schemars(description = "Include per-component detail")]
    pub detailed: Option<bool>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct CrossProjectSearchRequest {
    #[schemars(description = "Search query text")]
    pub query: String,
    #[schemars(description = "Max results (1-20, default 5)")]
    pub limit: Option<usize>,
    #[schemars(description = "Minimum relevance score (default 0.6)")]
    pub min_score: Option<f64>,
}
