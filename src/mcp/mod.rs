// src/mcp/mod.rs
// MCP server - the stdio tool surface consumed by the CLI host

mod handler;
mod requests;

use std::sync::Arc;
use std::time::Instant;

use rmcp::{
    ErrorData,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content},
    tool, tool_router,
};
use serde_json::{Value, json};
use tracing::warn;

use crate::memory::injector::{InjectionMode, InjectionRequest};
use crate::memory::retriever::RetrievalRequest;
use crate::memory::types::MemoryUnitType;
use crate::service::ServiceCore;

pub use requests::*;

/// MCP server state. One instance serves the whole stdio session.
#[derive(Clone)]
pub struct MemoryServer {
    pub core: Arc<ServiceCore>,
    tool_router: ToolRouter<Self>,
}

impl MemoryServer {
    pub fn new(core: Arc<ServiceCore>) -> Self {
        Self {
            core,
            tool_router: Self::tool_router(),
        }
    }

    /// The per-request project scope: strict per-project isolation with the
    /// configured active project.
    fn scope(&self) -> Option<String> {
        Some(self.core.settings.project_id.clone())
    }

    fn ok_json(value: Value) -> Result<CallToolResult, ErrorData> {
        let text = serde_json::to_string_pretty(&value)
            .unwrap_or_else(|_| "{\"success\":false}".to_string());
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    /// Tool failures surface as `{error, success: false, tool}` text,
    /// never as protocol-level errors.
    fn err_json(tool: &str, error: impl std::fmt::Display) -> Result<CallToolResult, ErrorData> {
        warn!(tool, error = %error, "Tool call failed");
        let body = json!({
            "error": error.to_string(),
            "success": false,
            "tool": tool,
        });
        let text = serde_json::to_string_pretty(&body)
            .unwrap_or_else(|_| "{\"success\":false}".to_string());
        Ok(CallToolResult::error(vec![Content::text(text)]))
    }

    fn parse_memory_types(
        raw: &Option<Vec<String>>,
    ) -> Result<Option<Vec<MemoryUnitType>>, String> {
        let Some(raw) = raw else {
            return Ok(None);
        };
        let mut types = Vec::with_capacity(raw.len());
        for name in raw {
            match MemoryUnitType::from_alias(name) {
                Some(t) => types.push(t),
                None => return Err(format!("unknown memory type: {name}")),
            }
        }
        Ok(Some(types))
    }

    async fn run_search(
        &self,
        query: String,
        limit: Option<usize>,
        min_score: Option<f64>,
        memory_types: Option<Vec<String>>,
        project_id: Option<String>,
        tool: &str,
    ) -> Result<CallToolResult, ErrorData> {
        if query.trim().is_empty() {
            return Self::err_json(tool, "query must not be empty");
        }
        let unit_types = match Self::parse_memory_types(&memory_types) {
            Ok(types) => types,
            Err(e) => return Self::err_json(tool, e),
        };

        let start = Instant::now();
        let mut request = RetrievalRequest::new(query.clone());
        request.project_id = project_id;
        request.limit = limit.unwrap_or(5).clamp(1, 20);
        request.min_score = min_score.unwrap_or(0.6);
        request.unit_types = unit_types;

        match self.core.search_memories(request).await {
            Ok(result) => {
                let results: Vec<Value> = result
                    .results
                    .iter()
                    .map(|r| {
                        json!({
                            "id": r.memory_unit.id,
                            "title": r.memory_unit.title,
                            "summary": r.memory_unit.summary,
                            "relevance_score": r.relevance_score,
                            "memory_type": r.memory_unit.unit_type,
                            "keywords": r.memory_unit.keywords,
                            "created_at": r.memory_unit.created_at,
                            "match_type": r.match_type,
                            "matched_keywords": r.matched_keywords,
                        })
                    })
                    .collect();
                Self::ok_json(json!({
                    "success": true,
                    "query": query,
                    "results": results,
                    "total_found": result.total_found,
                    "search_time_ms": start.elapsed().as_secs_f64() * 1000.0,
                    "metadata": result.metadata,
                }))
            }
            Err(e) => Self::err_json(tool, e),
        }
    }
}

#[tool_router]
impl MemoryServer {
    #[tool(
        description = "Search stored memories and past conversations by semantic and keyword relevance."
    )]
    async fn claude_memory_search(
        &self,
        Parameters(req): Parameters<SearchRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        self.run_search(
            req.query,
            req.limit,
            req.min_score,
            req.memory_types,
            self.scope(),
            "claude_memory_search",
        )
        .await
    }

    #[tool(
        description = "Inject relevant historical context in front of a user prompt. `/memory review` triggers a long-form retrospective."
    )]
    async fn claude_memory_inject(
        &self,
        Parameters(req): Parameters<InjectRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        const TOOL: &str = "claude_memory_inject";
        if req.original_prompt.trim().is_empty() {
            return Self::err_json(TOOL, "original_prompt must not be empty");
        }

        let start = Instant::now();

        // Manual review command bypasses the regular pipeline
        let manual_command = &self.core.settings.memory.summary_manual_trigger_command;
        if req.original_prompt.trim().starts_with(manual_command.as_str()) {
            let conversation_id = req.conversation_id.clone().unwrap_or_default();
            return match self.core.injector.manual_review(&conversation_id).await {
                Ok(review) => Self::ok_json(json!({
                    "success": true,
                    "enhanced_prompt": review,
                    "injected_memories": [],
                    "tokens_used": 0,
                    "processing_time_ms": start.elapsed().as_secs_f64() * 1000.0,
                    "metadata": { "mode": "manual_review" },
                })),
                Err(e) => Self::err_json(TOOL, e),
            };
        }

        let mode = req
            .injection_mode
            .as_deref()
            .map(|m| m.parse::<InjectionMode>())
            .transpose();
        let mode = match mode {
            Ok(mode) => mode.unwrap_or_default(),
            Err(_) => return Self::err_json(TOOL, "unknown injection_mode"),
        };

        let request = InjectionRequest {
            original_prompt: req.original_prompt.clone(),
            query_text: req.query_text,
            context_hint: req.context_hint,
            project_id: self.scope(),
            conversation_id: req.conversation_id,
            injection_mode: mode,
            max_tokens: req.max_tokens,
        };

        match self.core.inject_context(&request).await {
            Ok(response) => {
                let injected: Vec<Value> = response
                    .injected_memories
                    .iter()
                    .map(|m| {
                        json!({
                            "id": m.id,
                            "title": m.title,
                            "summary": m.summary,
                            "memory_type": m.unit_type,
                            "keywords": m.keywords,
                            "created_at": m.created_at,
                        })
                    })
                    .collect();
                Self::ok_json(json!({
                    "success": true,
                    "enhanced_prompt": response.enhanced_prompt(&req.original_prompt),
                    "injected_memories": injected,
                    "tokens_used": response.token_count,
                    "processing_time_ms": start.elapsed().as_secs_f64() * 1000.0,
                    "metadata": response.metadata,
                }))
            }
            Err(e) => Self::err_json(TOOL, e),
        }
    }

    #[tool(
        description = "Service status: component metrics, pool usage, cache statistics and cost report."
    )]
    async fn claude_memory_status(
        &self,
        Parameters(_req): Parameters<StatusRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        let mut status = self.core.status().await;
        status["success"] = json!(true);
        Self::ok_json(status)
    }

    #[tool(
        description = "Health check across the relational store, vector store and model providers."
    )]
    async fn claude_memory_health(
        &self,
        Parameters(req): Parameters<HealthRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        let mut health = self.core.health(req.detailed.unwrap_or(false)).await;
        health["success"] = json!(true);
        Self::ok_json(health)
    }

    #[tool(
        description = "Legacy alias: search memories across every project (global scope)."
    )]
    async fn claude_memory_cross_project_search(
        &self,
        Parameters(req): Parameters<CrossProjectSearchRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        self.run_search(
            req.query,
            req.limit,
            req.min_score,
            None,
            None,
            "claude_memory_cross_project_search",
        )
        .await
    }
}
