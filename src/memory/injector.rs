// src/memory/injector.rs
// Orchestrates retrieve -> fuse -> build -> limit -> return

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Value, json};
use strum::{Display, EnumString};
use tracing::{debug, info, warn};

use crate::config::MemorySettings;
use crate::db::{DatabasePool, memory_units as db_units};
use crate::error::Result;
use crate::llm::{ChatMessage, CompletionParams, ModelGateway};
use crate::monitor::CostMonitor;

use super::builder::PromptBuilder;
use super::fuser::MemoryFuser;
use super::limiter::{PriorityLevel, TokenLimiter};
use super::retriever::{RetrievalRequest, SemanticRetriever};
use super::types::MemoryUnit;

/// Injection mode requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum InjectionMode {
    Conservative,
    #[default]
    Balanced,
    Comprehensive,
}

/// Injection request
#[derive(Debug, Clone)]
pub struct InjectionRequest {
    pub original_prompt: String,
    pub query_text: Option<String>,
    pub context_hint: Option<String>,
    pub project_id: Option<String>,
    pub conversation_id: Option<String>,
    pub injection_mode: InjectionMode,
    pub max_tokens: Option<usize>,
}

impl InjectionRequest {
    pub fn new(original_prompt: impl Into<String>) -> Self {
        Self {
            original_prompt: original_prompt.into(),
            query_text: None,
            context_hint: None,
            project_id: None,
            conversation_id: None,
            injection_mode: InjectionMode::default(),
            max_tokens: None,
        }
    }
}

/// Injection response
#[derive(Debug, Clone)]
pub struct InjectionResponse {
    pub content: String,
    pub token_count: usize,
    pub memory_count: usize,
    pub injected_memories: Vec<MemoryUnit>,
    pub fused: bool,
    pub cost: f64,
    pub metadata: Value,
}

impl InjectionResponse {
    fn empty(reason: &str) -> Self {
        Self {
            content: String::new(),
            token_count: 0,
            memory_count: 0,
            injected_memories: Vec::new(),
            fused: false,
            cost: 0.0,
            metadata: json!({ "reason": reason }),
        }
    }

    /// The original prompt with the context block prepended.
    pub fn enhanced_prompt(&self, original_prompt: &str) -> String {
        if self.content.is_empty() {
            original_prompt.to_string()
        } else {
            format!("{}\n\n{}", self.content, original_prompt)
        }
    }
}

/// Pipeline orchestrator for context injection.
pub struct ContextInjector {
    retriever: Arc<SemanticRetriever>,
    fuser: Arc<MemoryFuser>,
    builder: PromptBuilder,
    limiter: Arc<TokenLimiter>,
    gateway: Arc<ModelGateway>,
    pool: Arc<DatabasePool>,
    monitor: Option<Arc<CostMonitor>>,
    settings: MemorySettings,
}

impl ContextInjector {
    pub fn new(
        retriever: Arc<SemanticRetriever>,
        fuser: Arc<MemoryFuser>,
        builder: PromptBuilder,
        limiter: Arc<TokenLimiter>,
        gateway: Arc<ModelGateway>,
        pool: Arc<DatabasePool>,
        monitor: Option<Arc<CostMonitor>>,
        settings: MemorySettings,
    ) -> Self {
        Self {
            retriever,
            fuser,
            builder,
            limiter,
            gateway,
            pool,
            monitor,
            settings,
        }
    }

    /// Run the injection pipeline:
    /// fixed Top-20 retrieval, fuse when policy allows, build, limit.
    pub async fn inject(&self, request: &InjectionRequest) -> Result<InjectionResponse> {
        let start = Instant::now();

        let query = self.effective_query(request);

        let mut retrieval = RetrievalRequest::new(query.clone());
        retrieval.project_id = request.project_id.clone();
        retrieval.conversation_id = request.conversation_id.clone();
        retrieval.limit = self.settings.retrieval_top_k;
        retrieval.min_score = self.settings.min_score;

        let retrieved = self.retriever.retrieve(&retrieval).await?;
        if retrieved.results.is_empty() {
            debug!(query = %crate::utils::truncate_chars(&query, 50), "No memories found");
            return Ok(InjectionResponse::empty("no_memories_found"));
        }

        let units: Vec<MemoryUnit> = retrieved
            .results
            .iter()
            .map(|r| r.memory_unit.clone())
            .collect();

        let mut cost = 0.0;
        let mut fused_content: Option<String> = None;
        if self.should_fuse(&query) {
            let fused = self
                .fuser
                .fuse(&units, &query, Some(self.settings.fuser_token_limit))
                .await;
            cost += fused.fusion_cost;
            if fused.fusion_model != "none" {
                fused_content = Some(fused.content);
            }
        }

        let was_fused = fused_content.is_some();
        let built = self
            .builder
            .build(&units, &query, request.max_tokens, fused_content.as_deref());

        let budget = request.max_tokens.unwrap_or(self.settings.token_budget_limit);
        let limited = self
            .limiter
            .limit(&built.content, Some(budget), PriorityLevel::Medium)
            .await;

        let elapsed = start.elapsed().as_secs_f64();
        info!(
            memory_count = units.len(),
            fused = was_fused,
            token_count = limited.final_tokens,
            cost,
            elapsed_time = elapsed,
            "Context injection completed"
        );

        Ok(InjectionResponse {
            content: limited.content,
            token_count: limited.final_tokens,
            memory_count: units.len(),
            injected_memories: units,
            fused: was_fused,
            cost,
            metadata: json!({
                "strategy": retrieved.strategy,
                "mode": request.injection_mode.to_string(),
                "truncated": limited.truncated,
                "compressed": limited.compressed,
                "elapsed_time": elapsed,
            }),
        })
    }

    /// Handle the manual review command (`/memory review`): fetch the
    /// recent window for the conversation and ask the heavy summary model
    /// for a long-form retrospective.
    pub async fn manual_review(&self, conversation_id: &str) -> Result<String> {
        let conversation_id_owned = conversation_id.to_string();
        let units = self
            .pool
            .run(move |conn| {
                db_units::list_units_for_conversation_sync(conn, &conversation_id_owned, 20)
            })
            .await?;

        if units.is_empty() {
            return Ok("No memories available for review.".to_string());
        }

        let history = units
            .iter()
            .map(|u| {
                format!(
                    "[{}] {}:\n{}\n",
                    u.created_at.format("%Y-%m-%d %H:%M"),
                    u.unit_type,
                    u.content
                )
            })
            .collect::<Vec<_>>()
            .join("\n---\n");

        let prompt = format!(
            "Write a comprehensive retrospective of the following conversation history, covering:\n\
             1. The main topics discussed and decisions made\n\
             2. Problems solved and challenges encountered\n\
             3. Significant code or architecture changes\n\
             4. Open issues and planned follow-ups\n\n\
             Conversation history:\n{history}"
        );

        let params = CompletionParams::default()
            .with_temperature(0.3)
            .with_max_tokens(self.settings.summary_max_tokens);
        let response = self
            .gateway
            .complete(&self.settings.summary_model, &[ChatMessage::user(prompt)], params)
            .await?;

        info!(
            conversation_id,
            memory_count = units.len(),
            cost = response.cost_usd,
            "Manual review generated"
        );
        Ok(format!("## 对话历史回顾\n\n{}", response.content))
    }

    fn effective_query(&self, request: &InjectionRequest) -> String {
        let base = request
            .query_text
            .clone()
            .filter(|q| !q.trim().is_empty())
            .unwrap_or_else(|| request.original_prompt.clone());
        match &request.context_hint {
            Some(hint) if !hint.trim().is_empty() => format!("{base}\n{hint}"),
            _ => base,
        }
    }

    /// Fusion policy: the configuration switch gates it, degradation can
    /// veto it, and any auto-trigger keyword in the query forces it back on
    /// (budget permitting).
    fn should_fuse(&self, query: &str) -> bool {
        let degradation_allows = self
            .monitor
            .as_ref()
            .map(|m| m.degradation_config().fusion_enabled)
            .unwrap_or(true);
        if !degradation_allows {
            warn!("Fusion disabled by cost degradation");
            return false;
        }
        if !self.settings.fuser_enabled {
            return self
                .settings
                .summary_auto_trigger_keywords
                .iter()
                .any(|kw| query.contains(kw.as_str()));
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiKeys, Settings};
    use crate::memory::builder::BuilderConfig;
    use crate::memory::fuser::FusionConfig;
    use crate::memory::limiter::{LimiterConfig, TokenLimiter};
    use crate::memory::retriever::SemanticRetriever;
    use crate::memory::types::MemoryUnitType;
    use crate::utils::cost::CostTracker;
    use crate::vector::VectorStore;
    use chrono::Utc;

    const DIM: usize = 8;

    async fn injector() -> (ContextInjector, Arc<SemanticRetriever>) {
        let mut settings = Settings::default();
        settings.vector.vector_size = DIM;

        let pool = Arc::new(DatabasePool::open_in_memory().await.expect("pool"));
        let vector_pool = Arc::new(DatabasePool::open_vector_in_memory().await.expect("vpool"));
        let vector = Arc::new(VectorStore::new(vector_pool, &settings.vector));
        vector.ensure_collection().await.expect("collection");

        pool.run(|conn| {
            crate::db::projects::upsert_project_sync(
                conn,
                &crate::db::Project {
                    id: "default".into(),
                    name: "default".into(),
                    description: String::new(),
                    is_active: true,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                    settings: json!({}),
                },
            )
        })
        .await
        .expect("seed project");

        let gateway = Arc::new(ModelGateway::from_api_keys(
            &ApiKeys::default(),
            settings.models.clone(),
            4,
            Arc::new(CostTracker::new()),
            reqwest::Client::new(),
        ));

        let retriever = Arc::new(SemanticRetriever::new(
            gateway.clone(),
            pool.clone(),
            vector,
            settings.memory.clone(),
            settings.models.clone(),
            &settings.performance,
        ));

        let fuser = Arc::new(MemoryFuser::new(FusionConfig::default(), gateway.clone()));
        let limiter = Arc::new(TokenLimiter::new(
            LimiterConfig {
                enable_compression: false,
                ..Default::default()
            },
            None,
        ));

        let injector = ContextInjector::new(
            retriever.clone(),
            fuser,
            PromptBuilder::new(BuilderConfig::default()),
            limiter,
            gateway,
            pool,
            None,
            settings.memory.clone(),
        );
        (injector, retriever)
    }

    fn stored_unit(title: &str, keywords: &[&str]) -> MemoryUnit {
        let mut unit = MemoryUnit::new("default", None, MemoryUnitType::Conversation);
        unit.title = title.to_string();
        unit.summary = format!("summary about {title}");
        unit.content = format!("content describing {title}");
        unit.set_keywords(keywords.iter().map(|s| s.to_string()).collect());
        unit
    }

    fn vec_for(hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; DIM];
        v[hot % DIM] = 1.0;
        v
    }

    #[tokio::test]
    async fn test_inject_no_memories_returns_empty() {
        let (injector, _) = injector().await;
        let response = injector
            .inject(&InjectionRequest::new("anything at all"))
            .await
            .unwrap();
        assert!(response.content.is_empty());
        assert_eq!(response.memory_count, 0);
        assert_eq!(response.metadata["reason"], "no_memories_found");
    }

    #[tokio::test]
    async fn test_inject_respects_token_budget() {
        let (injector, retriever) = injector().await;
        for i in 0..6 {
            let unit = stored_unit(
                &format!("terraform state management part {i}"),
                &["terraform", "state"],
            );
            assert!(retriever.store_with_embedding(&unit, vec_for(i)).await.unwrap());
        }

        let mut request = InjectionRequest::new("how do we manage terraform state");
        request.project_id = Some("default".to_string());
        request.max_tokens = Some(120);

        let response = injector.inject(&request).await.unwrap();
        assert!(response.memory_count > 0);
        assert!(
            response.token_count <= 120,
            "budget exceeded: {}",
            response.token_count
        );
        // Fusion degraded to identity without providers, so the block was
        // built from units and possibly truncated
        assert!(!response.fused);
    }

    #[tokio::test]
    async fn test_enhanced_prompt_prepends_context() {
        let response = InjectionResponse {
            content: "CONTEXT".to_string(),
            token_count: 1,
            memory_count: 1,
            injected_memories: vec![],
            fused: false,
            cost: 0.0,
            metadata: json!({}),
        };
        let enhanced = response.enhanced_prompt("QUESTION");
        assert!(enhanced.starts_with("CONTEXT"));
        assert!(enhanced.ends_with("QUESTION"));

        let empty = InjectionResponse::empty("none");
        assert_eq!(empty.enhanced_prompt("QUESTION"), "QUESTION");
    }

    #[tokio::test]
    async fn test_query_text_overrides_prompt_and_hint_appended() {
        let (injector, _) = injector().await;
        let mut request = InjectionRequest::new("original prompt");
        request.query_text = Some("search this".to_string());
        request.context_hint = Some("extra hint".to_string());
        let query = injector.effective_query(&request);
        assert!(query.starts_with("search this"));
        assert!(query.ends_with("extra hint"));
    }

    #[tokio::test]
    async fn test_auto_trigger_keyword_forces_fusion_policy() {
        let (mut inj, _) = injector().await;
        inj.settings.fuser_enabled = false;
        assert!(!inj.should_fuse("ordinary query"));
        assert!(inj.should_fuse("我们讨论一下重构方案"));
    }

    #[tokio::test]
    async fn test_manual_review_without_memories() {
        let (injector, _) = injector().await;
        let review = injector.manual_review("missing-conversation").await.unwrap();
        assert!(review.contains("No memories"));
    }

    #[tokio::test]
    async fn test_inject_with_conversation_filter() {
        let (injector, retriever) = injector().await;
        let unit = stored_unit("redis caching strategy", &["redis", "caching"]);
        assert!(retriever.store_with_embedding(&unit, vec_for(0)).await.unwrap());

        let mut request = InjectionRequest::new("redis caching");
        request.project_id = Some("default".to_string());
        let response = injector.inject(&request).await.unwrap();
        assert!(response.memory_count >= 1);
        assert!(response.content.contains("redis"));
    }
}
