// src/service.rs
// Component lifecycle, conversation ingestion and background loops

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::EnvConfig;
use crate::db::{DatabasePool, conversations as db_conversations, memory_units as db_units};
use crate::error::{MemoryError, Result};
use crate::llm::ModelGateway;
use crate::memory::builder::{BuilderConfig, PromptBuilder};
use crate::memory::compressor::{CompressionRequest, SemanticCompressor};
use crate::memory::fuser::{FusionConfig, MemoryFuser};
use crate::memory::injector::{ContextInjector, InjectionRequest, InjectionResponse};
use crate::memory::limiter::{LimiterConfig, TokenLimiter};
use crate::memory::retriever::{
    RetrievalRequest, RetrievalResult, SemanticRetriever,
};
use crate::memory::types::{Conversation, MemoryUnitType};
use crate::monitor::CostMonitor;
use crate::project::ProjectManager;
use crate::utils::cost::CostTracker;
use crate::utils::tokens::TokenCounter;
use crate::vector::VectorStore;

/// Service counters exposed on the status surface.
#[derive(Debug, Clone, Default)]
pub struct ServiceMetrics {
    pub conversations_processed: u64,
    pub memories_created: u64,
    pub searches_performed: u64,
    pub injections_performed: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub average_response_time_ms: f64,
}

/// Owns every long-lived component and the background loops.
///
/// Construction order: relational pool, vector store, gateway, project
/// manager (seeds the default project), then the pipeline components.
/// Short-lived request state moves through the pipeline by value.
pub struct ServiceCore {
    pub settings: crate::config::Settings,
    pub pool: Arc<DatabasePool>,
    pub vector: Arc<VectorStore>,
    pub gateway: Arc<ModelGateway>,
    pub cost_tracker: Arc<CostTracker>,
    pub cost_monitor: Arc<CostMonitor>,
    pub projects: Arc<ProjectManager>,
    pub compressor: Arc<SemanticCompressor>,
    pub retriever: Arc<SemanticRetriever>,
    pub fuser: Arc<MemoryFuser>,
    pub limiter: Arc<TokenLimiter>,
    pub injector: Arc<ContextInjector>,

    counter: TokenCounter,
    started_at: chrono::DateTime<Utc>,
    metrics: Mutex<ServiceMetrics>,
    response_times: Mutex<Vec<f64>>,
    /// Serializes writes per conversation id
    conversation_locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    component_health: Mutex<Value>,
    shutdown_tx: watch::Sender<bool>,
}

impl ServiceCore {
    /// Initialize all components. Background loops are spawned separately
    /// via [`spawn_background_tasks`](Self::spawn_background_tasks).
    pub async fn initialize(env: &EnvConfig) -> Result<Arc<Self>> {
        let settings = env.settings.clone();

        // 1. Relational pool + ping
        let pool_size = settings.database.pool_size + settings.database.max_overflow;
        let pool = Arc::new(
            DatabasePool::open(&settings.database.path, pool_size)
                .await
                .map_err(|e| MemoryError::Config(format!("relational store init: {e}")))?,
        );
        if !pool.ping().await {
            return Err(MemoryError::Config("relational store unreachable".into()));
        }

        // 2. Vector store + collection
        let vector_pool = Arc::new(
            DatabasePool::open_vector(&settings.vector.path, 4)
                .await
                .map_err(|e| MemoryError::Config(format!("vector store init: {e}")))?,
        );
        let vector = Arc::new(VectorStore::new(vector_pool, &settings.vector));
        vector.ensure_collection().await?;

        Self::initialize_with_stores(env, pool, vector).await
    }

    /// Component wiring on top of already-open stores (tests use in-memory
    /// pools here).
    pub async fn initialize_with_stores(
        env: &EnvConfig,
        pool: Arc<DatabasePool>,
        vector: Arc<VectorStore>,
    ) -> Result<Arc<Self>> {
        let settings = env.settings.clone();

        // 3. Gateway, cost accounting, project manager, pipeline components
        let cost_tracker = Arc::new(CostTracker::new());
        let cost_monitor = Arc::new(CostMonitor::new(
            cost_tracker.clone(),
            settings.cost.clone(),
            None,
        ));

        let http = reqwest::Client::builder()
            .timeout(settings.models.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(20)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let gateway = Arc::new(
            ModelGateway::from_api_keys(
                &env.api_keys,
                settings.models.clone(),
                settings.performance.max_concurrent_requests,
                cost_tracker.clone(),
                http,
            )
            .with_cost_monitor(cost_monitor.clone())
            .with_ledger(pool.clone()),
        );

        let projects = Arc::new(ProjectManager::new(
            pool.clone(),
            settings.default_project_id.clone(),
        ));
        projects.ensure_default().await?;

        let compressor = Arc::new(SemanticCompressor::new(
            gateway.clone(),
            settings.memory.clone(),
            settings.performance.batch_size,
            settings.performance.compression_cache_size,
        ));

        let retriever = Arc::new(SemanticRetriever::new(
            gateway.clone(),
            pool.clone(),
            vector.clone(),
            settings.memory.clone(),
            settings.models.clone(),
            &settings.performance,
        ));
        retriever.initialize().await?;

        let fuser = Arc::new(MemoryFuser::new(
            FusionConfig {
                enabled: settings.memory.fuser_enabled,
                model: settings.memory.fuser_model.clone(),
                temperature: settings.memory.fuser_temperature,
                token_limit: settings.memory.fuser_token_limit,
                language: settings.memory.fuser_language,
                prompt_template_path: settings.memory.fuser_prompt_template_path.clone(),
                cache_ttl: settings.performance.cache_ttl,
                cache_size: 256,
            },
            gateway.clone(),
        ));

        let limiter = Arc::new(TokenLimiter::new(
            LimiterConfig {
                compression_model: settings.memory.fuser_model.clone(),
                ..Default::default()
            },
            Some(gateway.clone()),
        ));

        let injector = Arc::new(ContextInjector::new(
            retriever.clone(),
            fuser.clone(),
            PromptBuilder::new(BuilderConfig::default()),
            limiter.clone(),
            gateway.clone(),
            pool.clone(),
            Some(cost_monitor.clone()),
            settings.memory.clone(),
        ));

        let (shutdown_tx, _) = watch::channel(false);

        info!(
            project_id = %settings.project_id,
            providers = %env.api_keys.summary(),
            "Service core initialized"
        );

        Ok(Arc::new(Self {
            settings,
            pool,
            vector,
            gateway,
            cost_tracker,
            cost_monitor,
            projects,
            compressor,
            retriever,
            fuser,
            limiter,
            injector,
            counter: TokenCounter::new(),
            started_at: Utc::now(),
            metrics: Mutex::new(ServiceMetrics::default()),
            response_times: Mutex::new(Vec::new()),
            conversation_locks: tokio::sync::Mutex::new(HashMap::new()),
            component_health: Mutex::new(json!({})),
            shutdown_tx,
        }))
    }

    /// Signal every background loop to stop within one iteration.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        info!("Shutdown flag set");
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    // ------------------------------------------------------------------
    // Conversation ingestion
    // ------------------------------------------------------------------

    /// Persist a conversation and derive its memory unit.
    ///
    /// Writes are serialized per conversation id; the conversation plus its
    /// messages commit in one transaction before compression starts, so a
    /// failed compression never loses the dialogue.
    pub async fn store_conversation(&self, mut conversation: Conversation) -> Result<Option<String>> {
        let start = std::time::Instant::now();

        if conversation.messages.is_empty() {
            return Err(MemoryError::Validation(
                "conversation has no messages".to_string(),
            ));
        }

        // Fill derived fields the collector may have omitted
        for (i, message) in conversation.messages.iter_mut().enumerate() {
            message.conversation_id = conversation.id.clone();
            message.sequence_number = i as i64;
            if message.token_count == 0 {
                message.token_count = self.counter.count(&message.content) as i64;
            }
        }
        conversation.message_count = conversation.messages.len() as i64;
        conversation.token_count = conversation.messages.iter().map(|m| m.token_count).sum();
        if conversation.title.is_empty() {
            if let Some(first) = conversation.messages.first() {
                conversation.title = crate::utils::truncate_chars(&first.content, 120);
            }
        }

        // Project rows are created on first reference
        self.projects
            .get_or_create(&conversation.project_id, None)
            .await?;

        let lock = self.conversation_lock(&conversation.id).await;
        let _guard = lock.lock().await;

        let stored = conversation.clone();
        self.pool
            .run_with_retry(move |conn| -> std::result::Result<(), rusqlite::Error> {
                let tx = conn.unchecked_transaction()?;
                db_conversations::insert_conversation_sync(&tx, &Conversation {
                    message_count: 0,
                    token_count: 0,
                    ..stored.clone()
                })?;
                db_conversations::append_messages_sync(&tx, &stored.id, &stored.messages)?;
                tx.commit()
            })
            .await?;

        let unit_type = Self::determine_unit_type(&conversation);
        let degradation = self.cost_monitor.degradation_config();

        let unit_id = if degradation.compression_enabled {
            match self.compress_and_store(&conversation, unit_type, &degradation).await {
                Ok(id) => Some(id),
                Err(e) => {
                    // The conversation stays stored; a follow-up job can
                    // retry the compression
                    warn!(
                        conversation_id = %conversation.id,
                        error = %e,
                        "Compression failed, conversation kept without memory unit"
                    );
                    self.record_error(&e);
                    None
                }
            }
        } else {
            warn!("Compression disabled by cost degradation, storing conversation only");
            None
        };

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.record_response_time(elapsed_ms);
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.conversations_processed += 1;
            if unit_id.is_some() {
                metrics.memories_created += 1;
            }
        }

        info!(
            conversation_id = %conversation.id,
            unit_type = %unit_type,
            memory_unit = ?unit_id,
            elapsed_ms,
            "Conversation processed"
        );
        Ok(unit_id)
    }

    async fn compress_and_store(
        &self,
        conversation: &Conversation,
        unit_type: MemoryUnitType,
        degradation: &crate::monitor::DegradationConfig,
    ) -> Result<String> {
        let mut request = CompressionRequest::new(conversation.clone(), unit_type);
        request.quality_threshold = Some(self.settings.memory.quality_threshold);
        request.max_summary_length = self.settings.memory.max_summary_length;
        request.allow_escalation = degradation.heavy_model_enabled;

        let result = self.compressor.compress(&request).await?;
        let unit = result.memory_unit;

        if self.retriever.store_with_transaction(&unit).await? {
            Ok(unit.id)
        } else {
            Err(MemoryError::Processing(format!(
                "dual-store write rejected for memory unit {}",
                unit.id
            )))
        }
    }

    /// `global_mu` for long or token-heavy dialogues, `conversation`
    /// otherwise.
    fn determine_unit_type(conversation: &Conversation) -> MemoryUnitType {
        if conversation.message_count > 10 || conversation.token_count > 5000 {
            MemoryUnitType::GlobalMu
        } else {
            MemoryUnitType::Conversation
        }
    }

    async fn conversation_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.conversation_locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // ------------------------------------------------------------------
    // Retrieval surfaces
    // ------------------------------------------------------------------

    /// Search within the active project scope (None = across projects).
    pub async fn search_memories(
        &self,
        request: RetrievalRequest,
    ) -> Result<RetrievalResult> {
        let result = self.retriever.retrieve(&request).await;
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.searches_performed += 1;
            if let Err(e) = &result {
                metrics.error_count += 1;
                metrics.last_error = Some(e.to_string());
            }
        }
        result
    }

    pub async fn inject_context(&self, request: &InjectionRequest) -> Result<InjectionResponse> {
        let result = self.injector.inject(request).await;
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.injections_performed += 1;
            if let Err(e) = &result {
                metrics.error_count += 1;
                metrics.last_error = Some(e.to_string());
            }
        }
        result
    }

    // ------------------------------------------------------------------
    // Status / health
    // ------------------------------------------------------------------

    pub fn metrics(&self) -> ServiceMetrics {
        self.metrics
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    fn record_error(&self, error: &MemoryError) {
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.error_count += 1;
            metrics.last_error = Some(error.to_string());
        }
    }

    fn record_response_time(&self, elapsed_ms: f64) {
        if let Ok(mut times) = self.response_times.lock() {
            times.push(elapsed_ms);
            if times.len() > 256 {
                times.drain(..128);
            }
            let avg = times.iter().sum::<f64>() / times.len() as f64;
            if let Ok(mut metrics) = self.metrics.lock() {
                metrics.average_response_time_ms = avg;
            }
        }
    }

    /// Status envelope for the status tool / endpoint.
    pub async fn status(&self) -> Value {
        let metrics = self.metrics();
        let pool_status = self.pool.status();
        json!({
            "service": "claude-memory",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": (Utc::now() - self.started_at).num_seconds(),
            "project_id": self.settings.project_id,
            "memory_mode": self.settings.memory.mode.to_string(),
            "metrics": {
                "conversations_processed": metrics.conversations_processed,
                "memories_created": metrics.memories_created,
                "searches_performed": metrics.searches_performed,
                "injections_performed": metrics.injections_performed,
                "error_count": metrics.error_count,
                "last_error": metrics.last_error,
                "average_response_time_ms": metrics.average_response_time_ms,
            },
            "pool": {
                "size": pool_status.size,
                "available": pool_status.available,
                "waiting": pool_status.waiting,
            },
            "caches": self.retriever.cache_stats(),
            "cost": self.cost_monitor.report(),
            "component_health": self.component_health(),
        })
    }

    fn component_health(&self) -> Value {
        self.component_health
            .lock()
            .map(|h| h.clone())
            .unwrap_or_else(|_| json!({}))
    }

    /// Health summary: healthy / degraded / unhealthy plus issues.
    pub async fn health(&self, detailed: bool) -> Value {
        let db_ok = self.pool.ping().await;
        let vector_ok = self.vector.ping().await;
        let providers_ok = self.gateway.has_providers();

        let mut issues: Vec<String> = Vec::new();
        if !db_ok {
            issues.push("relational store unreachable".to_string());
        }
        if !vector_ok {
            issues.push("vector store unreachable".to_string());
        }
        if !providers_ok {
            issues.push("no model providers configured".to_string());
        }
        if self.cost_monitor.degradation_level() > 0 {
            issues.push(format!(
                "cost degradation level {}",
                self.cost_monitor.degradation_level()
            ));
        }

        let status = if !db_ok || !vector_ok {
            "unhealthy"
        } else if !issues.is_empty() {
            "degraded"
        } else {
            "healthy"
        };

        let components = json!({
            "database": db_ok,
            "vector_store": vector_ok,
            "model_gateway": providers_ok,
        });
        if let Ok(mut health) = self.component_health.lock() {
            *health = components.clone();
        }

        let mut payload = json!({
            "health_status": status,
            "issues": issues,
        });
        if detailed {
            payload["component_health"] = components;
            payload["degradation"] = serde_json::to_value(self.cost_monitor.degradation_config())
                .unwrap_or(Value::Null);
        }
        payload
    }

    // ------------------------------------------------------------------
    // Background loops
    // ------------------------------------------------------------------

    /// Launch the health, metrics, cleanup and cost-monitor loops. Each
    /// observes the shutdown flag and exits within one iteration.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        let intervals = self.settings.monitoring.clone();

        Self::spawn_loop(
            self.clone(),
            "health",
            intervals.health_check_interval,
            |core| async move {
                let _ = core.health(false).await;
            },
        );

        Self::spawn_loop(
            self.clone(),
            "metrics",
            intervals.metrics_update_interval,
            |core| async move {
                let metrics = core.metrics();
                debug!(
                    conversations = metrics.conversations_processed,
                    memories = metrics.memories_created,
                    errors = metrics.error_count,
                    "Metrics snapshot"
                );
            },
        );

        Self::spawn_loop(
            self.clone(),
            "memory-cleanup",
            intervals.memory_cleanup_interval,
            |core| async move {
                if let Err(e) = core.cleanup_expired_memories().await {
                    warn!(error = %e, "Memory cleanup pass failed");
                }
            },
        );

        Self::spawn_loop(
            self.clone(),
            "cost-monitor",
            intervals.cost_monitor_interval,
            |core| async move {
                if core.cost_monitor.rollover_if_new_day() {
                    info!("Daily cost counters rolled over");
                }
                let report = core.cost_monitor.report();
                debug!(
                    daily_cost = report["daily_cost"].as_f64().unwrap_or(0.0),
                    usage_percent = report["daily_usage_percent"].as_f64().unwrap_or(0.0),
                    "Hourly cost report"
                );
            },
        );
    }

    fn spawn_loop<F, Fut>(core: Arc<Self>, name: &'static str, interval: Duration, body: F)
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let mut shutdown = core.shutdown_signal();
        tokio::spawn(async move {
            info!(loop_name = name, ?interval, "Background loop started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => {}
                }
                if *shutdown.borrow() {
                    info!(loop_name = name, "Background loop stopped");
                    break;
                }
                body(core.clone()).await;
            }
        });
    }

    /// Delete every expired unit from both stores. Idempotent: a delete
    /// racing a concurrent read leaves no partial record behind.
    pub async fn cleanup_expired_memories(&self) -> Result<usize> {
        let expired = self
            .pool
            .run(|conn| db_units::list_expired_memory_units_sync(conn, Utc::now()))
            .await?;

        let mut deleted = 0usize;
        for id in &expired {
            match self.retriever.delete(id).await {
                Ok(_) => deleted += 1,
                Err(e) => warn!(memory_unit_id = %id, error = %e, "Failed to delete expired unit"),
            }
        }
        if deleted > 0 {
            info!(deleted, "Expired memory units cleaned up");
        }
        Ok(deleted)
    }

    /// Synthesize a global review unit over the recent window and store it.
    pub async fn run_global_review(
        &self,
        project_id: &str,
        timeframe_days: i64,
    ) -> Result<Option<String>> {
        let project = project_id.to_string();
        let ids = self
            .pool
            .run(move |conn| {
                db_conversations::recent_conversation_ids_sync(conn, &project, timeframe_days, 50)
            })
            .await?;
        if ids.is_empty() {
            return Ok(None);
        }

        let mut conversations = Vec::new();
        for id in ids {
            let loaded = self
                .pool
                .run(move |conn| db_conversations::get_conversation_sync(conn, &id))
                .await?;
            if let Some(conv) = loaded {
                if !conv.messages.is_empty() {
                    conversations.push(conv);
                }
            }
        }
        if conversations.is_empty() {
            return Ok(None);
        }

        let unit = self
            .compressor
            .global_review(&conversations, timeframe_days)
            .await?;
        let unit_id = unit.id.clone();
        if self.retriever.store_with_transaction(&unit).await? {
            Ok(Some(unit_id))
        } else {
            Err(MemoryError::Processing(
                "dual-store write rejected for global review unit".to_string(),
            ))
        }
    }
}

impl Drop for ServiceCore {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiKeys, Settings};
    use crate::memory::types::MessageType;

    const DIM: usize = 8;

    async fn core() -> Arc<ServiceCore> {
        let mut settings = Settings::default();
        settings.vector.vector_size = DIM;
        let env = EnvConfig {
            api_keys: ApiKeys::default(),
            settings,
        };

        let pool = Arc::new(DatabasePool::open_in_memory().await.expect("pool"));
        let vector_pool = Arc::new(DatabasePool::open_vector_in_memory().await.expect("vpool"));
        let vector = Arc::new(VectorStore::new(vector_pool, &env.settings.vector));
        vector.ensure_collection().await.expect("collection");

        ServiceCore::initialize_with_stores(&env, pool, vector)
            .await
            .expect("core init")
    }

    fn sample_conversation(messages: usize) -> Conversation {
        let mut conv = Conversation::new("default");
        for i in 0..messages {
            let message_type = if i % 2 == 0 {
                MessageType::Human
            } else {
                MessageType::Assistant
            };
            conv.push_message(message_type, format!("message number {i} about rust traits"));
        }
        conv
    }

    #[tokio::test]
    async fn test_initialize_seeds_default_project() {
        let core = core().await;
        let project = core.projects.get("default").await.unwrap();
        assert!(project.is_some());
    }

    #[tokio::test]
    async fn test_store_conversation_persists_without_providers() {
        // Compression fails without API keys, but the conversation must
        // stay stored
        let core = core().await;
        let conv = sample_conversation(2);
        let conv_id = conv.id.clone();

        let unit_id = core.store_conversation(conv).await.unwrap();
        assert!(unit_id.is_none(), "no providers -> no memory unit");

        let stored = core
            .pool
            .run(move |conn| db_conversations::get_conversation_sync(conn, &conv_id))
            .await
            .unwrap();
        let stored = stored.expect("conversation row must exist");
        assert_eq!(stored.messages.len(), 2);
        assert!(stored.token_count > 0);

        let metrics = core.metrics();
        assert_eq!(metrics.conversations_processed, 1);
        assert_eq!(metrics.memories_created, 0);
        assert!(metrics.error_count >= 1);
    }

    #[tokio::test]
    async fn test_store_conversation_rejects_empty() {
        let core = core().await;
        let conv = Conversation::new("default");
        let err = core.store_conversation(conv).await.unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
    }

    #[test]
    fn test_unit_type_thresholds() {
        let mut conv = sample_conversation(3);
        conv.token_count = 100;
        assert_eq!(
            ServiceCore::determine_unit_type(&conv),
            MemoryUnitType::Conversation
        );

        let mut long = sample_conversation(11);
        long.token_count = 100;
        assert_eq!(ServiceCore::determine_unit_type(&long), MemoryUnitType::GlobalMu);

        let mut heavy = sample_conversation(2);
        heavy.token_count = 6000;
        assert_eq!(ServiceCore::determine_unit_type(&heavy), MemoryUnitType::GlobalMu);
    }

    #[tokio::test]
    async fn test_cleanup_deletes_expired_units() {
        let core = core().await;

        // Store one expired and one live unit directly through the writer
        let mut expired = crate::memory::types::MemoryUnit::new(
            "default",
            None,
            MemoryUnitType::Archive,
        );
        expired.title = "old".into();
        expired.summary = "old archive".into();
        expired.content = "old archive content".into();
        expired.expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
        let mut vector = vec![0.0f32; DIM];
        vector[0] = 1.0;
        assert!(core
            .retriever
            .store_with_embedding(&expired, vector.clone())
            .await
            .unwrap());

        let mut live =
            crate::memory::types::MemoryUnit::new("default", None, MemoryUnitType::Conversation);
        live.title = "live".into();
        live.summary = "live unit".into();
        live.content = "live unit content".into();
        assert!(core.retriever.store_with_embedding(&live, vector).await.unwrap());

        let deleted = core.cleanup_expired_memories().await.unwrap();
        assert_eq!(deleted, 1);

        // Running again is a no-op
        let deleted = core.cleanup_expired_memories().await.unwrap();
        assert_eq!(deleted, 0);

        // The live unit survived in both stores
        assert_eq!(core.vector.get(&[live.id.clone()]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_health_reports_missing_providers() {
        let core = core().await;
        let health = core.health(true).await;
        assert_eq!(health["health_status"], "degraded");
        assert!(health["component_health"]["database"].as_bool().unwrap());
        assert!(health["component_health"]["vector_store"].as_bool().unwrap());
        assert!(!health["component_health"]["model_gateway"].as_bool().unwrap());
    }

    #[tokio::test]
    async fn test_status_envelope() {
        let core = core().await;
        let status = core.status().await;
        assert_eq!(status["service"], "claude-memory");
        assert!(status["metrics"].is_object());
        assert!(status["cost"].is_object());
        assert!(status["caches"].is_object());
    }

    #[tokio::test]
    async fn test_shutdown_flag_observed() {
        let core = core().await;
        let mut rx = core.shutdown_signal();
        assert!(!*rx.borrow());
        core.shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_concurrent_stores_serialized_per_conversation() {
        let core = core().await;
        let conv = sample_conversation(2);

        // Two concurrent stores of the same conversation: the second hits
        // the primary-key conflict instead of interleaving partial writes
        let (a, b) = tokio::join!(
            core.store_conversation(conv.clone()),
            core.store_conversation(conv.clone())
        );
        assert!(a.is_ok() != b.is_ok(), "exactly one store should win");
    }
}
