// src/llm/gateway.rs
// Uniform complete/embed/rerank across providers with ordered fallback,
// retry with capped exponential backoff, circuit breaking and cost accounting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::{ApiKeys, ModelSettings};
use crate::db::DatabasePool;
use crate::error::{MemoryError, Result};
use crate::monitor::CostMonitor;
use crate::utils::cost::CostTracker;

use super::circuit_breaker::CircuitBreaker;
use super::provider::{Provider, ProviderClient, TaskKind};
use super::{
    CallError, ChatMessage, CompletionParams, CompletionResponse, CostCategory,
    EmbeddingResponse, GeminiClient, OpenRouterClient, RerankResponse, SiliconFlowClient, Usage,
};

/// Uniform gateway over all model providers.
///
/// Owns the provider registry (each model name maps to exactly one
/// provider), the fallback chain for completions, per-provider circuit
/// breakers, and the global concurrency semaphore for model calls.
pub struct ModelGateway {
    clients: HashMap<Provider, Arc<dyn ProviderClient>>,
    routes: HashMap<String, Provider>,
    fallback_order: Vec<Provider>,
    breaker: CircuitBreaker,
    permits: Arc<Semaphore>,
    cost_tracker: Arc<CostTracker>,
    monitor: Option<Arc<CostMonitor>>,
    ledger: Option<Arc<DatabasePool>>,
    settings: ModelSettings,
}

impl ModelGateway {
    pub fn from_api_keys(
        api_keys: &ApiKeys,
        settings: ModelSettings,
        max_concurrent_requests: usize,
        cost_tracker: Arc<CostTracker>,
        http: reqwest::Client,
    ) -> Self {
        let mut clients: HashMap<Provider, Arc<dyn ProviderClient>> = HashMap::new();

        if let Some(key) = &api_keys.gemini {
            clients.insert(
                Provider::Gemini,
                Arc::new(GeminiClient::new(
                    key.clone(),
                    settings.gemini_base_url.clone(),
                    http.clone(),
                )),
            );
        }
        if let Some(key) = &api_keys.openrouter {
            clients.insert(
                Provider::OpenRouter,
                Arc::new(OpenRouterClient::new(
                    key.clone(),
                    settings.openrouter_base_url.clone(),
                    http.clone(),
                )),
            );
        }
        if let Some(key) = &api_keys.siliconflow {
            clients.insert(
                Provider::SiliconFlow,
                Arc::new(SiliconFlowClient::new(
                    key.clone(),
                    settings.siliconflow_base_url.clone(),
                    http.clone(),
                )),
            );
        }

        let available: Vec<_> = clients.keys().map(|p| p.to_string()).collect();
        info!(providers = ?available, "Model providers available");

        let mut routes = HashMap::new();
        for provider in [Provider::Gemini, Provider::OpenRouter, Provider::SiliconFlow] {
            for model in provider.declared_models() {
                routes.insert((*model).to_string(), provider);
            }
        }

        let fallback_order = settings
            .fallback_order
            .iter()
            .filter_map(|name| Provider::from_str(name))
            .collect();

        Self {
            clients,
            routes,
            fallback_order,
            breaker: CircuitBreaker::new(),
            permits: Arc::new(Semaphore::new(max_concurrent_requests.max(1))),
            cost_tracker,
            monitor: None,
            ledger: None,
            settings,
        }
    }

    /// Wire the cost monitor so every recorded cost updates budget buckets.
    pub fn with_cost_monitor(mut self, monitor: Arc<CostMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Wire the relational pool for the append-only cost ledger.
    pub fn with_ledger(mut self, pool: Arc<DatabasePool>) -> Self {
        self.ledger = Some(pool);
        self
    }

    pub fn has_providers(&self) -> bool {
        !self.clients.is_empty()
    }

    pub fn available_providers(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self.clients.keys().copied().collect();
        providers.sort_by_key(|p| p.to_string());
        providers
    }

    /// Which provider serves a model name.
    pub fn provider_for(&self, model: &str) -> Option<Provider> {
        self.routes.get(model).copied()
    }

    /// The ordered (provider, model) attempt list for a completion.
    ///
    /// The model's own provider goes first, then the remaining fallback
    /// chain with each provider's preferred model. Pure function of the
    /// registry, so the attempt sequence is identical across runs.
    pub fn attempt_plan(&self, model: &str) -> Vec<(Provider, String)> {
        let mut plan = Vec::new();
        if let Some(primary) = self.provider_for(model) {
            plan.push((primary, model.to_string()));
            for provider in &self.fallback_order {
                if *provider != primary {
                    plan.push((*provider, provider.preferred_model().to_string()));
                }
            }
        } else {
            // Unknown model: walk the whole chain with preferred models
            for provider in &self.fallback_order {
                plan.push((*provider, provider.preferred_model().to_string()));
            }
        }
        plan
    }

    /// Run a completion with ordered provider fallback.
    pub async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: CompletionParams,
    ) -> Result<CompletionResponse> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| MemoryError::Cancelled)?;

        let plan = self.attempt_plan(model);
        if plan.is_empty() {
            return Err(MemoryError::Config(
                "no providers in fallback order".to_string(),
            ));
        }

        let mut attempt_errors: Vec<String> = Vec::new();

        for (index, (provider, attempt_model)) in plan.iter().enumerate() {
            let Some(client) = self.clients.get(provider) else {
                attempt_errors.push(format!("{provider}: no API key configured"));
                continue;
            };
            if !self.breaker.is_available(*provider) {
                attempt_errors.push(format!("{provider}: circuit open"));
                continue;
            }

            match self
                .call_with_retry(|| client.complete(attempt_model, messages, &params))
                .await
            {
                Ok(mut response) => {
                    self.breaker.record_success(*provider);
                    response.cost_usd = self.record_cost(
                        attempt_model,
                        *provider,
                        response.usage,
                        TaskKind::Complete,
                        params.purpose,
                    );
                    if index > 0 {
                        response.metadata = json!({
                            "fallback": true,
                            "fallback_provider": provider.to_string(),
                            "fallback_attempt": index + 1,
                            "attempt_errors": attempt_errors.clone(),
                        });
                        info!(
                            provider = %provider,
                            model = %attempt_model,
                            attempt = index + 1,
                            "Completion served by fallback provider"
                        );
                    }
                    return Ok(response);
                }
                Err(e) => {
                    self.breaker.record_failure(*provider);
                    warn!(provider = %provider, model = %attempt_model, error = %e, "Provider attempt failed");
                    attempt_errors.push(format!("{provider}: {e}"));
                }
            }
        }

        Err(MemoryError::ExternalService(format!(
            "all providers failed for '{model}': [{}]",
            attempt_errors.join("; ")
        )))
    }

    /// Generate an embedding. Routed to the model's provider; no fallback
    /// chain (a different embedding model would live in a different space).
    pub async fn embed(&self, model: &str, text: &str) -> Result<EmbeddingResponse> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| MemoryError::Cancelled)?;

        let provider = self
            .provider_for(model)
            .ok_or_else(|| MemoryError::Config(format!("unknown embedding model: {model}")))?;
        let client = self.client_checked(provider)?;

        let mut response = self
            .call_with_retry(|| client.embed(model, text))
            .await
            .map_err(|e| self.classify(provider, e))?;
        self.breaker.record_success(provider);

        response.cost_usd = self.record_cost(
            model,
            provider,
            response.usage,
            TaskKind::Embed,
            CostCategory::Embedding,
        );
        Ok(response)
    }

    /// Rerank documents against a query.
    pub async fn rerank(
        &self,
        model: &str,
        query: &str,
        documents: &[String],
        top_k: Option<usize>,
    ) -> Result<RerankResponse> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| MemoryError::Cancelled)?;

        let provider = self
            .provider_for(model)
            .ok_or_else(|| MemoryError::Config(format!("unknown rerank model: {model}")))?;
        let client = self.client_checked(provider)?;

        let mut response = self
            .call_with_retry(|| client.rerank(model, query, documents, top_k))
            .await
            .map_err(|e| self.classify(provider, e))?;
        self.breaker.record_success(provider);

        response.cost_usd = self.record_cost(
            model,
            provider,
            response.usage,
            TaskKind::Rerank,
            CostCategory::Other,
        );
        Ok(response)
    }

    fn client_checked(&self, provider: Provider) -> Result<&Arc<dyn ProviderClient>> {
        let client = self.clients.get(&provider).ok_or_else(|| {
            MemoryError::Config(format!(
                "no API key configured for provider {provider} (set {})",
                provider.api_key_env_var()
            ))
        })?;
        // Breaker check comes last: an unconfigured provider must not
        // consume the single half-open probe slot
        if !self.breaker.is_available(provider) {
            return Err(MemoryError::ResourceExhausted(format!(
                "provider {provider} circuit is open"
            )));
        }
        Ok(client)
    }

    fn classify(&self, provider: Provider, e: CallError) -> MemoryError {
        self.breaker.record_failure(provider);
        match &e {
            CallError::Status { status: 429, .. } => {
                MemoryError::ResourceExhausted(e.to_string())
            }
            CallError::Network(inner) if inner.is_timeout() => MemoryError::Timeout(e.to_string()),
            _ => MemoryError::ExternalService(e.to_string()),
        }
    }

    /// Retry a provider call up to `max_retries` times with exponential
    /// backoff (base 1s, cap 60s). Only retryable errors (timeouts, 5xx,
    /// rate limits) are retried; other failures return immediately so the
    /// caller can move on to the next provider.
    async fn call_with_retry<T, F, Fut>(&self, mut op: F) -> std::result::Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, CallError>>,
    {
        let max_retries = self.settings.max_retries;
        let mut last_error: Option<CallError> = None;

        for attempt in 0..=max_retries {
            if attempt > 0 {
                let delay = self.backoff_delay(attempt, last_error.as_ref());
                debug!(attempt, ?delay, "Retrying provider call");
                tokio::time::sleep(delay).await;
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| CallError::InvalidResponse("retry loop exhausted".into())))
    }

    fn backoff_delay(&self, attempt: u32, last_error: Option<&CallError>) -> Duration {
        // Honor Retry-After when the provider sent one
        if let Some(secs) = last_error.and_then(|e| e.retry_after()) {
            return Duration::from_secs(secs).min(self.settings.backoff_cap);
        }
        let base = self.settings.backoff_base.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << (attempt - 1).min(16));
        let capped = exp.min(self.settings.backoff_cap.as_millis() as u64);
        // Small jitter to avoid thundering herds
        let jitter = rand::rng().random_range(0..=capped / 4 + 1);
        Duration::from_millis(capped + jitter)
    }

    /// Record cost for a successful call: in-memory tracker, budget monitor
    /// and the append-only relational ledger.
    fn record_cost(
        &self,
        model: &str,
        provider: Provider,
        usage: Usage,
        operation: TaskKind,
        category: CostCategory,
    ) -> f64 {
        let cost = self
            .cost_tracker
            .calculate(model, usage.prompt_tokens, usage.completion_tokens);

        if let Some(monitor) = &self.monitor {
            monitor.observe(category, cost);
        }

        if let Some(pool) = &self.ledger {
            let pool = pool.clone();
            let provider = provider.to_string();
            let model = model.to_string();
            let operation = operation.to_string();
            tokio::spawn(async move {
                let result = pool
                    .interact(move |conn| {
                        crate::db::costs::insert_cost_record_sync(
                            conn,
                            &provider,
                            &model,
                            &operation,
                            usage.prompt_tokens as i64,
                            usage.completion_tokens as i64,
                            cost,
                            None,
                        )
                        .map_err(Into::into)
                    })
                    .await;
                if let Err(e) = result {
                    warn!(error = %e, "Failed to record cost ledger row");
                }
            });
        }

        cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn gateway_with_keys(gemini: bool, openrouter: bool, siliconflow: bool) -> ModelGateway {
        let api_keys = ApiKeys {
            gemini: gemini.then(|| "gk".to_string()),
            openrouter: openrouter.then(|| "ok".to_string()),
            siliconflow: siliconflow.then(|| "sk".to_string()),
        };
        ModelGateway::from_api_keys(
            &api_keys,
            Settings::default().models,
            10,
            Arc::new(CostTracker::new()),
            reqwest::Client::new(),
        )
    }

    #[test]
    fn test_routes_cover_declared_models() {
        let gw = gateway_with_keys(true, true, true);
        assert_eq!(gw.provider_for("gemini-2.5-pro"), Some(Provider::Gemini));
        assert_eq!(gw.provider_for("deepseek-r1"), Some(Provider::OpenRouter));
        assert_eq!(
            gw.provider_for("Qwen/Qwen3-Embedding-8B"),
            Some(Provider::SiliconFlow)
        );
        assert_eq!(gw.provider_for("unknown-model"), None);
    }

    #[test]
    fn test_attempt_plan_primary_first_then_chain() {
        let gw = gateway_with_keys(true, true, true);
        let plan = gw.attempt_plan("deepseek-ai/DeepSeek-V2.5");
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0], (Provider::SiliconFlow, "deepseek-ai/DeepSeek-V2.5".to_string()));
        assert_eq!(plan[1].0, Provider::Gemini);
        assert_eq!(plan[2].0, Provider::OpenRouter);
    }

    #[test]
    fn test_attempt_plan_deterministic() {
        let gw = gateway_with_keys(true, true, true);
        let a = gw.attempt_plan("gemini-2.5-pro");
        let b = gw.attempt_plan("gemini-2.5-pro");
        assert_eq!(a, b);
        // Primary never repeats in the chain
        assert_eq!(
            a.iter().filter(|(p, _)| *p == Provider::Gemini).count(),
            1
        );
    }

    #[test]
    fn test_attempt_plan_unknown_model_uses_preferred() {
        let gw = gateway_with_keys(true, true, true);
        let plan = gw.attempt_plan("some-new-model");
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].1, Provider::Gemini.preferred_model());
    }

    #[test]
    fn test_available_providers_reflect_keys() {
        let gw = gateway_with_keys(false, true, false);
        assert_eq!(gw.available_providers(), vec![Provider::OpenRouter]);
        assert!(gw.has_providers());
        assert!(!gateway_with_keys(false, false, false).has_providers());
    }

    #[tokio::test]
    async fn test_complete_without_any_provider_aggregates_errors() {
        let gw = gateway_with_keys(false, false, false);
        let err = gw
            .complete("gemini-2.5-pro", &[ChatMessage::user("hi")], CompletionParams::default())
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("all providers failed"));
        assert!(msg.contains("gemini"));
        assert!(msg.contains("openrouter"));
        assert!(msg.contains("siliconflow"));
    }

    #[tokio::test]
    async fn test_embed_unknown_model_is_config_error() {
        let gw = gateway_with_keys(true, true, true);
        let err = gw.embed("mystery-embedder", "text").await.unwrap_err();
        assert!(matches!(err, MemoryError::Config(_)));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let gw = gateway_with_keys(true, false, false);
        let d1 = gw.backoff_delay(1, None);
        let d3 = gw.backoff_delay(3, None);
        assert!(d1 >= Duration::from_secs(1));
        assert!(d3 >= Duration::from_secs(4));
        let huge = gw.backoff_delay(20, None);
        // cap 60s plus at most 25% jitter
        assert!(huge <= Duration::from_millis(75_000));
    }

    #[test]
    fn test_backoff_honors_retry_after() {
        let gw = gateway_with_keys(true, false, false);
        let err = CallError::Status {
            status: 429,
            message: "slow down".into(),
            retry_after: Some(7),
        };
        assert_eq!(gw.backoff_delay(1, Some(&err)), Duration::from_secs(7));
    }
}
