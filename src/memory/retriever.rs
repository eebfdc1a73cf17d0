// src/memory/retriever.rs
// Hybrid retrieval (vector + keyword) with rerank, and the transactional
// dual-store write that keeps the relational and vector stores consistent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{Value, json};
use strum::{Display, EnumString};
use tracing::{debug, info, warn};

use crate::config::{MemorySettings, ModelSettings, PerformanceSettings};
use crate::db::{DatabasePool, embeddings as db_embeddings, memory_units as db_units};
use crate::error::{MemoryError, Result};
use crate::llm::ModelGateway;
use crate::utils::cache::BoundedCache;
use crate::utils::short_hash;
use crate::utils::text::TextProcessor;
use crate::vector::{VectorFilter, VectorPayload, VectorStore};

use super::types::{MatchType, MemoryUnit, MemoryUnitType, SearchResult};

/// Retrieval strategy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum RetrievalStrategy {
    #[default]
    Hybrid,
    SemanticOnly,
    KeywordOnly,
}

/// Retrieval request
#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub query: String,
    /// None searches across all projects (the legacy global alias)
    pub project_id: Option<String>,
    pub conversation_id: Option<String>,
    pub limit: usize,
    pub min_score: f64,
    pub include_expired: bool,
    pub unit_types: Option<Vec<MemoryUnitType>>,
    pub rerank: bool,
    pub strategy: RetrievalStrategy,
}

impl RetrievalRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            project_id: None,
            conversation_id: None,
            limit: 20,
            min_score: 0.2,
            include_expired: false,
            unit_types: None,
            rerank: true,
            strategy: RetrievalStrategy::Hybrid,
        }
    }
}

/// Retrieval result
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub results: Vec<SearchResult>,
    pub total_found: usize,
    pub search_time_ms: f64,
    pub rerank_time_ms: Option<f64>,
    pub strategy: String,
    pub metadata: Value,
}

impl RetrievalResult {
    fn empty(strategy: &str) -> Self {
        Self {
            results: Vec::new(),
            total_found: 0,
            search_time_ms: 0.0,
            rerank_time_ms: None,
            strategy: strategy.to_string(),
            metadata: json!({}),
        }
    }
}

/// The only writer to the vector store and the embeddings table.
pub struct SemanticRetriever {
    gateway: Arc<ModelGateway>,
    pool: Arc<DatabasePool>,
    vector: Arc<VectorStore>,
    text: TextProcessor,
    memory_settings: MemorySettings,
    model_settings: ModelSettings,
    embedding_cache: BoundedCache<Vec<f32>>,
    search_cache: BoundedCache<RetrievalResult>,
}

impl SemanticRetriever {
    pub fn new(
        gateway: Arc<ModelGateway>,
        pool: Arc<DatabasePool>,
        vector: Arc<VectorStore>,
        memory_settings: MemorySettings,
        model_settings: ModelSettings,
        performance: &PerformanceSettings,
    ) -> Self {
        Self {
            gateway,
            pool,
            vector,
            text: TextProcessor::new(),
            memory_settings,
            model_settings,
            embedding_cache: BoundedCache::new(performance.embedding_cache_size),
            search_cache: BoundedCache::new(performance.search_cache_size),
        }
    }

    /// Ensure the vector collection exists with the configured dimension.
    pub async fn initialize(&self) -> Result<()> {
        self.vector.ensure_collection().await
    }

    // ------------------------------------------------------------------
    // Dual-store write
    // ------------------------------------------------------------------

    /// Store a memory unit across both backends.
    ///
    /// Order: embed, vector upsert, then one relational transaction holding
    /// the unit row and its embedding record. A relational failure (FK
    /// violation included) triggers the compensating vector delete, so
    /// readers never observe a vector point without its relational row.
    ///
    /// Returns false when either store rejected the write (and the other
    /// was rolled back); true on full success.
    pub async fn store_with_transaction(&self, unit: &MemoryUnit) -> Result<bool> {
        let embed_input = self
            .text
            .normalize(&format!("{} {}", unit.summary, unit.content));
        let vector = self.embed_cached(&embed_input).await?;
        self.store_with_embedding(unit, vector).await
    }

    /// Dual-store write with a pre-computed embedding vector.
    pub async fn store_with_embedding(
        &self,
        unit: &MemoryUnit,
        vector: Vec<f32>,
    ) -> Result<bool> {
        if vector.len() != self.vector.dimension() {
            return Err(MemoryError::Validation(format!(
                "embedding dimension {} does not match collection dimension {}",
                vector.len(),
                self.vector.dimension()
            )));
        }

        let payload = VectorPayload::from_unit(unit);
        if let Err(e) = self.vector.upsert(&unit.id, vector.clone(), payload).await {
            warn!(memory_unit_id = %unit.id, error = %e, "Vector upsert failed, nothing stored");
            return Ok(false);
        }

        let unit_for_tx = unit.clone();
        let model_name = self.model_settings.default_embedding_model.clone();
        let relational = self
            .pool
            .run(move |conn| -> std::result::Result<(), rusqlite::Error> {
                let tx = conn.unchecked_transaction()?;
                db_units::insert_memory_unit_sync(&tx, &unit_for_tx)?;
                db_embeddings::insert_embedding_record_sync(
                    &tx,
                    &unit_for_tx.id,
                    &model_name,
                    &vector,
                )?;
                tx.commit()
            })
            .await;

        match relational {
            Ok(()) => {
                info!(
                    memory_unit_id = %unit.id,
                    unit_type = %unit.unit_type,
                    "Memory unit stored in both backends"
                );
                Ok(true)
            }
            Err(e) => {
                warn!(
                    memory_unit_id = %unit.id,
                    error = %e,
                    "Relational write failed, compensating vector delete"
                );
                if let Err(rollback) = self.vector.delete(&[unit.id.clone()]).await {
                    // The cleanup loop will reconcile the orphan point later
                    warn!(
                        memory_unit_id = %unit.id,
                        error = %rollback,
                        "Compensating vector delete failed"
                    );
                }
                Ok(false)
            }
        }
    }

    /// Delete a unit from both stores. Vector delete runs first because it
    /// is idempotent - a retry after a crash between the two steps is safe.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.vector.delete(&[id.to_string()]).await?;

        let id_owned = id.to_string();
        self.pool
            .run(move |conn| -> std::result::Result<bool, rusqlite::Error> {
                let tx = conn.unchecked_transaction()?;
                db_embeddings::delete_embedding_record_sync(&tx, &id_owned)?;
                let deleted = db_units::delete_memory_unit_sync(&tx, &id_owned)?;
                tx.commit()?;
                Ok(deleted)
            })
            .await
    }

    // ------------------------------------------------------------------
    // Retrieval
    // ------------------------------------------------------------------

    /// Hybrid retrieval: Top-K initial recall, expiry filter, rerank to
    /// Top-N. Never fails for "no results" - that is an empty result set.
    pub async fn retrieve(&self, request: &RetrievalRequest) -> Result<RetrievalResult> {
        let cache_key = self.search_cache_key(request);
        if let Some(cached) = self.search_cache.get(&cache_key) {
            debug!("Search cache hit");
            return Ok(cached);
        }

        let start = Instant::now();

        let mut results = match request.strategy {
            RetrievalStrategy::SemanticOnly => match self.semantic_search(request).await {
                Ok(results) => results,
                Err(e) => {
                    warn!(error = %e, "Semantic search failed");
                    let mut empty = RetrievalResult::empty("semantic_only");
                    empty.metadata = json!({ "error": e.to_string() });
                    return Ok(empty);
                }
            },
            RetrievalStrategy::KeywordOnly => self.keyword_search(request).await?,
            RetrievalStrategy::Hybrid => self.hybrid_search(request).await?,
        };

        if !request.include_expired {
            let now = Utc::now();
            results.retain(|r| !r.memory_unit.is_expired(now));
        }

        let total_found = results.len();

        let mut rerank_time_ms = None;
        if request.rerank && !results.is_empty() {
            let rerank_start = Instant::now();
            results = self.rerank_results(&request.query, results).await;
            rerank_time_ms = Some(rerank_start.elapsed().as_secs_f64() * 1000.0);
        }

        let filtered: Vec<SearchResult> = results
            .into_iter()
            .filter(|r| r.relevance_score >= request.min_score)
            .take(request.limit)
            .collect();

        let result = RetrievalResult {
            metadata: json!({
                "query": request.query,
                "total_candidates": total_found,
                "returned": filtered.len(),
                "min_score": request.min_score,
                "include_expired": request.include_expired,
            }),
            total_found,
            search_time_ms: start.elapsed().as_secs_f64() * 1000.0,
            rerank_time_ms,
            strategy: request.strategy.to_string(),
            results: filtered,
        };

        self.search_cache.insert(cache_key, result.clone());

        info!(
            query = %crate::utils::truncate_chars(&request.query, 50),
            strategy = %result.strategy,
            total_found = result.total_found,
            returned = result.results.len(),
            search_time_ms = result.search_time_ms,
            "Memory retrieval completed"
        );
        Ok(result)
    }

    async fn semantic_search(&self, request: &RetrievalRequest) -> Result<Vec<SearchResult>> {
        let query_vector = self.embed_cached(&request.query).await?;

        let mut filter = VectorFilter {
            project_id: request.project_id.clone(),
            conversation_id: request.conversation_id.clone(),
            unit_types: request
                .unit_types
                .as_ref()
                .map(|types| types.iter().map(|t| t.to_string()).collect()),
            not_expired_at: None,
        };
        if !request.include_expired {
            filter = filter.not_expired_now();
        }

        // Over-fetch for the rerank stage, with a slightly loose threshold;
        // exact min_score filtering happens after rerank
        let hits = self
            .vector
            .search(
                query_vector,
                request.limit * 2,
                &filter,
                Some((request.min_score * 0.8) as f32),
            )
            .await?;

        let ids: Vec<String> = hits.iter().map(|h| h.id.clone()).collect();
        let units = self
            .pool
            .run(move |conn| db_units::get_memory_units_by_ids_sync(conn, &ids))
            .await?;
        let mut by_id: HashMap<String, MemoryUnit> =
            units.into_iter().map(|u| (u.id.clone(), u)).collect();

        // Vector hits without a relational row are dropped silently -
        // a delete may have raced this read
        let results = hits
            .into_iter()
            .filter_map(|hit| {
                let mut unit = by_id.remove(&hit.id)?;
                unit.relevance_score = hit.score as f64;
                Some(SearchResult {
                    relevance_score: hit.score as f64,
                    match_type: MatchType::Semantic,
                    matched_keywords: Vec::new(),
                    memory_unit: unit,
                })
            })
            .collect();
        Ok(results)
    }

    async fn keyword_search(&self, request: &RetrievalRequest) -> Result<Vec<SearchResult>> {
        let keywords = self.text.extract_keywords(&request.query, 20);
        if keywords.is_empty() {
            return Ok(Vec::new());
        }

        let project_id = request.project_id.clone();
        let unit_types = request.unit_types.clone();
        let include_expired = request.include_expired;
        let limit = request.limit * 2;
        let keywords_for_db = keywords.clone();

        let candidates = self
            .pool
            .run(move |conn| {
                db_units::keyword_candidates_sync(
                    conn,
                    &db_units::KeywordQuery {
                        project_id: project_id.as_deref(),
                        keywords: &keywords_for_db,
                        unit_types: unit_types.as_deref(),
                        include_expired,
                        limit,
                    },
                )
            })
            .await?;

        let results = candidates
            .into_iter()
            .filter_map(|mut unit| {
                let (score, matched) = Self::keyword_score(&unit, &keywords);
                if score < request.min_score * 0.5 {
                    return None;
                }
                unit.relevance_score = score;
                Some(SearchResult {
                    relevance_score: score,
                    match_type: MatchType::Keyword,
                    matched_keywords: matched,
                    memory_unit: unit,
                })
            })
            .collect();
        Ok(results)
    }

    /// Direct keyword hits count 1.0; title and summary matches count 0.5
    /// and 0.3. Normalized by the query keyword count, capped at 1.
    fn keyword_score(unit: &MemoryUnit, query_keywords: &[String]) -> (f64, Vec<String>) {
        let title = unit.title.to_lowercase();
        let summary = unit.summary.to_lowercase();
        let unit_keywords: Vec<String> =
            unit.keywords.iter().map(|k| k.to_lowercase()).collect();

        let mut score = 0.0;
        let mut matched = Vec::new();
        for keyword in query_keywords {
            let lower = keyword.to_lowercase();
            if unit_keywords.contains(&lower) {
                matched.push(keyword.clone());
                score += 1.0;
            }
            if title.contains(&lower) {
                score += 0.5;
            }
            if summary.contains(&lower) {
                score += 0.3;
            }
        }

        ((score / query_keywords.len() as f64).min(1.0), matched)
    }

    /// Run both paths concurrently and join by unit id. Overlapping hits
    /// get a keyword boost on top of their semantic score.
    async fn hybrid_search(&self, request: &RetrievalRequest) -> Result<Vec<SearchResult>> {
        let (semantic, keyword) = tokio::join!(
            self.semantic_search(request),
            self.keyword_search(request)
        );

        let semantic = semantic.unwrap_or_else(|e| {
            warn!(error = %e, "Semantic search failed in hybrid mode");
            Vec::new()
        });
        let keyword = keyword.unwrap_or_else(|e| {
            warn!(error = %e, "Keyword search failed in hybrid mode");
            Vec::new()
        });

        let mut combined: HashMap<String, SearchResult> = HashMap::new();
        for result in semantic {
            combined.insert(result.memory_unit.id.clone(), result);
        }
        for result in keyword {
            match combined.entry(result.memory_unit.id.clone()) {
                std::collections::hash_map::Entry::Occupied(mut entry) => {
                    let existing = entry.get_mut();
                    existing.relevance_score =
                        (existing.relevance_score + result.relevance_score * 0.3).min(1.0);
                    existing.memory_unit.relevance_score = existing.relevance_score;
                    existing.match_type = MatchType::Hybrid;
                    existing
                        .matched_keywords
                        .extend(result.matched_keywords.clone());
                }
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert(result);
                }
            }
        }

        let mut results: Vec<SearchResult> = combined.into_values().collect();
        results.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(results)
    }

    /// Top-K -> Top-N rerank. Primary path asks the rerank model to score
    /// `summary + content` against the query; on any failure the
    /// rule-based relevance/time/importance blend takes over.
    async fn rerank_results(
        &self,
        query: &str,
        mut results: Vec<SearchResult>,
    ) -> Vec<SearchResult> {
        let top_n = self.memory_settings.rerank_top_k;

        let documents: Vec<String> = results
            .iter()
            .map(|r| format!("{} {}", r.memory_unit.summary, r.memory_unit.content))
            .collect();

        match self
            .gateway
            .rerank(
                &self.model_settings.default_rerank_model,
                query,
                &documents,
                Some(top_n),
            )
            .await
        {
            Ok(response) => {
                for (i, result) in results.iter_mut().enumerate() {
                    if let Some(score) = response.scores.get(i) {
                        result.relevance_score = *score as f64;
                        result.memory_unit.relevance_score = *score as f64;
                    }
                }
                results.sort_by(|a, b| {
                    b.relevance_score
                        .partial_cmp(&a.relevance_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                results.truncate(top_n);
                results
            }
            Err(e) => {
                debug!(error = %e, "Model rerank unavailable, using rule-based blend");
                Self::rule_based_rerank(&mut results);
                results.truncate(top_n);
                results
            }
        }
    }

    /// 0.6 * base + 0.3 * time_decay + 0.1 * importance,
    /// with time_decay = max(0.1, 1 - age_days / 30).
    fn rule_based_rerank(results: &mut [SearchResult]) {
        let now = Utc::now();
        for result in results.iter_mut() {
            let base = result.relevance_score;
            let age_days = (now - result.memory_unit.created_at).num_days() as f64;
            let time_decay = (1.0 - age_days / 30.0).max(0.1);
            let importance = result.memory_unit.importance_score();

            let blended = (base * 0.6 + time_decay * 0.3 + importance * 0.1).min(1.0);
            result.relevance_score = blended;
            result.memory_unit.relevance_score = blended;
        }
        results.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    /// Embed with the process-wide LRU keyed by a hash of the normalized
    /// text. A cached vector equals a freshly computed one for that model.
    async fn embed_cached(&self, text: &str) -> Result<Vec<f32>> {
        let normalized = self.text.normalize(text);
        let key = short_hash(&normalized);
        if let Some(vector) = self.embedding_cache.get(&key) {
            debug!("Embedding cache hit");
            return Ok(vector);
        }

        let response = self
            .gateway
            .embed(&self.model_settings.default_embedding_model, &normalized)
            .await?;
        self.embedding_cache.insert(key, response.vector.clone());
        Ok(response.vector)
    }

    fn search_cache_key(&self, request: &RetrievalRequest) -> String {
        let types = request
            .unit_types
            .as_ref()
            .map(|t| {
                let mut names: Vec<String> = t.iter().map(|u| u.to_string()).collect();
                names.sort();
                names.join(",")
            })
            .unwrap_or_default();
        short_hash(&format!(
            "{}|{:?}|{:?}|{}|{}|{}|{}|{}|{}",
            request.query,
            request.project_id,
            request.conversation_id,
            request.limit,
            request.min_score,
            request.include_expired,
            types,
            request.rerank,
            request.strategy,
        ))
    }

    /// Cache statistics for the status surface.
    pub fn cache_stats(&self) -> Value {
        let emb = self.embedding_cache.stats();
        let search = self.search_cache.stats();
        json!({
            "embedding_cache": { "hits": emb.hits, "misses": emb.misses, "len": emb.len },
            "search_cache": { "hits": search.hits, "misses": search.misses, "len": search.len },
        })
    }
}
