// src/api/mod.rs
// HTTP API used by the collector and alternative clients

mod error;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::memory::injector::{InjectionMode, InjectionRequest};
use crate::memory::retriever::{RetrievalRequest, RetrievalStrategy};
use crate::memory::types::{Conversation, MemoryUnitType};
use crate::service::ServiceCore;

pub use error::ApiError;

/// Build the HTTP router over the shared service core.
pub fn router(core: Arc<ServiceCore>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/conversation/store", post(store_conversation_handler))
        .route("/memory/search", post(search_handler))
        .route("/memory/inject", post(inject_handler))
        .with_state(core)
}

async fn health_handler(State(core): State<Arc<ServiceCore>>) -> Json<Value> {
    Json(core.health(false).await)
}

async fn store_conversation_handler(
    State(core): State<Arc<ServiceCore>>,
    Json(conversation): Json<Conversation>,
) -> Result<Json<Value>, ApiError> {
    if conversation.messages.is_empty() {
        return Err(ApiError::validation("conversation has no messages"));
    }

    let conversation_id = conversation.id.clone();
    let memory_unit_id = core.store_conversation(conversation).await?;

    Ok(Json(json!({
        "success": true,
        "conversation_id": conversation_id,
        "memory_unit_id": memory_unit_id,
    })))
}

/// Search request DTO
#[derive(Debug, Deserialize)]
pub struct SearchDto {
    pub query: String,
    #[serde(default)]
    pub query_type: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub min_score: Option<f64>,
    #[serde(default)]
    pub memory_types: Option<Vec<String>>,
    #[serde(default)]
    pub include_expired: bool,
    #[serde(default)]
    pub project_id: Option<String>,
}

async fn search_handler(
    State(core): State<Arc<ServiceCore>>,
    Json(dto): Json<SearchDto>,
) -> Result<Json<Value>, ApiError> {
    if dto.query.trim().is_empty() {
        return Err(ApiError::validation("query must not be empty"));
    }

    let strategy = match dto.query_type.as_deref() {
        None | Some("hybrid") => RetrievalStrategy::Hybrid,
        Some("semantic_only") => RetrievalStrategy::SemanticOnly,
        Some("keyword_only") => RetrievalStrategy::KeywordOnly,
        Some(other) => {
            return Err(ApiError::validation(format!("unknown query_type: {other}")));
        }
    };

    let unit_types = match &dto.memory_types {
        None => None,
        Some(raw) => {
            let mut types = Vec::with_capacity(raw.len());
            for name in raw {
                let parsed = MemoryUnitType::from_alias(name)
                    .ok_or_else(|| ApiError::validation(format!("unknown memory type: {name}")))?;
                types.push(parsed);
            }
            Some(types)
        }
    };

    let start = Instant::now();
    let mut request = RetrievalRequest::new(dto.query.clone());
    request.project_id = dto
        .project_id
        .or_else(|| Some(core.settings.project_id.clone()));
    request.limit = dto.limit.unwrap_or(5).clamp(1, 20);
    request.min_score = dto.min_score.unwrap_or(0.6);
    request.include_expired = dto.include_expired;
    request.unit_types = unit_types;
    request.strategy = strategy;

    let result = core.search_memories(request).await?;
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

    Ok(Json(json!({
        "success": true,
        "query": dto.query,
        "results": results,
        "total_found": result.total_found,
        "search_time_ms": start.elapsed().as_secs_f64() * 1000.0,
        "metadata": result.metadata,
    })))
}

/// Inject request DTO
#[derive(Debug, Deserialize)]
pub struct InjectDto {
    pub original_prompt: String,
    #[serde(default)]
    pub query_text: Option<String>,
    #[serde(default)]
    pub context_hint: Option<String>,
    #[serde(default)]
    pub injection_mode: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

async fn inject_handler(
    State(core): State<Arc<ServiceCore>>,
    Json(dto): Json<InjectDto>,
) -> Result<Json<Value>, ApiError> {
    if dto.original_prompt.trim().is_empty() {
        return Err(ApiError::validation("original_prompt must not be empty"));
    }

    let mode = match dto.injection_mode.as_deref() {
        None => InjectionMode::default(),
        Some(raw) => raw
            .parse::<InjectionMode>()
            .map_err(|_| ApiError::validation(format!("unknown injection_mode: {raw}")))?,
    };

    let start = Instant::now();
    let request = InjectionRequest {
        original_prompt: dto.original_prompt.clone(),
        query_text: dto.query_text,
        context_hint: dto.context_hint,
        project_id: dto
            .project_id
            .or_else(|| Some(core.settings.project_id.clone())),
        conversation_id: dto.conversation_id,
        injection_mode: mode,
        max_tokens: dto.max_tokens,
    };

    let response = core.inject_context(&request).await?;
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

    Ok(Json(json!({
        "success": true,
        "enhanced_prompt": response.enhanced_prompt(&dto.original_prompt),
        "injected_memories": injected,
        "tokens_used": response.token_count,
        "processing_time_ms": start.elapsed().as_secs_f64() * 1000.0,
        "metadata": response.metadata,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiKeys, EnvConfig, Settings};
    use crate::db::DatabasePool;
    use crate::memory::types::MessageType;
    use crate::vector::VectorStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const DIM: usize = 8;

    async fn app() -> (Router, Arc<ServiceCore>) {
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

        let core = ServiceCore::initialize_with_stores(&env, pool, vector)
            .await
            .expect("core");
        (router(core.clone()), core)
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (app, _) = app().await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["health_status"].is_string());
    }

    #[tokio::test]
    async fn test_store_conversation_roundtrip() {
        let (app, core) = app().await;
        let mut conv = Conversation::new("default");
        conv.push_message(MessageType::Human, "what is a b-tree");
        conv.push_message(MessageType::Assistant, "a balanced search tree");
        let conv_id = conv.id.clone();

        let response = app
            .oneshot(post_json(
                "/conversation/store",
                serde_json::to_value(&conv).unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["conversation_id"], conv_id.as_str());

        let stored = core
            .pool
            .run(move |conn| {
                crate::db::conversations::get_conversation_sync(conn, &conv_id)
            })
            .await
            .unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn test_store_empty_conversation_is_400() {
        let (app, _) = app().await;
        let conv = Conversation::new("default");
        let response = app
            .oneshot(post_json(
                "/conversation/store",
                serde_json::to_value(&conv).unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error_code"], "VALIDATION");
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_search_endpoint_keyword_path() {
        let (app, core) = app().await;
        let mut unit =
            crate::memory::types::MemoryUnit::new("default", None, MemoryUnitType::Conversation);
        unit.title = "sqlite wal checkpointing".into();
        unit.summary = "summary about sqlite wal checkpointing".into();
        unit.content = "content about sqlite wal".into();
        unit.set_keywords(vec!["sqlite".into(), "wal".into()]);
        let mut v = vec![0.0f32; DIM];
        v[0] = 1.0;
        assert!(core.retriever.store_with_embedding(&unit, v).await.unwrap());

        let response = app
            .oneshot(post_json(
                "/memory/search",
                json!({
                    "query": "sqlite wal",
                    "query_type": "keyword_only",
                    "min_score": 0.1,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["results"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_search_unknown_query_type_is_400() {
        let (app, _) = app().await;
        let response = app
            .oneshot(post_json(
                "/memory/search",
                json!({ "query": "x", "query_type": "psychic" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_inject_endpoint_empty_store() {
        let (app, _) = app().await;
        let response = app
            .oneshot(post_json(
                "/memory/inject",
                json!({ "original_prompt": "plan the migration", "max_tokens": 500 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["enhanced_prompt"], "plan the migration");
    }
}
