// src/llm/siliconflow.rs
// SiliconFlow provider client - chat completions, embeddings and rerank

use async_trait::async_trait;
use serde_json::json;

use super::openrouter::{check_openai_status, parse_chat_response};
use super::provider::{Provider, ProviderClient, TaskKind};
use super::{
    CallError, ChatMessage, CompletionParams, CompletionResponse, EmbeddingResponse,
    RerankResponse, Usage,
};

pub struct SiliconFlowClient {
    api_key: String,
    base_url: String,
    http: reqwest::Client,
}

impl SiliconFlowClient {
    pub fn new(api_key: String, base_url: String, http: reqwest::Client) -> Self {
        Self {
            api_key,
            base_url,
            http,
        }
    }
}

#[async_trait]
impl ProviderClient for SiliconFlowClient {
    fn provider(&self) -> Provider {
        Provider::SiliconFlow
    }

    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn supported_tasks(&self) -> &'static [TaskKind] {
        &[TaskKind::Complete, TaskKind::Embed, TaskKind::Rerank]
    }

    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<CompletionResponse, CallError> {
        let mut body = json!({
            "model": model,
            "messages": messages,
            "temperature": params.temperature,
        });
        if let Some(max) = params.max_tokens {
            body["max_tokens"] = json!(max);
        }

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let json = check_openai_status(response).await?;
        let (content, usage) = parse_chat_response(&json)?;

        Ok(CompletionResponse {
            content,
            model: model.to_string(),
            provider: Provider::SiliconFlow,
            usage,
            cost_usd: 0.0,
            metadata: json!({}),
        })
    }

    async fn embed(&self, model: &str, text: &str) -> Result<EmbeddingResponse, CallError> {
        let body = json!({ "model": model, "input": text });

        let response = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let json = check_openai_status(response).await?;

        let vector: Vec<f32> = json["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| CallError::InvalidResponse("no embedding in response".into()))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();

        if vector.is_empty() {
            return Err(CallError::InvalidResponse("empty embedding".into()));
        }

        let usage = Usage::new(json["usage"]["prompt_tokens"].as_u64().unwrap_or(0), 0);
        let dimension = vector.len();

        Ok(EmbeddingResponse {
            vector,
            dimension,
            model: model.to_string(),
            provider: Provider::SiliconFlow,
            usage,
            cost_usd: 0.0,
        })
    }

    async fn rerank(
        &self,
        model: &str,
        query: &str,
        documents: &[String],
        top_k: Option<usize>,
    ) -> Result<RerankResponse, CallError> {
        let mut body = json!({
            "model": model,
            "query": query,
            "documents": documents,
        });
        if let Some(n) = top_k {
            body["top_n"] = json!(n);
        }

        let response = self
            .http
            .post(format!("{}/rerank", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let json = check_openai_status(response).await?;

        // Results come back sorted by score with an index into `documents`;
        // realign so scores[i] matches documents[i].
        let results = json["results"]
            .as_array()
            .ok_or_else(|| CallError::InvalidResponse("no rerank results".into()))?;

        let mut scores = vec![0.0f32; documents.len()];
        for item in results {
            let index = item["index"].as_u64().unwrap_or(0) as usize;
            let score = item["relevance_score"].as_f64().unwrap_or(0.0) as f32;
            if index < scores.len() {
                scores[index] = score;
            }
        }

        let usage = Usage::new(
            json["meta"]["tokens"]["input_tokens"]
                .as_u64()
                .or_else(|| json["usage"]["prompt_tokens"].as_u64())
                .unwrap_or(0),
            0,
        );

        Ok(RerankResponse {
            scores,
            model: model.to_string(),
            provider: Provider::SiliconFlow,
            usage,
            cost_usd: 0.0,
        })
    }
}
