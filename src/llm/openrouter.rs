// src/llm/openrouter.rs
// OpenRouter provider client (OpenAI-compatible chat completions)

use async_trait::async_trait;
use serde_json::{Value, json};

use super::provider::{Provider, ProviderClient, TaskKind};
use super::{CallError, ChatMessage, CompletionParams, CompletionResponse, Usage};

pub struct OpenRouterClient {
    api_key: String,
    base_url: String,
    http: reqwest::Client,
}

impl OpenRouterClient {
    pub fn new(api_key: String, base_url: String, http: reqwest::Client) -> Self {
        Self {
            api_key,
            base_url,
            http,
        }
    }
}

/// Parse an OpenAI-compatible error response into a classified CallError.
pub(super) async fn check_openai_status(response: reqwest::Response) -> Result<Value, CallError> {
    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let message = response.text().await.unwrap_or_default();
        return Err(CallError::Status {
            status: status.as_u16(),
            message,
            retry_after,
        });
    }
    response.json().await.map_err(CallError::Network)
}

/// Extract content + usage from an OpenAI-compatible chat response.
pub(super) fn parse_chat_response(json: &Value) -> Result<(String, Usage), CallError> {
    let content = json["choices"][0]["message"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CallError::InvalidResponse("no choice content".into()))?
        .to_string();

    let usage = Usage::new(
        json["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
        json["usage"]["completion_tokens"].as_u64().unwrap_or(0),
    );

    Ok((content, usage))
}

#[async_trait]
impl ProviderClient for OpenRouterClient {
    fn provider(&self) -> Provider {
        Provider::OpenRouter
    }

    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn supported_tasks(&self) -> &'static [TaskKind] {
        &[TaskKind::Complete]
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
            provider: Provider::OpenRouter,
            usage,
            cost_usd: 0.0,
            metadata: json!({}),
        })
    }
}
