// src/llm/gemini.rs
// Gemini provider client (generateContent / embedContent REST API)

use async_trait::async_trait;
use serde_json::{Value, json};

use super::provider::{Provider, ProviderClient, TaskKind};
use super::{
    CallError, ChatMessage, CompletionParams, CompletionResponse, EmbeddingResponse, Usage,
};

pub struct GeminiClient {
    api_key: String,
    base_url: String,
    http: reqwest::Client,
}

impl GeminiClient {
    pub fn new(api_key: String, base_url: String, http: reqwest::Client) -> Self {
        Self {
            api_key,
            base_url,
            http,
        }
    }

    /// Translate chat messages into Gemini's contents + systemInstruction shape.
    fn build_request(messages: &[ChatMessage], params: &CompletionParams) -> Value {
        let mut contents = Vec::new();
        let mut system_parts = Vec::new();

        for msg in messages {
            match msg.role.as_str() {
                "system" => system_parts.push(json!({ "text": msg.content })),
                "assistant" => contents.push(json!({
                    "role": "model",
                    "parts": [{ "text": msg.content }]
                })),
                _ => contents.push(json!({
                    "role": "user",
                    "parts": [{ "text": msg.content }]
                })),
            }
        }

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "temperature": params.temperature,
            }
        });
        if let Some(max) = params.max_tokens {
            body["generationConfig"]["maxOutputTokens"] = json!(max);
        }
        if !system_parts.is_empty() {
            body["systemInstruction"] = json!({ "parts": system_parts });
        }
        body
    }

    async fn check_status(response: reqwest::Response) -> Result<Value, CallError> {
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
}

#[async_trait]
impl ProviderClient for GeminiClient {
    fn provider(&self) -> Provider {
        Provider::Gemini
    }

    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn supported_tasks(&self) -> &'static [TaskKind] {
        &[TaskKind::Complete, TaskKind::Embed]
    }

    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<CompletionResponse, CallError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        );
        let body = Self::build_request(messages, params);

        let response = self.http.post(&url).json(&body).send().await?;
        let json = Self::check_status(response).await?;

        let content = json["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CallError::InvalidResponse("no candidate content".into()))?;

        let usage = Usage::new(
            json["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0),
            json["usageMetadata"]["candidatesTokenCount"]
                .as_u64()
                .unwrap_or(0),
        );

        Ok(CompletionResponse {
            content,
            model: model.to_string(),
            provider: Provider::Gemini,
            usage,
            cost_usd: 0.0,
            metadata: json!({}),
        })
    }

    async fn embed(&self, model: &str, text: &str) -> Result<EmbeddingResponse, CallError> {
        let url = format!(
            "{}/models/{}:embedContent?key={}",
            self.base_url, model, self.api_key
        );
        let body = json!({ "content": { "parts": [{ "text": text }] } });

        let response = self.http.post(&url).json(&body).send().await?;
        let json = Self::check_status(response).await?;

        let vector: Vec<f32> = json["embedding"]["values"]
            .as_array()
            .ok_or_else(|| CallError::InvalidResponse("no embedding values".into()))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();

        if vector.is_empty() {
            return Err(CallError::InvalidResponse("empty embedding".into()));
        }

        let dimension = vector.len();
        Ok(EmbeddingResponse {
            vector,
            dimension,
            model: model.to_string(),
            provider: Provider::Gemini,
            usage: Usage::new((text.len() / 4) as u64, 0),
            cost_usd: 0.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request_maps_roles() {
        let messages = vec![
            ChatMessage::system("be terse"),
            ChatMessage::user("hello"),
            ChatMessage::assistant("hi"),
        ];
        let body = GeminiClient::build_request(&messages, &CompletionParams::default());

        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be terse");
    }

    #[test]
    fn test_build_request_max_tokens_optional() {
        let messages = vec![ChatMessage::user("q")];
        let without = GeminiClient::build_request(&messages, &CompletionParams::default());
        assert!(without["generationConfig"]["maxOutputTokens"].is_null());

        let with = GeminiClient::build_request(
            &messages,
            &CompletionParams::default().with_max_tokens(100),
        );
        assert_eq!(with["generationConfig"]["maxOutputTokens"], 100);
    }

    #[test]
    fn test_availability_requires_key() {
        let client = GeminiClient::new(String::new(), "http://x".into(), reqwest::Client::new());
        assert!(!client.is_available());
        let client = GeminiClient::new("k".into(), "http://x".into(), reqwest::Client::new());
        assert!(client.is_available());
    }
}
