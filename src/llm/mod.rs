// src/llm/mod.rs
// Model provider layer: uniform complete/embed/rerank across providers

mod circuit_breaker;
mod gateway;
mod gemini;
mod openrouter;
pub mod provider;
mod siliconflow;

pub use circuit_breaker::CircuitBreaker;
pub use gateway::ModelGateway;
pub use gemini::GeminiClient;
pub use openrouter::OpenRouterClient;
pub use provider::{Provider, ProviderClient, TaskKind};
pub use siliconflow::SiliconFlowClient;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Message in a model conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system" | "user" | "assistant"
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Which daily budget bucket a model call belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CostCategory {
    Embedding,
    Fusion,
    Compression,
    #[default]
    Other,
}

/// Tunables for a completion request
#[derive(Debug, Clone)]
pub struct CompletionParams {
    pub temperature: f32,
    pub max_tokens: Option<usize>,
    pub purpose: CostCategory,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: None,
            purpose: CostCategory::Other,
        }
    }
}

impl CompletionParams {
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn for_purpose(mut self, purpose: CostCategory) -> Self {
        self.purpose = purpose;
        self
    }
}

/// Normalized usage statistics across all providers
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Usage {
    pub fn new(prompt: u64, completion: u64) -> Self {
        Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
        }
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Result of a completion call
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    pub provider: Provider,
    pub usage: Usage,
    pub cost_usd: f64,
    pub metadata: Value,
}

/// Result of an embedding call
#[derive(Debug, Clone)]
pub struct EmbeddingResponse {
    pub vector: Vec<f32>,
    pub dimension: usize,
    pub model: String,
    pub provider: Provider,
    pub usage: Usage,
    pub cost_usd: f64,
}

/// Result of a rerank call - scores aligned to the input document order
#[derive(Debug, Clone)]
pub struct RerankResponse {
    pub scores: Vec<f32>,
    pub model: String,
    pub provider: Provider,
    pub usage: Usage,
    pub cost_usd: f64,
}

/// Error from a single provider call, classified for retry decisions.
#[derive(Error, Debug)]
pub enum CallError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("provider returned {status}: {message}")]
    Status {
        status: u16,
        message: String,
        /// Parsed Retry-After header, seconds
        retry_after: Option<u64>,
    },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("{task} not supported by provider {provider}")]
    Unsupported { provider: Provider, task: TaskKind },

    #[error("no API key configured for provider {0}")]
    NotConfigured(Provider),
}

impl CallError {
    /// Timeouts, connection failures, 5xx and 429 are worth retrying on the
    /// same provider. Other 4xx short-circuit straight to fallback.
    pub fn is_retryable(&self) -> bool {
        match self {
            CallError::Network(e) => e.is_timeout() || e.is_connect(),
            CallError::Status { status, message, .. } => {
                *status >= 500 || *status == 429 || message.to_lowercase().contains("overloaded")
            }
            _ => false,
        }
    }

    /// Suggested wait before the next retry, when the provider told us.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            CallError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
