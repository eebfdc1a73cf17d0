// src/llm/provider.rs
// Provider abstraction - closed set of model API backends

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{CallError, ChatMessage, CompletionParams, CompletionResponse, EmbeddingResponse, RerankResponse};

/// Model provider types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gemini,
    OpenRouter,
    SiliconFlow,
}

impl Provider {
    /// Parse provider from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "gemini" => Some(Self::Gemini),
            "openrouter" => Some(Self::OpenRouter),
            "siliconflow" => Some(Self::SiliconFlow),
            _ => None,
        }
    }

    /// Environment variable carrying this provider's API key
    pub fn api_key_env_var(&self) -> &'static str {
        match self {
            Self::Gemini => "GEMINI_API_KEY",
            Self::OpenRouter => "OPENROUTER_API_KEY",
            Self::SiliconFlow => "SILICONFLOW_API_KEY",
        }
    }

    /// Preferred completion model when this provider is hit via fallback
    pub fn preferred_model(&self) -> &'static str {
        match self {
            Self::Gemini => "gemini-2.5-flash",
            Self::OpenRouter => "deepseek/deepseek-chat-v3-0324",
            Self::SiliconFlow => "deepseek-ai/DeepSeek-V2.5",
        }
    }

    /// Models this provider serves (used by the gateway routing table)
    pub fn declared_models(&self) -> &'static [&'static str] {
        match self {
            Self::Gemini => &["gemini-2.5-pro", "gemini-2.5-flash", "text-embedding-004"],
            Self::OpenRouter => &[
                "openai/gpt-4",
                "anthropic/claude-3.5-sonnet",
                "claude-3.5-sonnet",
                "deepseek/deepseek-chat-v3-0324",
                "deepseek-r1",
            ],
            Self::SiliconFlow => &[
                "Qwen/Qwen3-Embedding-8B",
                "Qwen/Qwen3-Reranker-8B",
                "deepseek-ai/DeepSeek-V2.5",
            ],
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gemini => write!(f, "gemini"),
            Self::OpenRouter => write!(f, "openrouter"),
            Self::SiliconFlow => write!(f, "siliconflow"),
        }
    }
}

/// Model API task kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Complete,
    Embed,
    Rerank,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::Embed => write!(f, "embed"),
            Self::Rerank => write!(f, "rerank"),
        }
    }
}

/// Trait all provider clients implement.
///
/// `embed` and `rerank` default to `Unsupported` - only providers that
/// declare the task override them.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider(&self) -> Provider;

    /// Whether the client is usable (has credentials)
    fn is_available(&self) -> bool;

    fn supported_tasks(&self) -> &'static [TaskKind];

    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<CompletionResponse, CallError>;

    async fn embed(&self, _model: &str, _text: &str) -> Result<EmbeddingResponse, CallError> {
        Err(CallError::Unsupported {
            provider: self.provider(),
            task: TaskKind::Embed,
        })
    }

    async fn rerank(
        &self,
        _model: &str,
        _query: &str,
        _documents: &[String],
        _top_k: Option<usize>,
    ) -> Result<RerankResponse, CallError> {
        Err(CallError::Unsupported {
            provider: self.provider(),
            task: TaskKind::Rerank,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_from_str() {
        assert_eq!(Provider::from_str("gemini"), Some(Provider::Gemini));
        assert_eq!(Provider::from_str("OpenRouter"), Some(Provider::OpenRouter));
        assert_eq!(Provider::from_str("SILICONFLOW"), Some(Provider::SiliconFlow));
        assert_eq!(Provider::from_str("openai"), None);
    }

    #[test]
    fn test_provider_display_roundtrip() {
        for p in [Provider::Gemini, Provider::OpenRouter, Provider::SiliconFlow] {
            assert_eq!(Provider::from_str(&p.to_string()), Some(p));
        }
    }

    #[test]
    fn test_api_key_env_vars() {
        assert_eq!(Provider::Gemini.api_key_env_var(), "GEMINI_API_KEY");
        assert_eq!(Provider::OpenRouter.api_key_env_var(), "OPENROUTER_API_KEY");
        assert_eq!(Provider::SiliconFlow.api_key_env_var(), "SILICONFLOW_API_KEY");
    }

    #[test]
    fn test_declared_models_disjoint() {
        let mut seen = std::collections::HashSet::new();
        for p in [Provider::Gemini, Provider::OpenRouter, Provider::SiliconFlow] {
            for m in p.declared_models() {
                assert!(seen.insert(*m), "model {m} declared by two providers");
            }
        }
    }
}
