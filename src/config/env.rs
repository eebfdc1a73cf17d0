// src/config/env.rs
// Environment-based configuration - single source of truth for env vars

use tracing::{debug, info, warn};

use super::Settings;

/// API keys loaded from environment variables
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// Gemini/Google API key (GEMINI_API_KEY or GOOGLE_API_KEY)
    pub gemini: Option<String>,
    /// OpenRouter API key (OPENROUTER_API_KEY)
    pub openrouter: Option<String>,
    /// SiliconFlow API key (SILICONFLOW_API_KEY)
    pub siliconflow: Option<String>,
}

impl ApiKeys {
    /// Load API keys from environment variables.
    ///
    /// Set `CLAUDE_MEMORY_DISABLE_LLM=1` to suppress all keys (forces the
    /// heuristic fallbacks everywhere a model call would happen).
    pub fn from_env() -> Self {
        if parse_bool_env("CLAUDE_MEMORY_DISABLE_LLM").unwrap_or(false) {
            info!("CLAUDE_MEMORY_DISABLE_LLM is set - model providers disabled");
            return Self::default();
        }

        let keys = Self {
            gemini: Self::read_key("GEMINI_API_KEY").or_else(|| Self::read_key("GOOGLE_API_KEY")),
            openrouter: Self::read_key("OPENROUTER_API_KEY"),
            siliconflow: Self::read_key("SILICONFLOW_API_KEY"),
        };
        keys.log_status();
        keys
    }

    /// Read a single API key from environment, filtering empty values
    fn read_key(name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|k| !k.trim().is_empty())
    }

    /// Check if any completion provider is available
    pub fn has_llm_provider(&self) -> bool {
        self.gemini.is_some() || self.openrouter.is_some() || self.siliconflow.is_some()
    }

    /// Check if embeddings are available (Gemini or SiliconFlow)
    pub fn has_embeddings(&self) -> bool {
        self.gemini.is_some() || self.siliconflow.is_some()
    }

    /// Check if reranking is available (SiliconFlow only)
    pub fn has_rerank(&self) -> bool {
        self.siliconflow.is_some()
    }

    /// Get a summary of configured providers
    pub fn summary(&self) -> String {
        let mut providers = Vec::new();
        if self.gemini.is_some() {
            providers.push("Gemini");
        }
        if self.openrouter.is_some() {
            providers.push("OpenRouter");
        }
        if self.siliconflow.is_some() {
            providers.push("SiliconFlow");
        }
        if providers.is_empty() {
            "None".to_string()
        } else {
            providers.join(", ")
        }
    }

    /// Log which API keys are available (without exposing values)
    fn log_status(&self) {
        if !self.has_llm_provider() {
            warn!("No API keys configured - compression, fusion and rerank will degrade");
        } else {
            debug!(providers = %self.summary(), "API keys loaded");
        }
    }
}

/// Configuration validation result
#[derive(Debug, Default)]
pub struct ConfigValidation {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ConfigValidation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Format as a human-readable report
    pub fn report(&self) -> String {
        let mut lines = Vec::new();
        if !self.errors.is_empty() {
            lines.push("Errors:".to_string());
            for err in &self.errors {
                lines.push(format!("  - {}", err));
            }
        }
        if !self.warnings.is_empty() {
            lines.push("Warnings:".to_string());
            for w in &self.warnings {
                lines.push(format!("  - {}", w));
            }
        }
        if lines.is_empty() {
            "Configuration OK".to_string()
        } else {
            lines.join("\n")
        }
    }
}

/// Environment configuration - API keys plus the full settings tree
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub api_keys: ApiKeys,
    pub settings: Settings,
}

impl EnvConfig {
    /// Load all environment configuration (call once at startup)
    pub fn load() -> Self {
        info!("Loading environment configuration");
        Self {
            api_keys: ApiKeys::from_env(),
            settings: Settings::from_env(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigValidation {
        let mut validation = self.settings.validate();

        if !self.api_keys.has_llm_provider() {
            validation.add_warning(
                "No model API keys configured. Set GEMINI_API_KEY, OPENROUTER_API_KEY or SILICONFLOW_API_KEY.",
            );
        }
        if !self.api_keys.has_embeddings() {
            validation.add_warning(
                "No embedding provider configured. Semantic search requires GEMINI_API_KEY or SILICONFLOW_API_KEY.",
            );
        }

        validation
    }
}

/// Parse a boolean-ish env var ("1"/"true"/"yes"/"on" and their negations).
pub fn parse_bool_env(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?.to_lowercase();
    match value.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_keys_default_empty() {
        let keys = ApiKeys::default();
        assert!(!keys.has_llm_provider());
        assert!(!keys.has_embeddings());
        assert!(!keys.has_rerank());
        assert_eq!(keys.summary(), "None");
    }

    #[test]
    fn test_api_keys_with_values() {
        let keys = ApiKeys {
            gemini: Some("test-key".to_string()),
            openrouter: None,
            siliconflow: None,
        };
        assert!(keys.has_llm_provider());
        assert!(keys.has_embeddings());
        assert!(!keys.has_rerank());
        assert_eq!(keys.summary(), "Gemini");
    }

    #[test]
    fn test_siliconflow_enables_rerank() {
        let keys = ApiKeys {
            gemini: None,
            openrouter: None,
            siliconflow: Some("sf".to_string()),
        };
        assert!(keys.has_rerank());
        assert!(keys.has_embeddings());
    }

    #[test]
    fn test_validation_without_keys_warns() {
        let config = EnvConfig {
            api_keys: ApiKeys::default(),
            settings: Settings::default(),
        };
        let validation = config.validate();
        assert!(validation.is_valid()); // warnings do not make it invalid
        assert!(!validation.warnings.is_empty());
    }
}
