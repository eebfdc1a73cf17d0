// src/config/settings.rs
// Typed settings tree with enum-validated options

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::{ConfigValidation, parse_bool_env};

/// Memory operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum MemoryMode {
    EmbeddingOnly,
    IntelligentCompression,
    Hybrid,
}

/// Vector distance metric for the collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum DistanceMetric {
    Cosine,
    Dot,
    Euclid,
}

/// Output language for fused context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FuserLanguage {
    Zh,
    En,
}

/// Relational store configuration
#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    /// Path to the main SQLite file
    pub path: PathBuf,
    /// Connection pool size
    pub pool_size: usize,
    /// Additional overflow connections allowed under load
    pub max_overflow: usize,
    /// Checkout timeout
    pub pool_timeout: Duration,
}

/// Vector collection configuration
#[derive(Debug, Clone)]
pub struct VectorSettings {
    /// Path to the vector SQLite file (separate from the main store)
    pub path: PathBuf,
    pub collection_name: String,
    pub vector_size: usize,
    pub distance_metric: DistanceMetric,
    pub timeout: Duration,
}

/// Model provider configuration
#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub openrouter_base_url: String,
    pub siliconflow_base_url: String,
    pub gemini_base_url: String,

    pub default_light_model: String,
    pub default_heavy_model: String,
    pub default_embedding_model: String,
    pub default_rerank_model: String,

    /// Ordered provider fallback chain for completions
    pub fallback_order: Vec<String>,

    pub request_timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

/// Memory pipeline configuration
#[derive(Debug, Clone)]
pub struct MemorySettings {
    pub mode: MemoryMode,

    // Fusion
    pub fuser_enabled: bool,
    pub fuser_model: String,
    pub fuser_temperature: f32,
    pub fuser_token_limit: usize,
    pub fuser_language: FuserLanguage,
    pub fuser_prompt_template_path: PathBuf,

    // Summary / manual review
    pub summary_model: String,
    pub summary_max_tokens: usize,
    pub summary_manual_trigger_command: String,
    pub summary_auto_trigger_keywords: Vec<String>,

    // Memory units
    pub quality_threshold: f64,
    pub retention_days: i64,
    pub max_summary_length: usize,

    // Token budgets
    pub token_budget_limit: usize,

    // Retrieval (fixed Top-20 -> rerank Top-5 strategy)
    pub retrieval_top_k: usize,
    pub rerank_top_k: usize,
    pub min_score: f64,
}

/// Performance configuration
#[derive(Debug, Clone)]
pub struct PerformanceSettings {
    pub max_concurrent_requests: usize,
    pub batch_size: usize,
    pub cache_ttl: Duration,
    pub embedding_cache_size: usize,
    pub search_cache_size: usize,
    pub compression_cache_size: usize,
}

/// Cost control configuration (USD)
#[derive(Debug, Clone)]
pub struct CostSettings {
    pub daily_budget_usd: f64,
    pub embedding_daily_budget_usd: f64,
    pub fusion_daily_budget_usd: f64,
    pub compression_daily_budget_usd: f64,
    pub auto_degradation_enabled: bool,
}

/// Background loop intervals
#[derive(Debug, Clone)]
pub struct MonitoringSettings {
    pub health_check_interval: Duration,
    pub metrics_update_interval: Duration,
    pub memory_cleanup_interval: Duration,
    pub cost_monitor_interval: Duration,
    /// Drain window for in-flight requests at shutdown
    pub shutdown_drain: Duration,
}

/// Full settings tree
#[derive(Debug, Clone)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub vector: VectorSettings,
    pub models: ModelSettings,
    pub memory: MemorySettings,
    pub performance: PerformanceSettings,
    pub cost: CostSettings,
    pub monitoring: MonitoringSettings,
    /// Base URL of the HTTP API for out-of-process clients
    pub api_url: String,
    /// Active project scope for MCP/HTTP requests
    pub project_id: String,
    /// The always-present project every scope falls back to
    pub default_project_id: String,
}

fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CLAUDE_MEMORY_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude-memory")
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for Settings {
    fn default() -> Self {
        let dir = data_dir();
        let default_project = env_or("DEFAULT_PROJECT_ID", "default");
        Self {
            database: DatabaseSettings {
                path: dir.join("claude_memory.db"),
                pool_size: 10,
                max_overflow: 20,
                pool_timeout: Duration::from_secs(30),
            },
            vector: VectorSettings {
                path: dir.join("claude_memory_vectors.db"),
                collection_name: "claude_memory_vectors_v14".to_string(),
                vector_size: 4096,
                distance_metric: DistanceMetric::Cosine,
                timeout: Duration::from_secs(30),
            },
            models: ModelSettings {
                openrouter_base_url: "https://openrouter.ai/api/v1".to_string(),
                siliconflow_base_url: "https://api.siliconflow.cn/v1".to_string(),
                gemini_base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                default_light_model: "deepseek-ai/DeepSeek-V2.5".to_string(),
                default_heavy_model: "gemini-2.5-pro".to_string(),
                default_embedding_model: "Qwen/Qwen3-Embedding-8B".to_string(),
                default_rerank_model: "Qwen/Qwen3-Reranker-8B".to_string(),
                fallback_order: vec![
                    "gemini".to_string(),
                    "openrouter".to_string(),
                    "siliconflow".to_string(),
                ],
                request_timeout: Duration::from_secs(30),
                max_retries: 3,
                backoff_base: Duration::from_secs(1),
                backoff_cap: Duration::from_secs(60),
            },
            memory: MemorySettings {
                mode: MemoryMode::Hybrid,
                fuser_enabled: true,
                fuser_model: "gemini-2.5-flash".to_string(),
                fuser_temperature: 0.2,
                fuser_token_limit: 800,
                fuser_language: FuserLanguage::Zh,
                fuser_prompt_template_path: dir.join("prompts/memory_fusion_prompt.txt"),
                summary_model: "gemini-2.5-pro".to_string(),
                summary_max_tokens: 2048,
                summary_manual_trigger_command: "/memory review".to_string(),
                summary_auto_trigger_keywords: vec![
                    "重构".to_string(),
                    "架构决定".to_string(),
                    "系统重写".to_string(),
                ],
                quality_threshold: 0.7,
                retention_days: 365,
                max_summary_length: 500,
                token_budget_limit: 6000,
                retrieval_top_k: 20,
                rerank_top_k: 5,
                min_score: 0.2,
            },
            performance: PerformanceSettings {
                max_concurrent_requests: 10,
                batch_size: 50,
                cache_ttl: Duration::from_secs(3600),
                embedding_cache_size: 1000,
                search_cache_size: 500,
                compression_cache_size: 1000,
            },
            cost: CostSettings {
                daily_budget_usd: 0.5,
                embedding_daily_budget_usd: 0.2,
                fusion_daily_budget_usd: 0.1,
                compression_daily_budget_usd: 0.1,
                auto_degradation_enabled: true,
            },
            monitoring: MonitoringSettings {
                health_check_interval: Duration::from_secs(60),
                metrics_update_interval: Duration::from_secs(30),
                memory_cleanup_interval: Duration::from_secs(3600),
                cost_monitor_interval: Duration::from_secs(3600),
                shutdown_drain: Duration::from_secs(30),
            },
            api_url: "http://127.0.0.1:8000".to_string(),
            project_id: default_project.clone(),
            default_project_id: default_project,
        }
    }
}

impl Settings {
    /// Load settings from environment variables on top of the defaults.
    ///
    /// Unrecognized env vars are tolerated; unparseable values fall back to
    /// the default silently (validate() reports the important ones).
    pub fn from_env() -> Self {
        let mut s = Self::default();

        s.api_url = env_or("CLAUDE_MEMORY_API_URL", &s.api_url);
        s.default_project_id = env_or("DEFAULT_PROJECT_ID", &s.default_project_id);
        s.project_id = env_or("CLAUDE_MEMORY_PROJECT_ID", &s.default_project_id);

        if let Ok(path) = std::env::var("CLAUDE_MEMORY_VECTOR_PATH") {
            s.vector.path = PathBuf::from(path);
        }
        s.vector.vector_size = env_parse("CLAUDE_MEMORY_VECTOR_SIZE", s.vector.vector_size);
        if let Ok(metric) = std::env::var("CLAUDE_MEMORY_DISTANCE_METRIC") {
            if let Ok(m) = metric.parse() {
                s.vector.distance_metric = m;
            }
        }

        s.models.openrouter_base_url = env_or("OPENROUTER_BASE_URL", &s.models.openrouter_base_url);
        s.models.siliconflow_base_url =
            env_or("SILICONFLOW_BASE_URL", &s.models.siliconflow_base_url);

        if let Ok(mode) = std::env::var("CLAUDE_MEMORY_MODE") {
            if let Ok(m) = mode.parse() {
                s.memory.mode = m;
            }
        }
        if let Some(enabled) = parse_bool_env("MEMORY_FUSER_ENABLED") {
            s.memory.fuser_enabled = enabled;
        }
        if let Ok(lang) = std::env::var("MEMORY_FUSER_LANGUAGE") {
            if let Ok(l) = lang.to_lowercase().parse() {
                s.memory.fuser_language = l;
            }
        }
        s.memory.token_budget_limit =
            env_parse("CLAUDE_MEMORY_TOKEN_BUDGET", s.memory.token_budget_limit);

        s.cost.daily_budget_usd = env_parse("CLAUDE_MEMORY_DAILY_BUDGET", s.cost.daily_budget_usd);

        s
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> ConfigValidation {
        let mut v = ConfigValidation::new();

        if self.vector.vector_size == 0 || self.vector.vector_size > 8192 {
            v.add_error(format!(
                "vector_size {} out of range (1..=8192)",
                self.vector.vector_size
            ));
        }
        if self.memory.retrieval_top_k < self.memory.rerank_top_k {
            v.add_error(format!(
                "retrieval_top_k ({}) must be >= rerank_top_k ({})",
                self.memory.retrieval_top_k, self.memory.rerank_top_k
            ));
        }
        if !(0.0..=1.0).contains(&self.memory.quality_threshold) {
            v.add_error("quality_threshold must be within [0, 1]".to_string());
        }
        if self.cost.daily_budget_usd <= 0.0 {
            v.add_warning("daily budget is zero - every tracked call will trip degradation");
        }
        if self.project_id.len() > 64 {
            v.add_error("project_id exceeds 64 characters".to_string());
        }

        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let s = Settings::default();
        let v = s.validate();
        assert!(v.is_valid(), "{}", v.report());
        assert_eq!(s.vector.collection_name, "claude_memory_vectors_v14");
        assert_eq!(s.vector.vector_size, 4096);
        assert_eq!(s.memory.retrieval_top_k, 20);
        assert_eq!(s.memory.rerank_top_k, 5);
    }

    #[test]
    fn test_mode_parses_kebab_case() {
        assert_eq!(
            "embedding-only".parse::<MemoryMode>().unwrap(),
            MemoryMode::EmbeddingOnly
        );
        assert_eq!(
            "intelligent-compression".parse::<MemoryMode>().unwrap(),
            MemoryMode::IntelligentCompression
        );
        assert!("turbo".parse::<MemoryMode>().is_err());
    }

    #[test]
    fn test_distance_metric_enumerated() {
        assert_eq!("Cosine".parse::<DistanceMetric>().unwrap(), DistanceMetric::Cosine);
        assert!("Manhattan".parse::<DistanceMetric>().is_err());
    }

    #[test]
    fn test_invalid_topk_rejected() {
        let mut s = Settings::default();
        s.memory.retrieval_top_k = 3;
        s.memory.rerank_top_k = 5;
        assert!(!s.validate().is_valid());
    }
}
