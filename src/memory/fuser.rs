// src/memory/fuser.rs
// Fuses retrieved memory fragments into one structured context block via a
// light model call, with a TTL-bounded fusion cache and identity fallback.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::config::FuserLanguage;
use crate::llm::{ChatMessage, CompletionParams, CostCategory, ModelGateway};
use crate::utils::short_hash;
use crate::utils::tokens::TokenCounter;

use super::types::MemoryUnit;

/// Default fusion prompt, used when no template file is configured or the
/// configured file cannot be read. The placeholders `{retrieved_passages}`,
/// `{token_limit}` and `{language}` are required in any template.
const DEFAULT_TEMPLATE: &str = r#"You are a Memory Fusion Assistant. Fuse the memory fragments below into structured context.

**Input Fragments:**
{retrieved_passages}

**Current Query:** {query}

**Your Task:**
1. Extract key technical information
2. Organize by relevance and timeline
3. Highlight unresolved issues
4. Keep technical identifiers precise

**Output Format:**
## 项目概况
- <概括当前任务/模块>

## 关键决策与修改
1. <日期> <描述> - <文件/函数>

## 待解决问题
- <问题描述>

## 重要函数/类
| 名称 | 描述 | 参数 | 返回值 |
|------|------|------|--------|

## 错误摘要
```
<error logs if any>
```

**Constraints:**
- Maximum {token_limit} tokens
- Language: {language}
- Do not copy fragments verbatim; synthesize
"#;

/// Fusion configuration
#[derive(Debug, Clone)]
pub struct FusionConfig {
    pub enabled: bool,
    pub model: String,
    pub temperature: f32,
    pub token_limit: usize,
    pub language: FuserLanguage,
    pub prompt_template_path: PathBuf,
    pub cache_ttl: Duration,
    pub cache_size: u64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "gemini-2.5-flash".to_string(),
            temperature: 0.2,
            token_limit: 800,
            language: FuserLanguage::Zh,
            prompt_template_path: PathBuf::from("./prompts/memory_fusion_prompt.txt"),
            cache_ttl: Duration::from_secs(3600),
            cache_size: 256,
        }
    }
}

/// Fused context block
#[derive(Debug, Clone)]
pub struct FusedMemory {
    pub content: String,
    pub metadata: Value,
    pub source_units: Vec<String>,
    pub token_count: usize,
    pub fusion_model: String,
    pub fusion_cost: f64,
}

/// Reduces N retrieved fragments to one structured context block.
pub struct MemoryFuser {
    config: FusionConfig,
    gateway: Arc<ModelGateway>,
    counter: TokenCounter,
    template: String,
    cache: Cache<String, FusedMemory>,
}

impl MemoryFuser {
    pub fn new(config: FusionConfig, gateway: Arc<ModelGateway>) -> Self {
        let template = Self::load_template(&config.prompt_template_path);
        let cache = Cache::builder()
            .max_capacity(config.cache_size)
            .time_to_live(config.cache_ttl)
            .build();
        Self {
            config,
            gateway,
            counter: TokenCounter::new(),
            template,
            cache,
        }
    }

    fn load_template(path: &PathBuf) -> String {
        match std::fs::read_to_string(path) {
            Ok(template)
                if template.contains("{retrieved_passages}")
                    && template.contains("{token_limit}")
                    && template.contains("{language}") =>
            {
                info!(path = %path.display(), "Fusion prompt template loaded");
                template
            }
            Ok(_) => {
                warn!(
                    path = %path.display(),
                    "Fusion template missing required placeholders, using default"
                );
                DEFAULT_TEMPLATE.to_string()
            }
            Err(_) => {
                info!(path = %path.display(), "No fusion template on disk, using embedded default");
                DEFAULT_TEMPLATE.to_string()
            }
        }
    }

    /// Fuse fragments into one block of at most `max_tokens` tokens.
    ///
    /// Disabled mode and every failure path return the identity
    /// concatenation, so fusion never breaks the injection pipeline.
    pub async fn fuse(
        &self,
        memory_units: &[MemoryUnit],
        query: &str,
        max_tokens: Option<usize>,
    ) -> FusedMemory {
        if !self.config.enabled || memory_units.is_empty() {
            return self.simple_concatenate(memory_units);
        }

        let cache_key = self.cache_key(memory_units, query);
        if let Some(cached) = self.cache.get(&cache_key).await {
            info!("Fusion cache hit");
            return cached;
        }

        let token_limit = max_tokens.unwrap_or(self.config.token_limit);
        match self.perform_fusion(memory_units, query, token_limit).await {
            Ok(fused) => {
                self.cache.insert(cache_key, fused.clone()).await;
                fused
            }
            Err(e) => {
                warn!(error = %e, "Fusion failed, degrading to simple concatenation");
                self.simple_concatenate(memory_units)
            }
        }
    }

    async fn perform_fusion(
        &self,
        memory_units: &[MemoryUnit],
        query: &str,
        token_limit: usize,
    ) -> crate::error::Result<FusedMemory> {
        let fragments = Self::prepare_fragments(memory_units);
        let prompt = self.build_prompt(&fragments, query, token_limit);

        let params = CompletionParams::default()
            .with_temperature(self.config.temperature)
            .with_max_tokens(token_limit)
            .for_purpose(CostCategory::Fusion);
        let response = self
            .gateway
            .complete(&self.config.model, &[ChatMessage::user(prompt)], params)
            .await?;

        let token_count = self.counter.count(&response.content);
        info!(
            model = %self.config.model,
            input_units = memory_units.len(),
            output_tokens = token_count,
            cost = response.cost_usd,
            "Fusion completed"
        );

        Ok(FusedMemory {
            content: response.content,
            metadata: json!({
                "query": query,
                "input_count": memory_units.len(),
            }),
            source_units: memory_units.iter().map(|u| u.id.clone()).collect(),
            token_count,
            fusion_model: self.config.model.clone(),
            fusion_cost: response.cost_usd,
        })
    }

    /// `<fragment_NN>` blocks with Time / Type / Metadata / Content fields,
    /// concatenated in input order.
    fn prepare_fragments(memory_units: &[MemoryUnit]) -> String {
        memory_units
            .iter()
            .enumerate()
            .map(|(i, unit)| {
                let mut fragment = format!("<fragment_{i:02}>\n");
                fragment.push_str(&format!("Time: {}\n", unit.created_at.to_rfc3339()));
                fragment.push_str(&format!("Type: {}\n", unit.unit_type));
                if !unit.metadata.is_null() {
                    fragment.push_str(&format!("Metadata: {}\n", unit.metadata));
                }
                fragment.push_str(&format!("Content:\n{}\n", unit.content));
                fragment.push_str(&format!("</fragment_{i:02}>"));
                fragment
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn build_prompt(&self, fragments: &str, query: &str, token_limit: usize) -> String {
        self.template
            .replace("{retrieved_passages}", fragments)
            .replace("{query}", query)
            .replace("{token_limit}", &token_limit.to_string())
            .replace("{language}", &self.config.language.to_string())
    }

    /// The identity fusion: timestamped fragments joined with separators.
    fn simple_concatenate(&self, memory_units: &[MemoryUnit]) -> FusedMemory {
        let combined = memory_units
            .iter()
            .map(|unit| {
                format!(
                    "[{}] {}:\n{}\n",
                    unit.created_at.format("%Y-%m-%d %H:%M"),
                    unit.unit_type,
                    unit.content
                )
            })
            .collect::<Vec<_>>()
            .join("\n---\n");
        let token_count = self.counter.count(&combined);

        FusedMemory {
            content: combined,
            metadata: json!({ "fusion_method": "simple_concatenation" }),
            source_units: memory_units.iter().map(|u| u.id.clone()).collect(),
            token_count,
            fusion_model: "none".to_string(),
            fusion_cost: 0.0,
        }
    }

    fn cache_key(&self, memory_units: &[MemoryUnit], query: &str) -> String {
        let mut ids: Vec<&str> = memory_units.iter().map(|u| u.id.as_str()).collect();
        ids.sort();
        short_hash(&format!("{query}:{}", ids.join(":")))
    }

    pub fn clear_cache(&self) {
        self.cache.invalidate_all();
    }

    pub fn stats(&self) -> Value {
        json!({
            "cache_entries": self.cache.entry_count(),
            "model": self.config.model,
            "enabled": self.config.enabled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiKeys, Settings};
    use crate::memory::types::MemoryUnitType;
    use crate::utils::cost::CostTracker;

    fn fuser(enabled: bool) -> MemoryFuser {
        let settings = Settings::default();
        let gateway = Arc::new(ModelGateway::from_api_keys(
            &ApiKeys::default(),
            settings.models,
            4,
            Arc::new(CostTracker::new()),
            reqwest::Client::new(),
        ));
        MemoryFuser::new(
            FusionConfig {
                enabled,
                ..Default::default()
            },
            gateway,
        )
    }

    fn unit(content: &str) -> MemoryUnit {
        let mut u = MemoryUnit::new("default", None, MemoryUnitType::Conversation);
        u.content = content.to_string();
        u
    }

    #[test]
    fn test_default_template_has_placeholders() {
        for placeholder in ["{retrieved_passages}", "{token_limit}", "{language}"] {
            assert!(
                DEFAULT_TEMPLATE.contains(placeholder),
                "missing {placeholder}"
            );
        }
    }

    #[test]
    fn test_fragment_packing_format() {
        let units = vec![unit("first fragment"), unit("second fragment")];
        let packed = MemoryFuser::prepare_fragments(&units);
        assert!(packed.contains("<fragment_00>"));
        assert!(packed.contains("</fragment_00>"));
        assert!(packed.contains("<fragment_01>"));
        assert!(packed.contains("Type: conversation"));
        assert!(packed.contains("Content:\nfirst fragment"));
        // Input order is preserved
        assert!(packed.find("first fragment").unwrap() < packed.find("second fragment").unwrap());
    }

    #[test]
    fn test_build_prompt_substitutes_placeholders() {
        let f = fuser(true);
        let prompt = f.build_prompt("FRAGS", "my query", 800);
        assert!(prompt.contains("FRAGS"));
        assert!(prompt.contains("800"));
        assert!(prompt.contains("zh"));
        assert!(!prompt.contains("{retrieved_passages}"));
        assert!(!prompt.contains("{token_limit}"));
        assert!(!prompt.contains("{language}"));
    }

    #[tokio::test]
    async fn test_disabled_mode_is_identity_concat() {
        let f = fuser(false);
        let units = vec![unit("alpha"), unit("beta")];
        let fused = f.fuse(&units, "q", None).await;
        assert_eq!(fused.fusion_model, "none");
        assert!(fused.content.contains("alpha"));
        assert!(fused.content.contains("beta"));
        assert!(fused.content.contains("---"));
        assert_eq!(fused.fusion_cost, 0.0);
        assert_eq!(fused.source_units.len(), 2);
    }

    #[tokio::test]
    async fn test_fusion_failure_degrades_to_identity() {
        // Enabled but no provider keys: the model call fails and the
        // identity concatenation preserves correctness
        let f = fuser(true);
        let units = vec![unit("gamma content")];
        let fused = f.fuse(&units, "q", None).await;
        assert_eq!(fused.fusion_model, "none");
        assert!(fused.content.contains("gamma content"));
    }

    #[tokio::test]
    async fn test_empty_input_yields_empty_identity() {
        let f = fuser(true);
        let fused = f.fuse(&[], "q", None).await;
        assert!(fused.content.is_empty());
        assert_eq!(fused.fusion_model, "none");
    }

    #[test]
    fn test_cache_key_stable_under_unit_order() {
        let f = fuser(true);
        let a = unit("a");
        let b = unit("b");
        let key1 = f.cache_key(&[a.clone(), b.clone()], "q");
        let key2 = f.cache_key(&[b, a], "q");
        assert_eq!(key1, key2);
    }

    #[test]
    fn test_cache_key_varies_with_query() {
        let f = fuser(true);
        let a = unit("a");
        assert_ne!(f.cache_key(&[a.clone()], "q1"), f.cache_key(&[a], "q2"));
    }

    #[test]
    fn test_missing_template_file_uses_default() {
        let template =
            MemoryFuser::load_template(&PathBuf::from("/nonexistent/template.txt"));
        assert_eq!(template, DEFAULT_TEMPLATE);
    }

    #[test]
    fn test_template_without_placeholders_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.txt");
        std::fs::write(&path, "no placeholders here").unwrap();
        let template = MemoryFuser::load_template(&path);
        assert_eq!(template, DEFAULT_TEMPLATE);
    }

    #[test]
    fn test_template_with_placeholders_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("good.txt");
        std::fs::write(
            &path,
            "custom {retrieved_passages} {token_limit} {language}",
        )
        .unwrap();
        let template = MemoryFuser::load_template(&path);
        assert!(template.starts_with("custom"));
    }
}
