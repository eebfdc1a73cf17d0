// src/memory/limiter.rs
// Token budget enforcement by compression or truncation

use std::sync::Arc;

use serde_json::{Value, json};
use strum::{Display, EnumString};
use tracing::{debug, warn};

use crate::llm::{ChatMessage, CompletionParams, CostCategory, ModelGateway};
use crate::utils::tokens::TokenCounter;

use super::types::{MemoryUnit, MemoryUnitType};

/// Truncation strategy when content exceeds its budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum TruncationStrategy {
    /// Keep the beginning
    Head,
    /// Keep the end
    Tail,
    /// Keep both ends, drop the middle
    Middle,
    /// Line-wise, then sentence-wise, then char-proportional
    Smart,
}

/// Priority levels scale the default cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum PriorityLevel {
    Critical,
    High,
    Medium,
    Low,
}

impl PriorityLevel {
    fn multiplier(self) -> f64 {
        match self {
            Self::Critical => 1.0,
            Self::High => 0.8,
            Self::Medium => 0.6,
            Self::Low => 0.4,
        }
    }
}

/// Limiter configuration
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub default_limit: usize,
    pub truncation_strategy: TruncationStrategy,
    pub enable_compression: bool,
    pub compression_model: String,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            default_limit: 20_000,
            truncation_strategy: TruncationStrategy::Smart,
            enable_compression: true,
            compression_model: "gemini-2.5-flash".to_string(),
        }
    }
}

/// Result of a limit pass
#[derive(Debug, Clone)]
pub struct LimitedContent {
    pub content: String,
    pub original_tokens: usize,
    pub final_tokens: usize,
    pub truncated: bool,
    pub compressed: bool,
    pub metadata: Value,
}

/// Enforces the final token budget on outgoing context.
pub struct TokenLimiter {
    config: LimiterConfig,
    counter: TokenCounter,
    gateway: Option<Arc<ModelGateway>>,
}

impl TokenLimiter {
    pub fn new(config: LimiterConfig, gateway: Option<Arc<ModelGateway>>) -> Self {
        Self {
            config,
            counter: TokenCounter::new(),
            gateway,
        }
    }

    /// Limit `content` to `max_tokens` (or the priority-scaled default).
    ///
    /// Content under the cap passes through untouched. Over the cap, a
    /// model compression pass is attempted first (when enabled and a
    /// gateway is wired); truncation per the configured strategy is the
    /// fallback.
    pub async fn limit(
        &self,
        content: &str,
        max_tokens: Option<usize>,
        priority: PriorityLevel,
    ) -> LimitedContent {
        let limit = max_tokens.unwrap_or_else(|| self.limit_for_priority(priority));
        let original_tokens = self.counter.count(content);

        if original_tokens <= limit {
            return LimitedContent {
                content: content.to_string(),
                original_tokens,
                final_tokens: original_tokens,
                truncated: false,
                compressed: false,
                metadata: json!({ "priority": priority.to_string() }),
            };
        }

        if self.config.enable_compression {
            if let Some(compressed) = self.try_compress(content, limit, priority).await {
                return compressed;
            }
        }

        let truncated = self.truncate_content(content, limit);
        let final_tokens = self.counter.count(&truncated);
        LimitedContent {
            content: truncated,
            original_tokens,
            final_tokens,
            truncated: true,
            compressed: false,
            metadata: json!({
                "priority": priority.to_string(),
                "truncation_strategy": self.config.truncation_strategy.to_string(),
            }),
        }
    }

    /// Rank units by (type priority, relevance) and accept until the cap.
    ///
    /// With `preserve_structure`, the first unit that would overflow may be
    /// individually truncated into the remaining budget, provided at least
    /// 100 tokens remain.
    pub fn limit_units(
        &self,
        units: Vec<MemoryUnit>,
        total_limit: usize,
        preserve_structure: bool,
    ) -> (Vec<MemoryUnit>, Value) {
        let original_count = units.len();
        let mut ranked: Vec<(MemoryUnit, usize)> = units
            .into_iter()
            .map(|u| {
                let tokens = self.counter.count(&u.content);
                (u, tokens)
            })
            .collect();
        ranked.sort_by(|(a, _), (b, _)| {
            Self::unit_priority(b.unit_type)
                .cmp(&Self::unit_priority(a.unit_type))
                .then(
                    b.relevance_score
                        .partial_cmp(&a.relevance_score)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });

        let original_tokens: usize = ranked.iter().map(|(_, t)| t).sum();
        let mut selected = Vec::new();
        let mut current = 0usize;
        let mut truncated_count = 0usize;

        for (mut unit, tokens) in ranked {
            if current + tokens <= total_limit {
                current += tokens;
                selected.push(unit);
            } else if preserve_structure {
                let remaining = total_limit.saturating_sub(current);
                if remaining >= 100 {
                    let cut = self.truncate_content(&unit.content, remaining);
                    let cut_tokens = self.counter.count(&cut);
                    if cut_tokens > 0 {
                        unit.content = cut;
                        unit.metadata["truncated"] = json!(true);
                        current += cut_tokens;
                        truncated_count += 1;
                        selected.push(unit);
                    }
                }
            }
        }

        let stats = json!({
            "original_count": original_count,
            "selected_count": selected.len(),
            "truncated_count": truncated_count,
            "original_tokens": original_tokens,
            "final_tokens": current,
        });
        debug!(%stats, "Units limited");
        (selected, stats)
    }

    pub fn estimate_tokens(&self, content: &str) -> usize {
        self.counter.count(content)
    }

    fn limit_for_priority(&self, priority: PriorityLevel) -> usize {
        (self.config.default_limit as f64 * priority.multiplier()) as usize
    }

    fn unit_priority(unit_type: MemoryUnitType) -> u8 {
        match unit_type {
            MemoryUnitType::GlobalMu => 4,
            MemoryUnitType::ErrorLog | MemoryUnitType::Decision => 3,
            MemoryUnitType::Conversation | MemoryUnitType::CodeSnippet => 2,
            MemoryUnitType::Documentation | MemoryUnitType::Archive => 1,
        }
    }

    async fn try_compress(
        &self,
        content: &str,
        limit: usize,
        priority: PriorityLevel,
    ) -> Option<LimitedContent> {
        let gateway = self.gateway.as_ref()?;
        let original_tokens = self.counter.count(content);

        let prompt = format!(
            "Compress the following content to at most {limit} tokens while keeping all \
             key information:\n\n{content}\n\nRequirements:\n\
             1. Preserve all technical details, identifiers, file paths, parameters and error text\n\
             2. Remove redundancy and repetition\n\
             3. Use concise phrasing\n\
             4. Priority: {priority}"
        );

        let params = CompletionParams::default()
            .with_temperature(0.1)
            .with_max_tokens(limit)
            .for_purpose(CostCategory::Compression);

        match gateway
            .complete(&self.config.compression_model, &[ChatMessage::user(prompt)], params)
            .await
        {
            Ok(response) => {
                let compressed_tokens = self.counter.count(&response.content);
                if compressed_tokens <= limit && compressed_tokens < original_tokens {
                    debug!(
                        original_tokens,
                        compressed_tokens, "Content compressed under budget"
                    );
                    Some(LimitedContent {
                        content: response.content,
                        original_tokens,
                        final_tokens: compressed_tokens,
                        truncated: false,
                        compressed: true,
                        metadata: json!({
                            "priority": priority.to_string(),
                            "compression_model": self.config.compression_model,
                        }),
                    })
                } else {
                    None
                }
            }
            Err(e) => {
                warn!(error = %e, "Compression pass failed, falling back to truncation");
                None
            }
        }
    }

    fn truncate_content(&self, content: &str, limit: usize) -> String {
        // 1 token is roughly 4 chars
        let char_limit = limit.saturating_mul(4);
        let chars: Vec<char> = content.chars().collect();

        match self.config.truncation_strategy {
            TruncationStrategy::Head => {
                let head: String = chars.iter().take(char_limit).collect();
                format!("{head}...")
            }
            TruncationStrategy::Tail => {
                let skip = chars.len().saturating_sub(char_limit);
                let tail: String = chars.iter().skip(skip).collect();
                format!("...{tail}")
            }
            TruncationStrategy::Middle => {
                let half = char_limit / 2;
                let head: String = chars.iter().take(half).collect();
                let tail: String = chars.iter().skip(chars.len().saturating_sub(half)).collect();
                format!("{head}\n...[truncated]...\n{tail}")
            }
            TruncationStrategy::Smart => self.smart_truncate(content, limit),
        }
    }

    /// Accumulate whole lines under the cap; if even the first line is over
    /// budget, fall back to sentence-wise, then char-proportional cuts.
    fn smart_truncate(&self, content: &str, limit: usize) -> String {
        let mut result: Vec<&str> = Vec::new();
        let mut current = 0usize;

        for line in content.lines() {
            let line_tokens = self.counter.count(line);
            if current + line_tokens > limit {
                if result.is_empty() {
                    return self.truncate_line(line, limit);
                }
                break;
            }
            result.push(line);
            current += line_tokens;
        }

        result.join("\n")
    }

    fn truncate_line(&self, line: &str, limit: usize) -> String {
        let mut kept: Vec<&str> = Vec::new();
        let mut current = 0usize;

        for sentence in line.split_inclusive(['.', '。']) {
            let tokens = self.counter.count(sentence);
            if current + tokens > limit {
                break;
            }
            kept.push(sentence);
            current += tokens;
        }

        if kept.is_empty() {
            let char_limit = limit.saturating_mul(4);
            let head: String = line.chars().take(char_limit).collect();
            format!("{head}...")
        } else {
            format!("{}...", kept.concat().trim_end())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(strategy: TruncationStrategy) -> TokenLimiter {
        TokenLimiter::new(
            LimiterConfig {
                truncation_strategy: strategy,
                enable_compression: false,
                ..Default::default()
            },
            None,
        )
    }

    fn unit(unit_type: MemoryUnitType, relevance: f64, content: &str) -> MemoryUnit {
        let mut u = MemoryUnit::new("default", None, unit_type);
        u.content = content.to_string();
        u.relevance_score = relevance;
        u
    }

    #[tokio::test]
    async fn test_under_budget_passthrough() {
        let limiter = limiter(TruncationStrategy::Smart);
        let result = limiter.limit("short text", Some(100), PriorityLevel::Medium).await;
        assert_eq!(result.content, "short text");
        assert!(!result.truncated);
        assert!(!result.compressed);
    }

    #[tokio::test]
    async fn test_over_budget_truncates() {
        let limiter = limiter(TruncationStrategy::Smart);
        let long = "line of steady filler words here\n".repeat(200);
        let result = limiter.limit(&long, Some(50), PriorityLevel::Medium).await;
        assert!(result.truncated);
        assert!(result.final_tokens <= 50);
        assert!(result.final_tokens < result.original_tokens);
    }

    #[tokio::test]
    async fn test_priority_scales_default_cap() {
        let limiter = TokenLimiter::new(
            LimiterConfig {
                default_limit: 1000,
                enable_compression: false,
                ..Default::default()
            },
            None,
        );
        assert_eq!(limiter.limit_for_priority(PriorityLevel::Critical), 1000);
        assert_eq!(limiter.limit_for_priority(PriorityLevel::High), 800);
        assert_eq!(limiter.limit_for_priority(PriorityLevel::Medium), 600);
        assert_eq!(limiter.limit_for_priority(PriorityLevel::Low), 400);
    }

    #[test]
    fn test_head_tail_middle_strategies() {
        let content = "abcdefghij".repeat(100);

        let head = limiter(TruncationStrategy::Head).truncate_content(&content, 10);
        assert!(head.ends_with("..."));
        assert!(head.starts_with("abcdefghij"));

        let tail = limiter(TruncationStrategy::Tail).truncate_content(&content, 10);
        assert!(tail.starts_with("..."));
        assert!(tail.ends_with("abcdefghij"));

        let middle = limiter(TruncationStrategy::Middle).truncate_content(&content, 10);
        assert!(middle.contains("...[truncated]..."));
    }

    #[test]
    fn test_smart_keeps_whole_lines() {
        let limiter = limiter(TruncationStrategy::Smart);
        let content = "first line words\nsecond line words\nthird line words";
        let out = limiter.smart_truncate(content, 8);
        assert!(out.lines().count() < 3);
        for line in out.lines() {
            assert!(content.contains(line));
        }
    }

    #[test]
    fn test_smart_single_huge_line_falls_back() {
        let limiter = limiter(TruncationStrategy::Smart);
        let line = "one sentence here. another sentence follows. ".repeat(100);
        let out = limiter.smart_truncate(&line, 10);
        assert!(limiter.estimate_tokens(&out) <= 14); // cap plus the ellipsis
        assert!(out.ends_with("..."));
    }

    #[test]
    fn test_limit_units_rank_and_cap() {
        let limiter = limiter(TruncationStrategy::Smart);
        let filler = "steady filler words ".repeat(30);
        let units = vec![
            unit(MemoryUnitType::Conversation, 0.9, &filler),
            unit(MemoryUnitType::GlobalMu, 0.1, &filler),
            unit(MemoryUnitType::Documentation, 0.9, &filler),
        ];
        let per_unit = limiter.estimate_tokens(&filler);
        let (selected, stats) = limiter.limit_units(units, per_unit * 2, false);

        // global_mu outranks conversation outranks documentation
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].unit_type, MemoryUnitType::GlobalMu);
        assert_eq!(selected[1].unit_type, MemoryUnitType::Conversation);
        assert!(stats["final_tokens"].as_u64().unwrap() <= (per_unit * 2) as u64);
    }

    #[test]
    fn test_limit_units_preserve_structure_truncates_tail() {
        let limiter = limiter(TruncationStrategy::Head);
        let big = "word ".repeat(600);
        let units = vec![
            unit(MemoryUnitType::GlobalMu, 0.9, &big),
            unit(MemoryUnitType::Conversation, 0.9, &big),
        ];
        let big_tokens = limiter.estimate_tokens(&big);
        let cap = big_tokens + 150;
        let (selected, stats) = limiter.limit_units(units, cap, true);
        assert_eq!(selected.len(), 2);
        assert_eq!(stats["truncated_count"], 1);
        assert_eq!(selected[1].metadata["truncated"], json!(true));
    }

    #[test]
    fn test_limit_units_no_structure_drops_overflow() {
        let limiter = limiter(TruncationStrategy::Head);
        let big = "word ".repeat(600);
        let units = vec![
            unit(MemoryUnitType::GlobalMu, 0.9, &big),
            unit(MemoryUnitType::Conversation, 0.9, &big),
        ];
        let cap = limiter.estimate_tokens(&big) + 150;
        let (selected, _) = limiter.limit_units(units, cap, false);
        assert_eq!(selected.len(), 1);
    }
}
