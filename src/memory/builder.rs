// src/memory/builder.rs
// Assembles retrieved memory units into the injected context block

use std::collections::HashMap;

use serde_json::{Value, json};
use tracing::debug;

use crate::utils::short_hash;
use crate::utils::tokens::TokenCounter;

use super::types::{MemoryUnit, MemoryUnitType};

/// Builder configuration
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    pub enable_deduplication: bool,
    /// Type weight applied on top of relevance when ordering fragments
    pub priority_weights: HashMap<MemoryUnitType, f64>,
    pub context_prefix: String,
    pub context_suffix: String,
    pub group_by_type: bool,
    pub max_fragments_per_type: usize,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        let priority_weights = HashMap::from([
            (MemoryUnitType::GlobalMu, 1.5),
            (MemoryUnitType::Decision, 1.4),
            (MemoryUnitType::ErrorLog, 1.3),
            (MemoryUnitType::Archive, 1.1),
            (MemoryUnitType::Conversation, 1.0),
        ]);
        Self {
            enable_deduplication: true,
            priority_weights,
            context_prefix: "以下是相关的历史上下文信息：\n\n".to_string(),
            context_suffix: "\n\n基于以上历史信息，请回答用户的问题。".to_string(),
            group_by_type: true,
            max_fragments_per_type: 5,
        }
    }
}

/// Built prompt block
#[derive(Debug, Clone)]
pub struct BuiltPrompt {
    pub content: String,
    pub token_count: usize,
    pub fragment_count: usize,
    pub metadata: Value,
}

/// Orders, deduplicates, groups and concatenates retrieved units into one
/// context block under the token budget.
pub struct PromptBuilder {
    config: BuilderConfig,
    counter: TokenCounter,
}

impl PromptBuilder {
    pub fn new(config: BuilderConfig) -> Self {
        Self {
            config,
            counter: TokenCounter::new(),
        }
    }

    /// Build the context block. When `fused_content` is provided it is used
    /// verbatim (wrapped in prefix/suffix) instead of the raw units.
    pub fn build(
        &self,
        memory_units: &[MemoryUnit],
        query: &str,
        max_tokens: Option<usize>,
        fused_content: Option<&str>,
    ) -> BuiltPrompt {
        if let Some(fused) = fused_content {
            return self.build_with_fused(fused, query);
        }
        self.build_from_units(memory_units, query, max_tokens)
    }

    fn build_with_fused(&self, fused: &str, query: &str) -> BuiltPrompt {
        let content = format!(
            "{}{}{}",
            self.config.context_prefix, fused, self.config.context_suffix
        );
        let token_count = self.counter.count(&content);
        BuiltPrompt {
            content,
            token_count,
            fragment_count: 1,
            metadata: json!({ "query": query, "build_method": "fused" }),
        }
    }

    fn build_from_units(
        &self,
        memory_units: &[MemoryUnit],
        query: &str,
        max_tokens: Option<usize>,
    ) -> BuiltPrompt {
        let mut sorted = self.sort_by_weight(memory_units);
        let total_units = sorted.len();
        if self.config.enable_deduplication {
            sorted = self.deduplicate(sorted);
        }
        let deduped_units = sorted.len();

        let grouped: Vec<(Option<MemoryUnitType>, Vec<&MemoryUnit>)> = if self.config.group_by_type
        {
            self.group_by_type(&sorted)
        } else {
            vec![(None, sorted.iter().collect())]
        };

        let mut parts = vec![self.config.context_prefix.clone()];
        let mut current_tokens = self.counter.count(&self.config.context_prefix);
        let mut fragment_count = 0usize;

        'outer: for (unit_type, units) in grouped {
            if let Some(unit_type) = unit_type {
                let header = format!("\n## {}\n\n", Self::type_header(unit_type));
                current_tokens += self.counter.count(&header);
                parts.push(header);
            }

            for unit in units.iter().take(self.config.max_fragments_per_type) {
                let fragment = Self::format_unit(unit);
                let fragment_tokens = self.counter.count(&fragment);
                if let Some(cap) = max_tokens {
                    if current_tokens + fragment_tokens > cap {
                        break 'outer;
                    }
                }
                parts.push(fragment);
                current_tokens += fragment_tokens;
                fragment_count += 1;
            }
        }

        // The suffix is appended only if it still fits
        let suffix_tokens = self.counter.count(&self.config.context_suffix);
        if max_tokens.is_none_or(|cap| current_tokens + suffix_tokens <= cap) {
            parts.push(self.config.context_suffix.clone());
            current_tokens += suffix_tokens;
        }

        debug!(
            total_units,
            deduped_units, fragment_count, "Prompt built from units"
        );

        BuiltPrompt {
            content: parts.concat(),
            token_count: current_tokens,
            fragment_count,
            metadata: json!({
                "query": query,
                "build_method": "units",
                "total_units": total_units,
                "deduped_units": deduped_units,
                "grouped": self.config.group_by_type,
            }),
        }
    }

    /// weight = relevance * type_weight * time_weight. The time weight is
    /// currently constant; the contract allows swapping in a decay.
    fn sort_by_weight(&self, units: &[MemoryUnit]) -> Vec<MemoryUnit> {
        let mut sorted: Vec<MemoryUnit> = units.to_vec();
        sorted.sort_by(|a, b| {
            let wa = self.weight(a);
            let wb = self.weight(b);
            wb.partial_cmp(&wa).unwrap_or(std::cmp::Ordering::Equal)
        });
        sorted
    }

    fn weight(&self, unit: &MemoryUnit) -> f64 {
        let type_weight = self
            .config
            .priority_weights
            .get(&unit.unit_type)
            .copied()
            .unwrap_or(1.0);
        let time_weight = 1.0;
        unit.relevance_score * type_weight * time_weight
    }

    fn deduplicate(&self, units: Vec<MemoryUnit>) -> Vec<MemoryUnit> {
        let mut seen = std::collections::HashSet::new();
        units
            .into_iter()
            .filter(|u| {
                let normalized = u.content.split_whitespace().collect::<Vec<_>>().join(" ");
                seen.insert(short_hash(&normalized))
            })
            .collect()
    }

    /// Group units by type, preserving weight order inside groups and
    /// ordering groups by their best-weighted member.
    fn group_by_type<'a>(
        &self,
        units: &'a [MemoryUnit],
    ) -> Vec<(Option<MemoryUnitType>, Vec<&'a MemoryUnit>)> {
        let mut order: Vec<MemoryUnitType> = Vec::new();
        let mut groups: HashMap<MemoryUnitType, Vec<&MemoryUnit>> = HashMap::new();
        for unit in units {
            if !groups.contains_key(&unit.unit_type) {
                order.push(unit.unit_type);
            }
            groups.entry(unit.unit_type).or_default().push(unit);
        }
        order
            .into_iter()
            .map(|t| (Some(t), groups.remove(&t).unwrap_or_default()))
            .collect()
    }

    fn type_header(unit_type: MemoryUnitType) -> &'static str {
        match unit_type {
            MemoryUnitType::GlobalMu => "全局记忆摘要",
            MemoryUnitType::Conversation => "对话历史",
            MemoryUnitType::ErrorLog => "错误日志",
            MemoryUnitType::Decision => "决策记录",
            MemoryUnitType::CodeSnippet => "代码片段",
            MemoryUnitType::Documentation => "文档说明",
            MemoryUnitType::Archive => "归档记忆",
        }
    }

    fn format_unit(unit: &MemoryUnit) -> String {
        format!(
            "[{}] (relevance: {:.2})\n{}\n---\n",
            unit.created_at.format("%Y-%m-%d %H:%M"),
            unit.relevance_score,
            unit.content
        )
    }
}
