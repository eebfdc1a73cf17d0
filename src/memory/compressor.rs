// src/memory/compressor.rs
// Conversation -> MemoryUnit via prompt + quality gate + model escalation

use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Utc};
use futures::future::join_all;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::MemorySettings;
use crate::error::{MemoryError, Result};
use crate::llm::{ChatMessage, CompletionParams, CostCategory, ModelGateway};
use crate::utils::cache::BoundedCache;
use crate::utils::short_hash;
use crate::utils::text::TextProcessor;

use super::types::{Conversation, MemoryUnit, MemoryUnitType, MessageType};

/// Quality-score factor weights:
/// length / meaningfulness / keywords / compression ratio / structure.
const QUALITY_WEIGHTS: [f64; 5] = [0.2, 0.3, 0.15, 0.2, 0.15];

/// Compression request
#[derive(Debug, Clone)]
pub struct CompressionRequest {
    pub conversation: Conversation,
    pub unit_type: MemoryUnitType,
    /// None = the type-specific default threshold
    pub quality_threshold: Option<f64>,
    pub max_summary_length: usize,
    /// Set false under cost degradation to forbid the heavy-tier retry
    pub allow_escalation: bool,
}

impl CompressionRequest {
    pub fn new(conversation: Conversation, unit_type: MemoryUnitType) -> Self {
        Self {
            conversation,
            unit_type,
            quality_threshold: None,
            max_summary_length: 500,
            allow_escalation: true,
        }
    }
}

/// Compression result
#[derive(Debug, Clone)]
pub struct CompressionResult {
    pub memory_unit: MemoryUnit,
    pub quality_score: f64,
    pub compression_ratio: f64,
    pub processing_time_ms: f64,
    pub model_used: String,
}

/// Parsed model reply (strict JSON, extracted JSON, or synthesized shape)
#[derive(Debug, Clone)]
struct ParsedReply {
    title: Option<String>,
    summary: String,
    content: String,
    key_topics: Vec<String>,
    importance_score: f64,
    metadata: Value,
}

/// Turns conversations into high-quality memory units.
///
/// Light-tier models handle conversations, error logs and snippets; heavy
/// models handle decisions and documentation. A unit that misses its
/// quality threshold on a light model is retried once on the heavy tier.
pub struct SemanticCompressor {
    gateway: Arc<ModelGateway>,
    text: TextProcessor,
    settings: MemorySettings,
    batch_size: usize,
    cache: BoundedCache<CompressionResult>,
    light_models: Vec<String>,
    heavy_models: Vec<String>,
}

impl SemanticCompressor {
    pub fn new(
        gateway: Arc<ModelGateway>,
        settings: MemorySettings,
        batch_size: usize,
        cache_size: usize,
    ) -> Self {
        Self {
            gateway,
            text: TextProcessor::new(),
            settings,
            batch_size: batch_size.max(1),
            cache: BoundedCache::new(cache_size),
            light_models: vec![
                "deepseek-ai/DeepSeek-V2.5".to_string(),
                "deepseek-r1".to_string(),
            ],
            heavy_models: vec![
                "gemini-2.5-pro".to_string(),
                "claude-3.5-sonnet".to_string(),
            ],
        }
    }

    /// Compress one conversation into a memory unit.
    pub async fn compress(&self, request: &CompressionRequest) -> Result<CompressionResult> {
        if request.conversation.messages.is_empty() {
            return Err(MemoryError::Validation(
                "empty conversation cannot be compressed".to_string(),
            ));
        }

        let cache_key = self.cache_key(request);
        if let Some(cached) = self.cache.get(&cache_key) {
            debug!(conversation_id = %request.conversation.id, "Compression cache hit");
            return Ok(cached);
        }

        let start = Instant::now();
        let threshold = self.threshold_for(request);
        let processed = self.preprocess(&request.conversation);

        let mut model = self.select_model(request.unit_type, &processed).to_string();
        let mut models_attempted = vec![model.clone()];

        let mut unit = self.generate_unit(request, &processed, &model).await?;
        let mut quality = self.evaluate_quality(&unit, &request.conversation);

        // Escalate once when a light model misses the quality bar
        if quality < threshold && request.allow_escalation && self.light_models.contains(&model) {
            let heavy = self.heavy_models[0].clone();
            info!(
                quality,
                threshold,
                original_model = %model,
                heavy_model = %heavy,
                "Quality below threshold, retrying with heavy model"
            );
            unit = self.generate_unit(request, &processed, &heavy).await?;
            quality = self.evaluate_quality(&unit, &request.conversation);
            model = heavy;
            models_attempted.push(model.clone());
        }

        unit.metadata["quality_score"] = json!(quality);
        unit.metadata["models_attempted"] = json!(models_attempted);

        let compression_ratio = if request.conversation.token_count > 0 {
            (unit.token_count as f64 / request.conversation.token_count as f64).min(1.0)
        } else {
            0.0
        };
        unit.metadata["compression_ratio"] = json!(compression_ratio);

        let result = CompressionResult {
            memory_unit: unit,
            quality_score: quality,
            compression_ratio,
            processing_time_ms: start.elapsed().as_secs_f64() * 1000.0,
            model_used: model,
        };
        self.cache.insert(cache_key, result.clone());

        info!(
            conversation_id = %request.conversation.id,
            unit_type = %request.unit_type,
            quality_score = result.quality_score,
            compression_ratio = result.compression_ratio,
            model_used = %result.model_used,
            "Conversation compressed"
        );
        Ok(result)
    }

    /// Compress a batch with per-item failure isolation. Items are
    /// processed in groups of `batch_size`, concurrent within a group.
    pub async fn compress_batch(
        &self,
        requests: Vec<CompressionRequest>,
    ) -> Vec<Result<CompressionResult>> {
        let mut results = Vec::with_capacity(requests.len());
        for group in requests.chunks(self.batch_size) {
            let futures = group.iter().map(|r| self.compress(r));
            results.extend(join_all(futures).await);
        }
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            warn!(failed, total = results.len(), "Batch compression had failures");
        }
        results
    }

    /// Synthesize one documentation-tier unit reviewing many conversations.
    ///
    /// Each conversation is compressed briefly, the short summaries are
    /// aggregated with keyword/message statistics, and the aggregate runs
    /// through a single heavy compression.
    pub async fn global_review(
        &self,
        conversations: &[Conversation],
        timeframe_days: i64,
    ) -> Result<MemoryUnit> {
        if conversations.is_empty() {
            return Err(MemoryError::Validation(
                "no conversations provided for global review".to_string(),
            ));
        }

        let mut summaries = Vec::new();
        let mut total_messages = 0i64;
        let mut total_tokens = 0i64;

        for conv in conversations {
            let request = CompressionRequest {
                conversation: conv.clone(),
                unit_type: MemoryUnitType::Conversation,
                quality_threshold: None,
                max_summary_length: 200,
                allow_escalation: true,
            };
            match self.compress(&request).await {
                Ok(result) => {
                    summaries.push((conv.clone(), result.memory_unit));
                    total_messages += conv.message_count;
                    total_tokens += conv.token_count;
                }
                Err(e) => warn!(conversation_id = %conv.id, error = %e, "Skipping conversation in review"),
            }
        }
        if summaries.is_empty() {
            return Err(MemoryError::Processing(
                "all per-conversation compressions failed".to_string(),
            ));
        }

        let review_content = Self::build_review_content(&summaries, timeframe_days);
        let project_id = conversations[0].project_id.clone();

        let review_request = CompressionRequest {
            conversation: Conversation {
                messages: Vec::new(),
                message_count: total_messages,
                token_count: total_tokens,
                ..Conversation::new(project_id)
            },
            unit_type: MemoryUnitType::Documentation,
            quality_threshold: None,
            max_summary_length: 1000,
            allow_escalation: true,
        };

        let model = self.select_model(MemoryUnitType::Documentation, &review_content);
        let mut unit = self
            .generate_unit(&review_request, &review_content, model)
            .await?;
        unit.conversation_id = None;

        unit.metadata["review_type"] = json!("global_memory_review");
        unit.metadata["timeframe_days"] = json!(timeframe_days);
        unit.metadata["conversations_count"] = json!(summaries.len());
        unit.metadata["total_messages"] = json!(total_messages);
        unit.metadata["total_tokens"] = json!(total_tokens);

        info!(
            timeframe_days,
            conversations = summaries.len(),
            "Global memory review generated"
        );
        Ok(unit)
    }

    /// `[<ROLE>]: <clean content>` lines, blanks skipped.
    fn preprocess(&self, conversation: &Conversation) -> String {
        let mut parts = Vec::new();
        for message in &conversation.messages {
            let clean = self.text.normalize(&message.content);
            if clean.is_empty() {
                continue;
            }
            let role = match message.message_type {
                MessageType::Human => "USER",
                MessageType::Assistant => "ASSISTANT",
                MessageType::System => "SYSTEM",
            };
            parts.push(format!("[{role}]: {clean}"));
        }
        parts.join("\n\n")
    }

    /// Model selection by unit type and preprocessed size.
    fn select_model(&self, unit_type: MemoryUnitType, content: &str) -> &str {
        let token_count = self.text.count_tokens(content);
        match unit_type {
            MemoryUnitType::Conversation | MemoryUnitType::ErrorLog => {
                if token_count < 2000 {
                    &self.light_models[0]
                } else {
                    self.light_models.get(1).unwrap_or(&self.light_models[0])
                }
            }
            MemoryUnitType::Decision | MemoryUnitType::Documentation => {
                if token_count < 5000 {
                    self.heavy_models.get(1).unwrap_or(&self.heavy_models[0])
                } else {
                    &self.heavy_models[0]
                }
            }
            _ => &self.light_models[0],
        }
    }

    async fn generate_unit(
        &self,
        request: &CompressionRequest,
        processed: &str,
        model: &str,
    ) -> Result<MemoryUnit> {
        let prompt = Self::build_prompt(processed, request.unit_type, request.max_summary_length);

        let params = CompletionParams::default()
            .with_temperature(0.3)
            .with_max_tokens(request.max_summary_length * 2)
            .for_purpose(CostCategory::Compression);
        let response = self
            .gateway
            .complete(model, &[ChatMessage::user(prompt)], params)
            .await?;

        let parsed = Self::parse_reply(&response.content);

        let mut keywords = self
            .text
            .extract_keywords(&format!("{} {}", parsed.summary, parsed.content), 10);
        if keywords.is_empty() {
            keywords = parsed.key_topics.clone();
        }

        let summary_tokens = self.text.count_tokens(&parsed.summary);
        let content_tokens = self.text.count_tokens(&parsed.content);

        // Only archive units carry an expiry by default
        let expires_at = (request.unit_type == MemoryUnitType::Archive)
            .then(|| Utc::now() + Duration::days(self.settings.retention_days));

        let mut unit = MemoryUnit::new(
            request.conversation.project_id.clone(),
            Some(request.conversation.id.clone()),
            request.unit_type,
        );
        unit.title = parsed
            .title
            .unwrap_or_else(|| Self::auto_title(&parsed.summary));
        unit.summary = parsed.summary;
        unit.content = if parsed.content.is_empty() {
            unit.summary.clone()
        } else {
            parsed.content
        };
        unit.set_keywords(keywords);
        unit.token_count = (summary_tokens + content_tokens) as i64;
        unit.expires_at = expires_at;
        unit.metadata = json!({
            "model_used": model,
            "compression_type": request.unit_type.to_string(),
            "original_messages": request.conversation.messages.len(),
            "source_session": request.conversation.session_id,
            "importance_score": parsed.importance_score,
            "quality_score": 0.0,
            "key_topics": parsed.key_topics,
        });
        if let Value::Object(extra) = parsed.metadata {
            for (k, v) in extra {
                unit.metadata[k] = v;
            }
        }

        Ok(unit)
    }

    fn build_prompt(content: &str, unit_type: MemoryUnitType, max_length: usize) -> String {
        let focus = match unit_type {
            MemoryUnitType::Decision => {
                "Focus on: the decision taken, the alternatives weighed, and the rationale."
            }
            MemoryUnitType::ErrorLog => {
                "Focus on: exact error messages, root cause, and the fix applied."
            }
            MemoryUnitType::Documentation | MemoryUnitType::GlobalMu => {
                "Focus on: durable knowledge, long-term conclusions, and information likely to matter in future conversations."
            }
            MemoryUnitType::CodeSnippet => {
                "Focus on: function and type names, signatures, and what the code does."
            }
            _ => {
                "Focus on: the user's immediate needs, the assistant's answers, and short-term context."
            }
        };

        format!(
            "Analyze the following conversation and produce a high-quality memory summary.\n\n\
             Conversation:\n{content}\n\n\
             Requirements:\n\
             1. An accurate summary of at most {max_length} characters\n\
             2. Keep key facts, conclusions and action items\n\
             3. Identify the discussed topics and their context\n\
             {focus}\n\n\
             Reply with JSON only:\n\
             {{\n\
                 \"title\": \"short title (max 50 chars)\",\n\
                 \"summary\": \"detailed summary\",\n\
                 \"content\": \"optional extra detail\",\n\
                 \"key_topics\": [\"topic1\", \"topic2\"],\n\
                 \"importance_score\": 0.8,\n\
                 \"metadata\": {{\n\
                     \"main_intent\": \"primary intent\",\n\
                     \"outcome\": \"result or conclusion\",\n\
                     \"action_items\": [\"item1\"]\n\
                 }}\n\
             }}"
        )
    }

    /// Accept strict JSON, a JSON object embedded in prose, or fall back
    /// to a minimal shape synthesized from the raw reply.
    fn parse_reply(response: &str) -> ParsedReply {
        let trimmed = response.trim();

        let parsed: Option<Value> = if trimmed.starts_with('{') {
            serde_json::from_str(trimmed).ok()
        } else {
            None
        };
        let parsed = parsed.or_else(|| {
            let start = trimmed.find('{')?;
            let end = trimmed.rfind('}')?;
            serde_json::from_str(&trimmed[start..=end]).ok()
        });

        match parsed {
            Some(value) => {
                let summary = value["summary"]
                    .as_str()
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .unwrap_or_else(|| trimmed.chars().take(500).collect());
                ParsedReply {
                    title: value["title"].as_str().map(String::from),
                    content: value["content"].as_str().unwrap_or("").to_string(),
                    key_topics: value["key_topics"]
                        .as_array()
                        .map(|a| {
                            a.iter()
                                .filter_map(|v| v.as_str().map(String::from))
                                .collect()
                        })
                        .unwrap_or_default(),
                    importance_score: value["importance_score"].as_f64().unwrap_or(0.5),
                    metadata: value
                        .get("metadata")
                        .cloned()
                        .unwrap_or_else(|| json!({})),
                    summary,
                }
            }
            None => ParsedReply {
                title: None,
                summary: trimmed.chars().take(500).collect(),
                content: trimmed.to_string(),
                key_topics: Vec::new(),
                importance_score: 0.5,
                metadata: json!({ "parse_fallback": true }),
            },
        }
    }

    /// First ~50 chars of the summary, cut at a word boundary.
    fn auto_title(summary: &str) -> String {
        let title: String = summary.chars().take(50).collect();
        if title.chars().count() < summary.chars().count() {
            let cut = match title.rfind(' ') {
                Some(pos) if pos > 20 => &title[..pos],
                _ => title.as_str(),
            };
            format!("{cut}...")
        } else {
            title
        }
    }

    /// Weighted combination of five quality factors, each in [0, 1].
    fn evaluate_quality(&self, unit: &MemoryUnit, conversation: &Conversation) -> f64 {
        let summary_len = unit.summary.chars().count();
        let length_score = if (100..=2000).contains(&summary_len) {
            1.0
        } else if summary_len < 100 {
            summary_len as f64 / 100.0
        } else {
            (2000.0 / summary_len as f64).max(0.5)
        };

        let meaningful_score = if self.text.is_meaningful(&unit.summary) {
            1.0
        } else {
            0.3
        };

        let keyword_score = if unit.keywords.is_empty() {
            0.3
        } else {
            (unit.keywords.len() as f64 / 5.0).min(1.0)
        };

        let compression_score = if conversation.token_count > 0 {
            let ratio = unit.token_count as f64 / conversation.token_count as f64;
            if (0.1..=0.5).contains(&ratio) {
                1.0
            } else if ratio < 0.1 {
                ratio / 0.1
            } else {
                (0.5 / ratio).max(0.3)
            }
        } else {
            0.5
        };

        let mut structure_score = 0.0;
        if unit.title.trim().chars().count() > 5 {
            structure_score += 0.3;
        }
        if unit.summary.trim().chars().count() > 50 {
            structure_score += 0.4;
        }
        if !unit.keywords.is_empty() {
            structure_score += 0.3;
        }

        let factors = [
            length_score,
            meaningful_score,
            keyword_score,
            compression_score,
            structure_score,
        ];
        factors
            .iter()
            .zip(QUALITY_WEIGHTS.iter())
            .map(|(f, w)| f * w)
            .sum()
    }

    fn threshold_for(&self, request: &CompressionRequest) -> f64 {
        if let Some(t) = request.quality_threshold {
            return t;
        }
        match request.unit_type {
            MemoryUnitType::Decision | MemoryUnitType::Documentation => 0.8,
            MemoryUnitType::ErrorLog => 0.6,
            MemoryUnitType::Archive => 0.5,
            _ => self.settings.quality_threshold,
        }
    }

    fn cache_key(&self, request: &CompressionRequest) -> String {
        short_hash(&format!(
            "{}:{}:{:?}:{}",
            request.conversation.id,
            request.unit_type,
            request.quality_threshold,
            request.max_summary_length
        ))
    }

    fn build_review_content(
        summaries: &[(Conversation, MemoryUnit)],
        timeframe_days: i64,
    ) -> String {
        let mut parts = vec![
            format!("Global memory review - conversations from the last {timeframe_days} days\n"),
            format!("Total conversations: {}\n\n", summaries.len()),
            "Conversation summaries:\n".to_string(),
        ];

        for (i, (conv, unit)) in summaries.iter().enumerate() {
            parts.push(format!(
                "{}. [{}] {}\n   Summary: {}\n   Keywords: {}\n   Messages: {}, Tokens: {}\n\n",
                i + 1,
                conv.started_at.format("%Y-%m-%d"),
                unit.title,
                unit.summary,
                unit.keywords
                    .iter()
                    .take(5)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", "),
                conv.message_count,
                conv.token_count,
            ));
        }

        // Keyword frequency across every summary
        let mut freq: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
        for (_, unit) in summaries {
            for kw in &unit.keywords {
                *freq.entry(kw.as_str()).or_insert(0) += 1;
            }
        }
        let mut top: Vec<(&str, usize)> = freq.into_iter().collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let total_messages: i64 = summaries.iter().map(|(c, _)| c.message_count).sum();
        let total_tokens: i64 = summaries.iter().map(|(c, _)| c.token_count).sum();
        let n = summaries.len() as f64;

        parts.push("Overall trends:\n".to_string());
        parts.push(format!(
            "Top topics: {}\n",
            top.iter()
                .take(10)
                .map(|(kw, _)| *kw)
                .collect::<Vec<_>>()
                .join(", ")
        ));
        parts.push(format!(
            "Average conversation length: {:.1} messages\n",
            total_messages as f64 / n
        ));
        parts.push(format!(
            "Average token usage: {:.0} tokens\n",
            total_tokens as f64 / n
        ));

        parts.concat()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::llm::ModelGateway;
    use crate::utils::cost::CostTracker;

    fn compressor() -> SemanticCompressor {
        let settings = Settings::default();
        let gateway = Arc::new(ModelGateway::from_api_keys(
            &crate::config::ApiKeys::default(),
            settings.models.clone(),
            4,
            Arc::new(CostTracker::new()),
            reqwest::Client::new(),
        ));
        SemanticCompressor::new(gateway, settings.memory, 50, 100)
    }

    fn conversation(tokens: i64) -> Conversation {
        let mut conv = Conversation::new("default");
        conv.push_message(MessageType::Human, "How to implement binary search?");
        conv.push_message(
            MessageType::Assistant,
            "Use a sorted array and compare against the midpoint each step.",
        );
        conv.token_count = tokens;
        conv
    }

    #[test]
    fn test_preprocess_labels_roles() {
        let c = compressor();
        let conv = conversation(100);
        let processed = c.preprocess(&conv);
        assert!(processed.contains("[USER]: How to implement binary search?"));
        assert!(processed.contains("[ASSISTANT]:"));
    }

    #[test]
    fn test_preprocess_skips_blank_messages() {
        let c = compressor();
        let mut conv = conversation(100);
        conv.push_message(MessageType::Human, "   ");
        let processed = c.preprocess(&conv);
        assert_eq!(processed.matches('[').count(), 2);
    }

    #[test]
    fn test_select_model_tiers() {
        let c = compressor();
        let short = "short content";
        let long = "word ".repeat(6000);

        assert_eq!(
            c.select_model(MemoryUnitType::Conversation, short),
            "deepseek-ai/DeepSeek-V2.5"
        );
        assert_eq!(c.select_model(MemoryUnitType::Conversation, &long), "deepseek-r1");
        assert_eq!(
            c.select_model(MemoryUnitType::Decision, short),
            "claude-3.5-sonnet"
        );
        assert_eq!(c.select_model(MemoryUnitType::Documentation, &long), "gemini-2.5-pro");
        assert_eq!(
            c.select_model(MemoryUnitType::Archive, &long),
            "deepseek-ai/DeepSeek-V2.5"
        );
    }

    #[test]
    fn test_parse_reply_strict_json() {
        let reply = r#"{"title": "T", "summary": "the summary", "content": "extra",
                        "key_topics": ["a", "b"], "importance_score": 0.9,
                        "metadata": {"main_intent": "learn"}}"#;
        let parsed = SemanticCompressor::parse_reply(reply);
        assert_eq!(parsed.title.as_deref(), Some("T"));
        assert_eq!(parsed.summary, "the summary");
        assert_eq!(parsed.key_topics, vec!["a", "b"]);
        assert!((parsed.importance_score - 0.9).abs() < f64::EPSILON);
        assert_eq!(parsed.metadata["main_intent"], "learn");
    }

    #[test]
    fn test_parse_reply_embedded_json() {
        let reply = "Here is the result:\n{\"summary\": \"embedded\"}\nthanks";
        let parsed = SemanticCompressor::parse_reply(reply);
        assert_eq!(parsed.summary, "embedded");
    }

    #[test]
    fn test_parse_reply_fallback_shape() {
        let reply = "plain prose with no json at all";
        let parsed = SemanticCompressor::parse_reply(reply);
        assert_eq!(parsed.summary, reply);
        assert_eq!(parsed.metadata["parse_fallback"], true);
        assert!((parsed.importance_score - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_auto_title_word_boundary() {
        let summary = "a discussion about implementing persistent conversational memory services in production";
        let title = SemanticCompressor::auto_title(summary);
        assert!(title.ends_with("..."));
        assert!(title.chars().count() <= 53);
        assert!(!title.trim_end_matches("...").ends_with(' '));
    }

    #[test]
    fn test_quality_good_unit_scores_high() {
        let c = compressor();
        let conv = conversation(1000);
        let mut unit = MemoryUnit::new("default", Some(conv.id.clone()), MemoryUnitType::Conversation);
        unit.title = "Binary search discussion".to_string();
        unit.summary = "The user asked how to implement binary search and the assistant \
                        explained the midpoint comparison strategy over sorted arrays, \
                        including edge cases for empty inputs."
            .to_string();
        unit.set_keywords(vec![
            "binary".into(),
            "search".into(),
            "algorithm".into(),
            "arrays".into(),
            "midpoint".into(),
        ]);
        unit.token_count = 200; // ratio 0.2, ideal band

        let score = c.evaluate_quality(&unit, &conv);
        assert!(score >= 0.9, "expected high quality, got {score}");
    }

    #[test]
    fn test_quality_degenerate_unit_scores_low() {
        let c = compressor();
        let conv = conversation(1000);
        let mut unit = MemoryUnit::new("default", Some(conv.id.clone()), MemoryUnitType::Conversation);
        unit.title = "t".to_string();
        unit.summary = "aaaa".to_string();
        unit.token_count = 900; // ratio 0.9, poor compression

        let score = c.evaluate_quality(&unit, &conv);
        assert!(score < 0.5, "expected low quality, got {score}");
    }

    #[test]
    fn test_threshold_table() {
        let c = compressor();
        let conv = conversation(10);
        let mk = |unit_type| CompressionRequest::new(conv.clone(), unit_type);
        assert!((c.threshold_for(&mk(MemoryUnitType::Decision)) - 0.8).abs() < f64::EPSILON);
        assert!((c.threshold_for(&mk(MemoryUnitType::ErrorLog)) - 0.6).abs() < f64::EPSILON);
        assert!((c.threshold_for(&mk(MemoryUnitType::Archive)) - 0.5).abs() < f64::EPSILON);
        assert!((c.threshold_for(&mk(MemoryUnitType::Conversation)) - 0.7).abs() < f64::EPSILON);

        let mut custom = mk(MemoryUnitType::Decision);
        custom.quality_threshold = Some(0.55);
        assert!((c.threshold_for(&custom) - 0.55).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cache_key_depends_on_inputs() {
        let c = compressor();
        let conv = conversation(10);
        let a = c.cache_key(&CompressionRequest::new(conv.clone(), MemoryUnitType::Conversation));
        let b = c.cache_key(&CompressionRequest::new(conv.clone(), MemoryUnitType::Decision));
        assert_ne!(a, b);
        let a2 = c.cache_key(&CompressionRequest::new(conv, MemoryUnitType::Conversation));
        assert_eq!(a, a2);
    }

    #[tokio::test]
    async fn test_batch_isolates_failures() {
        let c = compressor();
        let requests = vec![
            CompressionRequest::new(Conversation::new("default"), MemoryUnitType::Conversation),
            CompressionRequest::new(conversation(100), MemoryUnitType::Conversation),
        ];
        let results = c.compress_batch(requests).await;
        assert_eq!(results.len(), 2);
        // The empty conversation fails validation, the other fails at the
        // gateway (no providers) - each failure stays isolated
        assert!(matches!(results[0], Err(MemoryError::Validation(_))));
        assert!(results[1].is_err());
    }

    #[tokio::test]
    async fn test_empty_conversation_rejected() {
        let c = compressor();
        let conv = Conversation::new("default");
        let err = c
            .compress(&CompressionRequest::new(conv, MemoryUnitType::Conversation))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
    }

    #[test]
    fn test_review_content_aggregates_stats() {
        let conv = conversation(500);
        let mut unit = MemoryUnit::new("default", Some(conv.id.clone()), MemoryUnitType::Conversation);
        unit.title = "binary search".to_string();
        unit.summary = "discussed binary search".to_string();
        unit.set_keywords(vec!["binary".into(), "search".into()]);

        let content =
            SemanticCompressor::build_review_content(&[(conv, unit)], 7);
        assert!(content.contains("last 7 days"));
        assert!(content.contains("Total conversations: 1"));
        assert!(content.contains("Top topics: binary, search"));
    }
}
