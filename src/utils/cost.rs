// src/utils/cost.rs
// Per-model cost accounting with session and daily aggregates

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Price per 1K tokens (input, output) in USD.
#[derive(Debug, Clone, Copy)]
struct ModelPrice {
    input_per_1k: f64,
    output_per_1k: f64,
}

const fn price(input: f64, output: f64) -> ModelPrice {
    ModelPrice {
        input_per_1k: input,
        output_per_1k: output,
    }
}

/// Default price applied to unknown models.
const DEFAULT_PRICE: ModelPrice = price(0.001, 0.002);

/// Static price table, $/1K tokens.
fn lookup_price(model: &str) -> ModelPrice {
    match model {
        // Gemini
        "gemini-2.5-flash" => price(0.000075, 0.00015),
        "gemini-2.5-pro" => price(0.00125, 0.005),
        // OpenRouter
        "deepseek-r1" | "deepseek/deepseek-chat-v3-0324" => price(0.001, 0.002),
        "claude-3.5-sonnet" | "anthropic/claude-3.5-sonnet" => price(0.003, 0.015),
        "openai/gpt-4" => price(0.03, 0.06),
        // SiliconFlow
        "deepseek-ai/DeepSeek-V2.5" => price(0.001, 0.002),
        "Qwen/Qwen3-Embedding-8B" => price(0.00002, 0.0),
        "Qwen/Qwen3-Reranker-8B" => price(0.00002, 0.0),
        // Embeddings (legacy)
        "text-embedding-004" => price(0.000025, 0.0),
        "text-embedding-3-small" => price(0.00002, 0.0),
        _ => DEFAULT_PRICE,
    }
}

/// One recorded model call.
#[derive(Debug, Clone)]
pub struct SessionCost {
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub cost: f64,
}

/// Aggregated tracker statistics.
#[derive(Debug, Clone, Default)]
pub struct CostStats {
    pub total_cost: f64,
    pub session_cost: f64,
    pub daily_estimate: f64,
    pub session_count: usize,
    pub daily_breakdown: HashMap<String, f64>,
}

#[derive(Default)]
struct TrackerInner {
    session_costs: Vec<SessionCost>,
    total_cost: f64,
    daily_costs: HashMap<String, f64>,
}

/// Thread-safe API cost tracker.
///
/// `total_cost` is non-decreasing; daily totals are keyed by UTC date and
/// equal the sum of session records within that day.
#[derive(Default)]
pub struct CostTracker {
    inner: Mutex<TrackerInner>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calculate and record the cost of one call.
    pub fn calculate(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let p = lookup_price(model);
        let cost = (input_tokens as f64 / 1000.0) * p.input_per_1k
            + (output_tokens as f64 / 1000.0) * p.output_per_1k;
        self.record(model, cost, Utc::now());
        cost
    }

    fn record(&self, model: &str, cost: f64, now: DateTime<Utc>) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.session_costs.push(SessionCost {
            timestamp: now,
            model: model.to_string(),
            cost,
        });
        inner.total_cost += cost;
        let date_key = now.format("%Y-%m-%d").to_string();
        *inner.daily_costs.entry(date_key).or_insert(0.0) += cost;
    }

    pub fn total_cost(&self) -> f64 {
        self.inner.lock().map(|i| i.total_cost).unwrap_or(0.0)
    }

    pub fn session_cost(&self) -> f64 {
        self.inner
            .lock()
            .map(|i| i.session_costs.iter().map(|c| c.cost).sum())
            .unwrap_or(0.0)
    }

    /// Total recorded cost for the current UTC day.
    pub fn today_cost(&self) -> f64 {
        let key = Utc::now().format("%Y-%m-%d").to_string();
        self.inner
            .lock()
            .map(|i| i.daily_costs.get(&key).copied().unwrap_or(0.0))
            .unwrap_or(0.0)
    }

    /// Mean of the day-totals observed over the last 7 days.
    pub fn daily_estimate(&self) -> f64 {
        let Ok(inner) = self.inner.lock() else {
            return 0.0;
        };
        if inner.daily_costs.is_empty() {
            return 0.0;
        }

        let now = Utc::now();
        let mut recent = Vec::new();
        for i in 0..7 {
            let key = (now - Duration::days(i)).format("%Y-%m-%d").to_string();
            if let Some(cost) = inner.daily_costs.get(&key) {
                recent.push(*cost);
            }
        }
        if recent.is_empty() {
            0.0
        } else {
            recent.iter().sum::<f64>() / recent.len() as f64
        }
    }

    /// Per-model cost breakdown across the session.
    pub fn cost_by_model(&self) -> HashMap<String, f64> {
        let Ok(inner) = self.inner.lock() else {
            return HashMap::new();
        };
        let mut by_model: HashMap<String, f64> = HashMap::new();
        for c in &inner.session_costs {
            *by_model.entry(c.model.clone()).or_insert(0.0) += c.cost;
        }
        by_model
    }

    pub fn stats(&self) -> CostStats {
        let daily_estimate = self.daily_estimate();
        let Ok(inner) = self.inner.lock() else {
            return CostStats::default();
        };
        CostStats {
            total_cost: inner.total_cost,
            session_cost: inner.session_costs.iter().map(|c| c.cost).sum(),
            daily_estimate,
            session_count: inner.session_costs.len(),
            daily_breakdown: inner.daily_costs.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_model_pricing() {
        let tracker = CostTracker::new();
        let cost = tracker.calculate("gemini-2.5-pro", 1000, 1000);
        // 0.00125 + 0.005 per 1K each direction
        assert!((cost - 0.00625).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_uses_default_price() {
        let tracker = CostTracker::new();
        let cost = tracker.calculate("mystery-model-9000", 1000, 1000);
        assert!((cost - 0.003).abs() < 1e-9);
    }

    #[test]
    fn test_total_cost_monotonic() {
        let tracker = CostTracker::new();
        let mut last = 0.0;
        for _ in 0..5 {
            tracker.calculate("gemini-2.5-flash", 500, 100);
            let total = tracker.total_cost();
            assert!(total >= last);
            last = total;
        }
    }

    #[test]
    fn test_daily_total_equals_session_sum() {
        let tracker = CostTracker::new();
        tracker.calculate("gemini-2.5-flash", 1000, 0);
        tracker.calculate("deepseek-ai/DeepSeek-V2.5", 2000, 500);
        let stats = tracker.stats();
        assert!((stats.session_cost - stats.total_cost).abs() < 1e-12);
        let today: f64 = stats
            .daily_breakdown
            .get(&Utc::now().format("%Y-%m-%d").to_string())
            .copied()
            .unwrap_or(0.0);
        assert!((today - stats.total_cost).abs() < 1e-12);
    }

    #[test]
    fn test_daily_estimate_single_day() {
        let tracker = CostTracker::new();
        tracker.calculate("gemini-2.5-flash", 1000, 1000);
        let estimate = tracker.daily_estimate();
        assert!((estimate - tracker.today_cost()).abs() < 1e-12);
    }

    #[test]
    fn test_embedding_models_output_free() {
        let tracker = CostTracker::new();
        let cost = tracker.calculate("Qwen/Qwen3-Embedding-8B", 1000, 1000);
        assert!((cost - 0.00002).abs() < 1e-9);
    }

    #[test]
    fn test_cost_by_model_breakdown() {
        let tracker = CostTracker::new();
        tracker.calculate("gemini-2.5-flash", 1000, 0);
        tracker.calculate("gemini-2.5-flash", 1000, 0);
        let by_model = tracker.cost_by_model();
        assert_eq!(by_model.len(), 1);
        assert!(by_model.contains_key("gemini-2.5-flash"));
    }
}
