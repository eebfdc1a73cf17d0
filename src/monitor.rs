// src/monitor.rs
// Cost monitor: budget thresholds, alerts and degradation levels

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use strum::Display;
use tracing::{info, warn};

use crate::config::CostSettings;
use crate::llm::CostCategory;
use crate::utils::cost::CostTracker;

/// Budget usage level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CostLevel {
    Normal,
    Warning,
    Critical,
    Exceeded,
}

impl CostLevel {
    fn from_usage_percent(percent: f64) -> Self {
        if percent >= 100.0 {
            Self::Exceeded
        } else if percent >= 90.0 {
            Self::Critical
        } else if percent >= 80.0 {
            Self::Warning
        } else {
            Self::Normal
        }
    }
}

/// Tracked budget buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BudgetType {
    Daily,
    Embedding,
    Fusion,
    Compression,
}

/// A budget alert
#[derive(Debug, Clone, Serialize)]
pub struct CostAlert {
    pub timestamp: DateTime<Utc>,
    pub level: CostLevel,
    pub budget_type: BudgetType,
    pub current_cost: f64,
    pub budget_limit: f64,
    pub usage_percent: f64,
    pub message: String,
    pub suggestions: Vec<String>,
}

/// What the pipeline may still do under the current degradation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DegradationConfig {
    pub fusion_enabled: bool,
    pub compression_enabled: bool,
    pub heavy_model_enabled: bool,
}

/// Callback invoked on every emitted alert.
pub type AlertCallback = Box<dyn Fn(&CostAlert) + Send + Sync>;

struct MonitorState {
    cost_by_type: HashMap<BudgetType, f64>,
    levels: HashMap<BudgetType, CostLevel>,
    alert_history: Vec<CostAlert>,
    degradation_level: u8,
    last_reset_date: String,
}

/// Process-wide budget monitor.
///
/// Every tracked cost lands in a budget bucket and re-evaluates the bucket
/// level. An upward level change emits an alert and (with auto degradation
/// on) raises the degradation level: critical disables compression and
/// heavy models, exceeded additionally disables fusion. Midnight resets
/// per-day counters and degradation.
pub struct CostMonitor {
    settings: CostSettings,
    tracker: Arc<CostTracker>,
    state: Mutex<MonitorState>,
    callback: Option<AlertCallback>,
}

impl CostMonitor {
    pub fn new(
        tracker: Arc<CostTracker>,
        settings: CostSettings,
        callback: Option<AlertCallback>,
    ) -> Self {
        info!(
            daily_budget = settings.daily_budget_usd,
            "Cost monitor initialized"
        );
        Self {
            settings,
            tracker,
            state: Mutex::new(MonitorState {
                cost_by_type: HashMap::new(),
                levels: HashMap::new(),
                alert_history: Vec::new(),
                degradation_level: 0,
                last_reset_date: Utc::now().format("%Y-%m-%d").to_string(),
            }),
            callback,
        }
    }

    /// Calculate, record and bucket the cost of one model call.
    pub fn track_cost(
        &self,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        category: CostCategory,
    ) -> f64 {
        let cost = self.tracker.calculate(model, input_tokens, output_tokens);
        self.observe(category, cost);
        cost
    }

    /// Bucket an already-calculated cost and re-evaluate budget levels.
    /// Used by the gateway, which records into the tracker itself.
    pub fn observe(&self, category: CostCategory, cost: f64) {
        let bucket = match category {
            CostCategory::Embedding => Some(BudgetType::Embedding),
            CostCategory::Fusion => Some(BudgetType::Fusion),
            CostCategory::Compression => Some(BudgetType::Compression),
            CostCategory::Other => None,
        };

        let mut alerts = Vec::new();
        {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if let Some(bucket) = bucket {
                *state.cost_by_type.entry(bucket).or_insert(0.0) += cost;
            }
            self.check_budgets(&mut state, &mut alerts);
        }
        for alert in alerts {
            self.handle_alert(alert);
        }
    }

    fn check_budgets(&self, state: &mut MonitorState, alerts: &mut Vec<CostAlert>) {
        let daily = self.tracker.today_cost();
        let checks = [
            (BudgetType::Daily, daily, self.settings.daily_budget_usd),
            (
                BudgetType::Embedding,
                state
                    .cost_by_type
                    .get(&BudgetType::Embedding)
                    .copied()
                    .unwrap_or(0.0),
                self.settings.embedding_daily_budget_usd,
            ),
            (
                BudgetType::Fusion,
                state
                    .cost_by_type
                    .get(&BudgetType::Fusion)
                    .copied()
                    .unwrap_or(0.0),
                self.settings.fusion_daily_budget_usd,
            ),
            (
                BudgetType::Compression,
                state
                    .cost_by_type
                    .get(&BudgetType::Compression)
                    .copied()
                    .unwrap_or(0.0),
                self.settings.compression_daily_budget_usd,
            ),
        ];

        for (budget_type, current, limit) in checks {
            let usage_percent = if limit > 0.0 {
                current / limit * 100.0
            } else {
                0.0
            };
            let level = CostLevel::from_usage_percent(usage_percent);
            let previous = state
                .levels
                .get(&budget_type)
                .copied()
                .unwrap_or(CostLevel::Normal);

            // Only upward transitions alert; recovery is silent until reset
            if level > previous {
                let alert = Self::build_alert(budget_type, level, current, limit, usage_percent);
                state.alert_history.push(alert.clone());
                alerts.push(alert);

                if self.settings.auto_degradation_enabled {
                    let target = match level {
                        CostLevel::Critical => 1,
                        CostLevel::Exceeded => 2,
                        _ => state.degradation_level,
                    };
                    if target > state.degradation_level {
                        state.degradation_level = target;
                        info!(level = target, "Cost degradation applied");
                    }
                }
            }
            state.levels.insert(budget_type, level);
        }
    }

    fn build_alert(
        budget_type: BudgetType,
        level: CostLevel,
        current_cost: f64,
        budget_limit: f64,
        usage_percent: f64,
    ) -> CostAlert {
        let suggestions = match level {
            CostLevel::Warning => vec![
                "Reduce API call frequency".to_string(),
                "Enable more aggressive caching".to_string(),
                "Prefer lighter models".to_string(),
            ],
            CostLevel::Critical => vec![
                "Switch to light models immediately".to_string(),
                "Pause non-essential compression".to_string(),
                "Keep only critical features running".to_string(),
            ],
            CostLevel::Exceeded => vec![
                "Emergency degradation engaged".to_string(),
                "Stop all non-critical API calls".to_string(),
                "Fall back to embedding-only mode".to_string(),
            ],
            CostLevel::Normal => Vec::new(),
        };

        CostAlert {
            timestamp: Utc::now(),
            level,
            budget_type,
            current_cost,
            budget_limit,
            usage_percent,
            message: format!("{budget_type} budget usage reached {usage_percent:.1}%"),
            suggestions,
        }
    }

    fn handle_alert(&self, alert: CostAlert) {
        warn!(
            level = %alert.level,
            budget_type = %alert.budget_type,
            usage_percent = alert.usage_percent,
            "Cost alert"
        );
        if let Some(callback) = &self.callback {
            callback(&alert);
        }
    }

    /// Current degradation level (0, 1 or 2).
    pub fn degradation_level(&self) -> u8 {
        self.state.lock().map(|s| s.degradation_level).unwrap_or(0)
    }

    /// What the pipeline may still do at the current level.
    pub fn degradation_config(&self) -> DegradationConfig {
        match self.degradation_level() {
            0 => DegradationConfig {
                fusion_enabled: true,
                compression_enabled: true,
                heavy_model_enabled: true,
            },
            1 => DegradationConfig {
                fusion_enabled: true,
                compression_enabled: false,
                heavy_model_enabled: false,
            },
            _ => DegradationConfig {
                fusion_enabled: false,
                compression_enabled: false,
                heavy_model_enabled: false,
            },
        }
    }

    /// Reset per-day counters and degradation (midnight rollover).
    pub fn reset_daily_counters(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.cost_by_type.clear();
            state.levels.clear();
            state.degradation_level = 0;
            state.last_reset_date = Utc::now().format("%Y-%m-%d").to_string();
        }
        info!("Daily cost counters reset");
    }

    /// Reset when the local date has rolled over since the last reset.
    /// Called from the monitor loop; returns true when a reset happened.
    pub fn rollover_if_new_day(&self) -> bool {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let needs_reset = self
            .state
            .lock()
            .map(|s| s.last_reset_date != today)
            .unwrap_or(false);
        if needs_reset {
            self.reset_daily_counters();
        }
        needs_reset
    }

    /// Cost report: daily usage, per-bucket spend, per-model breakdown,
    /// alerts from the last hour, and recommendations.
    pub fn report(&self) -> Value {
        let daily_cost = self.tracker.today_cost();
        let daily_budget = self.settings.daily_budget_usd;
        let usage_percent = if daily_budget > 0.0 {
            daily_cost / daily_budget * 100.0
        } else {
            0.0
        };

        let (by_type, recent_alerts, degradation_level) = match self.state.lock() {
            Ok(state) => {
                let hour_ago = Utc::now() - chrono::Duration::hours(1);
                let recent: Vec<CostAlert> = state
                    .alert_history
                    .iter()
                    .filter(|a| a.timestamp >= hour_ago)
                    .cloned()
                    .collect();
                (state.cost_by_type.clone(), recent, state.degradation_level)
            }
            Err(_) => (HashMap::new(), Vec::new(), 0),
        };

        let embedding = by_type.get(&BudgetType::Embedding).copied().unwrap_or(0.0);
        let fusion = by_type.get(&BudgetType::Fusion).copied().unwrap_or(0.0);
        let compression = by_type
            .get(&BudgetType::Compression)
            .copied()
            .unwrap_or(0.0);

        let mut recommendations = Vec::new();
        if usage_percent > 50.0 {
            recommendations.push("Daily spend is past half the budget; watch usage".to_string());
        }
        if fusion > embedding {
            recommendations
                .push("Fusion is costing more than embeddings; review fusion policy".to_string());
        }
        if degradation_level > 0 {
            recommendations.push(format!(
                "Running degraded (level {degradation_level})"
            ));
        }

        json!({
            "timestamp": Utc::now(),
            "daily_cost": daily_cost,
            "daily_budget": daily_budget,
            "daily_usage_percent": usage_percent,
            "embedding_cost": embedding,
            "fusion_cost": fusion,
            "compression_cost": compression,
            "cost_by_model": self.tracker.cost_by_model(),
            "alerts": recent_alerts,
            "recommendations": recommendations,
            "degradation_level": degradation_level,
        })
    }
}
