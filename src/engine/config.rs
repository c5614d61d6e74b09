//! Engine configuration: defaults, validation, and partial updates.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{MarginThreshold, MarginType};

use super::response::StrategyKind;

/// Configuration for the resilience engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Total capacity per pool, installed at initialize
    pub pool_capacities: HashMap<MarginType, f64>,
    /// Utilization thresholds per pool
    pub thresholds: HashMap<MarginType, MarginThreshold>,
    /// Fail-fast ceiling on simultaneously live allocations
    pub max_concurrent_allocations: usize,
    /// Cooldown applied to a pool after recovering while in SURGE/EMERGENCY
    pub surge_cooldown_ms: u64,
    /// Processing-history bound (drives historical correlation)
    pub history_cap: usize,
    /// Response-time sample ring bound
    pub response_history_cap: usize,
    /// Audit event ring bound
    pub event_cap: usize,
    /// Learning event ring bound
    pub learning_event_cap: usize,
    /// Batch size above which the HYBRID strategy is selected
    pub complexity_threshold: usize,
    /// Strategy used when no selection rule fires
    pub default_strategy: StrategyKind,
    /// Blend weights for the HYBRID strategy; normalized at use
    pub hybrid_weights: Vec<(StrategyKind, f64)>,
    /// Append learning events and nudge model metrics per invocation
    pub online_learning: bool,
    /// EWMA step size for model-metric updates, in [0, 1]
    pub learning_rate: f64,
    /// Advisory per-call latency target; enforced by the caller, not the core
    pub max_response_time_ms: u64,
    /// Trailing window for same-type historical correlation
    pub historical_window_ms: u64,
    /// Number of prior same-type/same-asset results feeding the historical
    /// risk term
    pub historical_risk_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let pool_capacities = MarginType::ALL.iter().map(|&t| (t, 100.0)).collect();
        let thresholds = MarginType::ALL
            .iter()
            .map(|&t| (t, MarginThreshold::default()))
            .collect();
        Self {
            pool_capacities,
            thresholds,
            max_concurrent_allocations: 64,
            surge_cooldown_ms: 60_000,
            history_cap: 1_000,
            response_history_cap: 1_000,
            event_cap: 1_000,
            learning_event_cap: 500,
            complexity_threshold: 10,
            default_strategy: StrategyKind::MachineLearning,
            hybrid_weights: vec![
                (StrategyKind::Statistical, 0.5),
                (StrategyKind::PatternMatching, 0.3),
                (StrategyKind::RuleBased, 0.2),
            ],
            online_learning: true,
            learning_rate: 0.1,
            max_response_time_ms: 100,
            historical_window_ms: 24 * 3_600_000,
            historical_risk_window: 50,
        }
    }
}

impl EngineConfig {
    /// Override one pool's capacity (builder style).
    pub fn with_pool_capacity(mut self, margin_type: MarginType, capacity: f64) -> Self {
        self.pool_capacities.insert(margin_type, capacity);
        self
    }

    /// Override one pool's thresholds (builder style).
    pub fn with_threshold(mut self, margin_type: MarginType, threshold: MarginThreshold) -> Self {
        self.thresholds.insert(margin_type, threshold);
        self
    }

    /// Set the default strategy (builder style).
    pub fn with_default_strategy(mut self, strategy: StrategyKind) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// Enable or disable online learning (builder style).
    pub fn with_online_learning(mut self, enabled: bool) -> Self {
        self.online_learning = enabled;
        self
    }

    /// Validate invariants across the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.pool_capacities.is_empty() {
            return Err("at least one pool capacity is required".to_string());
        }
        for (t, &cap) in &self.pool_capacities {
            if !cap.is_finite() || cap <= 0.0 {
                return Err(format!("{t} pool capacity must be > 0, got {cap}"));
            }
        }
        for (t, threshold) in &self.thresholds {
            threshold
                .validate()
                .map_err(|e| format!("{t} thresholds: {e}"))?;
        }
        if self.max_concurrent_allocations == 0 {
            return Err("max_concurrent_allocations must be >= 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.learning_rate) || !self.learning_rate.is_finite() {
            return Err(format!(
                "learning_rate must be in [0, 1], got {}",
                self.learning_rate
            ));
        }
        if self.hybrid_weights.is_empty() {
            return Err("hybrid_weights must name at least one strategy".to_string());
        }
        let weight_sum: f64 = self.hybrid_weights.iter().map(|(_, w)| w).sum();
        if weight_sum <= 0.0 || !weight_sum.is_finite() {
            return Err(format!(
                "hybrid_weights must sum to a positive value, got {weight_sum}"
            ));
        }
        if self.hybrid_weights.iter().any(|(k, _)| *k == StrategyKind::Hybrid) {
            return Err("hybrid_weights cannot reference HYBRID itself".to_string());
        }
        if self.history_cap == 0 || self.response_history_cap == 0 || self.event_cap == 0 {
            return Err("history bounds must be >= 1".to_string());
        }
        Ok(())
    }
}

/// Partial configuration update. Set fields are merged into the current
/// config; out-of-range values are rejected (thresholds, capacities) or
/// clamped (learning rate) rather than silently accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigPatch {
    pub pool_capacities: Option<HashMap<MarginType, f64>>,
    pub thresholds: Option<HashMap<MarginType, MarginThreshold>>,
    pub max_concurrent_allocations: Option<usize>,
    pub surge_cooldown_ms: Option<u64>,
    pub complexity_threshold: Option<usize>,
    pub default_strategy: Option<StrategyKind>,
    pub hybrid_weights: Option<Vec<(StrategyKind, f64)>>,
    pub online_learning: Option<bool>,
    pub learning_rate: Option<f64>,
    pub max_response_time_ms: Option<u64>,
}

impl ConfigPatch {
    /// Merge this patch into `config`. Returns the merged config without
    /// mutating the input on failure.
    pub fn apply(&self, config: &EngineConfig) -> Result<EngineConfig, String> {
        let mut merged = config.clone();
        if let Some(caps) = &self.pool_capacities {
            for (&t, &cap) in caps {
                merged.pool_capacities.insert(t, cap);
            }
        }
        if let Some(thresholds) = &self.thresholds {
            for (&t, &threshold) in thresholds {
                merged.thresholds.insert(t, threshold);
            }
        }
        if let Some(v) = self.max_concurrent_allocations {
            merged.max_concurrent_allocations = v;
        }
        if let Some(v) = self.surge_cooldown_ms {
            merged.surge_cooldown_ms = v;
        }
        if let Some(v) = self.complexity_threshold {
            merged.complexity_threshold = v;
        }
        if let Some(v) = self.default_strategy {
            merged.default_strategy = v;
        }
        if let Some(v) = &self.hybrid_weights {
            merged.hybrid_weights = v.clone();
        }
        if let Some(v) = self.online_learning {
            merged.online_learning = v;
        }
        if let Some(v) = self.learning_rate {
            // Clamp rather than reject: the field is a step size, any value
            // inside [0, 1] is usable.
            if !v.is_finite() {
                return Err(format!("learning_rate must be finite, got {v}"));
            }
            merged.learning_rate = v.clamp(0.0, 1.0);
        }
        if let Some(v) = self.max_response_time_ms {
            merged.max_response_time_ms = v;
        }
        merged.validate()?;
        Ok(merged)
    }
}
