//! Adaptive response selection.
//!
//! Every strategy sits behind the uniform [`ResponseStrategy`] capability;
//! the selector picks one per batch from the situational shape (batch size,
//! type diversity, operating mode) and blends several for HYBRID. When
//! online learning is enabled it appends one [`LearningEvent`] per
//! invocation and nudges tracked model metrics with a bounded EWMA step.
//! This is a running average, not a training loop.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::helpers::{epoch_ms, mean};
use crate::types::{
    RecommendedAction, ResilienceMode, ResilienceState, ResponseActionKind, Severity, Signal,
    SignalType,
};

/// Accuracy metrics stay inside this band.
const ACCURACY_FLOOR: f64 = 0.5;
const ACCURACY_CEIL: f64 = 0.99;
/// Baseline the maintenance decay drifts accuracy toward.
const ACCURACY_BASELINE: f64 = 0.75;

/// Response strategy family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyKind {
    RuleBased,
    Statistical,
    PatternMatching,
    MachineLearning,
    Hybrid,
}

impl StrategyKind {
    /// Get display string for the strategy kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::RuleBased => "RULE_BASED",
            StrategyKind::Statistical => "STATISTICAL",
            StrategyKind::PatternMatching => "PATTERN_MATCHING",
            StrategyKind::MachineLearning => "MACHINE_LEARNING",
            StrategyKind::Hybrid => "HYBRID",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Batch-level prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub probability: f64,
    pub horizon_ms: u64,
}

impl Prediction {
    fn stable() -> Self {
        Self {
            label: "stable_operation".to_string(),
            probability: 0.0,
            horizon_ms: 24 * 3_600_000,
        }
    }
}

/// Output of one strategy invocation.
#[derive(Debug, Clone)]
pub struct StrategyOutput {
    pub actions: Vec<RecommendedAction>,
    pub prediction: Prediction,
    pub confidence: f64,
}

/// Uniform strategy capability.
pub trait ResponseStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;
    fn score(&self, signals: &[Signal], state: &ResilienceState) -> StrategyOutput;
}

/// Learning record appended per selector invocation when online learning is
/// enabled. Append-only, bounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningEvent {
    pub timestamp_ms: u64,
    pub strategy: StrategyKind,
    /// Ids of the signals this response covered
    pub original_signals: Vec<String>,
    pub response_actions: Vec<ResponseActionKind>,
    /// Observed severity of the batch, 0-1 (proxy outcome)
    pub actual_outcome: f64,
    pub insights: Vec<String>,
    pub algorithm_updates: Vec<String>,
}

/// Per-strategy tracked metrics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelMetrics {
    /// EWMA accuracy, clamped to [0.5, 0.99]
    pub accuracy: f64,
    pub invocations: u64,
}

impl Default for ModelMetrics {
    fn default() -> Self {
        Self {
            accuracy: ACCURACY_BASELINE,
            invocations: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

fn batch_severity(signals: &[Signal]) -> f64 {
    let fractions: Vec<f64> = signals.iter().map(|s| s.severity.risk_fraction()).collect();
    mean(&fractions)
}

fn max_severity(signals: &[Signal]) -> Option<Severity> {
    signals.iter().map(|s| s.severity).max()
}

/// Deterministic rule table. The strategy of record under EMERGENCY mode.
#[derive(Debug, Default)]
pub struct RuleBasedStrategy;

impl ResponseStrategy for RuleBasedStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::RuleBased
    }

    fn score(&self, signals: &[Signal], state: &ResilienceState) -> StrategyOutput {
        let mut actions = Vec::new();
        if signals.iter().any(|s| {
            s.severity == Severity::Critical && s.signal_type == SignalType::Emergency
        }) || state.mode == ResilienceMode::Emergency
        {
            actions.push(RecommendedAction {
                kind: ResponseActionKind::EmergencyResponse,
                description: "rule: critical emergency in batch".to_string(),
                priority: 0,
            });
            actions.push(RecommendedAction {
                kind: ResponseActionKind::DeployMargin,
                description: "rule: deploy reserved margin".to_string(),
                priority: 1,
            });
        }
        match max_severity(signals) {
            Some(Severity::Critical) | Some(Severity::High) => {
                actions.push(RecommendedAction {
                    kind: ResponseActionKind::AllocateMargin,
                    description: "rule: reserve margin for high-severity batch".to_string(),
                    priority: 2,
                });
            }
            Some(_) => {
                actions.push(RecommendedAction {
                    kind: ResponseActionKind::MonitorClosely,
                    description: "rule: routine monitoring".to_string(),
                    priority: 8,
                });
            }
            None => {}
        }

        let severity = batch_severity(signals);
        StrategyOutput {
            actions,
            prediction: Prediction {
                label: if severity >= 0.8 {
                    "service_disruption".to_string()
                } else {
                    "stable_operation".to_string()
                },
                probability: severity,
                horizon_ms: 3_600_000,
            },
            confidence: 0.9, // rules are near-certain on the cases they cover
        }
    }
}

/// Severity/strength moment statistics over the batch.
#[derive(Debug, Default)]
pub struct StatisticalStrategy;

impl ResponseStrategy for StatisticalStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Statistical
    }

    fn score(&self, signals: &[Signal], _state: &ResilienceState) -> StrategyOutput {
        let severity = batch_severity(signals);
        let strengths: Vec<f64> = signals.iter().map(|s| s.strength / 100.0).collect();
        let strength = mean(&strengths);
        let composite = 0.6 * severity + 0.4 * strength;

        let mut actions = Vec::new();
        if composite >= 0.6 {
            actions.push(RecommendedAction {
                kind: ResponseActionKind::AllocateMargin,
                description: format!("statistical: composite load {composite:.2}"),
                priority: 3,
            });
        }
        if composite >= 0.3 {
            actions.push(RecommendedAction {
                kind: ResponseActionKind::MonitorClosely,
                description: "statistical: sustained load".to_string(),
                priority: 7,
            });
        }

        // Confidence grows with sample size.
        let n = signals.len() as f64;
        StrategyOutput {
            actions,
            prediction: Prediction {
                label: "degraded_operation".to_string(),
                probability: composite,
                horizon_ms: 4 * 3_600_000,
            },
            confidence: (n / (n + 5.0)).clamp(0.0, 0.95),
        }
    }
}

/// Type diversity and repetition over the batch.
#[derive(Debug, Default)]
pub struct PatternMatchingStrategy;

impl ResponseStrategy for PatternMatchingStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PatternMatching
    }

    fn score(&self, signals: &[Signal], _state: &ResilienceState) -> StrategyOutput {
        let mut counts: HashMap<SignalType, usize> = HashMap::new();
        for s in signals {
            *counts.entry(s.signal_type).or_default() += 1;
        }
        let distinct = counts.len();
        let repeated = counts.values().any(|&c| c >= 3);

        let mut actions = Vec::new();
        if distinct >= 3 {
            actions.push(RecommendedAction {
                kind: ResponseActionKind::InvestigatePattern,
                description: format!("pattern: {distinct} distinct signal types in batch"),
                priority: 4,
            });
        }
        if repeated {
            actions.push(RecommendedAction {
                kind: ResponseActionKind::InvestigatePattern,
                description: "pattern: repeated signal type".to_string(),
                priority: 5,
            });
        }
        if !signals.is_empty() {
            actions.push(RecommendedAction {
                kind: ResponseActionKind::MonitorClosely,
                description: "pattern: track batch shape".to_string(),
                priority: 8,
            });
        }
        actions.dedup_by_key(|a| a.kind);

        StrategyOutput {
            actions,
            prediction: Prediction {
                label: "recurring_pattern".to_string(),
                probability: batch_severity(signals),
                horizon_ms: 12 * 3_600_000,
            },
            confidence: (0.55 + 0.05 * distinct as f64).min(0.9),
        }
    }
}

/// Deterministic learned strategy: two EWMA-tracked feature weights. The
/// "machine learning" slot; a real model can replace it behind the trait.
#[derive(Debug)]
pub struct LearnedStrategy {
    weights: Mutex<(f64, f64)>, // (severity weight, strength weight)
}

impl Default for LearnedStrategy {
    fn default() -> Self {
        Self {
            weights: Mutex::new((0.6, 0.4)),
        }
    }
}

impl LearnedStrategy {
    /// Nudge feature weights toward the observed outcome with a bounded
    /// step. Weights stay normalized.
    pub fn learn(&self, severity: f64, strength: f64, outcome: f64, learning_rate: f64) {
        let mut w = self.weights.lock().unwrap();
        let rate = learning_rate.clamp(0.0, 1.0) * 0.1;
        // Shift weight toward whichever feature tracked the outcome better.
        let severity_err = (severity - outcome).abs();
        let strength_err = (strength - outcome).abs();
        if severity_err < strength_err {
            w.0 += rate;
        } else {
            w.1 += rate;
        }
        let sum = w.0 + w.1;
        w.0 /= sum;
        w.1 /= sum;
    }
}

impl ResponseStrategy for LearnedStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::MachineLearning
    }

    fn score(&self, signals: &[Signal], _state: &ResilienceState) -> StrategyOutput {
        let (w_severity, w_strength) = *self.weights.lock().unwrap();
        let severity = batch_severity(signals);
        let strengths: Vec<f64> = signals.iter().map(|s| s.strength / 100.0).collect();
        let strength = mean(&strengths);
        let score = w_severity * severity + w_strength * strength;

        let mut actions = Vec::new();
        if score >= 0.7 {
            actions.push(RecommendedAction {
                kind: ResponseActionKind::EscalateRisk,
                description: format!("learned: predicted load {score:.2}"),
                priority: 2,
            });
        }
        if score >= 0.4 {
            actions.push(RecommendedAction {
                kind: ResponseActionKind::AllocateMargin,
                description: format!("learned: predicted load {score:.2}"),
                priority: 3,
            });
        } else if !signals.is_empty() {
            actions.push(RecommendedAction {
                kind: ResponseActionKind::MonitorClosely,
                description: "learned: low predicted load".to_string(),
                priority: 8,
            });
        }

        StrategyOutput {
            actions,
            prediction: Prediction {
                label: "predicted_load".to_string(),
                probability: score.clamp(0.0, 1.0),
                horizon_ms: 8 * 3_600_000,
            },
            confidence: 0.7,
        }
    }
}

// ---------------------------------------------------------------------------
// Performance tracking
// ---------------------------------------------------------------------------

/// Bounded response-time ring plus a true total-processed counter.
pub struct PerformanceTracker {
    response_times_us: Mutex<VecDeque<u64>>,
    cap: usize,
    total_processed: AtomicU64,
}

impl PerformanceTracker {
    pub fn new(cap: usize) -> Self {
        Self {
            response_times_us: Mutex::new(VecDeque::with_capacity(cap.min(1024))),
            cap,
            total_processed: AtomicU64::new(0),
        }
    }

    /// Record one processed signal and its latency sample.
    pub fn record(&self, elapsed_us: u64) {
        self.total_processed.fetch_add(1, Ordering::Relaxed);
        let mut ring = self.response_times_us.lock().unwrap();
        if ring.len() >= self.cap {
            ring.pop_front();
        }
        ring.push_back(elapsed_us);
    }

    /// Total signals ever processed (not bounded by the ring).
    pub fn total_processed(&self) -> u64 {
        self.total_processed.load(Ordering::Relaxed)
    }

    /// Number of retained latency samples.
    pub fn sample_count(&self) -> usize {
        self.response_times_us.lock().unwrap().len()
    }

    /// Mean retained latency in microseconds.
    pub fn mean_response_us(&self) -> f64 {
        let ring = self.response_times_us.lock().unwrap();
        if ring.is_empty() {
            return 0.0;
        }
        ring.iter().sum::<u64>() as f64 / ring.len() as f64
    }
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

/// Outcome of one selector invocation.
#[derive(Debug, Clone)]
pub struct SelectorOutcome {
    pub strategy: StrategyKind,
    pub actions: Vec<RecommendedAction>,
    pub prediction: Prediction,
    pub confidence: f64,
    pub insights: Vec<String>,
}

/// Selector tunables, read per invocation and replaced wholesale on config
/// updates. Learned weights and tracked metrics survive a retune.
#[derive(Debug, Clone)]
pub struct SelectorSettings {
    /// Batch size above which HYBRID kicks in
    pub complexity_threshold: usize,
    pub default_strategy: StrategyKind,
    pub hybrid_weights: Vec<(StrategyKind, f64)>,
    pub online_learning: bool,
    pub learning_rate: f64,
}

/// Chooses and runs a response strategy per batch.
pub struct AdaptiveResponseSelector {
    settings: RwLock<SelectorSettings>,
    rule_based: RuleBasedStrategy,
    statistical: StatisticalStrategy,
    pattern_matching: PatternMatchingStrategy,
    learned: LearnedStrategy,
    metrics: Mutex<HashMap<StrategyKind, ModelMetrics>>,
    learning_events: Mutex<VecDeque<LearningEvent>>,
    learning_event_cap: usize,
    pub(crate) perf: PerformanceTracker,
}

impl AdaptiveResponseSelector {
    pub fn new(
        complexity_threshold: usize,
        default_strategy: StrategyKind,
        hybrid_weights: Vec<(StrategyKind, f64)>,
        online_learning: bool,
        learning_rate: f64,
        learning_event_cap: usize,
        response_history_cap: usize,
    ) -> Self {
        Self {
            settings: RwLock::new(SelectorSettings {
                complexity_threshold,
                default_strategy,
                hybrid_weights,
                online_learning,
                learning_rate,
            }),
            rule_based: RuleBasedStrategy,
            statistical: StatisticalStrategy,
            pattern_matching: PatternMatchingStrategy,
            learned: LearnedStrategy::default(),
            metrics: Mutex::new(HashMap::new()),
            learning_events: Mutex::new(VecDeque::new()),
            learning_event_cap,
            perf: PerformanceTracker::new(response_history_cap),
        }
    }

    /// Pick a strategy from the situational shape. Rule-based, never
    /// randomized.
    pub fn select_strategy(&self, signals: &[Signal], state: &ResilienceState) -> StrategyKind {
        let settings = self.settings.read().unwrap();
        if signals.len() > settings.complexity_threshold {
            return StrategyKind::Hybrid;
        }
        let distinct: HashSet<SignalType> = signals.iter().map(|s| s.signal_type).collect();
        if distinct.len() >= 3 {
            return StrategyKind::PatternMatching;
        }
        if state.mode == ResilienceMode::Emergency {
            return StrategyKind::RuleBased;
        }
        settings.default_strategy
    }

    /// Replace the tunables. Tracked metrics and learned weights carry over.
    pub fn reconfigure(&self, settings: SelectorSettings) {
        *self.settings.write().unwrap() = settings;
    }

    /// Run the selected strategy (or the hybrid blend) over the batch.
    pub fn process(&self, signals: &[Signal], state: &ResilienceState) -> SelectorOutcome {
        let strategy = self.select_strategy(signals, state);
        let settings = self.settings.read().unwrap().clone();
        let mut insights = vec![format!(
            "strategy {strategy} for batch of {} ({} mode)",
            signals.len(),
            state.mode
        )];

        let output = match strategy {
            StrategyKind::Hybrid => {
                self.blend(signals, state, &settings.hybrid_weights, &mut insights)
            }
            kind => self.strategy(kind).score(signals, state),
        };

        let outcome_proxy = batch_severity(signals);
        if settings.online_learning {
            self.record_learning(
                strategy,
                signals,
                &output,
                outcome_proxy,
                settings.learning_rate,
                &mut insights,
            );
        }

        SelectorOutcome {
            strategy,
            actions: output.actions,
            prediction: if signals.is_empty() {
                Prediction::stable()
            } else {
                output.prediction
            },
            confidence: output.confidence,
            insights,
        }
    }

    fn strategy(&self, kind: StrategyKind) -> &dyn ResponseStrategy {
        match kind {
            StrategyKind::RuleBased => &self.rule_based,
            StrategyKind::Statistical => &self.statistical,
            StrategyKind::PatternMatching => &self.pattern_matching,
            StrategyKind::MachineLearning => &self.learned,
            // Hybrid is handled by blend(); default to rules if asked directly.
            StrategyKind::Hybrid => &self.rule_based,
        }
    }

    /// Weighted blend of the configured underlying strategies.
    fn blend(
        &self,
        signals: &[Signal],
        state: &ResilienceState,
        hybrid_weights: &[(StrategyKind, f64)],
        insights: &mut Vec<String>,
    ) -> StrategyOutput {
        let weight_sum: f64 = hybrid_weights.iter().map(|(_, w)| w).sum();
        let mut confidence = 0.0;
        let mut actions: Vec<RecommendedAction> = Vec::new();
        let mut best: Option<(f64, Prediction)> = None;

        for (kind, weight) in hybrid_weights {
            let weight = weight / weight_sum;
            let output = self.strategy(*kind).score(signals, state);
            confidence += weight * output.confidence;
            for action in output.actions {
                if !actions.iter().any(|a| a.kind == action.kind) {
                    actions.push(action);
                }
            }
            if best.as_ref().is_none_or(|(w, _)| weight > *w) {
                best = Some((weight, output.prediction));
            }
        }
        actions.sort_by_key(|a| a.priority);
        insights.push(format!(
            "hybrid blend over {} strategies",
            hybrid_weights.len()
        ));

        StrategyOutput {
            actions,
            prediction: best.map(|(_, p)| p).unwrap_or_else(Prediction::stable),
            confidence,
        }
    }

    fn record_learning(
        &self,
        strategy: StrategyKind,
        signals: &[Signal],
        output: &StrategyOutput,
        outcome: f64,
        learning_rate: f64,
        insights: &mut Vec<String>,
    ) {
        let mut updates = Vec::new();

        // EWMA nudge on the strategy's tracked accuracy: how close the
        // prediction probability landed to the observed severity proxy.
        {
            let mut metrics = self.metrics.lock().unwrap();
            let entry = metrics.entry(strategy).or_default();
            let agreement = 1.0 - (output.prediction.probability - outcome).abs();
            entry.accuracy = ((1.0 - learning_rate) * entry.accuracy
                + learning_rate * agreement)
                .clamp(ACCURACY_FLOOR, ACCURACY_CEIL);
            entry.invocations += 1;
            updates.push(format!("{strategy} accuracy -> {:.3}", entry.accuracy));
        }

        let strengths: Vec<f64> = signals.iter().map(|s| s.strength / 100.0).collect();
        self.learned
            .learn(batch_severity(signals), mean(&strengths), outcome, learning_rate);

        let event = LearningEvent {
            timestamp_ms: epoch_ms(),
            strategy,
            original_signals: signals.iter().map(|s| s.id.clone()).collect(),
            response_actions: output.actions.iter().map(|a| a.kind).collect(),
            actual_outcome: outcome,
            insights: insights.clone(),
            algorithm_updates: updates,
        };
        let mut events = self.learning_events.lock().unwrap();
        if events.len() >= self.learning_event_cap {
            events.pop_front();
        }
        events.push_back(event);
        debug!(%strategy, outcome, "learning event recorded");
    }

    /// Drift tracked accuracies toward the baseline. Called from the
    /// maintenance sweep so stale strategies do not keep inflated scores.
    pub fn decay_metrics(&self) {
        let mut metrics = self.metrics.lock().unwrap();
        for m in metrics.values_mut() {
            m.accuracy += 0.05 * (ACCURACY_BASELINE - m.accuracy);
            m.accuracy = m.accuracy.clamp(ACCURACY_FLOOR, ACCURACY_CEIL);
        }
    }

    /// Snapshot of tracked per-strategy metrics.
    pub fn metrics(&self) -> HashMap<StrategyKind, ModelMetrics> {
        self.metrics.lock().unwrap().clone()
    }

    /// Snapshot of retained learning events, oldest first.
    pub fn learning_events(&self) -> Vec<LearningEvent> {
        self.learning_events.lock().unwrap().iter().cloned().collect()
    }
}
