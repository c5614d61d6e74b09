//! Resilience engine: the orchestrator tying classification, risk analysis,
//! the margin ledger, policies, and adaptive response selection into one
//! signal-driven control loop.
//!
//! Concurrency shape: the engine is `Send + Sync` and shared behind an
//! `Arc`. Each subsystem guards its own state; the orchestrator holds the
//! state lock only while recomputing the mode against a coherent pool
//! snapshot, and never calls into the ledger while holding it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{Error, Result};
use crate::helpers::{epoch_ms, mean};
use crate::types::{
    AllocationRequest, MarginEvent, MarginEventKind, MarginType, PoolSnapshot, ProcessingResult,
    RecommendedAction, ResilienceMode, ResilienceState, ResponseActionKind, Signal, SignalType,
};

pub mod analyzer;
pub mod classifier;
pub mod config;
pub mod ledger;
mod mode;
pub mod policy;
pub mod response;
pub mod sweeper;


use analyzer::RiskAnalyzer;
use classifier::{Scorer, SignalClassifier};
use config::{ConfigPatch, EngineConfig};
use ledger::{AuditLog, MarginLedger, OptimizationFinding};
use mode::{compute_mode, ModeInputs};
use policy::{
    ConditionOp, MarginPolicy, PolicyAction, PolicyCondition, PolicyEngine,
};
use response::{
    AdaptiveResponseSelector, ModelMetrics, Prediction, SelectorSettings, StrategyKind,
};

/// A signal skipped by batch processing, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingError {
    pub signal_id: String,
    pub message: String,
}

/// Output of one `process_signals` cycle.
#[derive(Debug, Clone)]
pub struct ProcessingOutcome {
    /// Per-signal pipeline results, input order preserved
    pub results: Vec<ProcessingResult>,
    /// Mode after this cycle's recomputation
    pub mode: ResilienceMode,
    /// Strategy the selector ran for the batch
    pub strategy: StrategyKind,
    /// Batch-level actions: per-signal recommendations merged with the
    /// selector's, deduplicated by kind, most urgent first
    pub recommended_actions: Vec<RecommendedAction>,
    pub prediction: Prediction,
    pub confidence: f64,
    /// Ids of policies that fired during the batch
    pub triggered_policies: Vec<String>,
    /// Skipped signals and failed policy actions
    pub processing_errors: Vec<ProcessingError>,
    pub processed: usize,
    pub skipped: usize,
}

/// Result of a margin operation, with the post-operation pool view and mode.
#[derive(Debug, Clone)]
pub struct MarginOutcome {
    pub pool: PoolSnapshot,
    pub allocation_id: u64,
    /// Set for deployments only
    pub deployment_id: Option<u64>,
    pub mode: ResilienceMode,
}

/// Read-only status report.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub initialized: bool,
    pub state: ResilienceState,
    pub pools: Vec<PoolSnapshot>,
    pub active_allocations: usize,
    pub registered_policies: usize,
    pub total_processed: u64,
    pub mean_response_us: f64,
    pub strategy_metrics: HashMap<StrategyKind, ModelMetrics>,
}

/// The orchestrator. All public operations are `&self`; construction via
/// [`ResilienceEngine::new`] followed by [`ResilienceEngine::initialize`].
pub struct ResilienceEngine {
    config: RwLock<EngineConfig>,
    initialized: AtomicBool,
    audit: Arc<AuditLog>,
    ledger: Arc<MarginLedger>,
    policies: PolicyEngine,
    classifier: SignalClassifier,
    analyzer: RiskAnalyzer,
    selector: AdaptiveResponseSelector,
    state: Mutex<ResilienceState>,
    history: RwLock<std::collections::VecDeque<ProcessingResult>>,
}

impl ResilienceEngine {
    /// Build an engine from a validated config. Does not install policies;
    /// call [`initialize`](Self::initialize) before processing.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|m| Error::validation("config", m))?;

        let audit = Arc::new(AuditLog::new(config.event_cap));
        let ledger = Arc::new(MarginLedger::new(
            &config.pool_capacities,
            &config.thresholds,
            config.max_concurrent_allocations,
            config.surge_cooldown_ms,
            config.history_cap,
            audit.clone(),
        ));
        let policies = PolicyEngine::new(ledger.clone(), audit.clone());
        let analyzer = RiskAnalyzer::new(config.historical_window_ms, config.historical_risk_window);
        let selector = AdaptiveResponseSelector::new(
            config.complexity_threshold,
            config.default_strategy,
            config.hybrid_weights.clone(),
            config.online_learning,
            config.learning_rate,
            config.learning_event_cap,
            config.response_history_cap,
        );

        Ok(Self {
            config: RwLock::new(config),
            initialized: AtomicBool::new(false),
            audit,
            ledger,
            policies,
            classifier: SignalClassifier::new(),
            analyzer,
            selector,
            state: Mutex::new(ResilienceState::default()),
            history: RwLock::new(std::collections::VecDeque::new()),
        })
    }

    /// Register a classification scoring model (builder style). The model's
    /// confidence is averaged 50/50 with the rule-based value.
    pub fn with_scorer(mut self, scorer: Box<dyn Scorer>) -> Self {
        self.classifier = SignalClassifier::with_scorer(scorer);
        self
    }

    /// Idempotent startup: installs the default policies on the first call,
    /// returns current status on every call.
    pub fn initialize(&self) -> Result<EngineStatus> {
        if !self.initialized.swap(true, Ordering::SeqCst) {
            self.install_default_policies()?;
            self.state.lock().unwrap().last_health_check_ms = epoch_ms();
            info!(
                policies = self.policies.len(),
                "resilience engine initialized"
            );
        }
        Ok(self.get_status())
    }

    fn install_default_policies(&self) -> Result<()> {
        self.policies.register(MarginPolicy {
            id: "default-emergency-reserve".to_string(),
            margin_type: MarginType::Capacity,
            conditions: vec![
                PolicyCondition::Signal {
                    op: ConditionOp::Eq,
                    value: SignalType::Emergency,
                },
                PolicyCondition::Risk {
                    op: ConditionOp::Gte,
                    value: 0.8,
                },
            ],
            actions: vec![PolicyAction::Alert {
                message: "emergency signal at high risk".to_string(),
                impact: 0.0,
            }],
            priority: 0,
            active: true,
        })?;
        self.policies.register(MarginPolicy {
            id: "default-utilization-watch".to_string(),
            margin_type: MarginType::Capacity,
            conditions: vec![PolicyCondition::Utilization {
                op: ConditionOp::Gte,
                value: 0.9,
            }],
            actions: vec![PolicyAction::Alert {
                message: "overall utilization past 90%".to_string(),
                impact: 0.0,
            }],
            priority: 100,
            active: true,
        })?;
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    /// Run the full pipeline over a batch: validate, classify, assess,
    /// evaluate policies, recompute the mode, select a response. Malformed
    /// signals are skipped with a recorded diagnostic, never a batch error.
    pub fn process_signals(&self, signals: &[Signal]) -> Result<ProcessingOutcome> {
        self.ensure_initialized()?;
        let now = epoch_ms();
        let max_response_us = {
            let config = self.config.read().unwrap();
            config.max_response_time_ms * 1_000
        };

        let mut processing_errors = Vec::new();
        let mut valid: Vec<Signal> = Vec::with_capacity(signals.len());
        for signal in signals {
            match signal.validate() {
                Ok(()) => valid.push(signal.clone()),
                Err(message) => {
                    warn!(signal_id = %signal.id, %message, "signal skipped");
                    processing_errors.push(ProcessingError {
                        signal_id: signal.id.clone(),
                        message,
                    });
                }
            }
        }

        // Working copy of history so signals later in the batch see the
        // results of earlier ones.
        let mut history: Vec<ProcessingResult> =
            self.history.read().unwrap().iter().cloned().collect();
        let mut results = Vec::with_capacity(valid.len());

        for signal in &valid {
            let started = Instant::now();
            let classification = self.classifier.classify(signal);
            let risk_assessment = self.analyzer.assess_risk(signal, &history);
            let pattern_recognition = self.analyzer.recognize_patterns(signal, &history);
            let predictive_analysis = self.analyzer.predict(signal, &risk_assessment);
            let recommended_actions =
                self.analyzer
                    .recommend(signal, &risk_assessment, &pattern_recognition);

            let result = ProcessingResult {
                signal_id: signal.id.clone(),
                signal_type: signal.signal_type,
                severity: signal.severity,
                strength: signal.strength,
                asset_id: signal.asset_id().map(str::to_string),
                timestamp_ms: signal.timestamp_ms,
                classification,
                risk_assessment,
                pattern_recognition,
                predictive_analysis,
                recommended_actions,
            };

            let elapsed_us = started.elapsed().as_micros() as u64;
            self.selector.perf.record(elapsed_us);
            if elapsed_us > max_response_us {
                warn!(
                    signal_id = %signal.id,
                    elapsed_us,
                    limit_us = max_response_us,
                    "signal processing exceeded response-time target"
                );
            }

            history.push(result.clone());
            results.push(result);
        }

        // Policy pass. Escalation floors fold into the mode recomputation;
        // failed actions surface as diagnostics, not batch errors.
        let mut triggered_policies = Vec::new();
        let mut escalation_floor: Option<ResilienceMode> = None;
        for signal in &valid {
            let pass = self.policies.evaluate(signal, now);
            triggered_policies.extend(pass.triggered);
            if let Some(floor) = pass.escalation_floor {
                escalation_floor = Some(match escalation_floor {
                    Some(current) => current.max(floor),
                    None => floor,
                });
            }
            for message in pass.action_errors {
                processing_errors.push(ProcessingError {
                    signal_id: signal.id.clone(),
                    message,
                });
            }
        }

        let state_after = self.recompute_state(&results, escalation_floor, now);

        let selector_outcome = self.selector.process(&valid, &state_after);
        let recommended_actions =
            merge_actions(&results, selector_outcome.actions);

        {
            let mut stored = self.history.write().unwrap();
            let cap = self.config.read().unwrap().history_cap;
            for result in &results {
                if stored.len() >= cap {
                    stored.pop_front();
                }
                stored.push_back(result.clone());
            }
        }

        Ok(ProcessingOutcome {
            processed: results.len(),
            skipped: signals.len() - valid.len(),
            results,
            mode: state_after.mode,
            strategy: selector_outcome.strategy,
            recommended_actions,
            prediction: selector_outcome.prediction,
            confidence: selector_outcome.confidence,
            triggered_policies,
            processing_errors,
        })
    }

    /// Recompute mode and health under the state lock, against a coherent
    /// ledger snapshot. Returns the updated state.
    fn recompute_state(
        &self,
        results: &[ProcessingResult],
        escalation_floor: Option<ResilienceMode>,
        now: u64,
    ) -> ResilienceState {
        // The state lock is taken before the ledger reads: a snapshot taken
        // outside it can go stale before the mode write lands, letting a
        // concurrent writer's newer mode be overwritten. The ledger never
        // takes the state lock, so the nesting cannot deadlock.
        let mut state = self.state.lock().unwrap();
        let pools = self.ledger.snapshot();
        let thresholds = self.ledger.thresholds();
        let forcing_deployment = self.ledger.has_forcing_deployment();
        let utilization = self.ledger.overall_utilization();
        let (mode, cause) = compute_mode(&ModeInputs {
            results,
            pools: &pools,
            thresholds: &thresholds,
            forcing_deployment,
            escalation_floor,
        });
        if mode != state.mode {
            info!(from = %state.mode, to = %mode, %cause, "mode transition");
            self.audit.record(
                MarginEventKind::ModeChange,
                None,
                format!("mode {} -> {} ({cause})", state.mode, mode),
                0.0,
            );
        }
        state.mode = mode;
        state.margin_utilization = utilization;
        state.active_signals_count = results.len();
        state.last_health_check_ms = now;
        state.health_score = health_score(results, utilization);
        state.clone()
    }

    /// Reserve margin and recompute the mode against the new books.
    pub fn allocate_margin(&self, request: AllocationRequest) -> Result<MarginOutcome> {
        self.ensure_initialized()?;
        let margin_type = request.margin_type;
        let allocation = self.ledger.allocate(request)?;
        let state = self.recompute_state(&[], None, epoch_ms());
        Ok(MarginOutcome {
            pool: self.pool_snapshot(margin_type),
            allocation_id: allocation.id,
            deployment_id: None,
            mode: state.mode,
        })
    }

    /// Deploy against the most recent allocation in the pool. Deploying
    /// from CAPACITY or TIME forces EMERGENCY for as long as the deployment
    /// is active.
    pub fn deploy_margin(
        &self,
        margin_type: MarginType,
        amount: f64,
        reason: impl Into<String>,
    ) -> Result<MarginOutcome> {
        self.ensure_initialized()?;
        let allocation = self
            .ledger
            .latest_allocation(margin_type)
            .ok_or_else(|| {
                Error::validation(
                    "margin_type",
                    format!("no active allocation with remaining margin in {margin_type} pool"),
                )
            })?;
        let deployment = self.ledger.deploy(allocation.id, amount, reason)?;
        let state = self.recompute_state(&[], None, epoch_ms());
        Ok(MarginOutcome {
            pool: self.pool_snapshot(margin_type),
            allocation_id: allocation.id,
            deployment_id: Some(deployment.id),
            mode: state.mode,
        })
    }

    /// Return an allocation to its pool and recompute the mode. Recovering
    /// the last CAPACITY/TIME deployment is what brings the engine out of
    /// deployment-forced EMERGENCY.
    pub fn recover_margin(&self, allocation_id: u64, reason: impl Into<String>) -> Result<bool> {
        self.ensure_initialized()?;
        let recovered = self.ledger.recover(allocation_id, reason)?;
        self.recompute_state(&[], None, epoch_ms());
        Ok(recovered)
    }

    /// Register a margin policy. Validation happens here; a rejected policy
    /// leaves the registry untouched.
    pub fn register_policy(&self, policy: MarginPolicy) -> Result<()> {
        self.policies.register(policy)
    }

    /// Apply a partial config update. The merged config is validated before
    /// anything is touched; on any failure the running config is unchanged.
    pub fn update_config(&self, patch: &ConfigPatch) -> Result<EngineConfig> {
        let mut config = self.config.write().unwrap();
        let merged = patch
            .apply(&config)
            .map_err(|m| Error::validation("config", m))?;
        self.ledger
            .apply_config(&merged.pool_capacities, &merged.thresholds)?;
        self.selector.reconfigure(SelectorSettings {
            complexity_threshold: merged.complexity_threshold,
            default_strategy: merged.default_strategy,
            hybrid_weights: merged.hybrid_weights.clone(),
            online_learning: merged.online_learning,
            learning_rate: merged.learning_rate,
        });
        *config = merged.clone();
        info!("engine config updated");
        Ok(merged)
    }

    /// Read-only status snapshot. Never blocks on in-flight margin
    /// operations beyond the individual subsystem locks.
    pub fn get_status(&self) -> EngineStatus {
        EngineStatus {
            initialized: self.initialized.load(Ordering::SeqCst),
            state: self.state.lock().unwrap().clone(),
            pools: self.ledger.snapshot(),
            active_allocations: self.ledger.active_allocation_count(),
            registered_policies: self.policies.len(),
            total_processed: self.selector.perf.total_processed(),
            mean_response_us: self.selector.perf.mean_response_us(),
            strategy_metrics: self.selector.metrics(),
        }
    }

    /// Read-only view of the global state as of the last recomputation.
    pub fn health_check(&self) -> ResilienceState {
        self.state.lock().unwrap().clone()
    }

    /// Maintenance sweep: expire allocations, collect optimization
    /// findings, decay strategy metrics, refresh the mode. No-op before
    /// initialization.
    pub fn run_maintenance(&self) -> Vec<OptimizationFinding> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Vec::new();
        }
        let findings = self.ledger.optimize();
        self.selector.decay_metrics();
        self.recompute_state(&[], None, epoch_ms());
        findings
    }

    /// Current snapshot of one pool's books.
    fn pool_snapshot(&self, margin_type: MarginType) -> PoolSnapshot {
        self.ledger
            .snapshot()
            .into_iter()
            .find(|p| p.margin_type == margin_type)
            .unwrap_or(PoolSnapshot {
                margin_type,
                total_capacity: 0.0,
                allocated_capacity: 0.0,
                available_capacity: 0.0,
                utilization_rate: 0.0,
                status: crate::types::PoolStatus::Normal,
            })
    }

    /// The margin ledger, for direct inspection.
    pub fn ledger(&self) -> &MarginLedger {
        &self.ledger
    }

    /// Audit trail snapshot, oldest first.
    pub fn audit_events(&self) -> Vec<MarginEvent> {
        self.audit.snapshot()
    }

    /// Retained learning events, oldest first.
    pub fn learning_events(&self) -> Vec<response::LearningEvent> {
        self.selector.learning_events()
    }

    /// Running config snapshot.
    pub fn config(&self) -> EngineConfig {
        self.config.read().unwrap().clone()
    }
}

/// Health is capacity headroom minus recent batch risk, on a 0-100 scale.
fn health_score(results: &[ProcessingResult], utilization: f64) -> f64 {
    let risks: Vec<f64> = results
        .iter()
        .map(|r| r.risk_assessment.risk_score)
        .collect();
    let batch_risk = if risks.is_empty() { 0.0 } else { mean(&risks) };
    (100.0 - 30.0 * utilization - 0.5 * batch_risk).clamp(0.0, 100.0)
}

/// Merge per-signal recommendations with the selector's batch actions:
/// dedupe by kind keeping the most urgent, order most urgent first.
fn merge_actions(
    results: &[ProcessingResult],
    selector_actions: Vec<RecommendedAction>,
) -> Vec<RecommendedAction> {
    let mut by_kind: HashMap<ResponseActionKind, RecommendedAction> = HashMap::new();
    let per_signal = results.iter().flat_map(|r| r.recommended_actions.iter().cloned());
    for action in per_signal.chain(selector_actions) {
        match by_kind.get(&action.kind) {
            Some(existing) if existing.priority <= action.priority => {}
            _ => {
                by_kind.insert(action.kind, action);
            }
        }
    }
    let mut merged: Vec<RecommendedAction> = by_kind.into_values().collect();
    merged.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.kind.as_str().cmp(b.kind.as_str()))
    });
    merged
}
