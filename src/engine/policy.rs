//! Declarative margin policies.
//!
//! Conditions and actions are closed tagged unions, so unknown kinds are
//! unrepresentable; parameter ranges are checked once at registration
//! (`PolicyRejected`), never at evaluation. Evaluation walks active policies
//! in priority order (lowest number first), ANDs all conditions, and runs
//! actions in declaration order. ESCALATE is the only action kind that can
//! force the mode, and it does so via a floor folded into the cycle's
//! recomputation.

use std::cmp::Ordering as CmpOrdering;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{Error, Result};
use crate::types::{
    AllocationRequest, MarginEventKind, MarginType, ResilienceMode, Signal, SignalType,
};

use super::ledger::{AuditLog, MarginLedger};

/// Comparison operator for policy conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
}

impl ConditionOp {
    fn holds_f64(&self, actual: f64, expected: f64) -> bool {
        match self {
            ConditionOp::Eq => (actual - expected).abs() < 1e-9,
            ConditionOp::Ne => (actual - expected).abs() >= 1e-9,
            ConditionOp::Gt => actual > expected,
            ConditionOp::Lt => actual < expected,
            ConditionOp::Gte => actual >= expected,
            ConditionOp::Lte => actual <= expected,
        }
    }
}

/// Typed policy condition. All conditions in a policy must hold (AND).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyCondition {
    /// Compare the signal's type to a literal (EQ/NE only)
    Signal { op: ConditionOp, value: SignalType },
    /// Compare overall ledger utilization to a fraction
    Utilization { op: ConditionOp, value: f64 },
    /// Compare wall-clock epoch ms to a literal
    Time { op: ConditionOp, value_ms: u64 },
    /// Compare the signal's severity-derived risk fraction to a threshold
    Risk { op: ConditionOp, value: f64 },
}

/// Typed policy action, executed in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyAction {
    /// Reserve margin from the policy's pool
    Allocate { amount: f64, reason: String },
    /// Deploy against the allocation created by a prior ALLOCATE in the
    /// same firing
    Deploy { amount: f64, reason: String },
    /// Append an audit event only
    Alert { message: String, impact: f64 },
    /// Append an audit event and floor the mode for this cycle. The only
    /// action kind allowed to force a mode transition.
    Escalate {
        to_mode: ResilienceMode,
        message: String,
    },
}

/// A declarative condition→action rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginPolicy {
    pub id: String,
    pub margin_type: MarginType,
    pub conditions: Vec<PolicyCondition>,
    pub actions: Vec<PolicyAction>,
    /// Lowest number evaluates first (highest precedence)
    pub priority: u32,
    pub active: bool,
}

/// Result of evaluating all policies against one signal.
#[derive(Debug, Clone, Default)]
pub struct PolicyPass {
    /// Ids of policies whose conditions held
    pub triggered: Vec<String>,
    /// Highest mode requested by ESCALATE actions this pass
    pub escalation_floor: Option<ResilienceMode>,
    /// Non-fatal action failures (allocation refused, missing allocation)
    pub action_errors: Vec<String>,
}

/// Policy registry and evaluator.
pub struct PolicyEngine {
    policies: RwLock<Vec<MarginPolicy>>,
    ledger: Arc<MarginLedger>,
    audit: Arc<AuditLog>,
}

impl PolicyEngine {
    pub fn new(ledger: Arc<MarginLedger>, audit: Arc<AuditLog>) -> Self {
        Self {
            policies: RwLock::new(Vec::new()),
            ledger,
            audit,
        }
    }

    /// Register a policy. All validation happens here; evaluation never
    /// rejects.
    pub fn register(&self, policy: MarginPolicy) -> Result<()> {
        Self::validate(&policy)?;
        let mut policies = self.policies.write().unwrap();
        if policies.iter().any(|p| p.id == policy.id) {
            return Err(Error::policy_rejected(
                &policy.id,
                "a policy with this id is already registered",
            ));
        }
        policies.push(policy);
        policies.sort_by(|a, b| match a.priority.cmp(&b.priority) {
            CmpOrdering::Equal => a.id.cmp(&b.id),
            other => other,
        });
        Ok(())
    }

    fn validate(policy: &MarginPolicy) -> Result<()> {
        if policy.id.is_empty() {
            return Err(Error::policy_rejected("<unnamed>", "policy id must not be empty"));
        }
        if policy.conditions.is_empty() {
            return Err(Error::policy_rejected(
                &policy.id,
                "policy must declare at least one condition",
            ));
        }
        if policy.actions.is_empty() {
            return Err(Error::policy_rejected(
                &policy.id,
                "policy must declare at least one action",
            ));
        }
        for condition in &policy.conditions {
            match condition {
                PolicyCondition::Signal { op, .. } => {
                    if !matches!(op, ConditionOp::Eq | ConditionOp::Ne) {
                        return Err(Error::policy_rejected(
                            &policy.id,
                            "SIGNAL conditions support only EQ/NE",
                        ));
                    }
                }
                PolicyCondition::Utilization { value, .. }
                | PolicyCondition::Risk { value, .. } => {
                    if !value.is_finite() || !(0.0..=1.0).contains(value) {
                        return Err(Error::policy_rejected(
                            &policy.id,
                            format!("condition fraction must be in [0, 1], got {value}"),
                        ));
                    }
                }
                PolicyCondition::Time { .. } => {}
            }
        }
        let mut saw_allocate = false;
        for action in &policy.actions {
            match action {
                PolicyAction::Allocate { amount, .. } => {
                    if !amount.is_finite() || *amount <= 0.0 {
                        return Err(Error::policy_rejected(
                            &policy.id,
                            format!("ALLOCATE amount must be > 0, got {amount}"),
                        ));
                    }
                    saw_allocate = true;
                }
                PolicyAction::Deploy { amount, .. } => {
                    if !amount.is_finite() || *amount <= 0.0 {
                        return Err(Error::policy_rejected(
                            &policy.id,
                            format!("DEPLOY amount must be > 0, got {amount}"),
                        ));
                    }
                    if !saw_allocate {
                        return Err(Error::policy_rejected(
                            &policy.id,
                            "DEPLOY must follow an ALLOCATE in the same policy",
                        ));
                    }
                }
                PolicyAction::Alert { .. } | PolicyAction::Escalate { .. } => {}
            }
        }
        Ok(())
    }

    /// Evaluate all active policies against one signal.
    pub fn evaluate(&self, signal: &Signal, now_ms: u64) -> PolicyPass {
        let policies = self.policies.read().unwrap().clone();
        let mut pass = PolicyPass::default();

        for policy in policies.iter().filter(|p| p.active) {
            if !self.conditions_hold(policy, signal, now_ms) {
                continue;
            }
            pass.triggered.push(policy.id.clone());
            self.audit.record(
                MarginEventKind::PolicyTrigger,
                Some(policy.margin_type),
                format!("policy '{}' fired on signal {}", policy.id, signal.id),
                0.0,
            );
            self.execute(policy, &mut pass);
        }
        pass
    }

    fn conditions_hold(&self, policy: &MarginPolicy, signal: &Signal, now_ms: u64) -> bool {
        policy.conditions.iter().all(|condition| match condition {
            PolicyCondition::Signal { op, value } => match op {
                ConditionOp::Eq => signal.signal_type == *value,
                ConditionOp::Ne => signal.signal_type != *value,
                // Unreachable: rejected at registration.
                _ => false,
            },
            PolicyCondition::Utilization { op, value } => {
                op.holds_f64(self.ledger.overall_utilization(), *value)
            }
            PolicyCondition::Time { op, value_ms } => {
                op.holds_f64(now_ms as f64, *value_ms as f64)
            }
            PolicyCondition::Risk { op, value } => {
                op.holds_f64(signal.severity.risk_fraction(), *value)
            }
        })
    }

    /// Execute a fired policy's actions in declaration order. Action
    /// failures are recorded and logged, never propagated: a refused
    /// policy allocation must not abort batch processing.
    fn execute(&self, policy: &MarginPolicy, pass: &mut PolicyPass) {
        let mut firing_allocation: Option<u64> = None;
        for action in &policy.actions {
            match action {
                PolicyAction::Allocate { amount, reason } => {
                    let request =
                        AllocationRequest::new(policy.margin_type, *amount, reason.clone());
                    match self.ledger.allocate(request) {
                        Ok(allocation) => firing_allocation = Some(allocation.id),
                        Err(e) => {
                            warn!(policy = %policy.id, error = %e, "policy allocation refused");
                            pass.action_errors.push(format!("{}: {e}", policy.id));
                        }
                    }
                }
                PolicyAction::Deploy { amount, reason } => match firing_allocation {
                    Some(allocation_id) => {
                        if let Err(e) = self.ledger.deploy(allocation_id, *amount, reason.clone())
                        {
                            warn!(policy = %policy.id, error = %e, "policy deployment refused");
                            pass.action_errors.push(format!("{}: {e}", policy.id));
                        }
                    }
                    None => {
                        // The paired ALLOCATE failed at runtime.
                        pass.action_errors.push(format!(
                            "{}: DEPLOY skipped, no allocation from this firing",
                            policy.id
                        ));
                    }
                },
                PolicyAction::Alert { message, impact } => {
                    self.audit.record(
                        MarginEventKind::PolicyTrigger,
                        Some(policy.margin_type),
                        format!("alert from policy '{}': {message}", policy.id),
                        *impact,
                    );
                }
                PolicyAction::Escalate { to_mode, message } => {
                    self.audit.record(
                        MarginEventKind::PolicyTrigger,
                        Some(policy.margin_type),
                        format!("escalation from policy '{}' to {to_mode}: {message}", policy.id),
                        0.0,
                    );
                    pass.escalation_floor = Some(match pass.escalation_floor {
                        Some(current) => current.max(*to_mode),
                        None => *to_mode,
                    });
                }
            }
        }
    }

    /// Number of registered policies.
    pub fn len(&self) -> usize {
        self.policies.read().unwrap().len()
    }

    /// True when no policies are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of registered policies in evaluation order.
    pub fn policies(&self) -> Vec<MarginPolicy> {
        self.policies.read().unwrap().clone()
    }
}
