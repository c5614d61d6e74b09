//! Resilience mode state machine.
//!
//! The mode is a pure function of the current cycle's inputs: batch
//! outcomes, a coherent pool snapshot, and the active-deployment flag. It is
//! recomputed in full every cycle (including empty batches), never patched
//! incrementally, so there is no stuck state.

use std::collections::HashMap;

use crate::types::{
    MarginThreshold, MarginType, PoolSnapshot, ProcessingResult, ResilienceMode, RiskLevel,
    Severity, SignalType,
};

/// Inputs to one mode recomputation.
pub(crate) struct ModeInputs<'a> {
    pub results: &'a [ProcessingResult],
    pub pools: &'a [PoolSnapshot],
    pub thresholds: &'a HashMap<MarginType, MarginThreshold>,
    /// Any ACTIVE deployment against a CAPACITY or TIME pool. Deployment is
    /// a stronger signal than allocation and forces EMERGENCY.
    pub forcing_deployment: bool,
    /// Mode floor requested by an ESCALATE policy action this cycle
    pub escalation_floor: Option<ResilienceMode>,
}

/// Recompute the mode. Returns the mode and a human-readable cause for the
/// audit trail.
pub(crate) fn compute_mode(inputs: &ModeInputs<'_>) -> (ResilienceMode, String) {
    let (mut mode, mut cause) = base_mode(inputs);

    if let Some(floor) = inputs.escalation_floor {
        if floor > mode {
            mode = floor;
            cause = format!("policy escalation to {floor}");
        }
    }

    (mode, cause)
}

fn base_mode(inputs: &ModeInputs<'_>) -> (ResilienceMode, String) {
    // EMERGENCY: critical emergency signal, emergency-level utilization, or
    // an active deployment on a CAPACITY/TIME pool.
    if let Some(r) = inputs.results.iter().find(|r| {
        r.severity == Severity::Critical && r.signal_type == SignalType::Emergency
    }) {
        return (
            ResilienceMode::Emergency,
            format!("critical emergency signal {}", r.signal_id),
        );
    }
    if let Some((pool, threshold)) = breached(inputs, |t| t.emergency) {
        return (
            ResilienceMode::Emergency,
            format!(
                "{} utilization {:.2} >= emergency threshold {:.2}",
                pool.margin_type, pool.utilization_rate, threshold
            ),
        );
    }
    if inputs.forcing_deployment {
        return (
            ResilienceMode::Emergency,
            "active deployment against CAPACITY/TIME pool".to_string(),
        );
    }

    // HIGH: the distinct risk-escalation posture, above ELEVATED but below
    // EMERGENCY.
    if let Some(r) = inputs.results.iter().find(|r| {
        r.signal_type == SignalType::RiskEscalation && r.severity == Severity::High
    }) {
        return (
            ResilienceMode::High,
            format!("high-severity risk escalation {}", r.signal_id),
        );
    }

    // ELEVATED: batch risk at HIGH or above, or any pool past critical.
    if inputs
        .results
        .iter()
        .any(|r| r.risk_assessment.risk_level >= RiskLevel::High)
    {
        return (
            ResilienceMode::Elevated,
            "batch risk level HIGH or above".to_string(),
        );
    }
    if let Some((pool, threshold)) = breached(inputs, |t| t.critical) {
        return (
            ResilienceMode::Elevated,
            format!(
                "{} utilization {:.2} >= critical threshold {:.2}",
                pool.margin_type, pool.utilization_rate, threshold
            ),
        );
    }

    (ResilienceMode::Normal, "no elevated inputs".to_string())
}

/// First pool whose utilization meets or exceeds the selected threshold.
fn breached<'a>(
    inputs: &'a ModeInputs<'_>,
    pick: impl Fn(&MarginThreshold) -> f64,
) -> Option<(&'a PoolSnapshot, f64)> {
    inputs.pools.iter().find_map(|pool| {
        let threshold = inputs
            .thresholds
            .get(&pool.margin_type)
            .copied()
            .unwrap_or_default();
        let limit = pick(&threshold);
        (pool.utilization_rate >= limit).then_some((pool, limit))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        Classification, PatternRecognition, PoolStatus, PredictiveAnalysis, RiskAssessment,
    };

    fn result(signal_type: SignalType, severity: Severity, risk_score: f64) -> ProcessingResult {
        ProcessingResult {
            signal_id: "s".to_string(),
            signal_type,
            severity,
            strength: 50.0,
            asset_id: None,
            timestamp_ms: 1,
            classification: Classification {
                primary_type: signal_type,
                secondary_types: vec![],
                confidence: 0.8,
            },
            risk_assessment: RiskAssessment {
                risk_level: RiskLevel::from_score(risk_score),
                risk_score,
                risk_factors: vec![],
            },
            pattern_recognition: PatternRecognition {
                patterns: vec![],
                pattern_confidence: 0.0,
                historical_correlation: 0.0,
            },
            predictive_analysis: PredictiveAnalysis::empty(),
            recommended_actions: vec![],
        }
    }

    fn pool(margin_type: MarginType, utilization: f64) -> PoolSnapshot {
        PoolSnapshot {
            margin_type,
            total_capacity: 100.0,
            allocated_capacity: utilization * 100.0,
            available_capacity: 100.0 - utilization * 100.0,
            utilization_rate: utilization,
            status: PoolStatus::Normal,
        }
    }

    fn inputs<'a>(
        results: &'a [ProcessingResult],
        pools: &'a [PoolSnapshot],
        thresholds: &'a HashMap<MarginType, MarginThreshold>,
    ) -> ModeInputs<'a> {
        ModeInputs {
            results,
            pools,
            thresholds,
            forcing_deployment: false,
            escalation_floor: None,
        }
    }

    fn default_thresholds() -> HashMap<MarginType, MarginThreshold> {
        MarginType::ALL
            .iter()
            .map(|&t| (t, MarginThreshold::default()))
            .collect()
    }

    #[test]
    fn test_empty_batch_low_utilization_is_normal() {
        let thresholds = default_thresholds();
        let pools = [pool(MarginType::Capacity, 0.1)];
        let (mode, _) = compute_mode(&inputs(&[], &pools, &thresholds));
        assert_eq!(mode, ResilienceMode::Normal);
    }

    #[test]
    fn test_critical_emergency_signal_forces_emergency() {
        let thresholds = default_thresholds();
        let results = [result(SignalType::Emergency, Severity::Critical, 100.0)];
        let (mode, cause) = compute_mode(&inputs(&results, &[], &thresholds));
        assert_eq!(mode, ResilienceMode::Emergency);
        assert!(cause.contains("critical emergency"));
    }

    #[test]
    fn test_emergency_utilization_forces_emergency() {
        let thresholds = default_thresholds();
        let pools = [pool(MarginType::Time, 0.96)];
        let (mode, _) = compute_mode(&inputs(&[], &pools, &thresholds));
        assert_eq!(mode, ResilienceMode::Emergency);
    }

    #[test]
    fn test_forcing_deployment_forces_emergency() {
        let thresholds = default_thresholds();
        let pools = [pool(MarginType::Capacity, 0.2)];
        let mut i = inputs(&[], &pools, &thresholds);
        i.forcing_deployment = true;
        let (mode, cause) = compute_mode(&i);
        assert_eq!(mode, ResilienceMode::Emergency);
        assert!(cause.contains("deployment"));
    }

    #[test]
    fn test_high_risk_escalation_gives_high_mode() {
        let thresholds = default_thresholds();
        let results = [result(SignalType::RiskEscalation, Severity::High, 70.0)];
        let (mode, _) = compute_mode(&inputs(&results, &[], &thresholds));
        assert_eq!(mode, ResilienceMode::High);
    }

    #[test]
    fn test_high_batch_risk_gives_elevated() {
        let thresholds = default_thresholds();
        let results = [result(SignalType::AssetCondition, Severity::High, 70.0)];
        let (mode, _) = compute_mode(&inputs(&results, &[], &thresholds));
        assert_eq!(mode, ResilienceMode::Elevated);
    }

    #[test]
    fn test_critical_utilization_gives_elevated() {
        let thresholds = default_thresholds();
        let pools = [pool(MarginType::Financial, 0.86)];
        let (mode, _) = compute_mode(&inputs(&[], &pools, &thresholds));
        assert_eq!(mode, ResilienceMode::Elevated);
    }

    #[test]
    fn test_escalation_floor_raises_mode() {
        let thresholds = default_thresholds();
        let mut i = inputs(&[], &[], &thresholds);
        i.escalation_floor = Some(ResilienceMode::High);
        let (mode, cause) = compute_mode(&i);
        assert_eq!(mode, ResilienceMode::High);
        assert!(cause.contains("escalation"));
    }

    #[test]
    fn test_escalation_floor_never_lowers_mode() {
        let thresholds = default_thresholds();
        let results = [result(SignalType::Emergency, Severity::Critical, 100.0)];
        let mut i = inputs(&results, &[], &thresholds);
        i.escalation_floor = Some(ResilienceMode::Elevated);
        let (mode, _) = compute_mode(&i);
        assert_eq!(mode, ResilienceMode::Emergency);
    }
}
