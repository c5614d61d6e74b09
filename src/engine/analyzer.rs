//! Risk scoring, pattern recognition, and the per-signal predictive block.
//!
//! Scoring accumulates from a severity base table plus fixed increments, and
//! a historical term computed over a bounded window of prior results for the
//! same type and asset. Pattern/prediction sub-steps never fail the
//! pipeline: on degenerate input they degrade to empty or low-confidence
//! output with a `tracing` diagnostic.

use tracing::debug;

use crate::helpers::{hour_of_day, mean};
use crate::types::{
    PatternRecognition, PredictiveAnalysis, ProcessingResult, RecommendedAction,
    ResponseActionKind, RiskAssessment, RiskLevel, Severity, Signal, SignalType,
};

/// Historical mean risk above this adds the historical increment.
const HISTORICAL_RISK_GATE: f64 = 70.0;

/// Risk and pattern analyzer. Read-mostly; all methods are pure over the
/// signal plus the supplied history slice.
pub struct RiskAnalyzer {
    /// Trailing window for same-type correlation
    window_ms: u64,
    /// Max prior same-type/same-asset results feeding the historical term
    risk_window: usize,
}

impl RiskAnalyzer {
    pub fn new(window_ms: u64, risk_window: usize) -> Self {
        Self {
            window_ms,
            risk_window,
        }
    }

    /// Assess risk for one signal against prior processing history.
    pub fn assess_risk(&self, signal: &Signal, history: &[ProcessingResult]) -> RiskAssessment {
        let mut score = signal.severity.risk_base();
        let mut factors = vec![format!("severity base {}", signal.severity)];

        if signal.strength > 80.0 {
            score += 10.0;
            factors.push(format!("strength spike ({:.0})", signal.strength));
        }
        if signal.signal_type == SignalType::Emergency {
            score += 15.0;
            factors.push("emergency signal type".to_string());
        }
        if signal.signal_type == SignalType::AssetCondition && signal.severity == Severity::High {
            score += 20.0;
            factors.push("high-severity asset condition".to_string());
        }

        let historical = self.historical_mean_risk(signal, history);
        if historical > HISTORICAL_RISK_GATE {
            score += 10.0;
            factors.push(format!("elevated historical risk (mean {historical:.0})"));
        }

        let score = score.clamp(0.0, 100.0);
        RiskAssessment {
            risk_level: RiskLevel::from_score(score),
            risk_score: score,
            risk_factors: factors,
        }
    }

    /// Mean risk score of the most recent prior results with the same type
    /// and asset, over the bounded risk window. 0.0 when no history matches.
    fn historical_mean_risk(&self, signal: &Signal, history: &[ProcessingResult]) -> f64 {
        let scores: Vec<f64> = history
            .iter()
            .rev()
            .filter(|r| {
                r.signal_type == signal.signal_type
                    && r.asset_id.as_deref() == signal.asset_id()
            })
            .take(self.risk_window)
            .map(|r| r.risk_assessment.risk_score)
            .collect();
        mean(&scores)
    }

    /// Match the signal against the static pattern table and compute
    /// historical correlation over the trailing same-type window.
    pub fn recognize_patterns(
        &self,
        signal: &Signal,
        history: &[ProcessingResult],
    ) -> PatternRecognition {
        let mut patterns = Vec::new();

        if let Some(label) = Self::time_of_day_peak(signal) {
            patterns.push(label);
        }
        if signal.severity >= Severity::High {
            patterns.push(format!("{} severity spike", signal.signal_type));
        }
        if signal.strength > 85.0 {
            patterns.push(format!("{} intensity spike", signal.signal_type));
        }

        let pattern_confidence = if patterns.is_empty() {
            0.0
        } else {
            (0.6 + 0.1 * (patterns.len() as f64 - 1.0)).min(0.95)
        };

        PatternRecognition {
            patterns,
            pattern_confidence,
            historical_correlation: self.historical_correlation(signal, history),
        }
    }

    /// Static time-of-day peak table keyed by signal type (UTC hours).
    fn time_of_day_peak(signal: &Signal) -> Option<String> {
        let hour = hour_of_day(signal.timestamp_ms);
        let peak = match signal.signal_type {
            // Asset wear and performance issues cluster in working hours
            SignalType::AssetCondition | SignalType::PerformanceDegradation => (8, 18),
            // Maintenance requests land in the morning shift
            SignalType::Maintenance => (6, 12),
            // Environmental events peak in the afternoon
            SignalType::Environmental => (12, 20),
            SignalType::RiskEscalation | SignalType::Emergency => return None,
        };
        if (peak.0..peak.1).contains(&hour) {
            Some(format!("{} time-of-day peak", signal.signal_type))
        } else {
            None
        }
    }

    /// Mean pairwise similarity against same-type results processed within
    /// the trailing window of the signal's timestamp. Weights: type 0.4,
    /// severity 0.3, strength proximity 0.2, same asset 0.1.
    fn historical_correlation(&self, signal: &Signal, history: &[ProcessingResult]) -> f64 {
        let floor = signal.timestamp_ms.saturating_sub(self.window_ms);
        let similarities: Vec<f64> = history
            .iter()
            .filter(|r| r.signal_type == signal.signal_type && r.timestamp_ms >= floor)
            .map(|r| {
                let mut s = 0.4; // type always matches inside the filter
                if r.severity == signal.severity {
                    s += 0.3;
                }
                s += 0.2 * (1.0 - (r.strength - signal.strength).abs() / 100.0);
                if r.asset_id.as_deref() == signal.asset_id() && signal.asset_id().is_some() {
                    s += 0.1;
                }
                s
            })
            .collect();
        mean(&similarities)
    }

    /// Predictive block: likely outcome labels with probabilities derived
    /// from the risk score and horizons keyed by severity.
    pub fn predict(&self, signal: &Signal, risk: &RiskAssessment) -> PredictiveAnalysis {
        if !risk.risk_score.is_finite() {
            debug!(signal_id = %signal.id, "prediction degraded: non-finite risk score");
            return PredictiveAnalysis::empty();
        }

        let horizon_ms = match signal.severity {
            Severity::Critical => 3_600_000,       // 1 h
            Severity::High => 4 * 3_600_000,       // 4 h
            Severity::Medium => 24 * 3_600_000,    // 24 h
            Severity::Low => 72 * 3_600_000,       // 72 h
        };
        let p = risk.risk_score / 100.0;

        let mut outcomes = Vec::new();
        let mut probabilities = Vec::new();
        let mut time_horizons_ms = Vec::new();

        match risk.risk_level {
            RiskLevel::Critical => {
                outcomes.push("service_disruption".to_string());
                probabilities.push(p);
                time_horizons_ms.push(horizon_ms);
                outcomes.push("margin_exhaustion".to_string());
                probabilities.push((p * 0.8).min(1.0));
                time_horizons_ms.push(horizon_ms * 2);
            }
            RiskLevel::High => {
                outcomes.push("degraded_operation".to_string());
                probabilities.push(p);
                time_horizons_ms.push(horizon_ms);
            }
            RiskLevel::Medium => {
                outcomes.push("maintenance_required".to_string());
                probabilities.push(p);
                time_horizons_ms.push(horizon_ms);
            }
            RiskLevel::Low => {
                outcomes.push("stable_operation".to_string());
                probabilities.push(1.0 - p);
                time_horizons_ms.push(horizon_ms);
            }
        }

        PredictiveAnalysis {
            outcomes,
            probabilities,
            time_horizons_ms,
        }
    }

    /// Per-signal recommended actions from the classification/risk outcome.
    pub fn recommend(
        &self,
        signal: &Signal,
        risk: &RiskAssessment,
        patterns: &PatternRecognition,
    ) -> Vec<RecommendedAction> {
        let mut actions = Vec::new();

        if signal.severity == Severity::Critical && signal.signal_type == SignalType::Emergency {
            actions.push(RecommendedAction {
                kind: ResponseActionKind::EmergencyResponse,
                description: format!("emergency response for signal {}", signal.id),
                priority: 0,
            });
        }
        match risk.risk_level {
            RiskLevel::Critical => {
                actions.push(RecommendedAction {
                    kind: ResponseActionKind::EscalateRisk,
                    description: format!("escalate: risk score {:.0}", risk.risk_score),
                    priority: 1,
                });
                actions.push(RecommendedAction {
                    kind: ResponseActionKind::AllocateMargin,
                    description: "reserve margin ahead of likely disruption".to_string(),
                    priority: 2,
                });
            }
            RiskLevel::High => {
                actions.push(RecommendedAction {
                    kind: ResponseActionKind::AllocateMargin,
                    description: format!("reserve margin: risk score {:.0}", risk.risk_score),
                    priority: 3,
                });
            }
            RiskLevel::Medium | RiskLevel::Low => {}
        }
        if signal.signal_type == SignalType::Maintenance {
            actions.push(RecommendedAction {
                kind: ResponseActionKind::ScheduleMaintenance,
                description: format!("schedule maintenance from signal {}", signal.id),
                priority: 5,
            });
        }
        if signal.signal_type == SignalType::PerformanceDegradation {
            actions.push(RecommendedAction {
                kind: ResponseActionKind::MonitorClosely,
                description: "track degradation trend".to_string(),
                priority: 6,
            });
        }
        if patterns.historical_correlation > 0.7 {
            actions.push(RecommendedAction {
                kind: ResponseActionKind::InvestigatePattern,
                description: format!(
                    "recurring pattern (correlation {:.2})",
                    patterns.historical_correlation
                ),
                priority: 7,
            });
        }

        actions
    }
}
