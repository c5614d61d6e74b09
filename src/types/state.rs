//! Global resilience state and the per-signal processing result model.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::signal::{Severity, SignalType};

/// Global operating posture. Ordered: Normal < Elevated < High < Emergency.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResilienceMode {
    Normal,
    Elevated,
    High,
    Emergency,
}

impl ResilienceMode {
    /// Get display string for the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResilienceMode::Normal => "NORMAL",
            ResilienceMode::Elevated => "ELEVATED",
            ResilienceMode::High => "HIGH",
            ResilienceMode::Emergency => "EMERGENCY",
        }
    }
}

impl fmt::Display for ResilienceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Singleton global state, mutated only by the orchestrator under a
/// single-writer discipline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceState {
    pub mode: ResilienceMode,
    /// 0-100, derived from utilization and recent risk
    pub health_score: f64,
    /// Valid signals in the most recent batch
    pub active_signals_count: usize,
    /// Overall ledger utilization fraction
    pub margin_utilization: f64,
    pub last_health_check_ms: u64,
}

impl Default for ResilienceState {
    fn default() -> Self {
        Self {
            mode: ResilienceMode::Normal,
            health_score: 100.0,
            active_signals_count: 0,
            margin_utilization: 0.0,
            last_health_check_ms: 0,
        }
    }
}

/// Risk level derived from a 0-100 risk score.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Map a 0-100 score to a level: >=80 CRITICAL, >=60 HIGH, >=40 MEDIUM,
    /// else LOW.
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            RiskLevel::Critical
        } else if score >= 60.0 {
            RiskLevel::High
        } else if score >= 40.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    /// Get display string for the risk level.
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }
}

/// Classifier output for one signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub primary_type: SignalType,
    pub secondary_types: Vec<SignalType>,
    /// 0-1
    pub confidence: f64,
}

/// Risk assessment for one signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub risk_level: RiskLevel,
    /// 0-100
    pub risk_score: f64,
    pub risk_factors: Vec<String>,
}

/// Pattern recognition output for one signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRecognition {
    pub patterns: Vec<String>,
    /// 0-1
    pub pattern_confidence: f64,
    /// Mean pairwise similarity against the trailing same-type window, 0-1
    pub historical_correlation: f64,
}

/// Predictive block for one signal: likely outcomes with probabilities and
/// time horizons. Parallel vectors, same length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictiveAnalysis {
    pub outcomes: Vec<String>,
    pub probabilities: Vec<f64>,
    pub time_horizons_ms: Vec<u64>,
}

impl PredictiveAnalysis {
    /// Empty block used when prediction degrades.
    pub fn empty() -> Self {
        Self {
            outcomes: Vec::new(),
            probabilities: Vec::new(),
            time_horizons_ms: Vec::new(),
        }
    }
}

/// Kind of recommended response action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseActionKind {
    EmergencyResponse,
    AllocateMargin,
    DeployMargin,
    EscalateRisk,
    ScheduleMaintenance,
    MonitorClosely,
    InvestigatePattern,
}

impl ResponseActionKind {
    /// Get display string for the action kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseActionKind::EmergencyResponse => "EMERGENCY_RESPONSE",
            ResponseActionKind::AllocateMargin => "ALLOCATE_MARGIN",
            ResponseActionKind::DeployMargin => "DEPLOY_MARGIN",
            ResponseActionKind::EscalateRisk => "ESCALATE_RISK",
            ResponseActionKind::ScheduleMaintenance => "SCHEDULE_MAINTENANCE",
            ResponseActionKind::MonitorClosely => "MONITOR_CLOSELY",
            ResponseActionKind::InvestigatePattern => "INVESTIGATE_PATTERN",
        }
    }
}

/// A recommended (never actuated) response action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendedAction {
    pub kind: ResponseActionKind,
    pub description: String,
    /// Lower is more urgent
    pub priority: u32,
}

/// Full pipeline output for one signal. Created once, appended to the
/// bounded processing history, never mutated afterwards. Carries enough of
/// the source signal for historical correlation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub signal_id: String,
    pub signal_type: SignalType,
    pub severity: Severity,
    pub strength: f64,
    pub asset_id: Option<String>,
    pub timestamp_ms: u64,
    pub classification: Classification,
    pub risk_assessment: RiskAssessment,
    pub pattern_recognition: PatternRecognition,
    pub predictive_analysis: PredictiveAnalysis,
    pub recommended_actions: Vec<RecommendedAction>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_level_boundaries() {
        assert_eq!(RiskLevel::from_score(0.0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(39.9), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(40.0), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(60.0), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(79.9), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(80.0), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(100.0), RiskLevel::Critical);
    }

    #[test]
    fn test_mode_ordering() {
        assert!(ResilienceMode::Normal < ResilienceMode::Elevated);
        assert!(ResilienceMode::Elevated < ResilienceMode::High);
        assert!(ResilienceMode::High < ResilienceMode::Emergency);
    }

    #[test]
    fn test_default_state_is_normal() {
        let s = ResilienceState::default();
        assert_eq!(s.mode, ResilienceMode::Normal);
        assert_eq!(s.health_score, 100.0);
    }
}
