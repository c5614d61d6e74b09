//! Rule-based signal classification.
//!
//! Classification is a pure function over the signal plus static rule
//! tables: the primary type is taken verbatim from the signal, secondary
//! types are derived by rule, and confidence starts from a 0.8 base with a
//! fixed increment per matched rule, capped at 1.0. A pluggable [`Scorer`]
//! can be registered; its output is averaged 50/50 with the rule-based
//! confidence.

use crate::types::{Classification, Severity, Signal, SignalType};

/// Confidence baseline before any secondary rule matches.
const BASE_CONFIDENCE: f64 = 0.8;
/// Confidence added per matched secondary rule.
const RULE_INCREMENT: f64 = 0.05;

/// Pluggable scoring capability. Implementations must be deterministic if
/// deterministic pipeline output is required; randomness stays behind this
/// seam, never in the classifier itself.
pub trait Scorer: Send + Sync {
    /// Confidence estimate in [0, 1] for the signal's primary type.
    fn score(&self, signal: &Signal) -> f64;
}

/// Deterministic scorer: confidence scales with severity and strength.
/// Default model slot and the one tests rely on.
#[derive(Debug, Clone, Default)]
pub struct HeuristicScorer;

impl Scorer for HeuristicScorer {
    fn score(&self, signal: &Signal) -> f64 {
        let severity_term = signal.severity.risk_fraction();
        let strength_term = (signal.strength / 100.0).clamp(0.0, 1.0);
        (0.5 + 0.3 * severity_term + 0.2 * strength_term).clamp(0.0, 1.0)
    }
}

/// Random scorer stub standing in for an external model. Kept off the
/// default path; register explicitly when exercising non-deterministic
/// model plumbing.
#[derive(Debug, Clone, Default)]
pub struct StochasticScorer;

impl Scorer for StochasticScorer {
    fn score(&self, _signal: &Signal) -> f64 {
        rand::random::<f64>() * 0.3 + 0.7
    }
}

/// Signal classifier. No side effects; safe to call from parallel batches.
pub struct SignalClassifier {
    scorer: Option<Box<dyn Scorer>>,
}

impl SignalClassifier {
    /// Classifier with no registered model.
    pub fn new() -> Self {
        Self { scorer: None }
    }

    /// Classifier with a registered scoring model.
    pub fn with_scorer(scorer: Box<dyn Scorer>) -> Self {
        Self {
            scorer: Some(scorer),
        }
    }

    /// Classify one signal.
    pub fn classify(&self, signal: &Signal) -> Classification {
        let mut secondary_types = Vec::new();
        let mut matched_rules = 0u32;

        if signal.severity == Severity::Critical {
            secondary_types.push(SignalType::Emergency);
            matched_rules += 1;
        }
        if signal.strength > 80.0 {
            secondary_types.push(SignalType::PerformanceDegradation);
            matched_rules += 1;
        }
        if self.source_is_environmental(signal) {
            secondary_types.push(SignalType::Environmental);
            matched_rules += 1;
        }

        // Secondary types never repeat the primary and never repeat each other.
        secondary_types.retain(|t| *t != signal.signal_type);
        secondary_types.dedup();

        let rule_confidence =
            (BASE_CONFIDENCE + RULE_INCREMENT * matched_rules as f64).min(1.0);
        let confidence = match &self.scorer {
            Some(scorer) => {
                let model = scorer.score(signal).clamp(0.0, 1.0);
                (rule_confidence + model) / 2.0
            }
            None => rule_confidence,
        };

        Classification {
            primary_type: signal.signal_type,
            secondary_types,
            confidence,
        }
    }

    fn source_is_environmental(&self, signal: &Signal) -> bool {
        signal.source.to_ascii_lowercase().contains("environment")
            || signal
                .metadata
                .get("category")
                .is_some_and(|c| c.eq_ignore_ascii_case("environmental"))
    }
}

impl Default for SignalClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(severity: Severity, strength: f64) -> Signal {
        Signal::new("s-1", SignalType::AssetCondition, severity, "sensor-a", strength)
    }

    #[test]
    fn test_primary_type_verbatim() {
        let c = SignalClassifier::new().classify(&signal(Severity::Low, 10.0));
        assert_eq!(c.primary_type, SignalType::AssetCondition);
        assert!(c.secondary_types.is_empty());
        assert!((c.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_critical_adds_emergency_secondary() {
        let c = SignalClassifier::new().classify(&signal(Severity::Critical, 10.0));
        assert!(c.secondary_types.contains(&SignalType::Emergency));
        assert!((c.confidence - 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_high_strength_adds_degradation_secondary() {
        let c = SignalClassifier::new().classify(&signal(Severity::Low, 90.0));
        assert!(c.secondary_types.contains(&SignalType::PerformanceDegradation));
    }

    #[test]
    fn test_environmental_source_tag() {
        let s = Signal::new(
            "s-env",
            SignalType::AssetCondition,
            Severity::Low,
            "environment-station-3",
            10.0,
        );
        let c = SignalClassifier::new().classify(&s);
        assert!(c.secondary_types.contains(&SignalType::Environmental));
    }

    #[test]
    fn test_confidence_capped_at_one() {
        // All three rules match: 0.8 + 3 * 0.05 = 0.95, still below cap; a
        // registered scorer returning 1.0 averages to below 1.0 as well.
        let s = Signal::new(
            "s-max",
            SignalType::AssetCondition,
            Severity::Critical,
            "environment-station-3",
            95.0,
        );
        let c = SignalClassifier::new().classify(&s);
        assert!(c.confidence <= 1.0);
        assert!((c.confidence - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_secondary_never_duplicates_primary() {
        let s = Signal::new(
            "s-dup",
            SignalType::Emergency,
            Severity::Critical,
            "sensor-a",
            10.0,
        );
        let c = SignalClassifier::new().classify(&s);
        assert!(!c.secondary_types.contains(&SignalType::Emergency));
    }

    #[test]
    fn test_scorer_averaged_fifty_fifty() {
        struct FixedScorer(f64);
        impl Scorer for FixedScorer {
            fn score(&self, _signal: &Signal) -> f64 {
                self.0
            }
        }
        let c = SignalClassifier::with_scorer(Box::new(FixedScorer(0.4)))
            .classify(&signal(Severity::Low, 10.0));
        assert!((c.confidence - 0.6).abs() < 1e-9); // (0.8 + 0.4) / 2
    }

    #[test]
    fn test_heuristic_scorer_is_deterministic() {
        let s = signal(Severity::High, 60.0);
        let a = HeuristicScorer.score(&s);
        let b = HeuristicScorer.score(&s);
        assert_eq!(a, b);
    }
}
