//! Signal types: discrete operational events produced by sensors, users,
//! and external systems.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::helpers::epoch_ms;

/// Category of an operational signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalType {
    /// Condition change on a monitored asset
    AssetCondition,
    /// Scheduled or requested maintenance
    Maintenance,
    /// Environmental event (weather, temperature, site conditions)
    Environmental,
    /// Explicit risk escalation raised by an operator or upstream system
    RiskEscalation,
    /// Measured performance falling off
    PerformanceDegradation,
    /// Emergency condition
    Emergency,
}

impl SignalType {
    /// All known signal types.
    pub const ALL: [SignalType; 6] = [
        SignalType::AssetCondition,
        SignalType::Maintenance,
        SignalType::Environmental,
        SignalType::RiskEscalation,
        SignalType::PerformanceDegradation,
        SignalType::Emergency,
    ];

    /// Get display string for the signal type.
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::AssetCondition => "ASSET_CONDITION",
            SignalType::Maintenance => "MAINTENANCE",
            SignalType::Environmental => "ENVIRONMENTAL",
            SignalType::RiskEscalation => "RISK_ESCALATION",
            SignalType::PerformanceDegradation => "PERFORMANCE_DEGRADATION",
            SignalType::Emergency => "EMERGENCY",
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a signal. Ordered: Low < Medium < High < Critical.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Get display string for the severity.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    /// Base risk score contribution (0-100 scale).
    pub fn risk_base(&self) -> f64 {
        match self {
            Severity::Low => 20.0,
            Severity::Medium => 40.0,
            Severity::High => 70.0,
            Severity::Critical => 90.0,
        }
    }

    /// Risk fraction used by policy RISK conditions (0-1 scale).
    pub fn risk_fraction(&self) -> f64 {
        match self {
            Severity::Low => 0.2,
            Severity::Medium => 0.5,
            Severity::High => 0.8,
            Severity::Critical => 1.0,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A discrete, timestamped operational event. Immutable once created;
/// produced by external collaborators (ingestion endpoints, sensors).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    /// Producer-assigned identifier
    pub id: String,
    /// Primary category
    pub signal_type: SignalType,
    /// Severity
    pub severity: Severity,
    /// Origin description (sensor name, subsystem, user)
    pub source: String,
    /// Epoch milliseconds when the event occurred
    pub timestamp_ms: u64,
    /// Signal strength, 0-100
    pub strength: f64,
    /// Loosely-typed payload from the producer
    #[serde(default)]
    pub data: serde_json::Value,
    /// String metadata bag (`asset_id`, `category`, ...)
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Signal {
    /// Build a signal with the current timestamp and empty payload.
    pub fn new(
        id: impl Into<String>,
        signal_type: SignalType,
        severity: Severity,
        source: impl Into<String>,
        strength: f64,
    ) -> Self {
        Self {
            id: id.into(),
            signal_type,
            severity,
            source: source.into(),
            timestamp_ms: epoch_ms(),
            strength,
            data: serde_json::Value::Null,
            metadata: HashMap::new(),
        }
    }

    /// Attach a metadata key/value (builder style).
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Asset this signal refers to, when the producer tagged one.
    pub fn asset_id(&self) -> Option<&str> {
        self.metadata.get("asset_id").map(String::as_str)
    }

    /// Check the record is well-formed. Malformed signals are skipped by the
    /// batch pipeline with a recorded diagnostic, never a batch failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("signal id must not be empty".to_string());
        }
        if !self.strength.is_finite() || !(0.0..=100.0).contains(&self.strength) {
            return Err(format!(
                "strength must be in [0, 100], got {}",
                self.strength
            ));
        }
        if self.timestamp_ms == 0 {
            return Err("timestamp_ms must be set".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_validate_accepts_wellformed() {
        let s = Signal::new("s-1", SignalType::AssetCondition, Severity::Low, "sensor", 40.0);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_signal_validate_rejects_empty_id() {
        let s = Signal::new("", SignalType::Maintenance, Severity::Low, "sensor", 40.0);
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_signal_validate_rejects_out_of_range_strength() {
        let s = Signal::new("s-1", SignalType::Maintenance, Severity::Low, "sensor", 140.0);
        assert!(s.validate().is_err());
        let s = Signal::new("s-2", SignalType::Maintenance, Severity::Low, "sensor", f64::NAN);
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn test_asset_id_from_metadata() {
        let s = Signal::new("s-1", SignalType::AssetCondition, Severity::Low, "sensor", 10.0)
            .with_metadata("asset_id", "pump-7");
        assert_eq!(s.asset_id(), Some("pump-7"));
    }

    #[test]
    fn test_signal_type_serde_screaming_snake() {
        let json = serde_json::to_string(&SignalType::AssetCondition).unwrap();
        assert_eq!(json, "\"ASSET_CONDITION\"");
    }
}
