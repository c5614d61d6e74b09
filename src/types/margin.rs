//! Margin model: resource pools, allocations, deployments, recovery
//! history, thresholds, and the append-only audit event.
//!
//! Ownership shape: allocations live in an id-keyed arena owned by the
//! ledger; deployments hold the allocation id as a foreign key and never an
//! owning reference (no cycles).

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of finite margin resource held in reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarginType {
    Time,
    Capacity,
    Material,
    Financial,
}

impl MarginType {
    /// All margin types, in pool-creation order.
    pub const ALL: [MarginType; 4] = [
        MarginType::Time,
        MarginType::Capacity,
        MarginType::Material,
        MarginType::Financial,
    ];

    /// Get display string for the margin type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MarginType::Time => "TIME",
            MarginType::Capacity => "CAPACITY",
            MarginType::Material => "MATERIAL",
            MarginType::Financial => "FINANCIAL",
        }
    }
}

impl fmt::Display for MarginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pool posture derived from utilization vs thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolStatus {
    Normal,
    Surge,
    Emergency,
}

impl PoolStatus {
    /// Get display string for the pool status.
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolStatus::Normal => "NORMAL",
            PoolStatus::Surge => "SURGE",
            PoolStatus::Emergency => "EMERGENCY",
        }
    }
}

/// Per-resource-type utilization thresholds, as fractions of capacity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarginThreshold {
    /// Utilization fraction that raises a warning
    pub warning: f64,
    /// Utilization fraction considered critical (pool goes SURGE)
    pub critical: f64,
    /// Utilization fraction considered an emergency (pool goes EMERGENCY)
    pub emergency: f64,
    /// Utilization fraction at which auto-deployment policies may fire
    pub auto_deploy: f64,
}

impl Default for MarginThreshold {
    fn default() -> Self {
        Self {
            warning: 0.70,
            critical: 0.85,
            emergency: 0.95,
            auto_deploy: 0.90,
        }
    }
}

impl MarginThreshold {
    /// Validate threshold invariants.
    ///
    /// Required: `warning < critical <= emergency` and
    /// `auto_deploy <= emergency`. `auto_deploy` need not sit below
    /// `critical`.
    pub fn validate(&self) -> Result<(), String> {
        for (name, v) in [
            ("warning", self.warning),
            ("critical", self.critical),
            ("emergency", self.emergency),
            ("auto_deploy", self.auto_deploy),
        ] {
            if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                return Err(format!("{name} must be in [0, 1], got {v}"));
            }
        }
        if self.warning >= self.critical {
            return Err(format!(
                "warning ({}) must be < critical ({})",
                self.warning, self.critical
            ));
        }
        if self.critical > self.emergency {
            return Err(format!(
                "critical ({}) must be <= emergency ({})",
                self.critical, self.emergency
            ));
        }
        if self.auto_deploy > self.emergency {
            return Err(format!(
                "auto_deploy ({}) must be <= emergency ({})",
                self.auto_deploy, self.emergency
            ));
        }
        Ok(())
    }
}

/// A reservation of margin for a bounded duration. Owned by the ledger
/// arena; removed on recovery or expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginAllocation {
    pub id: u64,
    pub margin_type: MarginType,
    /// Reserved amount
    pub amount: f64,
    /// Deployed / allocated, updated on each deployment
    pub utilization_rate: f64,
    pub allocated_at_ms: u64,
    /// When set, the maintenance sweep recovers the allocation past this time
    pub expires_at_ms: Option<u64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Lifecycle of a deployment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Active,
    Completed,
}

/// Active consumption of part of an allocation. References the allocation
/// by id only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginDeployment {
    pub id: u64,
    /// Foreign key into the allocation arena
    pub allocation_id: u64,
    pub deployed_at_ms: u64,
    pub amount: f64,
    pub reason: String,
    pub status: DeploymentStatus,
}

/// Immutable historical record written when an allocation is recovered.
/// Used for reporting and forecasting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginUtilization {
    pub allocation_id: u64,
    pub margin_type: MarginType,
    /// Deployed / allocated at recovery time
    pub utilization_rate: f64,
    /// Amount returned to the pool
    pub amount: f64,
    pub recovered_at_ms: u64,
    pub reason: String,
}

/// Request to reserve margin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub margin_type: MarginType,
    pub amount: f64,
    /// Lower is more urgent; informational for audit/reporting
    pub priority: u32,
    /// Reservation lifetime; None means until explicitly recovered
    pub duration_ms: Option<u64>,
    pub reason: String,
}

impl AllocationRequest {
    /// Build a request with default priority and no expiry.
    pub fn new(margin_type: MarginType, amount: f64, reason: impl Into<String>) -> Self {
        Self {
            margin_type,
            amount,
            priority: 10,
            duration_ms: None,
            reason: reason.into(),
        }
    }
}

/// Read-only view of one pool's books.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub margin_type: MarginType,
    pub total_capacity: f64,
    pub allocated_capacity: f64,
    pub available_capacity: f64,
    /// allocated / total
    pub utilization_rate: f64,
    pub status: PoolStatus,
}

/// Kind of audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarginEventKind {
    Allocation,
    Deployment,
    Recovery,
    ThresholdBreach,
    PolicyTrigger,
    Optimization,
    Exhaustion,
    ModeChange,
}

impl MarginEventKind {
    /// Get display string for the event kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            MarginEventKind::Allocation => "ALLOCATION",
            MarginEventKind::Deployment => "DEPLOYMENT",
            MarginEventKind::Recovery => "RECOVERY",
            MarginEventKind::ThresholdBreach => "THRESHOLD_BREACH",
            MarginEventKind::PolicyTrigger => "POLICY_TRIGGER",
            MarginEventKind::Optimization => "OPTIMIZATION",
            MarginEventKind::Exhaustion => "EXHAUSTION",
            MarginEventKind::ModeChange => "MODE_CHANGE",
        }
    }
}

/// Append-only audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginEvent {
    pub id: u64,
    pub kind: MarginEventKind,
    /// Pool the event concerns, when it concerns one
    pub margin_type: Option<MarginType>,
    pub timestamp_ms: u64,
    pub description: String,
    /// Magnitude of the event in pool units (amount moved, utilization delta)
    pub impact: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_default_is_valid() {
        assert!(MarginThreshold::default().validate().is_ok());
    }

    #[test]
    fn test_threshold_rejects_warning_above_critical() {
        let t = MarginThreshold {
            warning: 0.9,
            critical: 0.8,
            ..Default::default()
        };
        let err = t.validate().unwrap_err();
        assert!(err.contains("warning"), "error should mention warning: {err}");
    }

    #[test]
    fn test_threshold_rejects_auto_deploy_above_emergency() {
        let t = MarginThreshold {
            auto_deploy: 0.99,
            emergency: 0.95,
            ..Default::default()
        };
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_threshold_allows_auto_deploy_above_critical() {
        let t = MarginThreshold {
            warning: 0.5,
            critical: 0.6,
            auto_deploy: 0.9,
            emergency: 0.95,
        };
        assert!(t.validate().is_ok());
    }

    #[test]
    fn test_threshold_rejects_out_of_range() {
        let t = MarginThreshold {
            warning: -0.1,
            ..Default::default()
        };
        assert!(t.validate().is_err());
    }
}
