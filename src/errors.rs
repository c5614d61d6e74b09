//! Error taxonomy for the resilience core.
//!
//! Every state-changing failure is surfaced synchronously as a typed error;
//! classification/pattern sub-steps never error (they degrade to empty or
//! low-confidence results and log a diagnostic instead).

use thiserror::Error;

use crate::types::MarginType;

/// Core error type.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Malformed config or signal field. For signals inside a batch this is
    /// recorded per item and the batch continues; for config it is fatal for
    /// the call.
    #[error("validation failed for {field}: {message}")]
    Validation { field: String, message: String },

    /// Allocation or deployment exceeds what the pool/allocation can cover.
    #[error("insufficient {margin_type} margin: requested {requested:.2}, available {available:.2}")]
    InsufficientMargin {
        margin_type: MarginType,
        requested: f64,
        available: f64,
    },

    /// Too many simultaneous allocations; fail fast, caller may retry later.
    #[error("concurrent allocation limit reached: {active} active, limit {limit}")]
    ConcurrencyLimit { active: usize, limit: usize },

    /// Mutating operation attempted before a successful `initialize`.
    #[error("engine not initialized")]
    NotInitialized,

    /// Policy failed registration-time validation. Never raised at
    /// evaluation time.
    #[error("policy '{policy_id}' rejected: {message}")]
    PolicyRejected { policy_id: String, message: String },

    /// Referenced allocation does not exist (recovered, expired, or never
    /// created).
    #[error("allocation {allocation_id} not found")]
    AllocationNotFound { allocation_id: u64 },

    /// Surge pool is inside its post-recovery cooldown window.
    #[error("{margin_type} pool in cooldown for another {remaining_ms}ms")]
    PoolCooldown {
        margin_type: MarginType,
        remaining_ms: u64,
    },

    /// No pool exists for the requested margin type.
    #[error("no pool for margin type {margin_type}")]
    UnknownMarginType { margin_type: MarginType },
}

impl Error {
    /// Build a validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Build a policy rejection error.
    pub fn policy_rejected(policy_id: impl Into<String>, message: impl Into<String>) -> Self {
        Error::PolicyRejected {
            policy_id: policy_id.into(),
            message: message.into(),
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
