//! Consolidated domain types for the resilience core.
//!
//! Signals come in from external producers, margin types describe the
//! ledger's resource model, and state types carry per-signal pipeline
//! output plus the global operating posture.

mod margin;
mod signal;
mod state;

pub use margin::*;
pub use signal::*;
pub use state::*;
