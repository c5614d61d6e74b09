//! Background maintenance sweep.
//!
//! A single tokio task that periodically runs the engine's maintenance
//! pass: allocation expiry, optimization findings, metric decay, and a mode
//! refresh. Ticks that land while a sweep is still running are skipped
//! rather than queued.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use super::ResilienceEngine;

/// Spawn the maintenance sweep. Drop or abort the handle to stop it.
pub fn spawn_sweeper(engine: Arc<ResilienceEngine>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let findings = engine.run_maintenance();
            if !findings.is_empty() {
                debug!(count = findings.len(), "maintenance sweep produced findings");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::EngineConfig;
    use crate::types::{AllocationRequest, MarginType};

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_expires_allocations() {
        let engine = Arc::new(ResilienceEngine::new(EngineConfig::default()).unwrap());
        engine.initialize().unwrap();

        // Already-expired allocation: duration 0 puts expiry at epoch_ms().
        let mut request = AllocationRequest::new(MarginType::Material, 10.0, "short-lived");
        request.duration_ms = Some(0);
        engine.allocate_margin(request).unwrap();
        assert_eq!(engine.ledger().active_allocation_count(), 1);

        let handle = spawn_sweeper(engine.clone(), Duration::from_millis(10));
        // First tick fires immediately; yield so the task runs.
        tokio::time::sleep(Duration::from_millis(1)).await;
        handle.abort();

        assert_eq!(engine.ledger().active_allocation_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_is_noop_before_initialize() {
        let engine = Arc::new(ResilienceEngine::new(EngineConfig::default()).unwrap());
        let handle = spawn_sweeper(engine.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(1)).await;
        handle.abort();
        assert!(engine.audit_events().is_empty());
    }
}
