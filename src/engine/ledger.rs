//! Margin ledger: per-type resource pools, the allocation arena, and the
//! append-only audit log.
//!
//! Concurrency discipline: each pool sits behind its own `Mutex`, so
//! allocation requests against the same pool serialize and can never act on
//! a stale `available` reading. The allocation arena has a separate lock;
//! pool and arena locks are never held at the same time. The
//! concurrent-allocation ceiling is an atomic increment-then-check, failing
//! fast instead of queueing.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{info, warn};

use crate::errors::{Error, Result};
use crate::helpers::epoch_ms;
use crate::types::{
    AllocationRequest, DeploymentStatus, MarginAllocation, MarginDeployment, MarginEvent,
    MarginEventKind, MarginThreshold, MarginType, MarginUtilization, PoolSnapshot, PoolStatus,
};

/// Utilization below which the optimization sweep flags a pool for
/// downsizing.
const OPTIMIZE_LOW_WATER: f64 = 0.30;
/// Utilization above which the sweep flags a pool for expansion.
const OPTIMIZE_HIGH_WATER: f64 = 0.90;

/// Tolerance for amount comparisons, matching the conservation check.
/// `f64::EPSILON` is too tight for accumulated sums at pool magnitudes.
const AMOUNT_SLACK: f64 = 1e-6;

// ---------------------------------------------------------------------------
// Audit log
// ---------------------------------------------------------------------------

/// Bounded append-only audit log of [`MarginEvent`]s.
pub struct AuditLog {
    events: Mutex<VecDeque<MarginEvent>>,
    next_id: AtomicU64,
    cap: usize,
}

impl AuditLog {
    pub fn new(cap: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(cap.min(1024))),
            next_id: AtomicU64::new(1),
            cap,
        }
    }

    /// Append one event, evicting the oldest past the bound.
    pub fn record(
        &self,
        kind: MarginEventKind,
        margin_type: Option<MarginType>,
        description: impl Into<String>,
        impact: f64,
    ) {
        let event = MarginEvent {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind,
            margin_type,
            timestamp_ms: epoch_ms(),
            description: description.into(),
            impact,
        };
        let mut events = self.events.lock().unwrap();
        if events.len() >= self.cap {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Snapshot of the retained events, oldest first.
    pub fn snapshot(&self) -> Vec<MarginEvent> {
        self.events.lock().unwrap().iter().cloned().collect()
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// True when no events are retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Pools
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Pool {
    margin_type: MarginType,
    total: f64,
    allocated: f64,
    available: f64,
    status: PoolStatus,
    /// Epoch ms until which new allocations are rejected (surge cooldown)
    cooldown_until_ms: u64,
}

impl Pool {
    fn new(margin_type: MarginType, total: f64) -> Self {
        Self {
            margin_type,
            total,
            allocated: 0.0,
            available: total,
            status: PoolStatus::Normal,
            cooldown_until_ms: 0,
        }
    }

    fn utilization(&self) -> f64 {
        if self.total > 0.0 {
            self.allocated / self.total
        } else {
            0.0
        }
    }

    fn update_status(&mut self, threshold: &MarginThreshold) {
        let util = self.utilization();
        self.status = if util >= threshold.emergency {
            PoolStatus::Emergency
        } else if util >= threshold.critical {
            PoolStatus::Surge
        } else {
            PoolStatus::Normal
        };
    }

    /// allocated + available == total, enforced on every mutation.
    fn check_conservation(&self) {
        debug_assert!(
            (self.allocated + self.available - self.total).abs() < 1e-6,
            "{} pool books out of balance: allocated {} + available {} != total {}",
            self.margin_type,
            self.allocated,
            self.available,
            self.total
        );
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            margin_type: self.margin_type,
            total_capacity: self.total,
            allocated_capacity: self.allocated,
            available_capacity: self.available,
            utilization_rate: self.utilization(),
            status: self.status,
        }
    }
}

/// Advisory finding from the optimization sweep.
#[derive(Debug, Clone, PartialEq)]
pub enum OptimizationFinding {
    /// Pool runs well below capacity and could shrink
    Downsize { margin_type: MarginType, utilization: f64 },
    /// Pool runs near capacity and should grow
    Expand { margin_type: MarginType, utilization: f64 },
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

struct AllocationEntry {
    allocation: MarginAllocation,
    deployments: Vec<MarginDeployment>,
}

impl AllocationEntry {
    fn deployed(&self) -> f64 {
        self.deployments
            .iter()
            .filter(|d| d.status == DeploymentStatus::Active)
            .map(|d| d.amount)
            .sum()
    }
}

/// The margin ledger. One pool per margin type, an id-keyed allocation
/// arena, and bounded recovery history.
pub struct MarginLedger {
    pools: HashMap<MarginType, Mutex<Pool>>,
    thresholds: RwLock<HashMap<MarginType, MarginThreshold>>,
    allocations: Mutex<HashMap<u64, AllocationEntry>>,
    utilization_history: Mutex<VecDeque<MarginUtilization>>,
    audit: Arc<AuditLog>,
    next_allocation_id: AtomicU64,
    next_deployment_id: AtomicU64,
    active_allocations: AtomicUsize,
    max_concurrent: usize,
    surge_cooldown_ms: u64,
    history_cap: usize,
}

impl MarginLedger {
    pub fn new(
        capacities: &HashMap<MarginType, f64>,
        thresholds: &HashMap<MarginType, MarginThreshold>,
        max_concurrent: usize,
        surge_cooldown_ms: u64,
        history_cap: usize,
        audit: Arc<AuditLog>,
    ) -> Self {
        let pools = capacities
            .iter()
            .map(|(&t, &cap)| (t, Mutex::new(Pool::new(t, cap))))
            .collect();
        Self {
            pools,
            thresholds: RwLock::new(thresholds.clone()),
            allocations: Mutex::new(HashMap::new()),
            utilization_history: Mutex::new(VecDeque::new()),
            audit,
            next_allocation_id: AtomicU64::new(1),
            next_deployment_id: AtomicU64::new(1),
            active_allocations: AtomicUsize::new(0),
            max_concurrent,
            surge_cooldown_ms,
            history_cap,
        }
    }

    /// Reserve margin. Debits `available`, credits `allocated`, recomputes
    /// utilization and pool status, and appends audit events.
    pub fn allocate(&self, request: AllocationRequest) -> Result<MarginAllocation> {
        if !request.amount.is_finite() || request.amount <= 0.0 {
            return Err(Error::validation(
                "amount",
                format!("allocation amount must be > 0, got {}", request.amount),
            ));
        }
        let pool_mutex = self
            .pools
            .get(&request.margin_type)
            .ok_or(Error::UnknownMarginType {
                margin_type: request.margin_type,
            })?;

        // Ceiling first: increment, then verify. Losers back out, so the
        // check never acts on a stale count.
        let active = self.active_allocations.fetch_add(1, Ordering::SeqCst);
        if active >= self.max_concurrent {
            self.active_allocations.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::ConcurrencyLimit {
                active,
                limit: self.max_concurrent,
            });
        }

        let now = epoch_ms();
        let threshold = self.threshold_for(request.margin_type);

        let snapshot = {
            let mut pool = pool_mutex.lock().unwrap();

            if now < pool.cooldown_until_ms {
                self.active_allocations.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::PoolCooldown {
                    margin_type: request.margin_type,
                    remaining_ms: pool.cooldown_until_ms - now,
                });
            }
            if pool.available < request.amount {
                self.active_allocations.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::InsufficientMargin {
                    margin_type: request.margin_type,
                    requested: request.amount,
                    available: pool.available,
                });
            }

            let old_util = pool.utilization();
            pool.available -= request.amount;
            pool.allocated += request.amount;
            pool.update_status(&threshold);
            pool.check_conservation();
            let new_util = pool.utilization();

            self.record_threshold_crossings(request.margin_type, old_util, new_util, &threshold);
            if pool.available <= f64::EPSILON {
                self.audit.record(
                    MarginEventKind::Exhaustion,
                    Some(request.margin_type),
                    format!("{} pool fully allocated", request.margin_type),
                    pool.total,
                );
            }
            pool.snapshot()
        };

        let allocation = MarginAllocation {
            id: self.next_allocation_id.fetch_add(1, Ordering::Relaxed),
            margin_type: request.margin_type,
            amount: request.amount,
            utilization_rate: 0.0,
            allocated_at_ms: now,
            expires_at_ms: request.duration_ms.map(|d| now + d),
            metadata: HashMap::new(),
        };
        self.allocations.lock().unwrap().insert(
            allocation.id,
            AllocationEntry {
                allocation: allocation.clone(),
                deployments: Vec::new(),
            },
        );

        info!(
            margin_type = %request.margin_type,
            amount = request.amount,
            utilization = snapshot.utilization_rate,
            reason = %request.reason,
            "margin allocated"
        );
        self.audit.record(
            MarginEventKind::Allocation,
            Some(request.margin_type),
            format!(
                "allocated {:.2} {} ({})",
                request.amount, request.margin_type, request.reason
            ),
            request.amount,
        );
        Ok(allocation)
    }

    /// Deploy part of an allocation. Fails when the amount exceeds the
    /// allocation's remaining (amount minus already-deployed).
    pub fn deploy(
        &self,
        allocation_id: u64,
        amount: f64,
        reason: impl Into<String>,
    ) -> Result<MarginDeployment> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(Error::validation(
                "amount",
                format!("deployment amount must be > 0, got {amount}"),
            ));
        }
        let reason = reason.into();
        let mut allocations = self.allocations.lock().unwrap();
        let entry = allocations
            .get_mut(&allocation_id)
            .ok_or(Error::AllocationNotFound { allocation_id })?;

        let remaining = entry.allocation.amount - entry.deployed();
        if amount > remaining + AMOUNT_SLACK {
            return Err(Error::InsufficientMargin {
                margin_type: entry.allocation.margin_type,
                requested: amount,
                available: remaining,
            });
        }

        let deployment = MarginDeployment {
            id: self.next_deployment_id.fetch_add(1, Ordering::Relaxed),
            allocation_id,
            deployed_at_ms: epoch_ms(),
            amount,
            reason: reason.clone(),
            status: DeploymentStatus::Active,
        };
        entry.deployments.push(deployment.clone());
        entry.allocation.utilization_rate = entry.deployed() / entry.allocation.amount;
        let margin_type = entry.allocation.margin_type;
        drop(allocations);

        info!(
            allocation_id,
            amount,
            margin_type = %margin_type,
            reason = %reason,
            "margin deployed"
        );
        self.audit.record(
            MarginEventKind::Deployment,
            Some(margin_type),
            format!("deployed {amount:.2} of allocation {allocation_id} ({reason})"),
            amount,
        );
        Ok(deployment)
    }

    /// Return an allocation to its pool: writes a utilization history
    /// record, credits `available` back, removes the allocation, and starts
    /// a cooldown on pools recovered while surging.
    pub fn recover(&self, allocation_id: u64, reason: impl Into<String>) -> Result<bool> {
        let reason = reason.into();
        let entry = self
            .allocations
            .lock()
            .unwrap()
            .remove(&allocation_id)
            .ok_or(Error::AllocationNotFound { allocation_id })?;

        let margin_type = entry.allocation.margin_type;
        let amount = entry.allocation.amount;
        let utilization_rate = if amount > 0.0 {
            entry.deployed() / amount
        } else {
            0.0
        };
        let now = epoch_ms();

        {
            let mut history = self.utilization_history.lock().unwrap();
            if history.len() >= self.history_cap {
                history.pop_front();
            }
            history.push_back(MarginUtilization {
                allocation_id,
                margin_type,
                utilization_rate,
                amount,
                recovered_at_ms: now,
                reason: reason.clone(),
            });
        }

        let threshold = self.threshold_for(margin_type);
        if let Some(pool_mutex) = self.pools.get(&margin_type) {
            let mut pool = pool_mutex.lock().unwrap();
            let was_surging = pool.status != PoolStatus::Normal;
            pool.allocated = (pool.allocated - amount).max(0.0);
            pool.available = (pool.available + amount).min(pool.total);
            pool.update_status(&threshold);
            pool.check_conservation();
            if was_surging {
                pool.cooldown_until_ms = now + self.surge_cooldown_ms;
            }
        } else {
            warn!(allocation_id, %margin_type, "recovered allocation had no pool");
        }

        self.active_allocations.fetch_sub(1, Ordering::SeqCst);
        info!(allocation_id, %margin_type, amount, utilization_rate, "margin recovered");
        self.audit.record(
            MarginEventKind::Recovery,
            Some(margin_type),
            format!("recovered {amount:.2} from allocation {allocation_id} ({reason})"),
            amount,
        );
        Ok(true)
    }

    /// Advisory optimization sweep plus allocation expiry. Never mutates
    /// capacity; findings are returned and logged as audit events.
    pub fn optimize(&self) -> Vec<OptimizationFinding> {
        let now = epoch_ms();

        // Expire allocations past their lifetime before reading utilization.
        let expired: Vec<u64> = self
            .allocations
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.allocation.expires_at_ms.is_some_and(|t| t <= now))
            .map(|e| e.allocation.id)
            .collect();
        for id in expired {
            if let Err(e) = self.recover(id, "expired") {
                warn!(allocation_id = id, error = %e, "failed to expire allocation");
            }
        }

        let mut findings = Vec::new();
        for margin_type in MarginType::ALL {
            let Some(pool_mutex) = self.pools.get(&margin_type) else {
                continue;
            };
            let utilization = pool_mutex.lock().unwrap().utilization();
            let finding = if utilization < OPTIMIZE_LOW_WATER {
                OptimizationFinding::Downsize {
                    margin_type,
                    utilization,
                }
            } else if utilization > OPTIMIZE_HIGH_WATER {
                OptimizationFinding::Expand {
                    margin_type,
                    utilization,
                }
            } else {
                continue;
            };
            let verb = match &finding {
                OptimizationFinding::Downsize { .. } => "downsize",
                OptimizationFinding::Expand { .. } => "expand",
            };
            self.audit.record(
                MarginEventKind::Optimization,
                Some(margin_type),
                format!("{margin_type} pool candidate for {verb} (utilization {utilization:.2})"),
                utilization,
            );
            findings.push(finding);
        }
        findings
    }

    /// Coherent snapshot of all pools, in fixed margin-type order.
    pub fn snapshot(&self) -> Vec<PoolSnapshot> {
        MarginType::ALL
            .iter()
            .filter_map(|t| self.pools.get(t))
            .map(|p| p.lock().unwrap().snapshot())
            .collect()
    }

    /// Overall utilization: total allocated over total capacity.
    pub fn overall_utilization(&self) -> f64 {
        let mut allocated = 0.0;
        let mut total = 0.0;
        for pool in self.pools.values() {
            let pool = pool.lock().unwrap();
            allocated += pool.allocated;
            total += pool.total;
        }
        if total > 0.0 {
            allocated / total
        } else {
            0.0
        }
    }

    /// Any ACTIVE deployment against a CAPACITY or TIME pool. Feeds the
    /// deployment-forces-EMERGENCY rule.
    pub fn has_forcing_deployment(&self) -> bool {
        self.allocations.lock().unwrap().values().any(|e| {
            matches!(
                e.allocation.margin_type,
                MarginType::Capacity | MarginType::Time
            ) && e
                .deployments
                .iter()
                .any(|d| d.status == DeploymentStatus::Active)
        })
    }

    /// Most recent live allocation of the given type with remaining margin.
    pub fn latest_allocation(&self, margin_type: MarginType) -> Option<MarginAllocation> {
        self.allocations
            .lock()
            .unwrap()
            .values()
            .filter(|e| {
                e.allocation.margin_type == margin_type
                    && e.allocation.amount - e.deployed() > f64::EPSILON
            })
            .max_by_key(|e| e.allocation.id)
            .map(|e| e.allocation.clone())
    }

    /// Look up an allocation by id.
    pub fn allocation(&self, allocation_id: u64) -> Option<MarginAllocation> {
        self.allocations
            .lock()
            .unwrap()
            .get(&allocation_id)
            .map(|e| e.allocation.clone())
    }

    /// Sum of ACTIVE deployment amounts for an allocation.
    pub fn deployed_amount(&self, allocation_id: u64) -> f64 {
        self.allocations
            .lock()
            .unwrap()
            .get(&allocation_id)
            .map(|e| e.deployed())
            .unwrap_or(0.0)
    }

    /// Number of live allocations.
    pub fn active_allocation_count(&self) -> usize {
        self.active_allocations.load(Ordering::SeqCst)
    }

    /// Snapshot of the bounded recovery history, oldest first.
    pub fn utilization_history(&self) -> Vec<MarginUtilization> {
        self.utilization_history
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .collect()
    }

    /// Current thresholds per pool.
    pub fn thresholds(&self) -> HashMap<MarginType, MarginThreshold> {
        self.thresholds.read().unwrap().clone()
    }

    /// Apply updated thresholds and capacities from a merged config.
    /// Shrinking a pool below its allocated amount is rejected.
    pub fn apply_config(
        &self,
        capacities: &HashMap<MarginType, f64>,
        thresholds: &HashMap<MarginType, MarginThreshold>,
    ) -> Result<()> {
        for (&margin_type, &new_total) in capacities {
            let Some(pool_mutex) = self.pools.get(&margin_type) else {
                continue;
            };
            let pool = pool_mutex.lock().unwrap();
            if new_total < pool.allocated {
                return Err(Error::validation(
                    "pool_capacities",
                    format!(
                        "{} capacity {:.2} below allocated {:.2}",
                        margin_type, new_total, pool.allocated
                    ),
                ));
            }
        }
        *self.thresholds.write().unwrap() = thresholds.clone();
        for (&margin_type, &new_total) in capacities {
            let Some(pool_mutex) = self.pools.get(&margin_type) else {
                continue;
            };
            let threshold = self.threshold_for(margin_type);
            let mut pool = pool_mutex.lock().unwrap();
            pool.total = new_total;
            pool.available = new_total - pool.allocated;
            pool.update_status(&threshold);
            pool.check_conservation();
        }
        Ok(())
    }

    fn threshold_for(&self, margin_type: MarginType) -> MarginThreshold {
        self.thresholds
            .read()
            .unwrap()
            .get(&margin_type)
            .copied()
            .unwrap_or_default()
    }

    fn record_threshold_crossings(
        &self,
        margin_type: MarginType,
        old_util: f64,
        new_util: f64,
        threshold: &MarginThreshold,
    ) {
        for (name, level) in [
            ("warning", threshold.warning),
            ("critical", threshold.critical),
            ("emergency", threshold.emergency),
        ] {
            if old_util < level && new_util >= level {
                warn!(
                    %margin_type,
                    utilization = new_util,
                    threshold = level,
                    "pool crossed {name} threshold"
                );
                self.audit.record(
                    MarginEventKind::ThresholdBreach,
                    Some(margin_type),
                    format!(
                        "{margin_type} utilization {new_util:.2} crossed {name} threshold {level:.2}"
                    ),
                    new_util - level,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> MarginLedger {
        ledger_with_limit(64)
    }

    fn ledger_with_limit(max_concurrent: usize) -> MarginLedger {
        let capacities: HashMap<_, _> = MarginType::ALL.iter().map(|&t| (t, 100.0)).collect();
        let thresholds: HashMap<_, _> = MarginType::ALL
            .iter()
            .map(|&t| (t, MarginThreshold::default()))
            .collect();
        MarginLedger::new(
            &capacities,
            &thresholds,
            max_concurrent,
            60_000,
            1_000,
            Arc::new(AuditLog::new(1_000)),
        )
    }

    fn request(margin_type: MarginType, amount: f64) -> AllocationRequest {
        AllocationRequest::new(margin_type, amount, "test")
    }

    #[test]
    fn test_allocate_debits_available() {
        let ledger = ledger();
        let alloc = ledger.allocate(request(MarginType::Capacity, 25.0)).unwrap();
        assert_eq!(alloc.amount, 25.0);
        let snap = ledger.snapshot();
        let pool = snap
            .iter()
            .find(|p| p.margin_type == MarginType::Capacity)
            .unwrap();
        assert_eq!(pool.allocated_capacity, 25.0);
        assert_eq!(pool.available_capacity, 75.0);
        assert!((pool.utilization_rate - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_allocate_fails_over_available() {
        let ledger = ledger();
        ledger.allocate(request(MarginType::Capacity, 25.0)).unwrap();
        let err = ledger
            .allocate(request(MarginType::Capacity, 150.0))
            .unwrap_err();
        match err {
            Error::InsufficientMargin {
                margin_type,
                requested,
                available,
            } => {
                assert_eq!(margin_type, MarginType::Capacity);
                assert_eq!(requested, 150.0);
                assert_eq!(available, 75.0);
            }
            other => panic!("expected InsufficientMargin, got {other:?}"),
        }
    }

    #[test]
    fn test_allocate_rejects_nonpositive_amount() {
        let ledger = ledger();
        assert!(ledger.allocate(request(MarginType::Time, 0.0)).is_err());
        assert!(ledger.allocate(request(MarginType::Time, -5.0)).is_err());
    }

    #[test]
    fn test_concurrency_ceiling_fails_fast() {
        let ledger = ledger_with_limit(2);
        ledger.allocate(request(MarginType::Capacity, 1.0)).unwrap();
        ledger.allocate(request(MarginType::Capacity, 1.0)).unwrap();
        let err = ledger
            .allocate(request(MarginType::Capacity, 1.0))
            .unwrap_err();
        assert!(matches!(err, Error::ConcurrencyLimit { limit: 2, .. }));
    }

    #[test]
    fn test_ceiling_frees_on_recovery() {
        let ledger = ledger_with_limit(1);
        let alloc = ledger.allocate(request(MarginType::Time, 5.0)).unwrap();
        assert!(ledger.allocate(request(MarginType::Time, 5.0)).is_err());
        ledger.recover(alloc.id, "done").unwrap();
        assert!(ledger.allocate(request(MarginType::Time, 5.0)).is_ok());
    }

    #[test]
    fn test_deploy_within_allocation() {
        let ledger = ledger();
        let alloc = ledger.allocate(request(MarginType::Capacity, 50.0)).unwrap();
        let dep = ledger.deploy(alloc.id, 25.0, "emergency").unwrap();
        assert_eq!(dep.allocation_id, alloc.id);
        assert_eq!(ledger.deployed_amount(alloc.id), 25.0);
    }

    #[test]
    fn test_deploy_rejects_over_remaining() {
        let ledger = ledger();
        let alloc = ledger.allocate(request(MarginType::Capacity, 50.0)).unwrap();
        ledger.deploy(alloc.id, 40.0, "first").unwrap();
        let err = ledger.deploy(alloc.id, 20.0, "second").unwrap_err();
        match err {
            Error::InsufficientMargin {
                requested,
                available,
                ..
            } => {
                assert_eq!(requested, 20.0);
                assert!((available - 10.0).abs() < 1e-9);
            }
            other => panic!("expected InsufficientMargin, got {other:?}"),
        }
    }

    #[test]
    fn test_deploy_tolerates_fractional_rounding() {
        let ledger = ledger();
        // 0.1 + 0.2 overshoots 0.3 in binary; exhausting the allocation in
        // fractional steps must not be refused over rounding error.
        let alloc = ledger.allocate(request(MarginType::Capacity, 0.3)).unwrap();
        ledger.deploy(alloc.id, 0.1, "first").unwrap();
        ledger.deploy(alloc.id, 0.2, "second").unwrap();
        // A real overdraw is still refused.
        assert!(ledger.deploy(alloc.id, 0.1, "third").is_err());
    }

    #[test]
    fn test_deploy_unknown_allocation() {
        let ledger = ledger();
        assert!(matches!(
            ledger.deploy(999, 1.0, "x").unwrap_err(),
            Error::AllocationNotFound { allocation_id: 999 }
        ));
    }

    #[test]
    fn test_recover_credits_pool_and_writes_history() {
        let ledger = ledger();
        let alloc = ledger.allocate(request(MarginType::Material, 40.0)).unwrap();
        ledger.deploy(alloc.id, 20.0, "use").unwrap();
        assert!(ledger.recover(alloc.id, "done").unwrap());

        let snap = ledger.snapshot();
        let pool = snap
            .iter()
            .find(|p| p.margin_type == MarginType::Material)
            .unwrap();
        assert_eq!(pool.available_capacity, 100.0);
        assert_eq!(pool.allocated_capacity, 0.0);

        let history = ledger.utilization_history();
        assert_eq!(history.len(), 1);
        assert!((history[0].utilization_rate - 0.5).abs() < 1e-9);
        assert!(ledger.allocation(alloc.id).is_none());
    }

    #[test]
    fn test_surge_recovery_starts_cooldown() {
        let ledger = ledger();
        // 90% pushes past the critical threshold (0.85): pool goes SURGE.
        let alloc = ledger.allocate(request(MarginType::Capacity, 90.0)).unwrap();
        ledger.recover(alloc.id, "done").unwrap();
        let err = ledger
            .allocate(request(MarginType::Capacity, 10.0))
            .unwrap_err();
        assert!(matches!(err, Error::PoolCooldown { .. }));
        // Other pools are unaffected.
        assert!(ledger.allocate(request(MarginType::Time, 10.0)).is_ok());
    }

    #[test]
    fn test_conservation_across_operations() {
        let ledger = ledger();
        let a = ledger.allocate(request(MarginType::Financial, 30.0)).unwrap();
        let b = ledger.allocate(request(MarginType::Financial, 20.0)).unwrap();
        ledger.deploy(a.id, 10.0, "x").unwrap();
        ledger.recover(b.id, "done").unwrap();
        let snap = ledger.snapshot();
        for pool in snap {
            assert!(
                (pool.allocated_capacity + pool.available_capacity - pool.total_capacity).abs()
                    < 1e-9,
                "{} books out of balance",
                pool.margin_type
            );
        }
    }

    #[test]
    fn test_forcing_deployment_detection() {
        let ledger = ledger();
        assert!(!ledger.has_forcing_deployment());
        let fin = ledger.allocate(request(MarginType::Financial, 10.0)).unwrap();
        ledger.deploy(fin.id, 5.0, "x").unwrap();
        // FINANCIAL deployments do not force the mode.
        assert!(!ledger.has_forcing_deployment());
        let cap = ledger.allocate(request(MarginType::Capacity, 10.0)).unwrap();
        ledger.deploy(cap.id, 5.0, "x").unwrap();
        assert!(ledger.has_forcing_deployment());
        ledger.recover(cap.id, "done").unwrap();
        assert!(!ledger.has_forcing_deployment());
    }

    #[test]
    fn test_optimize_flags_low_and_high_water() {
        let ledger = ledger();
        // CAPACITY at 95%: expansion candidate. Others at 0%: downsize.
        ledger.allocate(request(MarginType::Capacity, 95.0)).unwrap();
        let findings = ledger.optimize();
        assert!(findings.iter().any(|f| matches!(
            f,
            OptimizationFinding::Expand {
                margin_type: MarginType::Capacity,
                ..
            }
        )));
        assert!(findings.iter().any(|f| matches!(
            f,
            OptimizationFinding::Downsize {
                margin_type: MarginType::Time,
                ..
            }
        )));
        // Advisory only: capacity unchanged.
        let snap = ledger.snapshot();
        assert!(snap.iter().all(|p| p.total_capacity == 100.0));
    }

    #[test]
    fn test_optimize_expires_allocations() {
        let ledger = ledger();
        let mut req = request(MarginType::Time, 10.0);
        req.duration_ms = Some(0); // expires immediately
        let alloc = ledger.allocate(req).unwrap();
        ledger.optimize();
        assert!(ledger.allocation(alloc.id).is_none());
        let snap = ledger.snapshot();
        let pool = snap
            .iter()
            .find(|p| p.margin_type == MarginType::Time)
            .unwrap();
        assert_eq!(pool.available_capacity, 100.0);
    }

    #[test]
    fn test_threshold_breach_events_recorded() {
        let audit = Arc::new(AuditLog::new(1_000));
        let capacities: HashMap<_, _> = MarginType::ALL.iter().map(|&t| (t, 100.0)).collect();
        let thresholds: HashMap<_, _> = MarginType::ALL
            .iter()
            .map(|&t| (t, MarginThreshold::default()))
            .collect();
        let ledger = MarginLedger::new(&capacities, &thresholds, 64, 60_000, 1_000, audit.clone());
        ledger.allocate(request(MarginType::Capacity, 96.0)).unwrap();
        let events = audit.snapshot();
        let breaches: Vec<_> = events
            .iter()
            .filter(|e| e.kind == MarginEventKind::ThresholdBreach)
            .collect();
        // Crosses warning, critical, and emergency in one step.
        assert_eq!(breaches.len(), 3);
    }

    #[test]
    fn test_audit_log_bounded() {
        let audit = AuditLog::new(5);
        for i in 0..10 {
            audit.record(MarginEventKind::Allocation, None, format!("e{i}"), 0.0);
        }
        let events = audit.snapshot();
        assert_eq!(events.len(), 5);
        assert_eq!(events[0].description, "e5");
    }

    #[test]
    fn test_latest_allocation_skips_exhausted() {
        let ledger = ledger();
        let a = ledger.allocate(request(MarginType::Capacity, 10.0)).unwrap();
        let b = ledger.allocate(request(MarginType::Capacity, 10.0)).unwrap();
        ledger.deploy(b.id, 10.0, "all of it").unwrap();
        let latest = ledger.latest_allocation(MarginType::Capacity).unwrap();
        assert_eq!(latest.id, a.id);
    }
}
