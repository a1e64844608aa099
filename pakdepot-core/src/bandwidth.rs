//! Global bandwidth ledger.
//!
//! Pure in-memory resource accounting: tracks a global Mbps ceiling and
//! per-connection grants. No I/O happens under the ledger lock, so every
//! operation is a short critical section.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;

/// How a grant is computed from the remaining capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Equal share including the new request.
    Fair,
    /// Weighted by a small positive integer priority.
    Priority,
    /// Shrinks as ledger utilization rises.
    Adaptive,
}

/// Read-only snapshot of the ledger for external reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BandwidthUsage {
    pub max_mbps: f64,
    pub used_mbps: f64,
    pub available_mbps: f64,
    pub utilization_pct: f64,
    pub active_connections: usize,
    pub connections: HashMap<String, f64>,
}

#[derive(Debug)]
struct Ledger {
    max_mbps: f64,
    used_mbps: f64,
    grants: HashMap<String, f64>,
}

/// Arbitrates the shared bandwidth budget between concurrent transfers.
///
/// Invariant: the sum of all grants never exceeds `max_mbps`.
#[derive(Debug)]
pub struct BandwidthArbiter {
    ledger: Mutex<Ledger>,
}

impl BandwidthArbiter {
    pub fn new(max_mbps: f64) -> Self {
        Self {
            ledger: Mutex::new(Ledger {
                max_mbps,
                used_mbps: 0.0,
                grants: HashMap::new(),
            }),
        }
    }

    /// Allocate bandwidth for a connection, returning the granted Mbps.
    ///
    /// A grant of 0.0 means the ledger has no spare capacity; callers must
    /// treat that as "source unavailable now". Re-allocating an id replaces
    /// its previous grant.
    pub fn allocate(
        &self,
        connection_id: &str,
        requested_mbps: f64,
        strategy: AllocationStrategy,
        priority: u32,
    ) -> f64 {
        let requested_mbps = requested_mbps.max(0.0);
        let mut ledger = self.ledger.lock();

        if let Some(previous) = ledger.grants.remove(connection_id) {
            ledger.used_mbps -= previous;
        }

        let available = ledger.max_mbps - ledger.used_mbps;
        let granted = if available <= 0.0 {
            0.0
        } else {
            let granted = match strategy {
                AllocationStrategy::Fair => {
                    requested_mbps.min(available / (ledger.grants.len() + 1) as f64)
                }
                AllocationStrategy::Priority => {
                    // Priorities >= 10 would exceed the remaining capacity,
                    // so the result is clamped to `available`.
                    requested_mbps
                        .min(available * f64::from(priority) / 10.0)
                        .min(available)
                }
                AllocationStrategy::Adaptive => {
                    let utilization = ledger.used_mbps / ledger.max_mbps;
                    let ceiling = if utilization > 0.8 {
                        available / 4.0
                    } else if utilization > 0.5 {
                        available / 2.0
                    } else {
                        available
                    };
                    requested_mbps.min(ceiling)
                }
            };
            granted.max(0.0)
        };

        ledger.grants.insert(connection_id.to_string(), granted);
        ledger.used_mbps += granted;
        granted
    }

    /// Release a connection's grant. Unknown or already-released ids are a
    /// no-op.
    pub fn release(&self, connection_id: &str) {
        let mut ledger = self.ledger.lock();
        if let Some(granted) = ledger.grants.remove(connection_id) {
            ledger.used_mbps -= granted;
        }
    }

    /// Owned snapshot of the current ledger state.
    pub fn usage_stats(&self) -> BandwidthUsage {
        let ledger = self.ledger.lock();
        // A zero ceiling has nothing to grant, so it reads as fully used.
        let utilization_pct = if ledger.max_mbps > 0.0 {
            ledger.used_mbps / ledger.max_mbps * 100.0
        } else {
            100.0
        };
        BandwidthUsage {
            max_mbps: ledger.max_mbps,
            used_mbps: ledger.used_mbps,
            available_mbps: ledger.max_mbps - ledger.used_mbps,
            utilization_pct,
            active_connections: ledger.grants.len(),
            connections: ledger.grants.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn fair_allocation_shares_equally() {
        let arbiter = BandwidthArbiter::new(100.0);
        // First connection: 1 active including itself, full request fits.
        assert_eq!(arbiter.allocate("a", 40.0, AllocationStrategy::Fair, 1), 40.0);
        // Second connection: available 60, 2 entries counted -> 30 cap.
        assert_eq!(arbiter.allocate("b", 40.0, AllocationStrategy::Fair, 1), 30.0);
    }

    #[test]
    fn priority_allocation_clamps_to_available() {
        let arbiter = BandwidthArbiter::new(100.0);
        assert_eq!(
            arbiter.allocate("a", 100.0, AllocationStrategy::Priority, 5),
            50.0
        );
        // Priority 20 would double the remaining 50; clamp keeps it at 50.
        assert_eq!(
            arbiter.allocate("b", 100.0, AllocationStrategy::Priority, 20),
            50.0
        );
        assert!(arbiter.usage_stats().used_mbps <= 100.0);
    }

    #[test]
    fn adaptive_allocation_shrinks_under_load() {
        let arbiter = BandwidthArbiter::new(100.0);
        arbiter.allocate("base", 85.0, AllocationStrategy::Fair, 1);
        // 85% utilization, available 15 -> grant capped at 15 / 4.
        let granted = arbiter.allocate("x", 40.0, AllocationStrategy::Adaptive, 1);
        assert_eq!(granted, 3.75);
    }

    #[test]
    fn adaptive_allocation_moderate_load() {
        let arbiter = BandwidthArbiter::new(100.0);
        arbiter.allocate("base", 60.0, AllocationStrategy::Fair, 1);
        // 60% utilization, available 40 -> grant capped at 40 / 2.
        let granted = arbiter.allocate("x", 40.0, AllocationStrategy::Adaptive, 1);
        assert_eq!(granted, 20.0);
    }

    #[test]
    fn exhausted_ledger_grants_zero() {
        let arbiter = BandwidthArbiter::new(50.0);
        arbiter.allocate("a", 50.0, AllocationStrategy::Fair, 1);
        assert_eq!(arbiter.allocate("b", 10.0, AllocationStrategy::Fair, 1), 0.0);
    }

    #[test]
    fn zero_ceiling_grants_nothing_and_reads_fully_used() {
        let arbiter = BandwidthArbiter::new(0.0);
        assert_eq!(arbiter.allocate("a", 10.0, AllocationStrategy::Fair, 1), 0.0);
        assert_eq!(
            arbiter.allocate("b", 10.0, AllocationStrategy::Adaptive, 1),
            0.0
        );

        let stats = arbiter.usage_stats();
        assert_eq!(stats.utilization_pct, 100.0);
        assert!(stats.utilization_pct.is_finite());
    }

    #[test]
    fn release_is_idempotent() {
        let arbiter = BandwidthArbiter::new(100.0);
        arbiter.allocate("a", 30.0, AllocationStrategy::Fair, 1);
        arbiter.release("a");
        arbiter.release("a");
        arbiter.release("never-allocated");
        let stats = arbiter.usage_stats();
        assert_eq!(stats.used_mbps, 0.0);
        assert_eq!(stats.active_connections, 0);
    }

    #[test]
    fn reallocation_replaces_previous_grant() {
        let arbiter = BandwidthArbiter::new(100.0);
        arbiter.allocate("a", 80.0, AllocationStrategy::Fair, 1);
        arbiter.allocate("a", 10.0, AllocationStrategy::Fair, 1);
        let stats = arbiter.usage_stats();
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.used_mbps, 10.0);
    }

    proptest! {
        // The sum of grants never exceeds the ceiling, for any interleaving
        // of allocations and releases.
        #[test]
        fn ledger_never_exceeds_ceiling(
            ops in proptest::collection::vec(
                (0u8..3, 0usize..8, 0.0f64..200.0, 1u32..15),
                1..64,
            )
        ) {
            let arbiter = BandwidthArbiter::new(100.0);
            for (op, id, requested, priority) in ops {
                let id = format!("conn-{}", id);
                match op {
                    0 => { arbiter.allocate(&id, requested, AllocationStrategy::Fair, priority); }
                    1 => { arbiter.allocate(&id, requested, AllocationStrategy::Adaptive, priority); }
                    _ => { arbiter.release(&id); }
                }
                let stats = arbiter.usage_stats();
                let sum: f64 = stats.connections.values().sum();
                prop_assert!(sum <= 100.0 + 1e-9);
                prop_assert!((sum - stats.used_mbps).abs() < 1e-6);
            }
        }
    }
}
