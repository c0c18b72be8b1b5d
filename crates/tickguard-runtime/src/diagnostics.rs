#![forbid(unsafe_code)]

//! Read-only scheduler snapshot for dashboards and logs.

use std::collections::BTreeMap;

use serde::Serialize;
use tickguard_core::{CoalescerStats, DirtyStats, LoadContext, TickPercentiles};

use crate::scheduler::RouteStats;

/// Learned delay of one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DelaySnapshot {
    /// Delay in effect, in microseconds.
    pub delay_us: u64,
    /// Observations folded into the delay.
    pub sample_count: u64,
    /// Load context of the last observation.
    pub context: LoadContext,
    /// Lower clamp, in microseconds.
    pub min_us: u64,
    /// Upper clamp, in microseconds.
    pub max_us: u64,
}

/// Point-in-time view of a [`TickScheduler`](crate::TickScheduler).
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsSnapshot {
    /// Ticks run by the scheduler.
    pub ticks: u64,
    /// Rolling tick percentiles, once any tick was recorded.
    pub tick: Option<TickPercentiles>,
    /// Budget verdict.
    pub over_budget: bool,
    /// Spare budget capacity in `[0, 1]`.
    pub spare_capacity: f64,
    /// Load classification fed to the tuner.
    pub load_context: LoadContext,
    /// Keys with a pending batch.
    pub pending_batches: usize,
    /// Dirty records outstanding.
    pub dirty_count: usize,
    /// Dirty records per effective priority, lowest first.
    pub dirty_by_priority: Vec<usize>,
    /// Coalescer counters.
    pub coalescer: CoalescerStats,
    /// Dirty manager counters.
    pub dirty: DirtyStats,
    /// Ingress routing counters.
    pub routes: RouteStats,
    /// Learned delays by key.
    pub delays: BTreeMap<String, DelaySnapshot>,
}

impl DiagnosticsSnapshot {
    /// Serialize to a single-line JSON record.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_serializes_to_one_line() {
        let mut delays = BTreeMap::new();
        delays.insert(
            "health".to_string(),
            DelaySnapshot {
                delay_us: 50_000,
                sample_count: 3,
                context: LoadContext::Idle,
                min_us: 0,
                max_us: 500_000,
            },
        );
        let snapshot = DiagnosticsSnapshot {
            ticks: 7,
            tick: None,
            over_budget: false,
            spare_capacity: 1.0,
            load_context: LoadContext::Idle,
            pending_batches: 1,
            dirty_count: 0,
            dirty_by_priority: vec![0; 5],
            coalescer: CoalescerStats::default(),
            dirty: DirtyStats::default(),
            routes: RouteStats::default(),
            delays,
        };
        let json = snapshot.to_json().unwrap();
        assert!(!json.contains('\n'));
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["ticks"], 7);
        assert_eq!(value["load_context"], "idle");
        assert_eq!(value["delays"]["health"]["delay_us"], 50_000);
    }
}
