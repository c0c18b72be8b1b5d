#![forbid(unsafe_code)]

//! Cumulative coalescer statistics.
//!
//! Counters here are monotonic for the life of a scheduler and survive
//! restarts through the persisted state blob.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Number of batch-size buckets: `1`, `2-3`, `4-7`, ... `128+`.
pub const BATCH_SIZE_BUCKETS: usize = 8;

/// Power-of-two histogram of dispatched batch sizes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSizeHistogram {
    counts: [u64; BATCH_SIZE_BUCKETS],
}

impl BatchSizeHistogram {
    /// Bucket index for a batch size. Empty batches share the first bucket.
    #[must_use]
    pub fn bucket_for(batch_size: usize) -> usize {
        let size = batch_size.max(1);
        let log2 = (usize::BITS - 1 - size.leading_zeros()) as usize;
        log2.min(BATCH_SIZE_BUCKETS - 1)
    }

    /// Inclusive lower edge of a bucket.
    #[must_use]
    pub fn bucket_floor(bucket: usize) -> usize {
        1 << bucket.min(BATCH_SIZE_BUCKETS - 1)
    }

    /// Count one batch.
    pub fn record(&mut self, batch_size: usize) {
        let bucket = Self::bucket_for(batch_size);
        self.counts[bucket] = self.counts[bucket].saturating_add(1);
    }

    /// Raw bucket counts.
    #[must_use]
    pub fn counts(&self) -> &[u64; BATCH_SIZE_BUCKETS] {
        &self.counts
    }

    /// Total batches recorded.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    fn merge(&mut self, other: &Self) {
        for (a, b) in self.counts.iter_mut().zip(other.counts.iter()) {
            *a = a.saturating_add(*b);
        }
    }
}

/// Counters for one coalesced key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyStats {
    /// Events accepted into a batch.
    pub coalesced: u64,
    /// Batches dispatched.
    pub dispatched_batches: u64,
    /// Events delivered across all dispatched batches.
    pub dispatched_events: u64,
    /// Events refused by the queue-depth cap.
    pub rejected: u64,
    /// Flushes that bypassed the timer.
    pub emergency_flushes: u64,
    /// Events discarded by cancellation or unregistration.
    pub cancelled: u64,
    /// Handler invocations that returned an error or panicked.
    pub callback_failures: u64,
    /// Batches flushed with no handler to receive them.
    pub unhandled: u64,
    /// Distribution of dispatched batch sizes.
    pub histogram: BatchSizeHistogram,
}

impl KeyStats {
    /// Mean dispatched batch size, or 0 before the first dispatch.
    #[must_use]
    pub fn mean_batch_size(&self) -> f64 {
        if self.dispatched_batches == 0 {
            0.0
        } else {
            self.dispatched_events as f64 / self.dispatched_batches as f64
        }
    }

    /// Add another key's counters into this one.
    pub fn merge(&mut self, other: &KeyStats) {
        self.coalesced = self.coalesced.saturating_add(other.coalesced);
        self.dispatched_batches = self
            .dispatched_batches
            .saturating_add(other.dispatched_batches);
        self.dispatched_events = self
            .dispatched_events
            .saturating_add(other.dispatched_events);
        self.rejected = self.rejected.saturating_add(other.rejected);
        self.emergency_flushes = self
            .emergency_flushes
            .saturating_add(other.emergency_flushes);
        self.cancelled = self.cancelled.saturating_add(other.cancelled);
        self.callback_failures = self
            .callback_failures
            .saturating_add(other.callback_failures);
        self.unhandled = self.unhandled.saturating_add(other.unhandled);
        self.histogram.merge(&other.histogram);
    }
}

/// Aggregate counters across all keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoalescerStats {
    /// Events accepted into batches.
    pub total_coalesced: u64,
    /// Events delivered to handlers.
    pub total_dispatched: u64,
    /// Events refused by backpressure.
    pub total_rejected: u64,
    /// Emergency flushes.
    pub total_emergency: u64,
    /// Failed handler invocations.
    pub total_callback_failures: u64,
    /// Per-key breakdown.
    pub per_key: BTreeMap<String, KeyStats>,
}

impl CoalescerStats {
    /// Build the aggregate from per-key counters.
    #[must_use]
    pub fn from_keys(per_key: BTreeMap<String, KeyStats>) -> Self {
        let mut stats = Self::default();
        for ks in per_key.values() {
            stats.total_coalesced = stats.total_coalesced.saturating_add(ks.coalesced);
            stats.total_dispatched = stats.total_dispatched.saturating_add(ks.dispatched_events);
            stats.total_rejected = stats.total_rejected.saturating_add(ks.rejected);
            stats.total_emergency = stats.total_emergency.saturating_add(ks.emergency_flushes);
            stats.total_callback_failures = stats
                .total_callback_failures
                .saturating_add(ks.callback_failures);
        }
        stats.per_key = per_key;
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_are_powers_of_two() {
        assert_eq!(BatchSizeHistogram::bucket_for(0), 0);
        assert_eq!(BatchSizeHistogram::bucket_for(1), 0);
        assert_eq!(BatchSizeHistogram::bucket_for(2), 1);
        assert_eq!(BatchSizeHistogram::bucket_for(3), 1);
        assert_eq!(BatchSizeHistogram::bucket_for(4), 2);
        assert_eq!(BatchSizeHistogram::bucket_for(127), 6);
        assert_eq!(BatchSizeHistogram::bucket_for(128), 7);
        assert_eq!(BatchSizeHistogram::bucket_for(10_000), 7);
        assert_eq!(BatchSizeHistogram::bucket_floor(3), 8);
    }

    #[test]
    fn mean_batch_size_handles_zero() {
        let mut ks = KeyStats::default();
        assert_eq!(ks.mean_batch_size(), 0.0);
        ks.dispatched_batches = 2;
        ks.dispatched_events = 7;
        assert!((ks.mean_batch_size() - 3.5).abs() < f64::EPSILON);
    }

    #[test]
    fn merge_adds_counters_and_histograms() {
        let mut a = KeyStats::default();
        a.coalesced = 3;
        a.histogram.record(5);
        let mut b = KeyStats::default();
        b.coalesced = 4;
        b.rejected = 2;
        b.histogram.record(6);
        a.merge(&b);
        assert_eq!(a.coalesced, 7);
        assert_eq!(a.rejected, 2);
        assert_eq!(a.histogram.counts()[2], 2);
    }

    #[test]
    fn aggregate_sums_keys() {
        let mut per_key = BTreeMap::new();
        per_key.insert(
            "health".to_string(),
            KeyStats {
                coalesced: 5,
                dispatched_events: 5,
                ..KeyStats::default()
            },
        );
        per_key.insert(
            "aura".to_string(),
            KeyStats {
                coalesced: 100,
                dispatched_events: 100,
                rejected: 50,
                ..KeyStats::default()
            },
        );
        let stats = CoalescerStats::from_keys(per_key);
        assert_eq!(stats.total_coalesced, 105);
        assert_eq!(stats.total_rejected, 50);
        assert_eq!(stats.per_key.len(), 2);
    }

    #[test]
    fn stats_deserialize_with_missing_fields() {
        let stats: CoalescerStats = serde_json::from_str(r#"{"total_coalesced": 9}"#).unwrap();
        assert_eq!(stats.total_coalesced, 9);
        assert!(stats.per_key.is_empty());
    }
}
