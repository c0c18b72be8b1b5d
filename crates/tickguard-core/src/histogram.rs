#![forbid(unsafe_code)]

//! Order-preserving duration histogram backed by a Fenwick tree.
//!
//! Tick durations are quantised into fixed-width buckets. Each bucket holds
//! the number of samples currently in the rolling window, and a Fenwick tree
//! over those counts answers rank queries ("which bucket holds the k-th
//! smallest sample?") without sorting.
//!
//! # Operations
//!
//! | Operation | Time | Allocations |
//! |-----------|------|-------------|
//! | `new(buckets, width)` | O(buckets) | 1 Vec |
//! | `insert(micros)` | O(log buckets) | 0 |
//! | `remove(micros)` | O(log buckets) | 0 |
//! | `quantile_micros(q)` | O(log buckets) | 0 |
//! | `clear()` | O(buckets) | 0 |
//!
//! The bucket count is fixed at construction, so every operation has a
//! constant upper bound regardless of how many samples have been recorded.
//!
//! # Invariants
//!
//! 1. `tree[i]` stores the count of samples in the range of buckets
//!    determined by `lowbit(i)`.
//! 2. `total()` equals the number of inserted minus removed samples.
//! 3. Samples beyond the last bucket saturate into it.

use std::time::Duration;

/// Windowed histogram of durations with rank queries.
#[derive(Debug, Clone)]
pub struct DurationHistogram {
    /// 1-indexed Fenwick storage. `tree[0]` is unused.
    tree: Vec<u32>,
    /// Number of buckets.
    buckets: usize,
    /// Width of each bucket in microseconds (at least 1).
    bucket_width_us: u64,
    /// Number of samples currently counted.
    total: u32,
}

impl DurationHistogram {
    /// Create a histogram with `buckets` buckets of `bucket_width` each.
    ///
    /// A zero bucket count is raised to one and a zero width to one
    /// microsecond.
    #[must_use]
    pub fn new(buckets: usize, bucket_width: Duration) -> Self {
        let buckets = buckets.max(1);
        let width = u64::try_from(bucket_width.as_micros()).unwrap_or(u64::MAX);
        Self {
            tree: vec![0; buckets + 1],
            buckets,
            bucket_width_us: width.max(1),
            total: 0,
        }
    }

    /// Number of buckets.
    #[inline]
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets
    }

    /// Largest duration represented without saturation, in microseconds.
    #[must_use]
    pub fn range_micros(&self) -> u64 {
        self.bucket_width_us.saturating_mul(self.buckets as u64)
    }

    /// Number of samples currently counted.
    #[inline]
    #[must_use]
    pub fn total(&self) -> u32 {
        self.total
    }

    /// Whether no samples are counted.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Bucket index for a sample, saturating into the last bucket.
    #[must_use]
    pub fn bucket_for(&self, micros: u64) -> usize {
        let idx = micros / self.bucket_width_us;
        usize::try_from(idx)
            .unwrap_or(usize::MAX)
            .min(self.buckets - 1)
    }

    /// Count one sample.
    pub fn insert(&mut self, micros: u64) {
        let bucket = self.bucket_for(micros);
        self.add(bucket, 1);
        self.total = self.total.saturating_add(1);
    }

    /// Uncount one sample previously passed to [`insert`](Self::insert).
    ///
    /// Removing from an empty histogram is ignored.
    pub fn remove(&mut self, micros: u64) {
        if self.total == 0 {
            return;
        }
        let bucket = self.bucket_for(micros);
        self.add(bucket, u32::MAX); // wrapping -1
        self.total -= 1;
    }

    /// Number of samples in buckets `0..=bucket`.
    #[must_use]
    pub fn prefix(&self, bucket: usize) -> u32 {
        let mut idx = bucket.min(self.buckets - 1) + 1;
        let mut sum = 0u32;
        while idx > 0 {
            sum = sum.wrapping_add(self.tree[idx]);
            idx -= lowbit(idx);
        }
        sum
    }

    /// Smallest bucket whose cumulative count reaches `rank` (1-based).
    ///
    /// Returns `None` when `rank` is zero or exceeds [`total`](Self::total).
    #[must_use]
    pub fn bucket_at_rank(&self, rank: u32) -> Option<usize> {
        if rank == 0 || rank > self.total {
            return None;
        }
        let mut pos = 0usize;
        let mut remaining = rank;
        let mut mask = most_significant_bit(self.buckets);
        while mask > 0 {
            let next = pos + mask;
            if next <= self.buckets && self.tree[next] < remaining {
                remaining -= self.tree[next];
                pos = next;
            }
            mask >>= 1;
        }
        // `pos` is the last 1-indexed position with prefix < rank, so the
        // answer is the following bucket, which is `pos` in 0-indexed terms.
        Some(pos.min(self.buckets - 1))
    }

    /// Nearest-rank quantile estimate in microseconds.
    ///
    /// The estimate is the upper edge of the bucket holding the sample at
    /// rank `ceil(q * total)`, so it never under-reports a sample. The
    /// saturating last bucket reports `range_micros()`.
    #[must_use]
    pub fn quantile_micros(&self, q: f64) -> Option<u64> {
        if self.total == 0 || !q.is_finite() {
            return None;
        }
        let q = q.clamp(0.0, 1.0);
        let rank = ((q * f64::from(self.total)).ceil() as u32).clamp(1, self.total);
        let bucket = self.bucket_at_rank(rank)?;
        Some((bucket as u64 + 1).saturating_mul(self.bucket_width_us))
    }

    /// Drop all samples.
    pub fn clear(&mut self) {
        self.tree.fill(0);
        self.total = 0;
    }

    fn add(&mut self, bucket: usize, delta: u32) {
        let mut idx = bucket + 1;
        while idx <= self.buckets {
            self.tree[idx] = self.tree[idx].wrapping_add(delta);
            idx += lowbit(idx);
        }
    }
}

/// Lowest set bit of `x`.
#[inline]
fn lowbit(x: usize) -> usize {
    x & x.wrapping_neg()
}

/// Most significant bit that fits within `n`.
#[inline]
fn most_significant_bit(n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    1 << (usize::BITS - 1 - n.leading_zeros())
}
