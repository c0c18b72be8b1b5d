#![forbid(unsafe_code)]

//! Deferred, prioritised reconciliation of dirty targets.
//!
//! Callers mark targets dirty with a reason and a priority; the host drains
//! the dirty set in bounded passes. Each target has at most one
//! [`DirtyRecord`]: re-marking merges reasons and keeps the higher priority.
//!
//! # Ordering
//!
//! A pass picks the records with the highest *effective* priority, breaking
//! ties by first mark time and then by insertion order. The effective
//! priority is the recorded priority lowered by one level for every elapsed
//! `decay_interval` since the record was last marked, floored at
//! [`DirtyPriority::MIN`]. The effective priority is used everywhere a
//! record's priority is consulted: selection, per-priority counts, and the
//! urgent floor of adaptive sizing.
//!
//! # Liveness
//!
//! Targets are referenced by [`TargetHandle`] only. Before reconciling, the
//! manager asks the [`Reconciler`] whether the handle is still alive; dead
//! targets are removed without a callback and counted.
//!
//! # Reentrancy
//!
//! Reconcilers receive a [`DeferredMarks`] buffer instead of the manager.
//! Marks written there are merged after the pass finishes, so a target
//! dirtied while a pass is running is processed by the next pass: never
//! twice in one pass and never dropped.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::arena::{TargetArena, TargetHandle};
use crate::error::{CallbackError, ConfigError, guarded};
use crate::priority::DirtyPriority;
use crate::tick_budget::TickBudget;

/// Number of dirty priority levels.
pub const PRIORITY_LEVELS: usize = 5;

/// Dirty manager configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DirtyConfig {
    /// Age after which a record loses one priority level (zero disables).
    pub decay_interval: Duration,
    /// Adaptive batch size with no spare capacity.
    pub adaptive_min_batch: usize,
    /// Adaptive batch size with full spare capacity.
    pub adaptive_max_batch: usize,
    /// Reasons kept per record; further distinct reasons are counted only.
    pub max_reasons: usize,
    /// Pass limit for [`DirtyInvalidationManager::process_all_at`].
    pub process_all_max_passes: usize,
}

impl Default for DirtyConfig {
    fn default() -> Self {
        Self {
            decay_interval: Duration::from_millis(500),
            adaptive_min_batch: 4,
            adaptive_max_batch: 64,
            max_reasons: 16,
            process_all_max_passes: 32,
        }
    }
}

impl DirtyConfig {
    /// Set the decay interval.
    #[must_use]
    pub fn with_decay_interval(mut self, interval: Duration) -> Self {
        self.decay_interval = interval;
        self
    }

    /// Set the adaptive batch range.
    #[must_use]
    pub fn with_adaptive_range(mut self, min: usize, max: usize) -> Self {
        self.adaptive_min_batch = min;
        self.adaptive_max_batch = max;
        self
    }

    /// Set the per-record reason cap.
    #[must_use]
    pub fn with_max_reasons(mut self, max_reasons: usize) -> Self {
        self.max_reasons = max_reasons;
        self
    }

    /// Reject an inverted adaptive range or a zero pass limit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.adaptive_min_batch > self.adaptive_max_batch {
            return Err(ConfigError::Invalid(format!(
                "adaptive batch range inverted: min {} > max {}",
                self.adaptive_min_batch, self.adaptive_max_batch
            )));
        }
        if self.process_all_max_passes == 0 {
            return Err(ConfigError::Invalid(
                "process_all_max_passes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Pending reconciliation for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyRecord {
    target: TargetHandle,
    reasons: BTreeSet<String>,
    priority: DirtyPriority,
    first_marked_at: Instant,
    last_marked_at: Instant,
    seq: u64,
}

impl DirtyRecord {
    /// The target.
    #[must_use]
    pub fn target(&self) -> TargetHandle {
        self.target
    }

    /// Distinct reasons the target was marked for.
    #[must_use]
    pub fn reasons(&self) -> &BTreeSet<String> {
        &self.reasons
    }

    /// Highest priority the target was marked with.
    #[must_use]
    pub fn priority(&self) -> DirtyPriority {
        self.priority
    }

    /// When the record was created.
    #[must_use]
    pub fn first_marked_at(&self) -> Instant {
        self.first_marked_at
    }

    /// When the record was last marked.
    #[must_use]
    pub fn last_marked_at(&self) -> Instant {
        self.last_marked_at
    }

    /// Priority after decay at `now`.
    #[must_use]
    pub fn effective_priority(&self, now: Instant, decay_interval: Duration) -> DirtyPriority {
        if decay_interval.is_zero() {
            return self.priority;
        }
        let age = now.saturating_duration_since(self.last_marked_at);
        let levels = age.as_nanos() / decay_interval.as_nanos();
        self.priority
            .decayed(u32::try_from(levels).unwrap_or(u32::MAX))
    }
}

/// Marks raised while a pass is running; merged when the pass ends.
#[derive(Debug, Default)]
pub struct DeferredMarks {
    marks: Vec<(TargetHandle, String, DirtyPriority)>,
}

impl DeferredMarks {
    /// Mark a target dirty after the current pass.
    pub fn mark_dirty(
        &mut self,
        target: TargetHandle,
        reason: impl Into<String>,
        priority: impl Into<DirtyPriority>,
    ) {
        self.marks.push((target, reason.into(), priority.into()));
    }

    /// Number of deferred marks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.marks.len()
    }

    /// Whether nothing was deferred.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }
}

/// Reconciliation callback plus liveness oracle.
pub trait Reconciler {
    /// Whether `target` still exists.
    fn is_alive(&self, target: TargetHandle) -> bool;

    /// Reconcile one live target.
    fn reconcile(
        &mut self,
        target: TargetHandle,
        deferred: &mut DeferredMarks,
    ) -> Result<(), CallbackError>;
}

/// [`Reconciler`] over targets stored in a [`TargetArena`].
pub struct ArenaReconciler<'a, T, F> {
    arena: &'a mut TargetArena<T>,
    reconcile: F,
}

impl<'a, T, F> ArenaReconciler<'a, T, F>
where
    F: FnMut(TargetHandle, &mut T, &mut DeferredMarks) -> Result<(), CallbackError>,
{
    /// Reconcile arena targets with `reconcile`.
    pub fn new(arena: &'a mut TargetArena<T>, reconcile: F) -> Self {
        Self { arena, reconcile }
    }
}

impl<T, F> Reconciler for ArenaReconciler<'_, T, F>
where
    F: FnMut(TargetHandle, &mut T, &mut DeferredMarks) -> Result<(), CallbackError>,
{
    fn is_alive(&self, target: TargetHandle) -> bool {
        self.arena.contains(target)
    }

    fn reconcile(
        &mut self,
        target: TargetHandle,
        deferred: &mut DeferredMarks,
    ) -> Result<(), CallbackError> {
        match self.arena.get_mut(target) {
            Some(value) => (self.reconcile)(target, value, deferred),
            None => Ok(()),
        }
    }
}

/// Outcome of one or more processing passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessReport {
    /// Targets reconciled successfully.
    pub processed: usize,
    /// Dead targets removed without a callback.
    pub skipped_stale: usize,
    /// Reconcile calls that failed; their records stay dirty for a later pass.
    pub failed: usize,
    /// Marks raised during the pass and merged afterwards.
    pub deferred: usize,
    /// Records left after the pass.
    pub remaining: usize,
}

impl ProcessReport {
    /// Records taken out of the dirty set by the pass.
    #[must_use]
    pub fn touched(&self) -> usize {
        self.processed + self.skipped_stale + self.failed
    }

    fn absorb(&mut self, other: ProcessReport) {
        self.processed += other.processed;
        self.skipped_stale += other.skipped_stale;
        self.failed += other.failed;
        self.deferred += other.deferred;
        self.remaining = other.remaining;
    }
}

/// Cumulative dirty-manager counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyStats {
    /// Marks that created a record.
    pub marked: u64,
    /// Marks merged into an existing record.
    pub merged: u64,
    /// Targets reconciled.
    pub processed: u64,
    /// Dead targets skipped.
    pub skipped_stale: u64,
    /// Failed reconcile calls.
    pub failed: u64,
    /// Marks deferred to a later pass.
    pub deferred: u64,
    /// Reasons not stored because the record was at its cap.
    pub reasons_truncated: u64,
    /// Processing passes run.
    pub passes: u64,
}

/// Dirty set with priority ordering, decay, and bounded passes.
#[derive(Debug, Default)]
pub struct DirtyInvalidationManager {
    config: DirtyConfig,
    records: HashMap<TargetHandle, DirtyRecord>,
    next_seq: u64,
    stats: DirtyStats,
}

impl DirtyInvalidationManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new(config: DirtyConfig) -> Self {
        Self {
            config,
            records: HashMap::new(),
            next_seq: 0,
            stats: DirtyStats::default(),
        }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &DirtyConfig {
        &self.config
    }

    /// Mark a target dirty now.
    pub fn mark_dirty(
        &mut self,
        target: TargetHandle,
        reason: impl Into<String>,
        priority: impl Into<DirtyPriority>,
    ) -> bool {
        self.mark_dirty_at(target, reason, priority, Instant::now())
    }

    /// Mark a target dirty at `now`. Returns `true` if a new record was
    /// created, `false` if the mark merged into an existing one.
    ///
    /// A record keeps at most `max_reasons` distinct reasons. Further new
    /// reasons are not stored but still raise the priority and are counted
    /// in [`DirtyStats::reasons_truncated`].
    pub fn mark_dirty_at(
        &mut self,
        target: TargetHandle,
        reason: impl Into<String>,
        priority: impl Into<DirtyPriority>,
        now: Instant,
    ) -> bool {
        let reason = reason.into();
        let priority = priority.into();
        let max_reasons = self.config.max_reasons;

        if let Some(record) = self.records.get_mut(&target) {
            record.priority = record.priority.max(priority);
            record.last_marked_at = now;
            if !record.reasons.contains(&reason) {
                if record.reasons.len() < max_reasons {
                    record.reasons.insert(reason);
                } else {
                    self.stats.reasons_truncated += 1;
                }
            }
            self.stats.merged += 1;
            crate::trace!(target = ?target, priority = priority.get(), "dirty mark merged");
            return false;
        }

        let mut reasons = BTreeSet::new();
        if max_reasons > 0 {
            reasons.insert(reason);
        } else {
            self.stats.reasons_truncated += 1;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.records.insert(
            target,
            DirtyRecord {
                target,
                reasons,
                priority,
                first_marked_at: now,
                last_marked_at: now,
                seq,
            },
        );
        self.stats.marked += 1;
        crate::trace!(target = ?target, priority = priority.get(), "target marked dirty");
        true
    }

    /// Drop a target's record without reconciling it.
    pub fn remove(&mut self, target: TargetHandle) -> Option<DirtyRecord> {
        self.records.remove(&target)
    }

    /// Drop every record. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let n = self.records.len();
        self.records.clear();
        n
    }

    /// Number of dirty targets.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.records.len()
    }

    /// Whether a target is dirty.
    #[must_use]
    pub fn is_dirty(&self, target: TargetHandle) -> bool {
        self.records.contains_key(&target)
    }

    /// A target's record.
    #[must_use]
    pub fn record(&self, target: TargetHandle) -> Option<&DirtyRecord> {
        self.records.get(&target)
    }

    /// Effective priority of a target's record at `now`.
    #[must_use]
    pub fn effective_priority(&self, target: TargetHandle, now: Instant) -> Option<DirtyPriority> {
        self.records
            .get(&target)
            .map(|r| r.effective_priority(now, self.config.decay_interval))
    }

    /// Dirty targets per effective priority level, lowest level first.
    #[must_use]
    pub fn counts_by_priority(&self, now: Instant) -> [usize; PRIORITY_LEVELS] {
        let mut counts = [0; PRIORITY_LEVELS];
        for record in self.records.values() {
            counts[record.effective_priority(now, self.config.decay_interval).index()] += 1;
        }
        counts
    }

    /// Cumulative counters.
    #[must_use]
    pub fn stats(&self) -> &DirtyStats {
        &self.stats
    }

    /// Batch size for adaptive processing given the budget's spare capacity.
    ///
    /// Scales linearly between the configured min and max. When that comes
    /// out as zero but an urgent record is waiting, one record is processed.
    #[must_use]
    pub fn adaptive_batch_size(&self, spare_capacity: f64, now: Instant) -> usize {
        let min = self.config.adaptive_min_batch;
        let max = self.config.adaptive_max_batch.max(min);
        let spare = if spare_capacity.is_finite() {
            spare_capacity.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let n = min + ((max - min) as f64 * spare).round() as usize;
        if n == 0 && self.has_urgent(now) { 1 } else { n }
    }

    /// Process up to `max_count` records now.
    pub fn process_batch<R: Reconciler + ?Sized>(
        &mut self,
        max_count: usize,
        reconciler: &mut R,
    ) -> ProcessReport {
        self.process_batch_at(max_count, Instant::now(), reconciler)
    }

    /// Process up to `max_count` records, highest effective priority first.
    pub fn process_batch_at<R: Reconciler + ?Sized>(
        &mut self,
        max_count: usize,
        now: Instant,
        reconciler: &mut R,
    ) -> ProcessReport {
        let selected = self.select(max_count, now);
        let mut report = ProcessReport::default();
        if selected.is_empty() {
            report.remaining = self.records.len();
            return report;
        }

        let mut deferred = DeferredMarks::default();
        let mut retry = Vec::new();
        for target in selected {
            let Some(record) = self.records.remove(&target) else {
                continue;
            };
            if !reconciler.is_alive(target) {
                report.skipped_stale += 1;
                crate::trace!(target = ?target, "stale dirty target skipped");
                continue;
            }
            match guarded(|| reconciler.reconcile(target, &mut deferred)) {
                Ok(()) => report.processed += 1,
                Err(error) => {
                    report.failed += 1;
                    crate::warn!(target = ?target, error = %error, "reconcile failed");
                    retry.push(record);
                }
            }
        }

        // Failed records go back untouched before deferred marks merge in.
        for record in retry {
            self.records.insert(record.target, record);
        }
        report.deferred = deferred.len();
        for (target, reason, priority) in deferred.marks {
            self.mark_dirty_at(target, reason, priority, now);
        }
        report.remaining = self.records.len();

        self.stats.passes += 1;
        self.stats.processed += report.processed as u64;
        self.stats.skipped_stale += report.skipped_stale as u64;
        self.stats.failed += report.failed as u64;
        self.stats.deferred += report.deferred as u64;
        crate::debug!(
            processed = report.processed,
            skipped_stale = report.skipped_stale,
            failed = report.failed,
            deferred = report.deferred,
            remaining = report.remaining,
            "dirty pass complete"
        );
        report
    }

    /// Process a batch sized from the budget's spare capacity.
    pub fn process_adaptive_at<R: Reconciler + ?Sized>(
        &mut self,
        now: Instant,
        budget: &TickBudget,
        reconciler: &mut R,
    ) -> ProcessReport {
        let n = self.adaptive_batch_size(budget.spare_capacity_ratio(), now);
        self.process_batch_at(n, now, reconciler)
    }

    /// Drain the dirty set now.
    pub fn process_all<R: Reconciler + ?Sized>(&mut self, reconciler: &mut R) -> ProcessReport {
        self.process_all_at(Instant::now(), reconciler)
    }

    /// Drain the dirty set, including marks deferred by earlier passes.
    ///
    /// Stops after `process_all_max_passes` passes so a reconciler that keeps
    /// re-marking targets cannot loop forever, and early once a pass only
    /// fails. `remaining` reports what is left in either case.
    pub fn process_all_at<R: Reconciler + ?Sized>(
        &mut self,
        now: Instant,
        reconciler: &mut R,
    ) -> ProcessReport {
        let mut total = ProcessReport {
            remaining: self.records.len(),
            ..ProcessReport::default()
        };
        for _ in 0..self.config.process_all_max_passes {
            if self.records.is_empty() {
                break;
            }
            let pass = self.process_batch_at(usize::MAX, now, reconciler);
            let only_failures = pass.failed == pass.touched() && pass.deferred == 0;
            total.absorb(pass);
            if only_failures {
                break;
            }
        }
        if total.remaining > 0 {
            crate::warn!(
                remaining = total.remaining,
                passes = self.config.process_all_max_passes,
                "dirty set not drained within pass limit"
            );
        }
        total
    }

    fn has_urgent(&self, now: Instant) -> bool {
        self.records
            .values()
            .any(|r| r.effective_priority(now, self.config.decay_interval) == DirtyPriority::MAX)
    }

    fn select(&self, max_count: usize, now: Instant) -> Vec<TargetHandle> {
        if max_count == 0 || self.records.is_empty() {
            return Vec::new();
        }
        let interval = self.config.decay_interval;
        let mut order: Vec<_> = self
            .records
            .values()
            .map(|r| {
                (
                    Reverse(r.effective_priority(now, interval)),
                    r.first_marked_at,
                    r.seq,
                    r.target,
                )
            })
            .collect();
        if order.len() > max_count {
            order.select_nth_unstable(max_count - 1);
            order.truncate(max_count);
        }
        order.sort_unstable();
        order.into_iter().map(|(_, _, _, target)| target).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn h(idx: u32) -> TargetHandle {
        TargetHandle::from_raw_parts(idx, 0)
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[derive(Default)]
    struct Recorder {
        dead: HashSet<TargetHandle>,
        failing: HashSet<TargetHandle>,
        panicking: HashSet<TargetHandle>,
        remark: Vec<(TargetHandle, TargetHandle)>,
        seen: Vec<TargetHandle>,
    }

    impl Reconciler for Recorder {
        fn is_alive(&self, target: TargetHandle) -> bool {
            !self.dead.contains(&target)
        }

        fn reconcile(
            &mut self,
            target: TargetHandle,
            deferred: &mut DeferredMarks,
        ) -> Result<(), CallbackError> {
            self.seen.push(target);
            for (from, to) in &self.remark {
                if *from == target {
                    deferred.mark_dirty(*to, "cascade", DirtyPriority::NORMAL);
                }
            }
            if self.panicking.contains(&target) {
                panic!("reconciler panicked");
            }
            if self.failing.contains(&target) {
                return Err("reconcile failed".into());
            }
            Ok(())
        }
    }

    #[test]
    fn remark_merges_reasons_and_max_priority() {
        let mut m = DirtyInvalidationManager::default();
        let t0 = Instant::now();
        assert!(m.mark_dirty_at(h(1), "health", 2u8, t0));
        assert!(!m.mark_dirty_at(h(1), "power", 4u8, t0 + ms(1)));
        assert!(!m.mark_dirty_at(h(1), "health", 3u8, t0 + ms(2)));

        let record = m.record(h(1)).unwrap();
        assert_eq!(m.dirty_count(), 1);
        assert_eq!(record.priority().get(), 4);
        assert!(record.reasons().contains("health"));
        assert!(record.reasons().contains("power"));
        assert_eq!(record.first_marked_at(), t0);
        assert_eq!(record.last_marked_at(), t0 + ms(2));
        assert_eq!(m.stats().merged, 2);
    }

    #[test]
    fn reason_cap_counts_overflow() {
        let mut m = DirtyInvalidationManager::new(DirtyConfig::default().with_max_reasons(2));
        let t0 = Instant::now();
        for reason in ["a", "b", "c", "d"] {
            m.mark_dirty_at(h(1), reason, 3u8, t0);
        }
        assert_eq!(m.record(h(1)).unwrap().reasons().len(), 2);
        assert_eq!(m.stats().reasons_truncated, 2);

        // A dropped reason still raises the priority.
        m.mark_dirty_at(h(1), "e", 5u8, t0);
        let record = m.record(h(1)).unwrap();
        assert!(!record.reasons().contains("e"));
        assert_eq!(record.priority().get(), 5);
        assert_eq!(m.stats().reasons_truncated, 3);
    }

    #[test]
    fn batch_respects_max_and_priority_order() {
        let mut m = DirtyInvalidationManager::default();
        let t0 = Instant::now();
        m.mark_dirty_at(h(1), "r", 1u8, t0);
        m.mark_dirty_at(h(2), "r", 5u8, t0 + ms(1));
        m.mark_dirty_at(h(3), "r", 3u8, t0 + ms(2));
        m.mark_dirty_at(h(4), "r", 5u8, t0 + ms(3));

        let mut r = Recorder::default();
        let report = m.process_batch_at(2, t0 + ms(4), &mut r);
        assert_eq!(report.processed, 2);
        assert_eq!(report.remaining, 2);
        assert_eq!(r.seen, vec![h(2), h(4)]);

        m.process_batch_at(10, t0 + ms(5), &mut r);
        assert_eq!(r.seen, vec![h(2), h(4), h(3), h(1)]);
        assert_eq!(m.dirty_count(), 0);
    }

    #[test]
    fn ties_break_by_first_mark_then_insertion() {
        let mut m = DirtyInvalidationManager::new(DirtyConfig::default().with_decay_interval(Duration::ZERO));
        let t0 = Instant::now();
        m.mark_dirty_at(h(7), "r", 3u8, t0 + ms(1));
        m.mark_dirty_at(h(8), "r", 3u8, t0);
        m.mark_dirty_at(h(9), "r", 3u8, t0);
        let mut r = Recorder::default();
        m.process_batch_at(3, t0 + ms(2), &mut r);
        assert_eq!(r.seen, vec![h(8), h(9), h(7)]);
    }

    #[test]
    fn dead_targets_are_skipped_and_removed() {
        let mut m = DirtyInvalidationManager::default();
        let t0 = Instant::now();
        m.mark_dirty_at(h(1), "r", 3u8, t0);
        m.mark_dirty_at(h(2), "r", 3u8, t0);
        let mut r = Recorder::default();
        r.dead.insert(h(1));
        let report = m.process_batch_at(10, t0, &mut r);
        assert_eq!(report.skipped_stale, 1);
        assert_eq!(report.processed, 1);
        assert_eq!(r.seen, vec![h(2)]);
        assert!(!m.is_dirty(h(1)));
    }

    #[test]
    fn failures_and_panics_do_not_abort_pass() {
        let mut m = DirtyInvalidationManager::default();
        let t0 = Instant::now();
        for i in 1..=3 {
            m.mark_dirty_at(h(i), "r", 3u8, t0 + ms(u64::from(i)));
        }
        let mut r = Recorder::default();
        r.failing.insert(h(1));
        r.panicking.insert(h(2));
        let report = m.process_batch_at(10, t0 + ms(5), &mut r);
        assert_eq!(report.failed, 2);
        assert_eq!(report.processed, 1);
        assert_eq!(r.seen.len(), 3);
        assert_eq!(report.remaining, 2);
        assert!(m.is_dirty(h(1)));
        assert!(m.is_dirty(h(2)));
        assert!(!m.is_dirty(h(3)));
        assert_eq!(m.stats().failed, 2);
    }

    #[test]
    fn failed_record_keeps_reasons_and_priority_until_it_succeeds() {
        let mut m = DirtyInvalidationManager::new(DirtyConfig::default().with_decay_interval(Duration::ZERO));
        let t0 = Instant::now();
        m.mark_dirty_at(h(1), "health", 4u8, t0);
        m.mark_dirty_at(h(1), "power", 2u8, t0);
        m.mark_dirty_at(h(2), "aura", 3u8, t0 + ms(1));

        let mut r = Recorder::default();
        r.failing.insert(h(1));
        let report = m.process_batch_at(10, t0 + ms(2), &mut r);
        assert_eq!(report.failed, 1);
        assert_eq!(report.processed, 1);
        // Not retried within the same pass.
        assert_eq!(r.seen, vec![h(1), h(2)]);

        let record = m.record(h(1)).unwrap();
        assert_eq!(record.priority().get(), 4);
        assert!(record.reasons().contains("health"));
        assert!(record.reasons().contains("power"));
        assert_eq!(record.first_marked_at(), t0);

        r.failing.clear();
        let report = m.process_batch_at(10, t0 + ms(3), &mut r);
        assert_eq!(report.processed, 1);
        assert_eq!(m.dirty_count(), 0);
        assert_eq!(r.seen, vec![h(1), h(2), h(1)]);
    }

    #[test]
    fn failed_record_merges_marks_raised_during_its_pass() {
        let mut m = DirtyInvalidationManager::default();
        let t0 = Instant::now();
        m.mark_dirty_at(h(1), "layout", 2u8, t0);
        m.mark_dirty_at(h(2), "r", 3u8, t0);
        let mut r = Recorder::default();
        r.failing.insert(h(1));
        r.remark = vec![(h(2), h(1))];
        // 2 goes first and re-marks 1, which then fails.
        let report = m.process_batch_at(10, t0, &mut r);
        assert_eq!(report.failed, 1);
        assert_eq!(report.deferred, 1);
        let record = m.record(h(1)).unwrap();
        assert_eq!(record.priority().get(), 3);
        assert!(record.reasons().contains("layout"));
        assert!(record.reasons().contains("cascade"));
    }

    #[test]
    fn process_all_stops_when_only_failures_remain() {
        let mut m = DirtyInvalidationManager::default();
        let t0 = Instant::now();
        m.mark_dirty_at(h(1), "r", 3u8, t0);
        m.mark_dirty_at(h(2), "r", 3u8, t0);
        let mut r = Recorder::default();
        r.failing.insert(h(1));
        let report = m.process_all_at(t0, &mut r);
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(report.remaining, 1);
        assert!(m.is_dirty(h(1)));
    }

    #[test]
    fn marks_during_pass_are_deferred_not_repeated() {
        let mut m = DirtyInvalidationManager::default();
        let t0 = Instant::now();
        m.mark_dirty_at(h(1), "r", 3u8, t0);
        m.mark_dirty_at(h(2), "r", 3u8, t0 + ms(1));
        let mut r = Recorder::default();
        // Reconciling 1 re-dirties itself and dirties 3.
        r.remark = vec![(h(1), h(1)), (h(1), h(3))];

        let report = m.process_batch_at(10, t0 + ms(2), &mut r);
        assert_eq!(report.processed, 2);
        assert_eq!(report.deferred, 2);
        assert_eq!(r.seen, vec![h(1), h(2)]);
        assert!(m.is_dirty(h(1)));
        assert!(m.is_dirty(h(3)));

        r.remark.clear();
        m.process_batch_at(10, t0 + ms(3), &mut r);
        assert_eq!(r.seen, vec![h(1), h(2), h(1), h(3)]);
    }

    #[test]
    fn decay_lowers_effective_priority() {
        let mut m = DirtyInvalidationManager::new(DirtyConfig::default().with_decay_interval(ms(100)));
        let t0 = Instant::now();
        m.mark_dirty_at(h(1), "r", 4u8, t0);
        assert_eq!(m.effective_priority(h(1), t0 + ms(99)).unwrap().get(), 4);
        assert_eq!(m.effective_priority(h(1), t0 + ms(100)).unwrap().get(), 3);
        assert_eq!(m.effective_priority(h(1), t0 + ms(250)).unwrap().get(), 2);
        assert_eq!(m.effective_priority(h(1), t0 + ms(10_000)).unwrap(), DirtyPriority::MIN);
        assert_eq!(m.counts_by_priority(t0 + ms(100)), [0, 0, 1, 0, 0]);
    }

    #[test]
    fn decayed_record_yields_to_fresh_lower_priority() {
        let mut m = DirtyInvalidationManager::new(DirtyConfig::default().with_decay_interval(ms(100)));
        let t0 = Instant::now();
        m.mark_dirty_at(h(1), "old", 5u8, t0);
        m.mark_dirty_at(h(2), "fresh", 4u8, t0 + ms(300));
        let mut r = Recorder::default();
        m.process_batch_at(1, t0 + ms(300), &mut r);
        assert_eq!(r.seen, vec![h(2)]);
    }

    #[test]
    fn remark_refreshes_decay() {
        let mut m = DirtyInvalidationManager::new(DirtyConfig::default().with_decay_interval(ms(100)));
        let t0 = Instant::now();
        m.mark_dirty_at(h(1), "r", 4u8, t0);
        m.mark_dirty_at(h(1), "r", 2u8, t0 + ms(200));
        assert_eq!(m.effective_priority(h(1), t0 + ms(200)).unwrap().get(), 4);
    }

    #[test]
    fn adaptive_size_scales_with_spare_capacity() {
        let m = DirtyInvalidationManager::new(DirtyConfig::default().with_adaptive_range(4, 64));
        let now = Instant::now();
        assert_eq!(m.adaptive_batch_size(0.0, now), 4);
        assert_eq!(m.adaptive_batch_size(0.5, now), 34);
        assert_eq!(m.adaptive_batch_size(1.0, now), 64);
        assert_eq!(m.adaptive_batch_size(f64::NAN, now), 4);
    }

    #[test]
    fn adaptive_zero_floor_admits_one_urgent_record() {
        let mut m = DirtyInvalidationManager::new(DirtyConfig::default().with_adaptive_range(0, 8));
        let t0 = Instant::now();
        m.mark_dirty_at(h(1), "r", 4u8, t0);
        assert_eq!(m.adaptive_batch_size(0.0, t0), 0);
        m.mark_dirty_at(h(2), "r", DirtyPriority::MAX, t0);
        assert_eq!(m.adaptive_batch_size(0.0, t0), 1);
        // Once decayed, the record is no longer urgent.
        assert_eq!(m.adaptive_batch_size(0.0, t0 + ms(600)), 0);
    }

    #[test]
    fn process_adaptive_uses_budget() {
        let mut m = DirtyInvalidationManager::new(DirtyConfig::default().with_adaptive_range(1, 3));
        let t0 = Instant::now();
        for i in 0..10 {
            m.mark_dirty_at(h(i), "r", 3u8, t0);
        }
        let budget = TickBudget::new(crate::tick_budget::TickBudgetConfig::default());
        let mut r = Recorder::default();
        let report = m.process_adaptive_at(t0, &budget, &mut r);
        assert_eq!(report.processed, 3);
    }

    #[test]
    fn process_all_drains_cascades() {
        let mut m = DirtyInvalidationManager::default();
        let t0 = Instant::now();
        m.mark_dirty_at(h(1), "r", 3u8, t0);
        let mut r = Recorder::default();
        r.remark = vec![(h(1), h(2)), (h(2), h(3))];
        let report = m.process_all_at(t0, &mut r);
        assert_eq!(report.processed, 3);
        assert_eq!(report.remaining, 0);
        assert_eq!(r.seen, vec![h(1), h(2), h(3)]);
    }

    #[test]
    fn process_all_stops_at_pass_limit() {
        let mut config = DirtyConfig::default();
        config.process_all_max_passes = 3;
        let mut m = DirtyInvalidationManager::new(config);
        let t0 = Instant::now();
        m.mark_dirty_at(h(1), "r", 3u8, t0);
        let mut r = Recorder::default();
        r.remark = vec![(h(1), h(1))];
        let report = m.process_all_at(t0, &mut r);
        assert_eq!(report.processed, 3);
        assert_eq!(report.remaining, 1);
    }

    #[test]
    fn arena_reconciler_checks_generation() {
        let mut arena = TargetArena::new();
        let a = arena.insert(0u32);
        let b = arena.insert(0u32);
        let mut m = DirtyInvalidationManager::default();
        let t0 = Instant::now();
        m.mark_dirty_at(a, "r", 3u8, t0);
        m.mark_dirty_at(b, "r", 3u8, t0);
        arena.remove(a);
        let c = arena.insert(0u32);

        let report = {
            let mut r = ArenaReconciler::new(&mut arena, |_, count: &mut u32, _| {
                *count += 1;
                Ok(())
            });
            m.process_all_at(t0, &mut r)
        };
        assert_eq!(report.processed, 1);
        assert_eq!(report.skipped_stale, 1);
        assert_eq!(arena.get(b), Some(&1));
        assert_eq!(arena.get(c), Some(&0));
    }

    #[test]
    fn config_validation() {
        assert!(DirtyConfig::default().validate().is_ok());
        assert!(DirtyConfig::default().with_adaptive_range(9, 3).validate().is_err());
    }

    mod property {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// A pass never touches more than `max` records, never touches one
            /// twice, and always picks the highest effective priorities.
            #[test]
            fn pass_is_bounded_and_prioritised(
                marks in proptest::collection::vec((0u32..40, 1u8..=5), 1..120),
                max in 0usize..20
            ) {
                let mut m = DirtyInvalidationManager::new(DirtyConfig::default().with_decay_interval(Duration::ZERO));
                let t0 = Instant::now();
                for (i, (target, prio)) in marks.iter().enumerate() {
                    m.mark_dirty_at(h(*target), "r", *prio, t0 + ms(i as u64));
                }
                let before: Vec<(TargetHandle, u8)> = marks.iter()
                    .map(|(t, _)| (h(*t), m.record(h(*t)).unwrap().priority().get()))
                    .collect();
                let dirty = m.dirty_count();

                let mut r = Recorder::default();
                let report = m.process_batch_at(max, t0 + ms(500), &mut r);
                prop_assert!(report.touched() <= max);
                prop_assert_eq!(report.touched(), max.min(dirty));
                let unique: HashSet<_> = r.seen.iter().collect();
                prop_assert_eq!(unique.len(), r.seen.len());

                let min_taken = r.seen.iter()
                    .filter_map(|t| before.iter().find(|(handle, _)| handle == t).map(|(_, p)| *p))
                    .min();
                if let Some(min_taken) = min_taken {
                    for remaining in before.iter().filter(|(t, _)| m.is_dirty(*t)) {
                        prop_assert!(remaining.1 <= min_taken);
                    }
                }
            }

            /// Merging keeps every reason and the maximum priority.
            #[test]
            fn merge_keeps_union_and_max(prios in proptest::collection::vec(1u8..=5, 1..10)) {
                let mut m = DirtyInvalidationManager::default();
                let t0 = Instant::now();
                for (i, p) in prios.iter().enumerate() {
                    m.mark_dirty_at(h(0), format!("reason-{i}"), *p, t0);
                }
                let record = m.record(h(0)).unwrap();
                prop_assert_eq!(record.priority().get(), *prios.iter().max().unwrap());
                prop_assert_eq!(record.reasons().len(), prios.len());
            }
        }
    }
}
