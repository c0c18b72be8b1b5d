#![forbid(unsafe_code)]

//! Keyed event coalescing.
//!
//! Bursty upstream events are grouped per key into a pending batch and
//! delivered to the key's handlers as one ordered slice once the key's
//! coalescing delay has elapsed.
//!
//! # State machine (per key)
//!
//! ```text
//!          enqueue                 tick (deadline reached or batch full)
//!   Idle ───────────▶ Pending ────────────────────────────────────────▶ Idle
//!                       │  ▲                                              ▲
//!                       │  └── enqueue (append, order preserved)         │
//!                       └──────────── emergency / flush / cancel ─────────┘
//! ```
//!
//! * The first enqueue for an idle key opens a batch and schedules its
//!   flush at `now + delay`, where `delay` comes from the [`DelayTuner`].
//! * A `Critical` enqueue flushes the whole batch (including the new
//!   arguments) immediately. A key may lower its emergency threshold; below
//!   `Critical` the immediate flush only happens while the tick budget is
//!   not over budget.
//! * Deadlines are hard: a tick that arrives late flushes every overdue
//!   batch, never drops one.
//! * Once a batch holds `max_batch_size` arguments it is due on the next
//!   tick even if its deadline has not arrived.
//! * Enqueues beyond the key's queue-depth cap are rejected and the
//!   arguments are handed back so the caller can deliver them directly.
//!
//! # Failure isolation
//!
//! Every handler invocation runs through a panic guard. Errors and panics
//! are logged, counted against the key, and never prevent the batch from
//! being destroyed or other handlers from running.
//!
//! # Context
//!
//! Handlers receive a `&mut C` supplied by whoever drives the coalescer.
//! The scheduler passes its dirty-invalidation manager here so batch
//! handlers can mark targets dirty.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use crate::delay_tuner::{DelayBounds, DelayOutcome, DelayTuner, TunerConfig};
use crate::error::{CallbackError, ConfigError, guarded};
use crate::handlers::{HandlerId, HandlerList};
use crate::priority::Priority;
use crate::stats::{CoalescerStats, KeyStats};
use crate::tick_budget::{LoadContext, TickBudget};

/// Configuration of one coalescable event class.
#[derive(Debug, Clone, PartialEq)]
pub struct EventKeyConfig {
    /// Unique key.
    pub key: String,
    /// Priority used for flush ordering when no higher priority is enqueued.
    pub base_priority: Priority,
    /// Configured coalescing delay; the tuner may learn a different one.
    pub delay: Duration,
    /// Batch size at which the batch becomes due (0 disables).
    pub max_batch_size: usize,
    /// Enqueue priority at or above which the batch flushes on arrival.
    pub emergency_threshold: Priority,
    /// Queue-depth cap; `None` uses the coalescer default.
    pub queue_depth_cap: Option<usize>,
    /// Clamp for the learned delay.
    pub bounds: DelayBounds,
}

impl EventKeyConfig {
    /// Create a key config using the priority's default delay.
    #[must_use]
    pub fn new(key: impl Into<String>, base_priority: Priority) -> Self {
        Self {
            key: key.into(),
            base_priority,
            delay: base_priority.default_delay(),
            max_batch_size: 64,
            emergency_threshold: Priority::Critical,
            queue_depth_cap: None,
            bounds: DelayBounds::default(),
        }
    }

    /// Set the coalescing delay.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the batch size at which a batch becomes due.
    #[must_use]
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Set the emergency threshold.
    #[must_use]
    pub fn with_emergency_threshold(mut self, threshold: Priority) -> Self {
        self.emergency_threshold = threshold;
        self
    }

    /// Set the queue-depth cap.
    #[must_use]
    pub fn with_queue_depth_cap(mut self, cap: usize) -> Self {
        self.queue_depth_cap = Some(cap);
        self
    }

    /// Set the delay clamp.
    #[must_use]
    pub fn with_bounds(mut self, bounds: DelayBounds) -> Self {
        self.bounds = bounds;
        self
    }
}

/// Coalescer-wide defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct CoalescerConfig {
    /// Priority given to keys registered implicitly by `enqueue`.
    pub default_priority: Priority,
    /// Queue-depth cap for keys that do not set one.
    pub default_queue_depth_cap: usize,
    /// Tuner gains.
    pub tuner: TunerConfig,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            default_priority: Priority::Medium,
            default_queue_depth_cap: 256,
            tuner: TunerConfig::default(),
        }
    }
}

impl CoalescerConfig {
    /// Set the default queue-depth cap.
    #[must_use]
    pub fn with_default_queue_depth_cap(mut self, cap: usize) -> Self {
        self.default_queue_depth_cap = cap;
        self
    }

    /// Set the tuner gains.
    #[must_use]
    pub fn with_tuner(mut self, tuner: TunerConfig) -> Self {
        self.tuner = tuner;
        self
    }
}

/// Why a batch was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushReason {
    /// The batch deadline passed.
    Timer,
    /// The batch reached `max_batch_size`.
    BatchFull,
    /// An emergency-priority enqueue bypassed the timer.
    Emergency,
    /// The host asked for the flush.
    Explicit,
    /// The coalescer is shutting down.
    Shutdown,
}

impl FlushReason {
    /// Stable string form for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            FlushReason::Timer => "timer",
            FlushReason::BatchFull => "batch_full",
            FlushReason::Emergency => "emergency",
            FlushReason::Explicit => "explicit",
            FlushReason::Shutdown => "shutdown",
        }
    }
}

/// A flushed batch as seen by handlers.
#[derive(Debug)]
pub struct DispatchBatch<'a, A> {
    /// Key the batch belongs to.
    pub key: &'a str,
    /// Argument snapshots in arrival order.
    pub args: &'a [A],
    /// Why the batch was flushed.
    pub reason: FlushReason,
    /// When the first argument was queued.
    pub first_queued_at: Instant,
    /// When the last argument was queued.
    pub last_queued_at: Instant,
    /// When the batch was flushed.
    pub dispatched_at: Instant,
}

impl<A> DispatchBatch<'_, A> {
    /// Number of argument snapshots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

/// Batch handler.
pub type DispatchFn<A, C> =
    Box<dyn FnMut(&DispatchBatch<'_, A>, &mut C) -> Result<(), CallbackError>>;

/// Result of flushing one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushSummary {
    /// Key that was flushed.
    pub key: String,
    /// Arguments delivered.
    pub batch_size: usize,
    /// Why the flush happened.
    pub reason: FlushReason,
    /// Handlers invoked.
    pub handlers: usize,
    /// Handler invocations that failed.
    pub failures: usize,
    /// Time from the first enqueue to the flush.
    pub coalesce_time: Duration,
}

/// Result of an enqueue.
#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueOutcome<A> {
    /// Appended to the pending batch, which now holds `depth` arguments.
    Queued {
        /// Pending batch length after the append.
        depth: usize,
    },
    /// The batch was flushed immediately.
    Flushed(FlushSummary),
    /// The queue-depth cap was reached; the arguments are returned.
    Rejected(A),
}

impl<A> EnqueueOutcome<A> {
    /// Whether the enqueue was refused.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self, EnqueueOutcome::Rejected(_))
    }
}

/// Flushes performed by one tick, in flush order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickFlushReport {
    /// One summary per flushed key.
    pub flushed: Vec<FlushSummary>,
}

impl TickFlushReport {
    /// Total arguments delivered.
    #[must_use]
    pub fn events(&self) -> usize {
        self.flushed.iter().map(|s| s.batch_size).sum()
    }

    /// Whether nothing was flushed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flushed.is_empty()
    }
}

struct PendingBatch<A> {
    args: Vec<A>,
    priority: Priority,
    first_queued_at: Instant,
    last_queued_at: Instant,
    scheduled_at: Instant,
}

struct KeyEntry<A, C> {
    config: EventKeyConfig,
    queue_cap: usize,
    auto_registered: bool,
    handlers: HandlerList<DispatchFn<A, C>>,
    pending: Option<PendingBatch<A>>,
    stats: KeyStats,
}

/// Stats bucket that collects the counters of evicted implicit keys.
pub const IMPLICIT_KEYS: &str = "<implicit>";

/// Per-key batching scheduler.
///
/// `A` is the argument snapshot type; `C` is the context handed to
/// handlers on every dispatch.
pub struct EventCoalescer<A, C = ()> {
    config: CoalescerConfig,
    keys: HashMap<String, KeyEntry<A, C>>,
    tuner: DelayTuner,
    fallback: Option<DispatchFn<A, C>>,
    /// Counters restored from a previous session or left by unregistered keys.
    historical: BTreeMap<String, KeyStats>,
}

impl<A, C> fmt::Debug for EventCoalescer<A, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventCoalescer")
            .field("config", &self.config)
            .field("keys", &self.keys.len())
            .field("pending", &self.pending_count())
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

impl<A, C> Default for EventCoalescer<A, C> {
    fn default() -> Self {
        Self::new(CoalescerConfig::default())
    }
}

impl<A, C> EventCoalescer<A, C> {
    /// Create a coalescer.
    #[must_use]
    pub fn new(config: CoalescerConfig) -> Self {
        let tuner = DelayTuner::new(config.tuner.clone());
        Self {
            config,
            keys: HashMap::new(),
            tuner,
            fallback: None,
            historical: BTreeMap::new(),
        }
    }

    /// The coalescer-wide defaults.
    #[must_use]
    pub fn config(&self) -> &CoalescerConfig {
        &self.config
    }

    /// Register a key.
    ///
    /// A key that was registered implicitly by `enqueue` may be registered
    /// explicitly once while its batch is pending; the batch and counters are
    /// kept. Once an implicit key without subscribers flushes it is removed
    /// and its counters are folded into [`IMPLICIT_KEYS`].
    pub fn register(&mut self, config: EventKeyConfig) -> Result<(), ConfigError> {
        if let Some(existing) = self.keys.get_mut(&config.key) {
            if !existing.auto_registered {
                return Err(ConfigError::DuplicateKey(config.key));
            }
            existing.queue_cap = config
                .queue_depth_cap
                .unwrap_or(self.config.default_queue_depth_cap);
            existing.auto_registered = false;
            self.tuner
                .register(&config.key, config.delay, config.bounds);
            existing.config = config;
            return Ok(());
        }

        self.tuner.register(&config.key, config.delay, config.bounds);
        let queue_cap = config
            .queue_depth_cap
            .unwrap_or(self.config.default_queue_depth_cap);
        crate::debug!(
            key = config.key.as_str(),
            priority = config.base_priority.as_str(),
            delay_us = config.delay.as_micros() as u64,
            queue_cap,
            "coalesced key registered"
        );
        self.keys.insert(
            config.key.clone(),
            KeyEntry {
                config,
                queue_cap,
                auto_registered: false,
                handlers: HandlerList::new(),
                pending: None,
                stats: KeyStats::default(),
            },
        );
        Ok(())
    }

    /// Remove a key, discarding its pending batch without dispatching.
    ///
    /// Returns the number of discarded arguments, or `None` for unknown keys.
    /// Learned delay state is kept so a later registration resumes it.
    pub fn unregister(&mut self, key: &str) -> Option<usize> {
        let mut entry = self.keys.remove(key)?;
        let discarded = entry.pending.take().map_or(0, |b| b.args.len());
        entry.stats.cancelled += discarded as u64;
        self.historical
            .entry(key.to_string())
            .or_default()
            .merge(&entry.stats);
        crate::debug!(key, discarded, "coalesced key unregistered");
        Some(discarded)
    }

    /// Whether the key is registered (explicitly or implicitly).
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    /// Configuration of a registered key.
    #[must_use]
    pub fn key_config(&self, key: &str) -> Option<&EventKeyConfig> {
        self.keys.get(key).map(|e| &e.config)
    }

    /// Registered keys, in no particular order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    /// Attach a handler to a key.
    pub fn subscribe(
        &mut self,
        key: &str,
        handler: DispatchFn<A, C>,
    ) -> Result<HandlerId, ConfigError> {
        let entry = self
            .keys
            .get_mut(key)
            .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
        Ok(entry.handlers.add(handler))
    }

    /// Detach a handler. Returns whether it was attached.
    pub fn unsubscribe(&mut self, key: &str, id: HandlerId) -> bool {
        self.keys
            .get_mut(key)
            .and_then(|e| e.handlers.remove(id))
            .is_some()
    }

    /// Handler for batches of keys that have no handlers of their own.
    pub fn set_fallback_handler(&mut self, handler: DispatchFn<A, C>) {
        self.fallback = Some(handler);
    }

    /// Remove the fallback handler.
    pub fn clear_fallback_handler(&mut self) {
        self.fallback = None;
    }

    /// Enqueue using the current time.
    pub fn enqueue(
        &mut self,
        key: &str,
        priority: Priority,
        args: A,
        budget: &TickBudget,
        ctx: &mut C,
    ) -> EnqueueOutcome<A> {
        self.enqueue_at(key, priority, args, Instant::now(), budget, ctx)
    }

    /// Enqueue one argument snapshot for `key` at time `now`.
    ///
    /// Unknown keys are registered implicitly with the default priority.
    /// Critical arrivals are never rejected; they flush the batch at once.
    pub fn enqueue_at(
        &mut self,
        key: &str,
        priority: Priority,
        args: A,
        now: Instant,
        budget: &TickBudget,
        ctx: &mut C,
    ) -> EnqueueOutcome<A> {
        if !self.keys.contains_key(key) {
            self.register_implicit(key);
        }
        let Some(entry) = self.keys.get_mut(key) else {
            return EnqueueOutcome::Rejected(args);
        };

        let emergency = priority == Priority::Critical
            || (priority >= entry.config.emergency_threshold && !budget.is_over_budget());
        let depth = entry.pending.as_ref().map_or(0, |b| b.args.len());
        if !emergency && depth >= entry.queue_cap {
            entry.stats.rejected += 1;
            crate::trace!(key, depth, "enqueue rejected by queue cap");
            return EnqueueOutcome::Rejected(args);
        }

        if entry.pending.is_none() {
            let delay = self.tuner.get_delay(key, entry.config.delay);
            entry.pending = Some(PendingBatch {
                args: Vec::new(),
                priority: entry.config.base_priority.max(priority),
                first_queued_at: now,
                last_queued_at: now,
                scheduled_at: now.checked_add(delay).unwrap_or(now),
            });
        }
        let Some(batch) = entry.pending.as_mut() else {
            return EnqueueOutcome::Rejected(args);
        };
        batch.args.push(args);
        batch.last_queued_at = now;
        batch.priority = batch.priority.max(priority);
        let depth = batch.args.len();
        entry.stats.coalesced += 1;

        if emergency {
            let load = budget.load_context();
            if let Some(summary) = self.flush_key(key, FlushReason::Emergency, now, load, ctx) {
                return EnqueueOutcome::Flushed(summary);
            }
        }
        crate::trace!(key, depth, "event coalesced");
        EnqueueOutcome::Queued { depth }
    }

    /// Flush every batch that is due, using the current time.
    pub fn tick(&mut self, budget: &TickBudget, ctx: &mut C) -> TickFlushReport {
        self.tick_at(Instant::now(), budget, ctx)
    }

    /// Flush every batch whose deadline is at or before `now`, or which has
    /// reached its key's `max_batch_size`.
    ///
    /// Batches flush highest priority first, then earliest deadline, then by
    /// key.
    pub fn tick_at(&mut self, now: Instant, budget: &TickBudget, ctx: &mut C) -> TickFlushReport {
        let mut due: Vec<(Priority, Instant, String, FlushReason)> = self
            .keys
            .iter()
            .filter_map(|(key, entry)| {
                let batch = entry.pending.as_ref()?;
                let full =
                    entry.config.max_batch_size > 0 && batch.args.len() >= entry.config.max_batch_size;
                let reason = if batch.scheduled_at <= now {
                    FlushReason::Timer
                } else if full {
                    FlushReason::BatchFull
                } else {
                    return None;
                };
                Some((batch.priority, batch.scheduled_at, key.clone(), reason))
            })
            .collect();
        due.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.2.cmp(&b.2))
        });

        let load = budget.load_context();
        let mut report = TickFlushReport::default();
        for (_, _, key, reason) in due {
            if let Some(summary) = self.flush_key(&key, reason, now, load, ctx) {
                report.flushed.push(summary);
            }
        }
        for entry in self.keys.values_mut() {
            entry.handlers.maybe_compact();
        }
        report
    }

    /// Flush one key immediately.
    pub fn flush_at(
        &mut self,
        key: &str,
        now: Instant,
        budget: &TickBudget,
        ctx: &mut C,
    ) -> Option<FlushSummary> {
        self.flush_key(key, FlushReason::Explicit, now, budget.load_context(), ctx)
    }

    /// Flush every pending batch, regardless of deadlines.
    pub fn flush_all_at(&mut self, now: Instant, budget: &TickBudget, ctx: &mut C) -> TickFlushReport {
        self.flush_every(FlushReason::Explicit, now, budget.load_context(), ctx)
    }

    /// Flush every pending batch for shutdown. The tuner is not updated.
    pub fn shutdown_at(&mut self, now: Instant, ctx: &mut C) -> TickFlushReport {
        self.flush_every(FlushReason::Shutdown, now, LoadContext::Idle, ctx)
    }

    /// Discard a key's pending batch without dispatching.
    pub fn cancel_pending(&mut self, key: &str) -> usize {
        let Some(entry) = self.keys.get_mut(key) else {
            return 0;
        };
        let discarded = entry.pending.take().map_or(0, |b| b.args.len());
        entry.stats.cancelled += discarded as u64;
        if discarded > 0 {
            crate::debug!(key, discarded, "pending batch cancelled");
        }
        discarded
    }

    /// Discard every pending batch.
    pub fn clear(&mut self) -> usize {
        let keys: Vec<String> = self.keys.keys().cloned().collect();
        keys.iter().map(|k| self.cancel_pending(k)).sum()
    }

    /// Whether any batch is pending.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.keys.values().any(|e| e.pending.is_some())
    }

    /// Number of keys with a pending batch.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.keys.values().filter(|e| e.pending.is_some()).count()
    }

    /// Length of a key's pending batch.
    #[must_use]
    pub fn pending_len(&self, key: &str) -> usize {
        self.keys
            .get(key)
            .and_then(|e| e.pending.as_ref())
            .map_or(0, |b| b.args.len())
    }

    /// Earliest pending deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.keys
            .values()
            .filter_map(|e| e.pending.as_ref().map(|b| b.scheduled_at))
            .min()
    }

    /// Time from `now` until the earliest deadline (zero when overdue).
    #[must_use]
    pub fn time_until_flush(&self, now: Instant) -> Option<Duration> {
        self.next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// The delay tuner.
    #[must_use]
    pub fn tuner(&self) -> &DelayTuner {
        &self.tuner
    }

    /// Mutable access to the delay tuner, for restore and reset.
    pub fn tuner_mut(&mut self) -> &mut DelayTuner {
        &mut self.tuner
    }

    /// Cumulative counters, including historical ones.
    #[must_use]
    pub fn stats(&self) -> CoalescerStats {
        let mut per_key = self.historical.clone();
        for (key, entry) in &self.keys {
            per_key.entry(key.clone()).or_default().merge(&entry.stats);
        }
        CoalescerStats::from_keys(per_key)
    }

    /// Cumulative counters for one key, including historical ones.
    #[must_use]
    pub fn key_stats(&self, key: &str) -> Option<KeyStats> {
        let live = self.keys.get(key).map(|e| &e.stats);
        let past = self.historical.get(key);
        match (live, past) {
            (None, None) => None,
            (live, past) => {
                let mut stats = past.cloned().unwrap_or_default();
                if let Some(live) = live {
                    stats.merge(live);
                }
                Some(stats)
            }
        }
    }

    /// Fold counters from a previous session into the historical totals.
    pub fn restore_stats(&mut self, stats: &CoalescerStats) {
        for (key, ks) in &stats.per_key {
            self.historical.entry(key.clone()).or_default().merge(ks);
        }
    }

    fn register_implicit(&mut self, key: &str) {
        let config = EventKeyConfig::new(key, self.config.default_priority);
        self.tuner.register(key, config.delay, config.bounds);
        crate::debug!(key, "coalesced key registered implicitly");
        self.keys.insert(
            key.to_string(),
            KeyEntry {
                config,
                queue_cap: self.config.default_queue_depth_cap,
                auto_registered: true,
                handlers: HandlerList::new(),
                pending: None,
                stats: KeyStats::default(),
            },
        );
    }

    fn flush_every(
        &mut self,
        reason: FlushReason,
        now: Instant,
        load: LoadContext,
        ctx: &mut C,
    ) -> TickFlushReport {
        let mut keys: Vec<(Priority, String)> = self
            .keys
            .iter()
            .filter_map(|(k, e)| e.pending.as_ref().map(|b| (b.priority, k.clone())))
            .collect();
        keys.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        let mut report = TickFlushReport::default();
        for (_, key) in keys {
            if let Some(summary) = self.flush_key(&key, reason, now, load, ctx) {
                report.flushed.push(summary);
            }
        }
        report
    }

    fn flush_key(
        &mut self,
        key: &str,
        reason: FlushReason,
        now: Instant,
        load: LoadContext,
        ctx: &mut C,
    ) -> Option<FlushSummary> {
        let Self {
            keys,
            tuner,
            fallback,
            historical,
            ..
        } = self;
        let entry = keys.get_mut(key)?;
        let pending = entry.pending.take()?;
        let batch = DispatchBatch {
            key,
            args: &pending.args,
            reason,
            first_queued_at: pending.first_queued_at,
            last_queued_at: pending.last_queued_at,
            dispatched_at: now,
        };

        let mut handlers = 0usize;
        let mut failures = 0usize;
        if entry.handlers.is_empty() {
            match fallback.as_mut() {
                Some(handler) => {
                    handlers = 1;
                    if let Err(error) = guarded(|| handler(&batch, ctx)) {
                        failures += 1;
                        crate::warn!(key, error = %error, "fallback handler failed");
                    }
                }
                None => {
                    entry.stats.unhandled += 1;
                    crate::debug!(key, batch_size = batch.len(), "batch dropped, no handler");
                }
            }
        } else {
            entry.handlers.for_each_mut(|id, handler| {
                handlers += 1;
                if let Err(error) = guarded(|| handler(&batch, ctx)) {
                    failures += 1;
                    crate::warn!(key, handler = id.get(), error = %error, "dispatch handler failed");
                }
            });
        }

        let batch_size = pending.args.len();
        let stats = &mut entry.stats;
        stats.dispatched_batches += 1;
        stats.dispatched_events += batch_size as u64;
        stats.callback_failures += failures as u64;
        stats.histogram.record(batch_size);
        if reason == FlushReason::Emergency {
            stats.emergency_flushes += 1;
        }

        if reason != FlushReason::Shutdown {
            tuner.observe(
                key,
                DelayOutcome {
                    batch_size,
                    max_batch_size: entry.config.max_batch_size,
                    emergency: reason == FlushReason::Emergency,
                    context: load,
                },
            );
        }

        crate::debug!(
            key,
            batch_size,
            reason = reason.as_str(),
            failures,
            "batch flushed"
        );

        // Idle implicit keys are dropped so arbitrary keys cannot grow the map.
        if entry.auto_registered && entry.handlers.is_empty() {
            if let Some(evicted) = keys.remove(key) {
                historical
                    .entry(IMPLICIT_KEYS.to_string())
                    .or_default()
                    .merge(&evicted.stats);
                tuner.forget(key);
                crate::trace!(key, "idle implicit key evicted");
            }
        }

        Some(FlushSummary {
            key: key.to_string(),
            batch_size,
            reason,
            handlers,
            failures,
            coalesce_time: now.saturating_duration_since(pending.first_queued_at),
        })
    }
}
