#![forbid(unsafe_code)]

//! The host-driven tick scheduler.
//!
//! [`TickScheduler`] owns one [`TickBudget`], one [`EventCoalescer`], one
//! [`DirtyInvalidationManager`] and the raw-id [`SourceRegistry`]. The host
//! feeds events through [`dispatch`](TickScheduler::dispatch), marks targets
//! with [`mark_dirty`](TickScheduler::mark_dirty), and calls
//! [`tick`](TickScheduler::tick) once per frame.
//!
//! # Tick Order
//!
//! ```text
//! tick_at(now)
//!   ├─ coalescer.tick_at      flush due batches (handlers may mark dirty)
//!   ├─ dirty.process_*_at     reconcile a budget-sized batch
//!   └─ budget.record_tick     feed measured cost back into the budget
//! ```
//!
//! Batch handlers receive the dirty manager as their context, so a flush
//! can invalidate targets that the same tick then reconciles.
//!
//! # Ingress Routing
//!
//! | Situation | Route |
//! |-----------|-------|
//! | Bound raw id, coalescing on | Coalesced (or flushed at once for emergencies) |
//! | Coalescing disabled | Direct handler |
//! | Unbound raw id | Direct handler, raw id used as key |
//! | Queue-depth cap reached | Direct handler |
//! | Direct route without a direct handler | Dropped and counted |

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tickguard_core::{
    CallbackError, CoalescerStats, ConfigError, DirtyInvalidationManager, DirtyPriority,
    DirtyStats, DispatchFn, EnqueueOutcome, EventCoalescer, EventKeyConfig, FlushSummary,
    HandlerId, Priority, ProcessReport, Reconciler, RestoreReport, TargetHandle, TickBudget,
    TickFlushReport, TickPercentiles, guarded,
};

use crate::config::SchedulerConfig;
use crate::diagnostics::{DelaySnapshot, DiagnosticsSnapshot};
use crate::registry::{SourceBinding, SourceRegistry};
use crate::state_persistence::{LoadOutcome, PersistedState, StateStore, StorageResult};

/// Batch handler attached to a coalesced key.
pub type BatchFn<A> = DispatchFn<A, DirtyInvalidationManager>;

/// Handler for events that bypass coalescing. Receives the key and the
/// single argument snapshot.
pub type DirectFn<A> =
    Box<dyn FnMut(&str, A, &mut DirtyInvalidationManager) -> Result<(), CallbackError>>;

/// Why an event bypassed the coalescer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectReason {
    /// Coalescing is switched off.
    CoalescingDisabled,
    /// The raw id is not bound to a key.
    Unregistered,
    /// The key's queue-depth cap was reached.
    Backpressure,
}

impl DirectReason {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CoalescingDisabled => "coalescing_disabled",
            Self::Unregistered => "unregistered",
            Self::Backpressure => "backpressure",
        }
    }
}

/// Where [`TickScheduler::dispatch`] sent an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchRoute {
    /// Appended to the key's pending batch.
    Coalesced {
        /// Pending batch length after the append.
        depth: usize,
    },
    /// Appended and flushed at once.
    Flushed {
        /// Arguments delivered by the flush.
        batch_size: usize,
    },
    /// Delivered to the direct handler.
    Direct(DirectReason),
    /// Needed the direct handler but none is set.
    Dropped(DirectReason),
}

/// Ingress routing counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteStats {
    /// Events accepted by the coalescer.
    pub coalesced: u64,
    /// Accepted events that triggered an immediate flush.
    pub emergency: u64,
    /// Events delivered to the direct handler.
    pub direct: u64,
    /// Direct deliveries that failed.
    pub direct_failures: u64,
    /// Events dropped for lack of a direct handler.
    pub dropped: u64,
}

/// Work done by one tick.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// Batches flushed.
    pub flushed: TickFlushReport,
    /// Dirty processing result.
    pub dirty: ProcessReport,
    /// Measured wall-clock cost of the tick.
    pub elapsed: Duration,
}

/// Single-threaded scheduler combining coalescing and dirty reconciliation.
///
/// Handlers are not required to be `Send`, so they may capture `Rc` state.
/// The scheduler is then `!Send` and stays on the thread that built it.
pub struct TickScheduler<A> {
    config: SchedulerConfig,
    budget: TickBudget,
    coalescer: EventCoalescer<A, DirtyInvalidationManager>,
    dirty: DirtyInvalidationManager,
    registry: SourceRegistry,
    direct: Option<DirectFn<A>>,
    routes: RouteStats,
    ticks: u64,
}

impl<A> fmt::Debug for TickScheduler<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickScheduler")
            .field("ticks", &self.ticks)
            .field("coalescer", &self.coalescer)
            .field("dirty_count", &self.dirty.dirty_count())
            .field("sources", &self.registry.len())
            .field("has_direct", &self.direct.is_some())
            .finish()
    }
}

impl<A> TickScheduler<A> {
    /// Create a scheduler. Fails if the configuration does not validate.
    pub fn new(config: SchedulerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            budget: TickBudget::new(config.budget.clone()),
            coalescer: EventCoalescer::new(config.coalescer.clone()),
            dirty: DirtyInvalidationManager::new(config.dirty.clone()),
            registry: SourceRegistry::new(),
            direct: None,
            routes: RouteStats::default(),
            ticks: 0,
            config,
        })
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // ── Registration ────────────────────────────────────────────────────

    /// Bind `raw_event_id` to `key`.
    ///
    /// The key is registered with `default_priority` and `default_delay`
    /// unless it already exists, in which case the source joins it. A raw id
    /// that is already bound is rejected.
    pub fn register_coalesced_source(
        &mut self,
        raw_event_id: impl Into<String>,
        key: impl Into<String>,
        default_priority: Priority,
        default_delay: Duration,
    ) -> Result<(), ConfigError> {
        let raw_event_id = raw_event_id.into();
        let key = key.into();
        self.registry.register(SourceBinding {
            raw_event_id: raw_event_id.clone(),
            key: key.clone(),
            priority: default_priority,
            delay: default_delay,
        })?;

        let key_config = EventKeyConfig::new(key, default_priority).with_delay(default_delay);
        match self.coalescer.register(key_config) {
            Ok(()) | Err(ConfigError::DuplicateKey(_)) => Ok(()),
            Err(error) => {
                self.registry.unregister(&raw_event_id);
                Err(error)
            }
        }
    }

    /// Register a key with full control over its configuration.
    pub fn register_key(&mut self, config: EventKeyConfig) -> Result<(), ConfigError> {
        self.coalescer.register(config)
    }

    /// Attach a batch handler to `key`.
    pub fn on_batch(&mut self, key: &str, handler: BatchFn<A>) -> Result<HandlerId, ConfigError> {
        self.coalescer.subscribe(key, handler)
    }

    /// Detach a batch handler.
    pub fn remove_batch_handler(&mut self, key: &str, id: HandlerId) -> bool {
        self.coalescer.unsubscribe(key, id)
    }

    /// Handler for batches of keys without handlers of their own.
    pub fn set_fallback_handler(&mut self, handler: BatchFn<A>) {
        self.coalescer.set_fallback_handler(handler);
    }

    /// Handler for events that bypass the coalescer.
    pub fn set_direct_handler(&mut self, handler: DirectFn<A>) {
        self.direct = Some(handler);
    }

    /// Remove a key and every raw id bound to it, discarding its pending
    /// batch. Returns the number of discarded arguments.
    pub fn unregister_key(&mut self, key: &str) -> Option<usize> {
        let sources = self.registry.unregister_key(key);
        let discarded = self.coalescer.unregister(key);
        if discarded.is_some() || sources > 0 {
            tracing::debug!(key, sources, "key unregistered");
        }
        discarded
    }

    /// Unbind one raw id. The key itself stays registered.
    pub fn unregister_source(&mut self, raw_event_id: &str) -> Option<SourceBinding> {
        self.registry.unregister(raw_event_id)
    }

    // ── Ingress ─────────────────────────────────────────────────────────

    /// Route one event using the current time.
    pub fn dispatch(&mut self, raw_event_id: &str, args: A) -> DispatchRoute {
        self.dispatch_at(raw_event_id, args, Instant::now())
    }

    /// Route one event arriving at `now`.
    pub fn dispatch_at(&mut self, raw_event_id: &str, args: A, now: Instant) -> DispatchRoute {
        let Self {
            config,
            budget,
            coalescer,
            dirty,
            registry,
            direct,
            routes,
            ..
        } = self;

        let Some(binding) = registry.resolve(raw_event_id) else {
            return Self::deliver_direct(
                direct,
                routes,
                dirty,
                raw_event_id,
                args,
                DirectReason::Unregistered,
            );
        };
        if !config.coalescing_enabled {
            return Self::deliver_direct(
                direct,
                routes,
                dirty,
                &binding.key,
                args,
                DirectReason::CoalescingDisabled,
            );
        }

        match coalescer.enqueue_at(&binding.key, binding.priority, args, now, budget, dirty) {
            EnqueueOutcome::Queued { depth } => {
                routes.coalesced += 1;
                DispatchRoute::Coalesced { depth }
            }
            EnqueueOutcome::Flushed(summary) => {
                routes.coalesced += 1;
                routes.emergency += 1;
                DispatchRoute::Flushed {
                    batch_size: summary.batch_size,
                }
            }
            EnqueueOutcome::Rejected(args) => Self::deliver_direct(
                direct,
                routes,
                dirty,
                &binding.key,
                args,
                DirectReason::Backpressure,
            ),
        }
    }

    fn deliver_direct(
        direct: &mut Option<DirectFn<A>>,
        routes: &mut RouteStats,
        dirty: &mut DirtyInvalidationManager,
        key: &str,
        args: A,
        reason: DirectReason,
    ) -> DispatchRoute {
        let Some(handler) = direct.as_mut() else {
            routes.dropped += 1;
            tracing::warn!(key, reason = reason.as_str(), "event dropped, no direct handler");
            return DispatchRoute::Dropped(reason);
        };
        routes.direct += 1;
        tracing::trace!(key, reason = reason.as_str(), "direct delivery");
        if let Err(error) = guarded(|| handler(key, args, dirty)) {
            routes.direct_failures += 1;
            tracing::warn!(key, error = %error, "direct handler failed");
        }
        DispatchRoute::Direct(reason)
    }

    /// Mark a target dirty now.
    pub fn mark_dirty(
        &mut self,
        target: TargetHandle,
        reason: impl Into<String>,
        priority: impl Into<DirtyPriority>,
    ) -> bool {
        self.dirty.mark_dirty(target, reason, priority)
    }

    /// Mark a target dirty at `now`.
    pub fn mark_dirty_at(
        &mut self,
        target: TargetHandle,
        reason: impl Into<String>,
        priority: impl Into<DirtyPriority>,
        now: Instant,
    ) -> bool {
        self.dirty.mark_dirty_at(target, reason, priority, now)
    }

    /// Discard a key's pending batch without dispatching.
    pub fn cancel_pending(&mut self, key: &str) -> usize {
        self.coalescer.cancel_pending(key)
    }

    /// Flush one key immediately.
    pub fn flush_key_at(&mut self, key: &str, now: Instant) -> Option<FlushSummary> {
        self.coalescer
            .flush_at(key, now, &self.budget, &mut self.dirty)
    }

    // ── Ticking ─────────────────────────────────────────────────────────

    /// Run one tick using the current time.
    pub fn tick<R: Reconciler + ?Sized>(&mut self, reconciler: &mut R) -> TickReport {
        self.tick_at(Instant::now(), reconciler)
    }

    /// Run one tick at `now`.
    ///
    /// Deadlines are judged against `now`; the recorded tick cost is the
    /// measured wall-clock time of the call.
    pub fn tick_at<R: Reconciler + ?Sized>(
        &mut self,
        now: Instant,
        reconciler: &mut R,
    ) -> TickReport {
        self.ticks += 1;
        let span = tracing::debug_span!("scheduler_tick", tick = self.ticks);
        let _guard = span.enter();
        let started = Instant::now();

        let flushed = self.coalescer.tick_at(now, &self.budget, &mut self.dirty);
        let dirty = if self.config.adaptive_batching {
            self.dirty
                .process_adaptive_at(now, &self.budget, reconciler)
        } else {
            self.dirty
                .process_batch_at(self.config.fixed_batch_size, now, reconciler)
        };

        let elapsed = started.elapsed();
        self.budget.record_tick(elapsed);
        tracing::debug!(
            batches = flushed.flushed.len(),
            events = flushed.events(),
            processed = dirty.processed,
            remaining = dirty.remaining,
            elapsed_us = elapsed.as_micros() as u64,
            "tick complete"
        );
        TickReport {
            flushed,
            dirty,
            elapsed,
        }
    }

    /// Flush everything and drain the dirty set, using the current time.
    pub fn shutdown<R: Reconciler + ?Sized>(&mut self, reconciler: &mut R) -> TickReport {
        self.shutdown_at(Instant::now(), reconciler)
    }

    /// Flush every pending batch and drain the dirty set at `now`.
    /// Shutdown flushes do not train the delay tuner.
    pub fn shutdown_at<R: Reconciler + ?Sized>(
        &mut self,
        now: Instant,
        reconciler: &mut R,
    ) -> TickReport {
        let started = Instant::now();
        let flushed = self.coalescer.shutdown_at(now, &mut self.dirty);
        let dirty = self.dirty.process_all_at(now, reconciler);
        let elapsed = started.elapsed();
        tracing::debug!(
            batches = flushed.flushed.len(),
            processed = dirty.processed,
            remaining = dirty.remaining,
            "scheduler shut down"
        );
        TickReport {
            flushed,
            dirty,
            elapsed,
        }
    }

    // ── Diagnostics ─────────────────────────────────────────────────────

    /// Cumulative coalescer counters.
    #[must_use]
    pub fn stats(&self) -> CoalescerStats {
        self.coalescer.stats()
    }

    /// Outstanding dirty records.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.dirty.dirty_count()
    }

    /// Dirty manager counters.
    #[must_use]
    pub fn dirty_stats(&self) -> &DirtyStats {
        self.dirty.stats()
    }

    /// Rolling tick percentiles.
    #[must_use]
    pub fn tick_percentiles(&self) -> Option<TickPercentiles> {
        self.budget.percentiles()
    }

    /// Ingress routing counters.
    #[must_use]
    pub fn route_stats(&self) -> &RouteStats {
        &self.routes
    }

    /// Ticks run so far.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// The tick budget.
    #[must_use]
    pub fn budget(&self) -> &TickBudget {
        &self.budget
    }

    /// Mutable tick budget, for hosts that record tick cost themselves.
    pub fn budget_mut(&mut self) -> &mut TickBudget {
        &mut self.budget
    }

    /// The coalescer.
    #[must_use]
    pub fn coalescer(&self) -> &EventCoalescer<A, DirtyInvalidationManager> {
        &self.coalescer
    }

    /// The dirty manager.
    #[must_use]
    pub fn dirty(&self) -> &DirtyInvalidationManager {
        &self.dirty
    }

    /// The source registry.
    #[must_use]
    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Earliest pending batch deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.coalescer.next_deadline()
    }

    /// How long the host may sleep before the next batch is due.
    #[must_use]
    pub fn time_until_next_flush(&self, now: Instant) -> Option<Duration> {
        self.coalescer.time_until_flush(now)
    }

    /// Snapshot of every counter and learned delay.
    #[must_use]
    pub fn diagnostics(&self, now: Instant) -> DiagnosticsSnapshot {
        let delays = self
            .coalescer
            .tuner()
            .states()
            .map(|(key, state)| {
                (
                    key.to_string(),
                    DelaySnapshot {
                        delay_us: state.delay.as_micros() as u64,
                        sample_count: state.sample_count,
                        context: state.context,
                        min_us: state.bounds.min().as_micros() as u64,
                        max_us: state.bounds.max().as_micros() as u64,
                    },
                )
            })
            .collect();
        DiagnosticsSnapshot {
            ticks: self.ticks,
            tick: self.budget.percentiles(),
            over_budget: self.budget.is_over_budget(),
            spare_capacity: self.budget.spare_capacity_ratio(),
            load_context: self.budget.load_context(),
            pending_batches: self.coalescer.pending_count(),
            dirty_count: self.dirty.dirty_count(),
            dirty_by_priority: self.dirty.counts_by_priority(now).to_vec(),
            coalescer: self.coalescer.stats(),
            dirty: self.dirty.stats().clone(),
            routes: self.routes.clone(),
            delays,
        }
    }

    // ── Persistence ─────────────────────────────────────────────────────

    /// Learned delays and cumulative counters.
    #[must_use]
    pub fn persisted_state(&self) -> PersistedState {
        PersistedState {
            tuner: self.coalescer.tuner().snapshot(),
            stats: self.coalescer.stats(),
        }
    }

    /// Apply state from a previous session. Counters are added to the
    /// historical totals, so call this once at startup.
    pub fn restore_state(&mut self, state: &PersistedState) -> RestoreReport {
        let report = self.coalescer.tuner_mut().restore(&state.tuner);
        self.coalescer.restore_stats(&state.stats);
        report
    }

    /// Save [`persisted_state`](Self::persisted_state) to `store`.
    pub fn save_state(&self, store: &StateStore) -> StorageResult<()> {
        store.save(&self.persisted_state())
    }

    /// Load and apply state from `store`. Anything but
    /// [`LoadOutcome::Restored`] leaves the defaults in place.
    pub fn load_state(&mut self, store: &StateStore) -> StorageResult<LoadOutcome> {
        let outcome = store.load()?;
        if let LoadOutcome::Restored(state) = &outcome {
            let report = self.restore_state(state);
            tracing::debug!(
                applied = report.applied,
                parked = report.parked,
                discarded = report.discarded,
                "scheduler state restored"
            );
        }
        Ok(outcome)
    }
}
