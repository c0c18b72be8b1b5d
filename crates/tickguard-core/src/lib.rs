#![forbid(unsafe_code)]

//! Core: tick budget, keyed event coalescing, adaptive delay tuning, and
//! dirty-target invalidation for latency-sensitive update loops.
//!
//! Everything here is single-threaded and driven by explicit time values
//! (`*_at(now)` methods) so hosts and tests control the clock. The
//! `tickguard-runtime` crate wires these pieces into one scheduler.

pub mod arena;
pub mod delay_tuner;
pub mod dirty;
pub mod error;
pub mod event_coalescer;
pub mod handlers;
pub mod histogram;
pub mod logging;
pub mod priority;
pub mod stats;
pub mod tick_budget;

// Re-export tracing macros at crate root for ergonomic use.
#[cfg(feature = "tracing")]
pub use logging::{debug, debug_span, info, trace, warn};

pub use arena::{TargetArena, TargetHandle};
pub use delay_tuner::{
    AdaptiveDelayState, DelayBounds, DelayOutcome, DelayTuner, PersistedDelay, RestoreReport,
    TUNER_SCHEMA_VERSION, TunerConfig, TunerSnapshot,
};
pub use dirty::{
    ArenaReconciler, DeferredMarks, DirtyConfig, DirtyInvalidationManager, DirtyRecord,
    DirtyStats, ProcessReport, Reconciler,
};
pub use error::{CallbackError, ConfigError, guarded};
pub use event_coalescer::{
    CoalescerConfig, DispatchBatch, DispatchFn, EnqueueOutcome, EventCoalescer, EventKeyConfig,
    FlushReason, FlushSummary, IMPLICIT_KEYS, TickFlushReport,
};
pub use handlers::{HandlerId, HandlerList};
pub use priority::{DirtyPriority, Priority};
pub use stats::{BatchSizeHistogram, CoalescerStats, KeyStats};
pub use tick_budget::{
    BudgetPercentile, LoadContext, TickBudget, TickBudgetConfig, TickPercentiles, TickTimer,
};
