#![forbid(unsafe_code)]

//! Tickguard Runtime
//!
//! Wires the `tickguard-core` primitives into one host-driven scheduler.
//!
//! # Key Components
//!
//! - [`TickScheduler`] - Owns the budget, coalescer, dirty manager, and source registry
//! - [`SchedulerConfig`] - Component configs plus `TICKGUARD_*` environment overrides
//! - [`SourceRegistry`] - Raw upstream event ids bound to coalesced keys
//! - [`StateStore`] - Versioned persistence of learned delays and counters
//! - [`DiagnosticsSnapshot`] - Read-only view for dashboards
//!
//! # Usage
//!
//! ```ignore
//! let mut scheduler = TickScheduler::new(SchedulerConfig::from_env())?;
//! scheduler.register_coalesced_source("UNIT_HEALTH", "health", Priority::High, Duration::from_millis(50))?;
//! scheduler.on_batch("health", Box::new(|batch, dirty| {
//!     dirty.mark_dirty(health_bar, "health", Priority::High);
//!     Ok(())
//! }))?;
//!
//! // Host loop
//! scheduler.dispatch("UNIT_HEALTH", snapshot);
//! scheduler.tick(&mut reconciler);
//! ```

pub mod config;
pub mod diagnostics;
pub mod registry;
pub mod scheduler;
pub mod state_persistence;

pub use config::SchedulerConfig;
pub use diagnostics::{DelaySnapshot, DiagnosticsSnapshot};
pub use registry::{SourceBinding, SourceRegistry};
pub use scheduler::{
    BatchFn, DirectFn, DirectReason, DispatchRoute, RouteStats, TickReport, TickScheduler,
};
#[cfg(feature = "state-persistence")]
pub use state_persistence::FileStorage;
pub use state_persistence::{
    LoadOutcome, MemoryStorage, PersistedState, STATE_KEY, STATE_SCHEMA_VERSION, StateStore,
    StorageBackend, StorageError, StorageResult, StoredEntry,
};

pub use tickguard_core;
