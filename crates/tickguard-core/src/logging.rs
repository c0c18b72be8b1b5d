#![forbid(unsafe_code)]

//! Logging facade for the scheduling primitives.
//!
//! With the `tracing` feature (on by default) this re-exports the `tracing`
//! macros used inside the crate. Without it, same-named macros expand to
//! nothing so call sites never need their own `cfg` guards.
//!
//! Field conventions used across the crate:
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `key` | Coalesced event key |
//! | `target` | Dirty target handle (`Debug` form) |
//! | `batch_size` | Number of argument snapshots in a flushed batch |
//! | `reason` | Flush reason or dirty reason |
//! | `error` | Callback or configuration error (`Display` form) |

#[cfg(feature = "tracing")]
pub use tracing::{debug, debug_span, info, trace, warn};

#[cfg(not(feature = "tracing"))]
mod noop_macros {
    /// No-op debug macro when tracing is disabled.
    #[macro_export]
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }

    /// No-op debug_span macro when tracing is disabled.
    #[macro_export]
    macro_rules! debug_span {
        ($($arg:tt)*) => {
            $crate::logging::NoopSpan
        };
    }

    /// No-op info macro when tracing is disabled.
    #[macro_export]
    macro_rules! info {
        ($($arg:tt)*) => {};
    }

    /// No-op trace macro when tracing is disabled.
    #[macro_export]
    macro_rules! trace {
        ($($arg:tt)*) => {};
    }

    /// No-op warn macro when tracing is disabled.
    #[macro_export]
    macro_rules! warn {
        ($($arg:tt)*) => {};
    }
}

/// Span stand-in used when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[derive(Debug)]
pub struct NoopSpan;

#[cfg(not(feature = "tracing"))]
impl NoopSpan {
    /// Enter the span (does nothing).
    pub fn entered(self) -> NoopGuard {
        NoopGuard
    }
}

/// Guard returned by [`NoopSpan::entered`].
#[cfg(not(feature = "tracing"))]
#[derive(Debug)]
pub struct NoopGuard;
