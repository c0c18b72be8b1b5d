#![forbid(unsafe_code)]

//! Error types shared by the scheduling primitives.
//!
//! Only [`ConfigError`] is ever returned synchronously to callers. Steady
//! state failures (callback errors, stale targets, rejected events) are
//! recorded in statistics and logged, never propagated out of a tick.

use std::any::Any;
use std::fmt;
use std::time::Duration;

/// Configuration errors raised by registration calls.
///
/// These are fatal to the call that produced them, never to the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A coalesced key with this name is already registered.
    DuplicateKey(String),
    /// A raw upstream event id is already bound to a key.
    DuplicateSource {
        /// The raw event id that was registered twice.
        raw_event_id: String,
        /// The key the id is already bound to.
        existing_key: String,
    },
    /// The key has not been registered.
    UnknownKey(String),
    /// Delay bounds with `min > max`.
    InvalidBounds {
        /// Lower bound that was requested.
        min: Duration,
        /// Upper bound that was requested.
        max: Duration,
    },
    /// Any other rejected configuration value.
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::DuplicateKey(key) => {
                write!(f, "coalesced key {key:?} is already registered")
            }
            ConfigError::DuplicateSource {
                raw_event_id,
                existing_key,
            } => write!(
                f,
                "event source {raw_event_id:?} is already bound to key {existing_key:?}"
            ),
            ConfigError::UnknownKey(key) => write!(f, "coalesced key {key:?} is not registered"),
            ConfigError::InvalidBounds { min, max } => write!(
                f,
                "invalid delay bounds: min {}us exceeds max {}us",
                min.as_micros(),
                max.as_micros()
            ),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Error reported by a dispatch or reconciliation callback.
///
/// Callbacks return this to signal failure; panics inside callbacks are
/// converted into it as well. Either way the failure is attributed to the
/// key or target being processed and the pass continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackError {
    message: String,
    panicked: bool,
}

impl CallbackError {
    /// Create an error with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            panicked: false,
        }
    }

    /// Build an error from a caught panic payload.
    #[must_use]
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "callback panicked".to_string()
        };
        Self {
            message,
            panicked: true,
        }
    }

    /// The failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the failure was a caught panic.
    #[must_use]
    pub fn is_panic(&self) -> bool {
        self.panicked
    }
}

impl fmt::Display for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.panicked {
            write!(f, "callback panicked: {}", self.message)
        } else {
            f.write_str(&self.message)
        }
    }
}

impl std::error::Error for CallbackError {}

impl From<&str> for CallbackError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for CallbackError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// Run a callback, converting a panic into a [`CallbackError`].
pub fn guarded<F>(f: F) -> Result<(), CallbackError>
where
    F: FnOnce() -> Result<(), CallbackError>,
{
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(CallbackError::from_panic(payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_source_message_names_both_sides() {
        let err = ConfigError::DuplicateSource {
            raw_event_id: "UNIT_HEALTH".into(),
            existing_key: "health".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("UNIT_HEALTH"));
        assert!(msg.contains("health"));
    }

    #[test]
    fn invalid_bounds_message_uses_micros() {
        let err = ConfigError::InvalidBounds {
            min: Duration::from_millis(20),
            max: Duration::from_millis(10),
        };
        assert_eq!(
            err.to_string(),
            "invalid delay bounds: min 20000us exceeds max 10000us"
        );
    }

    #[test]
    fn guarded_passes_through_results() {
        assert!(guarded(|| Ok(())).is_ok());
        let err = guarded(|| Err("boom".into())).unwrap_err();
        assert_eq!(err.message(), "boom");
        assert!(!err.is_panic());
    }

    #[test]
    fn guarded_catches_panics() {
        let err = guarded(|| panic!("handler exploded")).unwrap_err();
        assert!(err.is_panic());
        assert_eq!(err.message(), "handler exploded");
        assert_eq!(err.to_string(), "callback panicked: handler exploded");
    }
}
