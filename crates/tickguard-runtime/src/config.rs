#![forbid(unsafe_code)]

//! Scheduler configuration.
//!
//! [`SchedulerConfig`] bundles the per-component configs with the
//! integration switches. Hosts usually start from
//! [`SchedulerConfig::from_env`] and adjust with the `with_*` builders.
//!
//! # Environment Variables
//!
//! | Variable | Field | Format |
//! |----------|-------|--------|
//! | `TICKGUARD_BUDGET_US` | `budget.target` | microseconds |
//! | `TICKGUARD_WINDOW` | `budget.window` | tick count |
//! | `TICKGUARD_PERCENTILE` | `budget.percentile` | `p50`, `p95`, `p99` |
//! | `TICKGUARD_QUEUE_CAP` | `coalescer.default_queue_depth_cap` | count |
//! | `TICKGUARD_DECAY_MS` | `dirty.decay_interval` | milliseconds |
//! | `TICKGUARD_COALESCING` | `coalescing_enabled` | bool |
//! | `TICKGUARD_ADAPTIVE_BATCH` | `adaptive_batching` | bool |
//! | `TICKGUARD_FIXED_BATCH` | `fixed_batch_size` | count |
//! | `TICKGUARD_TUNING` | `coalescer.tuner.enabled` | bool |
//!
//! Booleans accept `1`/`0`, `true`/`false`, `on`/`off`, `yes`/`no`.
//! Unparsable values are logged and ignored.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tickguard_core::{
    BudgetPercentile, CoalescerConfig, ConfigError, DirtyConfig, TickBudgetConfig, TunerConfig,
};

/// Configuration for [`TickScheduler`](crate::TickScheduler).
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Tick budget tracking.
    pub budget: TickBudgetConfig,
    /// Coalescer defaults, including the delay tuner.
    pub coalescer: CoalescerConfig,
    /// Dirty manager settings.
    pub dirty: DirtyConfig,
    /// When false, every dispatch is delivered directly.
    pub coalescing_enabled: bool,
    /// Size dirty passes from spare budget capacity.
    pub adaptive_batching: bool,
    /// Dirty pass size when `adaptive_batching` is off.
    pub fixed_batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            budget: TickBudgetConfig::default(),
            coalescer: CoalescerConfig::default(),
            dirty: DirtyConfig::default(),
            coalescing_enabled: true,
            adaptive_batching: true,
            fixed_batch_size: 16,
        }
    }
}

impl SchedulerConfig {
    /// Defaults with `TICKGUARD_*` overrides from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Defaults with overrides read through `lookup`.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(us) = parse_var::<u64>(&lookup, "TICKGUARD_BUDGET_US") {
            config.budget.target = Duration::from_micros(us);
        }
        if let Some(window) = parse_var::<usize>(&lookup, "TICKGUARD_WINDOW") {
            config.budget.window = window;
        }
        if let Some(raw) = lookup("TICKGUARD_PERCENTILE") {
            match BudgetPercentile::parse(&raw) {
                Some(p) => config.budget.percentile = p,
                None => ignored("TICKGUARD_PERCENTILE", &raw),
            }
        }
        if let Some(cap) = parse_var::<usize>(&lookup, "TICKGUARD_QUEUE_CAP") {
            config.coalescer.default_queue_depth_cap = cap;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "TICKGUARD_DECAY_MS") {
            config.dirty.decay_interval = Duration::from_millis(ms);
        }
        if let Some(on) = parse_flag(&lookup, "TICKGUARD_COALESCING") {
            config.coalescing_enabled = on;
        }
        if let Some(on) = parse_flag(&lookup, "TICKGUARD_ADAPTIVE_BATCH") {
            config.adaptive_batching = on;
        }
        if let Some(n) = parse_var::<usize>(&lookup, "TICKGUARD_FIXED_BATCH") {
            config.fixed_batch_size = n;
        }
        if let Some(on) = parse_flag(&lookup, "TICKGUARD_TUNING") {
            config.coalescer.tuner.enabled = on;
        }
        config
    }

    /// Set the tick budget config.
    #[must_use]
    pub fn with_budget(mut self, budget: TickBudgetConfig) -> Self {
        self.budget = budget;
        self
    }

    /// Set the coalescer config.
    #[must_use]
    pub fn with_coalescer(mut self, coalescer: CoalescerConfig) -> Self {
        self.coalescer = coalescer;
        self
    }

    /// Set the delay tuner config.
    #[must_use]
    pub fn with_tuner(mut self, tuner: TunerConfig) -> Self {
        self.coalescer.tuner = tuner;
        self
    }

    /// Set the dirty manager config.
    #[must_use]
    pub fn with_dirty(mut self, dirty: DirtyConfig) -> Self {
        self.dirty = dirty;
        self
    }

    /// Enable or disable coalescing.
    #[must_use]
    pub fn with_coalescing(mut self, enabled: bool) -> Self {
        self.coalescing_enabled = enabled;
        self
    }

    /// Use a fixed dirty pass size instead of adaptive sizing.
    #[must_use]
    pub fn with_fixed_batch_size(mut self, n: usize) -> Self {
        self.adaptive_batching = false;
        self.fixed_batch_size = n;
        self
    }

    /// Check every component config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.budget.window == 0 {
            return Err(ConfigError::Invalid("budget window must be non-zero".into()));
        }
        if self.budget.target.is_zero() {
            return Err(ConfigError::Invalid("budget target must be non-zero".into()));
        }
        if !self.adaptive_batching && self.fixed_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "fixed_batch_size must be non-zero when adaptive batching is off".into(),
            ));
        }
        self.coalescer.tuner.validate()?;
        self.dirty.validate()
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            ignored(name, &raw);
            None
        }
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<bool> {
    let raw = lookup(name)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => {
            ignored(name, &raw);
            None
        }
    }
}

fn ignored(name: &str, raw: &str) {
    tracing::warn!(variable = name, value = raw, "ignoring unparsable environment override");
}
