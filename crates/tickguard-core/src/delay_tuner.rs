#![forbid(unsafe_code)]

//! Per-key adaptive coalescing delay.
//!
//! Each coalesced key starts from its configured delay. After every flush
//! the coalescer reports an outcome (batch size, whether the flush was an
//! emergency, and the load context) and the tuner nudges the learned delay:
//!
//! | Outcome | Direction |
//! |---------|-----------|
//! | Emergency flush | shorter |
//! | Batch reached `max_batch_size` | shorter |
//! | Busy, otherwise | longer |
//! | Idle, batch of one | shorter |
//! | Idle, batch of several | hold |
//!
//! The nudge is a bounded exponential moving average: the controller aims
//! one `step` (a fraction of the current delay, at least `min_step`) in the
//! chosen direction and moves `smoothing` of the way there. The result is
//! then clamped into the key's [`DelayBounds`]. The clamp is applied after
//! every update and after every restore, so no sequence of observations or
//! persisted state can leave the learned delay outside the bounds.
//!
//! # Persistence
//!
//! [`DelayTuner::snapshot`] produces a [`TunerSnapshot`] holding, per key,
//! the learned delay, sample count, last context, and the bounds *version*.
//! Bounds themselves are configuration and are never persisted; a restored
//! entry whose bounds version differs from the current configuration is
//! discarded. Entries for keys that are not registered yet are parked and
//! applied on registration.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::tick_budget::LoadContext;

/// Schema version of [`TunerSnapshot`].
pub const TUNER_SCHEMA_VERSION: u32 = 1;

/// Hard safety clamp for a key's learned delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayBounds {
    min: Duration,
    max: Duration,
    version: u32,
}

impl Default for DelayBounds {
    fn default() -> Self {
        Self {
            min: Duration::ZERO,
            max: Duration::from_millis(500),
            version: 1,
        }
    }
}

impl DelayBounds {
    /// Create bounds, rejecting `min > max`.
    pub fn new(min: Duration, max: Duration) -> Result<Self, ConfigError> {
        if min > max {
            return Err(ConfigError::InvalidBounds { min, max });
        }
        Ok(Self {
            min,
            max,
            version: 1,
        })
    }

    /// Set the bounds version. Bump it when the bounds change in a way that
    /// should invalidate previously learned delays.
    #[must_use]
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Lower bound.
    #[must_use]
    pub fn min(&self) -> Duration {
        self.min
    }

    /// Upper bound.
    #[must_use]
    pub fn max(&self) -> Duration {
        self.max
    }

    /// Bounds version stored alongside learned state.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Clamp a delay into `[min, max]`.
    #[must_use]
    pub fn clamp(&self, delay: Duration) -> Duration {
        delay.clamp(self.min, self.max)
    }
}

/// Controller gains.
#[derive(Debug, Clone, PartialEq)]
pub struct TunerConfig {
    /// Fraction of the current delay to aim for per observation.
    pub step: f64,
    /// EMA weight of the new target, in `(0, 1]`.
    pub smoothing: f64,
    /// Smallest step, so a zero delay can still grow.
    pub min_step: Duration,
    /// When false, observations are ignored and configured delays are used.
    pub enabled: bool,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            step: 0.2,
            smoothing: 0.5,
            min_step: Duration::from_millis(1),
            enabled: true,
        }
    }
}

impl TunerConfig {
    /// Enable or disable learning.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the step fraction and smoothing weight.
    #[must_use]
    pub fn with_gains(mut self, step: f64, smoothing: f64) -> Self {
        self.step = step;
        self.smoothing = smoothing;
        self
    }

    /// Check that both gains are in `(0, 1]`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let in_range = |v: f64| v.is_finite() && v > 0.0 && v <= 1.0;
        if !in_range(self.step) {
            return Err(ConfigError::Invalid(format!(
                "tuner step must be in (0, 1], got {}",
                self.step
            )));
        }
        if !in_range(self.smoothing) {
            return Err(ConfigError::Invalid(format!(
                "tuner smoothing must be in (0, 1], got {}",
                self.smoothing
            )));
        }
        Ok(())
    }
}

/// What happened to one flushed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayOutcome {
    /// Argument snapshots in the batch.
    pub batch_size: usize,
    /// The key's advisory batch cap (0 means none).
    pub max_batch_size: usize,
    /// Whether the flush bypassed the timer.
    pub emergency: bool,
    /// Load classification at flush time.
    pub context: LoadContext,
}

/// Read-only view of one key's tuning state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveDelayState {
    /// Delay currently in effect.
    pub delay: Duration,
    /// Observations folded into `delay`.
    pub sample_count: u64,
    /// Context of the last observation.
    pub context: LoadContext,
    /// Active clamp.
    pub bounds: DelayBounds,
}

/// Persisted form of one key's learned state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedDelay {
    /// Learned delay in microseconds.
    pub delay_us: u64,
    /// Observations folded into the delay.
    pub sample_count: u64,
    /// Bounds version the delay was learned under.
    pub bounds_version: u32,
    /// Context of the last observation.
    #[serde(default)]
    pub context: LoadContext,
}

/// Versioned snapshot of all learned delays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunerSnapshot {
    /// Always [`TUNER_SCHEMA_VERSION`] when produced by this crate.
    pub schema_version: u32,
    /// Learned state per key.
    pub entries: BTreeMap<String, PersistedDelay>,
}

impl Default for TunerSnapshot {
    fn default() -> Self {
        Self {
            schema_version: TUNER_SCHEMA_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

/// Result of [`DelayTuner::restore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Entries applied to registered keys.
    pub applied: usize,
    /// Entries held until their key registers.
    pub parked: usize,
    /// Entries dropped because their bounds version no longer matches.
    pub discarded: usize,
    /// The snapshot had an unknown schema and was ignored entirely.
    pub schema_mismatch: bool,
}

#[derive(Debug, Clone, Copy)]
struct Learned {
    delay: Duration,
    sample_count: u64,
    context: LoadContext,
}

#[derive(Debug, Clone)]
struct KeyTuning {
    default_delay: Duration,
    bounds: DelayBounds,
    learned: Option<Learned>,
}

impl KeyTuning {
    fn current(&self) -> Duration {
        self.learned
            .map(|l| l.delay)
            .unwrap_or_else(|| self.bounds.clamp(self.default_delay))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Nudge {
    Shorter,
    Longer,
    Hold,
}

impl Nudge {
    fn for_outcome(outcome: &DelayOutcome) -> Self {
        let saturated = outcome.max_batch_size > 0 && outcome.batch_size >= outcome.max_batch_size;
        if outcome.emergency || saturated {
            return Nudge::Shorter;
        }
        match outcome.context {
            LoadContext::Busy => Nudge::Longer,
            LoadContext::Idle if outcome.batch_size <= 1 => Nudge::Shorter,
            LoadContext::Idle => Nudge::Hold,
        }
    }
}

/// Learns a coalescing delay per key.
#[derive(Debug, Clone, Default)]
pub struct DelayTuner {
    config: TunerConfig,
    keys: HashMap<String, KeyTuning>,
    parked: HashMap<String, PersistedDelay>,
}

impl DelayTuner {
    /// Create a tuner with the given gains.
    #[must_use]
    pub fn new(config: TunerConfig) -> Self {
        Self {
            config,
            keys: HashMap::new(),
            parked: HashMap::new(),
        }
    }

    /// The active gains.
    #[must_use]
    pub fn config(&self) -> &TunerConfig {
        &self.config
    }

    /// Register or reconfigure a key.
    ///
    /// Re-registering with a different bounds version drops learned state;
    /// otherwise learned state is re-clamped into the new bounds. A parked
    /// persisted entry for the key is applied here.
    pub fn register(&mut self, key: &str, default_delay: Duration, bounds: DelayBounds) {
        let tuning = self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| KeyTuning {
                default_delay,
                bounds,
                learned: None,
            });
        if tuning.bounds.version != bounds.version {
            tuning.learned = None;
        }
        tuning.default_delay = default_delay;
        tuning.bounds = bounds;
        if let Some(learned) = tuning.learned.as_mut() {
            learned.delay = bounds.clamp(learned.delay);
        }
        if let Some(persisted) = self.parked.remove(key) {
            self.apply_persisted(key, persisted);
        }
    }

    /// Remove a key and its learned state.
    pub fn forget(&mut self, key: &str) -> bool {
        self.parked.remove(key);
        self.keys.remove(key).is_some()
    }

    /// Whether the key is registered.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    /// Delay to use for the next batch of `key`.
    ///
    /// Unregistered keys get `default_delay` unchanged.
    #[must_use]
    pub fn get_delay(&self, key: &str, default_delay: Duration) -> Duration {
        match self.keys.get(key) {
            Some(tuning) => match tuning.learned {
                Some(learned) => learned.delay,
                None => tuning.bounds.clamp(default_delay),
            },
            None => default_delay,
        }
    }

    /// Fold one flush outcome into the key's learned delay.
    ///
    /// Returns the new delay, or `None` when learning is disabled or the key
    /// is unknown.
    pub fn observe(&mut self, key: &str, outcome: DelayOutcome) -> Option<Duration> {
        if !self.config.enabled {
            return None;
        }
        let Some(tuning) = self.keys.get_mut(key) else {
            crate::trace!(key, "observation for unregistered key ignored");
            return None;
        };

        let current = tuning.current();
        let nudge = Nudge::for_outcome(&outcome);
        let current_us = current.as_micros() as f64;
        let step_us = (current_us * self.config.step).max(self.config.min_step.as_micros() as f64);
        let target_us = match nudge {
            Nudge::Shorter => (current_us - step_us).max(0.0),
            Nudge::Longer => current_us + step_us,
            Nudge::Hold => current_us,
        };
        let smoothing = self.config.smoothing.clamp(0.0, 1.0);
        let next_us = current_us + smoothing * (target_us - current_us);
        let next = tuning
            .bounds
            .clamp(Duration::from_micros(next_us.max(0.0).round() as u64));

        let sample_count = tuning
            .learned
            .map_or(0, |l| l.sample_count)
            .saturating_add(1);
        tuning.learned = Some(Learned {
            delay: next,
            sample_count,
            context: outcome.context,
        });

        crate::trace!(
            key,
            batch_size = outcome.batch_size,
            emergency = outcome.emergency,
            context = outcome.context.as_str(),
            delay_us = next.as_micros() as u64,
            "delay observed"
        );
        Some(next)
    }

    /// Tuning state for a key, learned or default.
    #[must_use]
    pub fn state(&self, key: &str) -> Option<AdaptiveDelayState> {
        self.keys.get(key).map(|tuning| {
            let (sample_count, context) = tuning
                .learned
                .map_or((0, LoadContext::Idle), |l| (l.sample_count, l.context));
            AdaptiveDelayState {
                delay: tuning.current(),
                sample_count,
                context,
                bounds: tuning.bounds,
            }
        })
    }

    /// Tuning state of every registered key, in no particular order.
    pub fn states(&self) -> impl Iterator<Item = (&str, AdaptiveDelayState)> + '_ {
        self.keys
            .keys()
            .filter_map(|key| self.state(key).map(|state| (key.as_str(), state)))
    }

    /// Forget learned state for one key; the configured delay applies again.
    pub fn reset(&mut self, key: &str) -> bool {
        self.parked.remove(key);
        match self.keys.get_mut(key) {
            Some(tuning) => tuning.learned.take().is_some(),
            None => false,
        }
    }

    /// Forget all learned state.
    pub fn reset_all(&mut self) {
        self.parked.clear();
        for tuning in self.keys.values_mut() {
            tuning.learned = None;
        }
    }

    /// Capture learned state, including parked entries not yet applied.
    #[must_use]
    pub fn snapshot(&self) -> TunerSnapshot {
        let mut entries: BTreeMap<String, PersistedDelay> = self
            .parked
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        for (key, tuning) in &self.keys {
            if let Some(learned) = tuning.learned {
                entries.insert(
                    key.clone(),
                    PersistedDelay {
                        delay_us: u64::try_from(learned.delay.as_micros()).unwrap_or(u64::MAX),
                        sample_count: learned.sample_count,
                        bounds_version: tuning.bounds.version,
                        context: learned.context,
                    },
                );
            }
        }
        TunerSnapshot {
            schema_version: TUNER_SCHEMA_VERSION,
            entries,
        }
    }

    /// Apply a snapshot.
    ///
    /// A snapshot with an unknown schema version is ignored and the current
    /// (default) state is kept.
    pub fn restore(&mut self, snapshot: &TunerSnapshot) -> RestoreReport {
        let mut report = RestoreReport::default();
        if snapshot.schema_version != TUNER_SCHEMA_VERSION {
            crate::warn!(
                stored = snapshot.schema_version,
                expected = TUNER_SCHEMA_VERSION,
                "tuner snapshot schema mismatch, keeping defaults"
            );
            report.schema_mismatch = true;
            return report;
        }
        for (key, persisted) in &snapshot.entries {
            if self.keys.contains_key(key) {
                if self.apply_persisted(key, *persisted) {
                    report.applied += 1;
                } else {
                    report.discarded += 1;
                }
            } else {
                self.parked.insert(key.clone(), *persisted);
                report.parked += 1;
            }
        }
        report
    }

    fn apply_persisted(&mut self, key: &str, persisted: PersistedDelay) -> bool {
        let Some(tuning) = self.keys.get_mut(key) else {
            return false;
        };
        if persisted.bounds_version != tuning.bounds.version {
            crate::debug!(
                key,
                stored = persisted.bounds_version,
                current = tuning.bounds.version,
                "discarding learned delay from other bounds version"
            );
            return false;
        }
        tuning.learned = Some(Learned {
            delay: tuning
                .bounds
                .clamp(Duration::from_micros(persisted.delay_us)),
            sample_count: persisted.sample_count,
            context: persisted.context,
        });
        true
    }
}
