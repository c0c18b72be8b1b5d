#![forbid(unsafe_code)]

//! Tick budget tracking with spare-capacity signals.
//!
//! The host loop has a fixed deadline per iteration (16.7ms at 60Hz). When
//! bursts of input push tick cost past that deadline, the rest of the
//! scheduler backs off: batches grow, fewer dirty targets are reconciled per
//! tick, and non-critical emergency flushes are suppressed. This module
//! measures tick cost and exposes those advisory signals.
//!
//! # Usage
//!
//! ```
//! use tickguard_core::tick_budget::{TickBudget, TickBudgetConfig, TickTimer};
//! use std::time::Duration;
//!
//! let mut budget = TickBudget::new(TickBudgetConfig::default());
//!
//! let timer = TickTimer::start();
//! // ... run one iteration of the host loop ...
//! timer.finish(&mut budget);
//!
//! budget.record_tick(Duration::from_millis(4));
//! assert!(!budget.is_over_budget());
//! assert!(budget.spare_capacity_ratio() > 0.5);
//! ```
//!
//! # Data Structures
//!
//! - A fixed-capacity ring of the last `window` samples (oldest overwritten).
//! - A running sum over the ring so the mean updates in O(1).
//! - A [`DurationHistogram`] mirroring the ring, for percentile rank queries.
//!
//! Memory is bounded by `window + bucket_count`, independent of how many
//! ticks have been recorded.
//!
//! # Failure Modes
//!
//! | Condition | Behavior |
//! |-----------|----------|
//! | Empty history | Not over budget, spare capacity 1.0, no percentiles |
//! | Fewer than `min_samples` | Not over budget |
//! | Sample beyond histogram range | Saturates into the last bucket |
//! | Negative or NaN `record_tick_ms` | Recorded as zero |

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::histogram::DurationHistogram;

/// Which percentile of the rolling window is compared against the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPercentile {
    /// Median tick.
    P50,
    /// 95th percentile tick.
    #[default]
    P95,
    /// 99th percentile tick.
    P99,
}

impl BudgetPercentile {
    /// Quantile in `[0, 1]`.
    #[must_use]
    pub const fn quantile(self) -> f64 {
        match self {
            Self::P50 => 0.50,
            Self::P95 => 0.95,
            Self::P99 => 0.99,
        }
    }

    /// Parse `p50`, `p95`, or `p99` (case-insensitive).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "p50" => Some(Self::P50),
            "p95" => Some(Self::P95),
            "p99" => Some(Self::P99),
            _ => None,
        }
    }
}

/// Coarse load classification fed to the delay tuner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadContext {
    /// Ticks comfortably inside the budget.
    #[default]
    Idle,
    /// Ticks at or past the budget.
    Busy,
}

impl LoadContext {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
        }
    }
}

/// Configuration for [`TickBudget`].
#[derive(Debug, Clone, PartialEq)]
pub struct TickBudgetConfig {
    /// Per-tick deadline.
    pub target: Duration,
    /// Number of recent ticks kept in the rolling window.
    pub window: usize,
    /// Percentile compared against `target` by `is_over_budget`.
    pub percentile: BudgetPercentile,
    /// Histogram bucket width (percentile resolution).
    pub bucket_width: Duration,
    /// Histogram bucket count; `bucket_width * bucket_count` is the range.
    pub bucket_count: usize,
    /// Samples required before `is_over_budget` can report true.
    pub min_samples: usize,
    /// Spare capacity below which the load is classified busy.
    pub busy_spare_ratio: f64,
}

impl Default for TickBudgetConfig {
    fn default() -> Self {
        Self {
            target: Duration::from_micros(16_667),
            window: 120,
            percentile: BudgetPercentile::P95,
            bucket_width: Duration::from_micros(100),
            bucket_count: 1024,
            min_samples: 4,
            busy_spare_ratio: 0.2,
        }
    }
}

impl TickBudgetConfig {
    /// Set the per-tick deadline.
    #[must_use]
    pub fn with_target(mut self, target: Duration) -> Self {
        self.target = target;
        self
    }

    /// Set the rolling window size.
    #[must_use]
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    /// Set the percentile used for the over-budget verdict.
    #[must_use]
    pub fn with_percentile(mut self, percentile: BudgetPercentile) -> Self {
        self.percentile = percentile;
        self
    }

    /// Set the number of samples required before reporting over budget.
    #[must_use]
    pub fn with_min_samples(mut self, min_samples: usize) -> Self {
        self.min_samples = min_samples;
        self
    }
}

/// Percentile summary of the rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TickPercentiles {
    /// Median tick in ms.
    pub p50_ms: f64,
    /// 95th percentile tick in ms.
    pub p95_ms: f64,
    /// 99th percentile tick in ms.
    pub p99_ms: f64,
    /// Mean tick in ms over the window.
    pub mean_ms: f64,
    /// Samples in the window.
    pub count: usize,
}

impl TickPercentiles {
    /// Serialize to a single JSONL record.
    #[must_use]
    pub fn to_jsonl(&self) -> String {
        format!(
            r#"{{"event":"tick_percentiles","p50_ms":{:.3},"p95_ms":{:.3},"p99_ms":{:.3},"mean_ms":{:.3},"count":{}}}"#,
            self.p50_ms, self.p95_ms, self.p99_ms, self.mean_ms, self.count
        )
    }
}

/// Rolling tick-cost tracker.
#[derive(Debug, Clone)]
pub struct TickBudget {
    config: TickBudgetConfig,
    /// Window samples in microseconds, oldest first.
    samples: VecDeque<u64>,
    /// Sum of `samples`, maintained incrementally.
    sum_us: u128,
    histogram: DurationHistogram,
    last_us: Option<u64>,
    total_ticks: u64,
    over_target_ticks: u64,
}

impl Default for TickBudget {
    fn default() -> Self {
        Self::new(TickBudgetConfig::default())
    }
}

impl TickBudget {
    /// Create a tracker. A zero window is raised to one sample.
    #[must_use]
    pub fn new(mut config: TickBudgetConfig) -> Self {
        config.window = config.window.max(1);
        let histogram = DurationHistogram::new(config.bucket_count, config.bucket_width);
        Self {
            samples: VecDeque::with_capacity(config.window),
            sum_us: 0,
            histogram,
            last_us: None,
            total_ticks: 0,
            over_target_ticks: 0,
            config,
        }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &TickBudgetConfig {
        &self.config
    }

    /// The per-tick deadline.
    #[must_use]
    pub fn target(&self) -> Duration {
        self.config.target
    }

    /// Record the duration of one tick.
    pub fn record_tick(&mut self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        if self.samples.len() == self.config.window {
            if let Some(evicted) = self.samples.pop_front() {
                self.sum_us -= u128::from(evicted);
                self.histogram.remove(evicted);
            }
        }
        self.samples.push_back(us);
        self.sum_us += u128::from(us);
        self.histogram.insert(us);
        self.last_us = Some(us);
        self.total_ticks = self.total_ticks.saturating_add(1);
        if duration > self.config.target {
            self.over_target_ticks = self.over_target_ticks.saturating_add(1);
        }
        crate::trace!(
            tick_us = us,
            window = self.samples.len(),
            "tick recorded"
        );
    }

    /// Record the duration of one tick given in milliseconds.
    pub fn record_tick_ms(&mut self, ms: f64) {
        let ms = if ms.is_finite() { ms.max(0.0) } else { 0.0 };
        self.record_tick(Duration::from_secs_f64(ms / 1000.0));
    }

    /// Whether the configured percentile of the window exceeds the target.
    ///
    /// Always false until `min_samples` ticks are in the window.
    #[must_use]
    pub fn is_over_budget(&self) -> bool {
        if self.samples.is_empty() || self.samples.len() < self.config.min_samples {
            return false;
        }
        self.percentile(self.config.percentile)
            .is_some_and(|p| p > self.config.target)
    }

    /// `(target - last) / target`, clamped to `[0, 1]`.
    ///
    /// Returns 1.0 before any tick is recorded.
    #[must_use]
    pub fn spare_capacity_ratio(&self) -> f64 {
        let Some(last_us) = self.last_us else {
            return 1.0;
        };
        let target_us = self.config.target.as_secs_f64() * 1_000_000.0;
        if target_us <= 0.0 {
            return 0.0;
        }
        ((target_us - last_us as f64) / target_us).clamp(0.0, 1.0)
    }

    /// Busy when over budget or when spare capacity is below the configured
    /// ratio; idle otherwise.
    #[must_use]
    pub fn load_context(&self) -> LoadContext {
        if self.is_over_budget() || self.spare_capacity_ratio() < self.config.busy_spare_ratio {
            LoadContext::Busy
        } else {
            LoadContext::Idle
        }
    }

    /// Mean tick duration over the window, zero when empty.
    #[must_use]
    pub fn mean(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let mean = self.sum_us / self.samples.len() as u128;
        Duration::from_micros(u64::try_from(mean).unwrap_or(u64::MAX))
    }

    /// Mean tick duration over the window in milliseconds.
    #[must_use]
    pub fn mean_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.sum_us as f64 / self.samples.len() as f64 / 1000.0
    }

    /// Percentile estimate of the window.
    #[must_use]
    pub fn percentile(&self, percentile: BudgetPercentile) -> Option<Duration> {
        self.histogram
            .quantile_micros(percentile.quantile())
            .map(Duration::from_micros)
    }

    /// P50/P95/P99 summary, or `None` before any tick.
    #[must_use]
    pub fn percentiles(&self) -> Option<TickPercentiles> {
        if self.samples.is_empty() {
            return None;
        }
        let ms = |p: BudgetPercentile| {
            self.percentile(p)
                .map(|d| d.as_secs_f64() * 1000.0)
                .unwrap_or(0.0)
        };
        Some(TickPercentiles {
            p50_ms: ms(BudgetPercentile::P50),
            p95_ms: ms(BudgetPercentile::P95),
            p99_ms: ms(BudgetPercentile::P99),
            mean_ms: self.mean_ms(),
            count: self.samples.len(),
        })
    }

    /// Most recent tick duration.
    #[must_use]
    pub fn last_tick(&self) -> Option<Duration> {
        self.last_us.map(Duration::from_micros)
    }

    /// Samples currently in the window.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no tick has been recorded since construction or reset.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Ticks recorded since construction or reset.
    #[must_use]
    pub fn total_ticks(&self) -> u64 {
        self.total_ticks
    }

    /// Ticks that individually exceeded the target.
    #[must_use]
    pub fn over_target_ticks(&self) -> u64 {
        self.over_target_ticks
    }

    /// Drop all history.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.sum_us = 0;
        self.histogram.clear();
        self.last_us = None;
        self.total_ticks = 0;
        self.over_target_ticks = 0;
    }
}

/// Measures one tick and records it into a [`TickBudget`].
#[derive(Debug, Clone, Copy)]
#[must_use = "a started timer records nothing until finished"]
pub struct TickTimer {
    started: Instant,
}

impl TickTimer {
    /// Start timing now.
    pub fn start() -> Self {
        Self::start_at(Instant::now())
    }

    /// Start timing at a specific instant (for testing).
    pub fn start_at(started: Instant) -> Self {
        Self { started }
    }

    /// Stop timing now and record the elapsed time.
    pub fn finish(self, budget: &mut TickBudget) -> Duration {
        self.finish_at(Instant::now(), budget)
    }

    /// Stop timing at a specific instant and record the elapsed time.
    pub fn finish_at(self, now: Instant, budget: &mut TickBudget) -> Duration {
        let elapsed = now
            .checked_duration_since(self.started)
            .unwrap_or(Duration::ZERO);
        budget.record_tick(elapsed);
        elapsed
    }
}
