#![forbid(unsafe_code)]

//! Priority levels for coalesced events and dirty records.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Priority of a coalescable event class.
///
/// Variants are declared lowest first so the derived `Ord` ranks
/// `Critical` highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background updates; widest coalescing window.
    Low,
    /// Default for keys registered implicitly.
    #[default]
    Medium,
    /// Visible state that should update within a frame or two.
    High,
    /// Flushed on arrival, bypassing the timer.
    Critical,
}

impl Priority {
    /// All priorities, lowest first.
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Medium,
        Priority::High,
        Priority::Critical,
    ];

    /// Default coalescing delay for keys registered at this priority.
    ///
    /// The window shrinks as priority rises; `Critical` keys flush on
    /// arrival.
    #[must_use]
    pub const fn default_delay(self) -> Duration {
        match self {
            Priority::Critical => Duration::ZERO,
            Priority::High => Duration::from_millis(16),
            Priority::Medium => Duration::from_millis(50),
            Priority::Low => Duration::from_millis(100),
        }
    }

    /// Stable string form for logs and config.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    /// Parse the string form produced by [`Priority::as_str`].
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority of a dirty record, in `1..=5` (5 is most urgent).
///
/// Construction clamps out-of-range values instead of failing, because
/// dirty marks arrive from steady-state code paths that must not error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DirtyPriority(u8);

impl DirtyPriority {
    /// Lowest priority; decay never goes below this.
    pub const MIN: DirtyPriority = DirtyPriority(1);
    /// Default priority for ordinary marks.
    pub const NORMAL: DirtyPriority = DirtyPriority(3);
    /// Highest priority.
    pub const MAX: DirtyPriority = DirtyPriority(5);

    /// Create a priority, clamping into `1..=5`.
    #[must_use]
    pub const fn new(level: u8) -> Self {
        if level < Self::MIN.0 {
            Self::MIN
        } else if level > Self::MAX.0 {
            Self::MAX
        } else {
            Self(level)
        }
    }

    /// The numeric level.
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// This priority lowered by `levels`, floored at [`DirtyPriority::MIN`].
    #[must_use]
    pub fn decayed(self, levels: u32) -> Self {
        let levels = u8::try_from(levels).unwrap_or(u8::MAX);
        Self::new(self.0.saturating_sub(levels).max(Self::MIN.0))
    }

    /// Zero-based index for per-priority tables (`MIN` is 0).
    #[must_use]
    pub const fn index(self) -> usize {
        (self.0 - Self::MIN.0) as usize
    }
}

impl Default for DirtyPriority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl From<u8> for DirtyPriority {
    fn from(level: u8) -> Self {
        Self::new(level)
    }
}

impl From<Priority> for DirtyPriority {
    fn from(priority: Priority) -> Self {
        match priority {
            Priority::Low => DirtyPriority(2),
            Priority::Medium => DirtyPriority(3),
            Priority::High => DirtyPriority(4),
            Priority::Critical => DirtyPriority(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_ranks_highest() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert_eq!(Priority::default(), Priority::Medium);
    }

    #[test]
    fn default_delay_shrinks_with_priority() {
        let delays: Vec<_> = Priority::ALL.iter().map(|p| p.default_delay()).collect();
        assert!(delays.windows(2).all(|w| w[0] > w[1]));
        assert_eq!(Priority::Critical.default_delay(), Duration::ZERO);
    }

    #[test]
    fn parse_round_trips_and_ignores_case() {
        for p in Priority::ALL {
            assert_eq!(Priority::parse(p.as_str()), Some(p));
        }
        assert_eq!(Priority::parse(" HIGH "), Some(Priority::High));
        assert_eq!(Priority::parse("urgent"), None);
    }

    #[test]
    fn dirty_priority_clamps() {
        assert_eq!(DirtyPriority::new(0), DirtyPriority::MIN);
        assert_eq!(DirtyPriority::new(9), DirtyPriority::MAX);
        assert_eq!(DirtyPriority::new(4).get(), 4);
    }

    #[test]
    fn decay_floors_at_min() {
        let p = DirtyPriority::new(4);
        assert_eq!(p.decayed(0), p);
        assert_eq!(p.decayed(1).get(), 3);
        assert_eq!(p.decayed(3), DirtyPriority::MIN);
        assert_eq!(p.decayed(u32::MAX), DirtyPriority::MIN);
    }

    #[test]
    fn index_is_zero_based() {
        assert_eq!(DirtyPriority::MIN.index(), 0);
        assert_eq!(DirtyPriority::MAX.index(), 4);
    }
}
