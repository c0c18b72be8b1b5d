#![forbid(unsafe_code)]

//! Mapping from raw upstream event ids to coalesced keys.
//!
//! Several raw ids may feed one key (e.g. `UNIT_HEALTH` and
//! `UNIT_MAXHEALTH` both feeding `health`); one raw id maps to exactly one
//! key.

use std::collections::HashMap;
use std::time::Duration;

use tickguard_core::{ConfigError, Priority};

/// How one raw event id is routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBinding {
    /// Upstream event id.
    pub raw_event_id: String,
    /// Coalesced key the id feeds.
    pub key: String,
    /// Priority of arrivals from this source.
    pub priority: Priority,
    /// Delay the key was registered with.
    pub delay: Duration,
}

/// Raw id to key table.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: HashMap<String, SourceBinding>,
}

impl SourceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a raw id. A raw id can be bound only once.
    pub fn register(&mut self, binding: SourceBinding) -> Result<(), ConfigError> {
        if let Some(existing) = self.sources.get(&binding.raw_event_id) {
            return Err(ConfigError::DuplicateSource {
                raw_event_id: binding.raw_event_id,
                existing_key: existing.key.clone(),
            });
        }
        tracing::debug!(
            raw_event_id = %binding.raw_event_id,
            key = %binding.key,
            priority = binding.priority.as_str(),
            "event source bound"
        );
        self.sources.insert(binding.raw_event_id.clone(), binding);
        Ok(())
    }

    /// Look up a raw id.
    #[must_use]
    pub fn resolve(&self, raw_event_id: &str) -> Option<&SourceBinding> {
        self.sources.get(raw_event_id)
    }

    /// Remove one binding.
    pub fn unregister(&mut self, raw_event_id: &str) -> Option<SourceBinding> {
        self.sources.remove(raw_event_id)
    }

    /// Remove every binding feeding `key`. Returns how many were removed.
    pub fn unregister_key(&mut self, key: &str) -> usize {
        let before = self.sources.len();
        self.sources.retain(|_, b| b.key != key);
        before - self.sources.len()
    }

    /// Raw ids feeding `key`, sorted.
    #[must_use]
    pub fn sources_for_key(&self, key: &str) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .sources
            .values()
            .filter(|b| b.key == key)
            .map(|b| b.raw_event_id.as_str())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Number of bound raw ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether no raw id is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
