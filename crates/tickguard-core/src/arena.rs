#![forbid(unsafe_code)]

//! Generation-tagged target handles.
//!
//! The dirty-invalidation manager refers to reconcilable targets only through
//! [`TargetHandle`]s. A handle is a slot index plus the generation the slot
//! had when the target was inserted; removing a target bumps the slot's
//! generation, so every outstanding handle to it fails the liveness check in
//! O(1) even after the slot is reused.

use std::fmt;

/// Weak reference to a reconcilable target.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetHandle {
    idx: u32,
    generation: u32,
}

impl TargetHandle {
    /// Build a handle from raw parts, for hosts that manage their own
    /// target storage.
    #[inline]
    #[must_use]
    pub const fn from_raw_parts(idx: u32, generation: u32) -> Self {
        Self { idx, generation }
    }

    /// Slot index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.idx
    }

    /// Generation the handle was issued under.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for TargetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TargetHandle({}@gen{})", self.idx, self.generation)
    }
}

#[derive(Debug, Clone)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot arena issuing [`TargetHandle`]s.
///
/// Freed slots are recycled through a free list.
#[derive(Debug, Clone)]
pub struct TargetArena<T> {
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
    len: usize,
}

impl<T> Default for TargetArena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            len: 0,
        }
    }
}

impl<T> TargetArena<T> {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a target and return its handle.
    pub fn insert(&mut self, value: T) -> TargetHandle {
        self.len += 1;
        if let Some(idx) = self.free_list.pop() {
            let slot = &mut self.slots[idx as usize];
            slot.value = Some(value);
            return TargetHandle {
                idx,
                generation: slot.generation,
            };
        }
        let idx = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        TargetHandle { idx, generation: 0 }
    }

    /// Remove a target. Stale handles return `None`.
    pub fn remove(&mut self, handle: TargetHandle) -> Option<T> {
        let slot = self.slot_mut(handle)?;
        let value = slot.value.take()?;
        // Bump generation so old handles immediately fail validation.
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(handle.idx);
        self.len -= 1;
        Some(value)
    }

    /// Borrow a live target.
    #[must_use]
    pub fn get(&self, handle: TargetHandle) -> Option<&T> {
        self.slots
            .get(handle.idx as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_ref())
    }

    /// Mutably borrow a live target.
    pub fn get_mut(&mut self, handle: TargetHandle) -> Option<&mut T> {
        self.slot_mut(handle).and_then(|s| s.value.as_mut())
    }

    /// Whether `handle` refers to a live target.
    #[must_use]
    pub fn contains(&self, handle: TargetHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Number of live targets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the arena holds no live targets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate live targets with their handles.
    pub fn iter(&self) -> impl Iterator<Item = (TargetHandle, &T)> {
        self.slots.iter().enumerate().filter_map(|(idx, slot)| {
            slot.value.as_ref().map(|v| {
                (
                    TargetHandle {
                        idx: idx as u32,
                        generation: slot.generation,
                    },
                    v,
                )
            })
        })
    }

    fn slot_mut(&mut self, handle: TargetHandle) -> Option<&mut Slot<T>> {
        self.slots
            .get_mut(handle.idx as usize)
            .filter(|s| s.generation == handle.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let mut arena = TargetArena::new();
        let a = arena.insert("player");
        let b = arena.insert("target");
        assert_eq!(arena.get(a), Some(&"player"));
        assert_eq!(arena.get(b), Some(&"target"));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn generation_prevents_stale_access() {
        let mut arena = TargetArena::new();
        let first = arena.insert(1);
        assert_eq!(arena.remove(first), Some(1));
        assert!(!arena.contains(first));

        let second = arena.insert(2);
        assert_eq!(first.index(), second.index());
        assert_ne!(first.generation(), second.generation());
        assert_eq!(arena.get(first), None);
        assert_eq!(arena.remove(first), None);
        assert_eq!(arena.get(second), Some(&2));
    }

    #[test]
    fn double_remove_is_noop() {
        let mut arena = TargetArena::new();
        let h = arena.insert(());
        assert!(arena.remove(h).is_some());
        assert!(arena.remove(h).is_none());
        assert!(arena.is_empty());
    }

    #[test]
    fn out_of_range_handle_is_dead() {
        let arena: TargetArena<u8> = TargetArena::new();
        assert!(!arena.contains(TargetHandle::from_raw_parts(7, 0)));
    }

    #[test]
    fn iter_skips_removed() {
        let mut arena = TargetArena::new();
        let a = arena.insert('a');
        let b = arena.insert('b');
        arena.remove(a);
        let live: Vec<_> = arena.iter().collect();
        assert_eq!(live, vec![(b, &'b')]);
    }

    #[test]
    fn debug_shows_index_and_generation() {
        let h = TargetHandle::from_raw_parts(3, 1);
        assert_eq!(format!("{h:?}"), "TargetHandle(3@gen1)");
    }

    #[test]
    fn get_mut_modifies_in_place() {
        let mut arena = TargetArena::new();
        let h = arena.insert(10);
        if let Some(v) = arena.get_mut(h) {
            *v += 5;
        }
        assert_eq!(arena.get(h), Some(&15));
    }
}
