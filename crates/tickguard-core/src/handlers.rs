#![forbid(unsafe_code)]

//! Index-stable handler lists.
//!
//! Handlers are stored in insertion order and addressed by a monotonically
//! increasing [`HandlerId`]. Removal leaves a tombstone so positions of the
//! remaining handlers never shift; tombstones are reclaimed by
//! [`HandlerList::compact`], which the owner calls between dispatch passes.

/// Identifier returned when a handler is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
    /// The raw id value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

#[derive(Debug)]
struct Slot<F> {
    id: HandlerId,
    handler: Option<F>,
}

/// Ordered list of handlers with tombstoned removal.
#[derive(Debug)]
pub struct HandlerList<F> {
    slots: Vec<Slot<F>>,
    next_id: u64,
    live: usize,
}

impl<F> Default for HandlerList<F> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            next_id: 1,
            live: 0,
        }
    }
}

impl<F> HandlerList<F> {
    /// Create an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler.
    pub fn add(&mut self, handler: F) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.slots.push(Slot {
            id,
            handler: Some(handler),
        });
        self.live += 1;
        id
    }

    /// Tombstone a handler. Returns the handler if it was live.
    pub fn remove(&mut self, id: HandlerId) -> Option<F> {
        // Ids are handed out in increasing order and slots are never
        // reordered, so the slot list stays sorted by id.
        let idx = self.slots.binary_search_by_key(&id, |s| s.id).ok()?;
        let handler = self.slots[idx].handler.take()?;
        self.live -= 1;
        Some(handler)
    }

    /// Number of live handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether no live handlers remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Number of tombstoned slots awaiting compaction.
    #[must_use]
    pub fn tombstones(&self) -> usize {
        self.slots.len() - self.live
    }

    /// Call `f` on every live handler in insertion order.
    pub fn for_each_mut(&mut self, mut f: impl FnMut(HandlerId, &mut F)) {
        for slot in &mut self.slots {
            if let Some(handler) = slot.handler.as_mut() {
                f(slot.id, handler);
            }
        }
    }

    /// Drop all tombstones.
    pub fn compact(&mut self) {
        self.slots.retain(|s| s.handler.is_some());
    }

    /// Compact once tombstones outnumber live handlers.
    pub fn maybe_compact(&mut self) -> bool {
        let dead = self.tombstones();
        if dead > 0 && dead * 2 > self.slots.len() {
            self.compact();
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(list: &mut HandlerList<&'static str>) -> Vec<&'static str> {
        let mut out = Vec::new();
        list.for_each_mut(|_, h| out.push(*h));
        out
    }

    #[test]
    fn handlers_run_in_insertion_order() {
        let mut list = HandlerList::new();
        list.add("a");
        list.add("b");
        list.add("c");
        assert_eq!(collect(&mut list), ["a", "b", "c"]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn removal_tombstones_without_shifting() {
        let mut list = HandlerList::new();
        let a = list.add("a");
        let b = list.add("b");
        list.add("c");
        assert_eq!(list.remove(b), Some("b"));
        assert_eq!(list.remove(b), None);
        assert_eq!(list.tombstones(), 1);
        assert_eq!(collect(&mut list), ["a", "c"]);

        // Ids stay valid after other removals.
        assert_eq!(list.remove(a), Some("a"));
        assert_eq!(collect(&mut list), ["c"]);
    }

    #[test]
    fn ids_are_never_reused() {
        let mut list = HandlerList::new();
        let a = list.add(1);
        list.remove(a);
        list.compact();
        let b = list.add(2);
        assert_ne!(a, b);
        assert!(b > a);
        assert_eq!(list.remove(a), None);
    }

    #[test]
    fn maybe_compact_waits_for_majority_tombstones() {
        let mut list = HandlerList::new();
        let ids: Vec<_> = (0..4).map(|i| list.add(i)).collect();
        list.remove(ids[0]);
        list.remove(ids[1]);
        assert!(!list.maybe_compact());
        list.remove(ids[2]);
        assert!(list.maybe_compact());
        assert_eq!(list.tombstones(), 0);
        assert_eq!(list.len(), 1);
        assert_eq!(list.remove(ids[3]), Some(3));
        assert!(list.is_empty());
    }

    mod property {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Iteration visits exactly the live handlers, in insertion order,
            /// whatever the interleaving of adds, removes, and compactions.
            #[test]
            fn iteration_matches_reference(ops in proptest::collection::vec((0u8..3, 0usize..16), 0..80)) {
                let mut list = HandlerList::new();
                let mut reference: Vec<(HandlerId, usize)> = Vec::new();
                let mut issued: Vec<HandlerId> = Vec::new();
                for (n, (op, arg)) in ops.into_iter().enumerate() {
                    match op {
                        0 => {
                            let id = list.add(n);
                            issued.push(id);
                            reference.push((id, n));
                        }
                        1 if !issued.is_empty() => {
                            let id = issued[arg % issued.len()];
                            let expected = reference.iter().position(|(r, _)| *r == id)
                                .map(|pos| reference.remove(pos).1);
                            prop_assert_eq!(list.remove(id), expected);
                        }
                        _ => {
                            list.maybe_compact();
                        }
                    }
                    let mut seen = Vec::new();
                    list.for_each_mut(|id, v| seen.push((id, *v)));
                    prop_assert_eq!(&seen, &reference);
                    prop_assert_eq!(list.len(), reference.len());
                }
            }
        }
    }
}
