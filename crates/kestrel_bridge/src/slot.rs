//! Process-wide slot tables
//!
//! The engine cannot hold host pointers, so every host wrapper registers
//! itself in one of two process-wide tables and hands the engine its slot
//! index as extension data. The dispatcher trampolines turn an index back
//! into a live wrapper by upgrading the stored weak reference; a dead or
//! vacated slot simply fails the lookup instead of dereferencing stale
//! memory.
//!
//! Freed slots are kept on an intrusive free list and handed out
//! most-recently-freed first, so the tables never grow past their peak
//! occupancy.

use std::sync::{Arc, Mutex, Weak};

use once_cell::sync::Lazy;
use thiserror::Error;
use tracing::trace;

use crate::context::ContextShared;
use crate::engine::EngineShared;

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum SlotFault {
    #[error("index {0} out of range")]
    OutOfRange(usize),
    #[error("no instance at index {0}")]
    Vacant(usize),
}

enum Entry<T> {
    Held(Weak<T>),
    Free { next: Option<usize> },
}

pub(crate) struct SlotTable<T> {
    name: &'static str,
    slots: Vec<Entry<T>>,
    next_free: Option<usize>,
    held: usize,
}

impl<T> SlotTable<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: Vec::new(),
            next_free: None,
            held: 0,
        }
    }

    /// Store a weak reference, reusing the most recently freed slot.
    pub fn add(&mut self, object: &Arc<T>) -> usize {
        let weak = Arc::downgrade(object);
        let index = match self.next_free {
            Some(index) => {
                self.next_free = match &self.slots[index] {
                    Entry::Free { next } => *next,
                    Entry::Held(_) => panic!("{} slot {index} on free list is held", self.name),
                };
                self.slots[index] = Entry::Held(weak);
                index
            }
            None => {
                self.slots.push(Entry::Held(weak));
                self.slots.len() - 1
            }
        };
        self.held += 1;
        trace!(table = self.name, slot = index, "slot added");
        index
    }

    pub fn remove(&mut self, index: usize) -> Result<(), SlotFault> {
        if index >= self.slots.len() {
            return Err(SlotFault::OutOfRange(index));
        }
        match self.slots[index] {
            Entry::Free { .. } => Err(SlotFault::Vacant(index)),
            Entry::Held(_) => {
                self.slots[index] = Entry::Free {
                    next: self.next_free,
                };
                self.next_free = Some(index);
                self.held -= 1;
                trace!(table = self.name, slot = index, "slot freed");
                Ok(())
            }
        }
    }

    /// Weak reference held at `index`, if the slot is occupied. Upgrading
    /// is the caller's problem; the referent may be mid-teardown.
    pub fn get(&self, index: usize) -> Option<Weak<T>> {
        match self.slots.get(index) {
            Some(Entry::Held(weak)) => Some(weak.clone()),
            _ => None,
        }
    }

    pub fn held(&self) -> usize {
        self.held
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

// ============================================================================
// The two process-wide tables
// ============================================================================

static ENGINES: Lazy<Mutex<SlotTable<EngineShared>>> =
    Lazy::new(|| Mutex::new(SlotTable::new("engines")));

static CONTEXTS: Lazy<Mutex<SlotTable<ContextShared>>> =
    Lazy::new(|| Mutex::new(SlotTable::new("contexts")));

pub(crate) fn engines() -> &'static Mutex<SlotTable<EngineShared>> {
    &ENGINES
}

pub(crate) fn contexts() -> &'static Mutex<SlotTable<ContextShared>> {
    &CONTEXTS
}

pub(crate) fn resolve_engine(slot: usize) -> Option<Arc<EngineShared>> {
    let weak = ENGINES.lock().unwrap().get(slot)?;
    weak.upgrade()
}

pub(crate) fn resolve_context(slot: usize) -> Option<Arc<ContextShared>> {
    let weak = CONTEXTS.lock().unwrap().get(slot)?;
    weak.upgrade()
}

/// Occupancy snapshot of one slot table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SlotStats {
    /// Slots currently holding an object.
    pub held: usize,
    /// Total slots ever grown to (the table's high-water mark).
    pub capacity: usize,
}

pub fn engine_slot_stats() -> SlotStats {
    let table = ENGINES.lock().unwrap();
    SlotStats {
        held: table.held(),
        capacity: table.capacity(),
    }
}

pub fn context_slot_stats() -> SlotStats {
    let table = CONTEXTS.lock().unwrap();
    SlotStats {
        held: table.held(),
        capacity: table.capacity(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> SlotTable<u32> {
        SlotTable::new("test")
    }

    #[test]
    fn slots_assign_sequentially_then_reuse_the_freshest_free() {
        let mut t = table();
        let a = Arc::new(1);
        let b = Arc::new(2);
        let c = Arc::new(3);
        assert_eq!(t.add(&a), 0);
        assert_eq!(t.add(&b), 1);
        assert_eq!(t.add(&c), 2);

        t.remove(1).unwrap();
        t.remove(0).unwrap();
        // LIFO: the slot freed last comes back first.
        assert_eq!(t.add(&b), 0);
        assert_eq!(t.add(&a), 1);
        assert_eq!(t.capacity(), 3);
        assert_eq!(t.held(), 3);
    }

    #[test]
    fn remove_rejects_out_of_range_and_vacant_slots() {
        let mut t = table();
        let a = Arc::new(7);
        let slot = t.add(&a);
        assert_eq!(t.remove(slot + 1), Err(SlotFault::OutOfRange(slot + 1)));
        t.remove(slot).unwrap();
        assert_eq!(t.remove(slot), Err(SlotFault::Vacant(slot)));
        assert_eq!(t.remove(slot).unwrap_err().to_string(), "no instance at index 0");
    }

    #[test]
    fn get_returns_the_stored_weak_even_after_the_referent_died() {
        let mut t = table();
        let a = Arc::new(7);
        let slot = t.add(&a);
        assert_eq!(t.get(slot).unwrap().upgrade().as_deref(), Some(&7));

        drop(a);
        // The slot is still occupied; only the upgrade fails.
        assert!(t.get(slot).unwrap().upgrade().is_none());
        assert_eq!(t.held(), 1);
        assert!(t.get(slot + 1).is_none());
    }

    #[test]
    fn capacity_never_shrinks_but_held_tracks_removals() {
        let mut t = table();
        let objs: Vec<_> = (0..4).map(Arc::new).collect();
        let slots: Vec<_> = objs.iter().map(|o| t.add(o)).collect();
        assert_eq!(t.held(), 4);
        for slot in &slots {
            t.remove(*slot).unwrap();
        }
        assert_eq!(t.held(), 0);
        assert_eq!(t.capacity(), 4);
    }
}
