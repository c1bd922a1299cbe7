//! Generational slot arena
//!
//! Backs every handle the engine hands out. Freed slots go on a free list
//! and are reused with a bumped generation, so handles to dead objects
//! never resolve to the object that took their slot.

/// Slot arena with generation counters and free-list reuse.
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    item: Option<T>,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Place an item, reusing a freed slot when one exists.
    /// Returns `(index, generation)`.
    pub fn insert(&mut self, item: T) -> (u32, u32) {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.item.is_none());
            slot.item = Some(item);
            (index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                item: Some(item),
            });
            (index, 0)
        }
    }

    pub fn get(&self, index: u32, generation: u32) -> Option<&T> {
        self.slots
            .get(index as usize)
            .filter(|s| s.generation == generation)
            .and_then(|s| s.item.as_ref())
    }

    pub fn get_mut(&mut self, index: u32, generation: u32) -> Option<&mut T> {
        self.slots
            .get_mut(index as usize)
            .filter(|s| s.generation == generation)
            .and_then(|s| s.item.as_mut())
    }

    /// Remove an item. The slot's generation is bumped so outstanding
    /// handles to it stop resolving.
    pub fn remove(&mut self, index: u32, generation: u32) -> Option<T> {
        let slot = self
            .slots
            .get_mut(index as usize)
            .filter(|s| s.generation == generation)?;
        let item = slot.item.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        self.live -= 1;
        Some(item)
    }

    /// Visit every occupied slot as `(index, generation, item)`.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.item
                .as_ref()
                .map(|item| (index as u32, slot.generation, item))
        })
    }

    /// Number of occupied slots.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Total slots ever allocated (occupancy high-water mark).
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut arena = Arena::new();
        let (i, g) = arena.insert("alpha");
        assert_eq!(arena.get(i, g), Some(&"alpha"));
        assert_eq!(arena.live(), 1);
        assert_eq!(arena.remove(i, g), Some("alpha"));
        assert_eq!(arena.live(), 0);
        assert_eq!(arena.get(i, g), None);
    }

    #[test]
    fn freed_slot_is_reused_with_new_generation() {
        let mut arena = Arena::new();
        let (i0, g0) = arena.insert(10);
        arena.remove(i0, g0).unwrap();
        let (i1, g1) = arena.insert(20);
        assert_eq!(i1, i0, "freed slot should be handed out again");
        assert_ne!(g1, g0);
        assert_eq!(arena.get(i0, g0), None, "stale handle must not resolve");
        assert_eq!(arena.get(i1, g1), Some(&20));
    }

    #[test]
    fn remove_twice_fails_cleanly() {
        let mut arena = Arena::new();
        let (i, g) = arena.insert(1u32);
        assert!(arena.remove(i, g).is_some());
        assert!(arena.remove(i, g).is_none());
    }

    #[test]
    fn iter_visits_only_occupied_slots() {
        let mut arena = Arena::new();
        let (i0, g0) = arena.insert("a");
        arena.insert("b");
        arena.remove(i0, g0);
        let seen: Vec<_> = arena.iter().map(|(_, _, item)| *item).collect();
        assert_eq!(seen, vec!["b"]);
    }

    #[test]
    fn capacity_tracks_high_water_mark() {
        let mut arena = Arena::new();
        let handles: Vec<_> = (0..4).map(|n| arena.insert(n)).collect();
        for (i, g) in handles {
            arena.remove(i, g);
        }
        // Reuse should not grow the slot vector.
        for n in 0..4 {
            arena.insert(n);
        }
        assert_eq!(arena.capacity(), 4);
    }
}
