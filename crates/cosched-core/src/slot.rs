//! Generational slot arena
//!
//! Values live in a growable array of slots addressed by `SlotKey`
//! (index + generation). Releasing a slot bumps its generation, so a key
//! kept past its owner's lifetime resolves to `None` instead of aliasing
//! whatever reuses the index. Freed indices are recycled LIFO for cache
//! locality.
//!
//! The coroutine entry trampoline uses this to find its coroutine from a
//! plain integer argument, without holding an owning handle to itself.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::spinlock::SpinLock;

/// Key into a `SlotTable`
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    index: u32,
    generation: u32,
}

impl SlotKey {
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Pack into one machine word (generation high, index low)
    #[inline]
    pub const fn to_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        SlotKey {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

impl fmt::Debug for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotKey({}v{})", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    occupied: bool,
    value: Option<T>,
}

struct Slots<T> {
    entries: Vec<Slot<T>>,
    free: Vec<u32>,
}

/// Thread-safe generational arena
pub struct SlotTable<T> {
    inner: SpinLock<Slots<T>>,
    live: AtomicU32,
}

impl<T> SlotTable<T> {
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(Slots {
                entries: Vec::new(),
                free: Vec::new(),
            }),
            live: AtomicU32::new(0),
        }
    }

    /// Claim a slot without a value yet; `fill` publishes it later.
    pub fn reserve(&self) -> SlotKey {
        let mut slots = self.inner.lock();
        let key = match slots.free.pop() {
            Some(index) => {
                let slot = &mut slots.entries[index as usize];
                slot.occupied = true;
                SlotKey { index, generation: slot.generation }
            }
            None => {
                let index = slots.entries.len() as u32;
                slots.entries.push(Slot { generation: 0, occupied: true, value: None });
                SlotKey { index, generation: 0 }
            }
        };
        self.live.fetch_add(1, Ordering::Relaxed);
        key
    }

    /// Store a value in a reserved slot. Returns false for a stale key.
    pub fn fill(&self, key: SlotKey, value: T) -> bool {
        let mut slots = self.inner.lock();
        match slots.entries.get_mut(key.index as usize) {
            Some(slot) if slot.occupied && slot.generation == key.generation => {
                slot.value = Some(value);
                true
            }
            _ => false,
        }
    }

    /// Release a slot, invalidating every copy of `key`
    pub fn remove(&self, key: SlotKey) -> Option<T> {
        let mut slots = self.inner.lock();
        let slot = slots.entries.get_mut(key.index as usize)?;
        if !slot.occupied || slot.generation != key.generation {
            return None;
        }
        slot.occupied = false;
        slot.generation = slot.generation.wrapping_add(1);
        let value = slot.value.take();
        slots.free.push(key.index);
        self.live.fetch_sub(1, Ordering::Relaxed);
        value
    }

    /// Number of occupied slots
    #[inline]
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Copy> SlotTable<T> {
    /// Look up the value behind `key`; `None` if stale or not yet filled
    pub fn get(&self, key: SlotKey) -> Option<T> {
        let slots = self.inner.lock();
        let slot = slots.entries.get(key.index as usize)?;
        if slot.occupied && slot.generation == key.generation {
            slot.value
        } else {
            None
        }
    }
}

impl<T> Default for SlotTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert<T: Copy>(table: &SlotTable<T>, value: T) -> SlotKey {
        let key = table.reserve();
        assert!(table.fill(key, value));
        key
    }

    #[test]
    fn test_fill_get_remove() {
        let table = SlotTable::new();
        let a = insert(&table, 10u32);
        let b = insert(&table, 20u32);

        assert_eq!(table.get(a), Some(10));
        assert_eq!(table.get(b), Some(20));
        assert_eq!(table.len(), 2);

        assert_eq!(table.remove(a), Some(10));
        assert_eq!(table.get(a), None);
        assert_eq!(table.remove(a), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_reuse_bumps_generation() {
        let table = SlotTable::new();
        let a = insert(&table, 1u8);
        table.remove(a);

        // LIFO reuse of the freed index
        let b = insert(&table, 2u8);
        assert_eq!(b.index(), a.index());
        assert_ne!(b.generation(), a.generation());
        assert_eq!(table.get(a), None);
        assert_eq!(table.get(b), Some(2));
    }

    #[test]
    fn test_reserve_then_fill() {
        let table = SlotTable::new();
        let key = table.reserve();
        assert_eq!(table.get(key), None::<u64>);
        assert!(table.fill(key, 7));
        assert_eq!(table.get(key), Some(7));

        table.remove(key);
        assert!(!table.fill(key, 8));
    }

    #[test]
    fn test_raw_roundtrip() {
        let key = SlotKey { index: 12, generation: 3 };
        assert_eq!(SlotKey::from_raw(key.to_raw()), key);
    }

    #[test]
    fn test_concurrent_reserve() {
        use std::sync::Arc;
        use std::thread;

        let table = Arc::new(SlotTable::new());
        let mut handles = vec![];
        for t in 0..4u32 {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                (0..500u32).map(|i| insert(&table, t * 1000 + i)).collect::<Vec<_>>()
            }));
        }

        let mut keys = vec![];
        for h in handles {
            keys.extend(h.join().unwrap());
        }
        assert_eq!(table.len(), 2000);

        let mut indices: Vec<_> = keys.iter().map(|k| k.index()).collect();
        indices.sort();
        indices.dedup();
        assert_eq!(indices.len(), 2000);
    }
}
