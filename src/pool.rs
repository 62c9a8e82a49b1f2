//! # Buffer Free-Lists
//!
//! Slab-backed recycling pools for RXW payload buffers (`rx_data`) and
//! RXW entry metadata (`rx_packet`), guarded by a single `rx_mutex` at
//! the call site, amortising allocation on the receive hot path. Same
//! O(1) insert/remove slab idiom used for packet buffering throughout
//! this codebase, pared down to the two free-lists the concurrency
//! model names.

use slab::Slab;

/// A generic recycling pool: `take()` reuses a previously `release()`d
/// buffer when available, falling back to `Default::default()` otherwise.
pub struct BufferPool<T: Default> {
    slots: Slab<T>,
    high_water: usize,
}

impl<T: Default> BufferPool<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        BufferPool {
            slots: Slab::with_capacity(capacity),
            high_water: 0,
        }
    }

    /// Take a buffer out of the pool, creating a fresh one if empty.
    pub fn take(&mut self) -> T {
        if let Some(key) = self.slots.iter().map(|(k, _)| k).next() {
            self.slots.remove(key)
        } else {
            T::default()
        }
    }

    /// Return a buffer to the pool for reuse.
    pub fn release(&mut self, value: T) {
        let key = self.slots.insert(value);
        self.high_water = self.high_water.max(key + 1);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }
}
