// Weft
// Copyright (C) 2026 Weft Contributors

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Lock-free pools of preallocated synchronization trees.
//!
//! Elements never move: the free list is threaded through per-slot
//! `next_avail` indices, with an atomic head. An element is reachable from
//! the head XOR handed out to exactly one owner.

use std::sync::atomic::{AtomicIsize, Ordering};

/// Implemented by pool elements that must be pristine whenever they sit on
/// the free list.
pub(crate) trait PoolItem {
    fn reset(&self);
}

struct PoolSlot<T> {
    item: T,
    next_avail: AtomicIsize,
}

pub(crate) struct Pool<T> {
    slots: Box<[PoolSlot<T>]>,
    head: AtomicIsize,
}

impl<T: PoolItem> Pool<T> {
    pub fn new(count: usize, mut make: impl FnMut() -> T) -> Self {
        let slots: Box<[PoolSlot<T>]> = (0..count)
            .map(|i| PoolSlot {
                item: make(),
                next_avail: AtomicIsize::new(if i + 1 < count { (i + 1) as isize } else { -1 }),
            })
            .collect();
        Self {
            slots,
            head: AtomicIsize::new(if count == 0 { -1 } else { 0 }),
        }
    }

    /// Pop an element index off the free list, or `None` when exhausted.
    pub fn alloc(&self) -> Option<usize> {
        loop {
            let candidate = self.head.load(Ordering::Acquire);
            if candidate < 0 {
                return None;
            }
            let next = self.slots[candidate as usize].next_avail.load(Ordering::Relaxed);
            if self
                .head
                .compare_exchange_weak(candidate, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(candidate as usize);
            }
        }
    }

    /// Reset the element and push it back. The caller must be the element's
    /// sole owner.
    ///
    /// The slot's `next_avail` is written before the head CAS publishes the
    /// index, so a concurrent `alloc` can never observe a dangling link.
    pub fn free(&self, index: usize) {
        self.slots[index].item.reset();
        loop {
            let prev = self.head.load(Ordering::Acquire);
            self.slots[index].next_avail.store(prev, Ordering::Relaxed);
            if self
                .head
                .compare_exchange_weak(prev, index as isize, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn get(&self, index: usize) -> &T {
        &self.slots[index].item
    }

    #[cfg(test)]
    fn free_count(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head.load(Ordering::Acquire);
        while cur >= 0 {
            n += 1;
            cur = self.slots[cur as usize].next_avail.load(Ordering::Relaxed);
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        resets: AtomicUsize,
    }

    impl PoolItem for Counter {
        fn reset(&self) {
            self.resets.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn counter_pool(count: usize) -> Pool<Counter> {
        Pool::new(count, || Counter {
            resets: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_alloc_until_exhausted() {
        let pool = counter_pool(3);
        let mut taken = Vec::new();
        while let Some(i) = pool.alloc() {
            taken.push(i);
        }
        taken.sort_unstable();
        assert_eq!(taken, vec![0, 1, 2]);
        assert!(pool.alloc().is_none());
    }

    #[test]
    fn test_free_restores_availability() {
        let pool = counter_pool(2);
        let a = pool.alloc().expect("Failed to alloc");
        let b = pool.alloc().expect("Failed to alloc");
        assert!(pool.alloc().is_none());

        pool.free(b);
        assert_eq!(pool.free_count(), 1);
        pool.free(a);
        assert_eq!(pool.free_count(), 2);

        // Reset ran exactly once per free.
        assert_eq!(pool.get(a).resets.load(Ordering::Relaxed), 1);
        assert_eq!(pool.get(b).resets.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_element_on_free_list_xor_handed_out() {
        let pool = counter_pool(8);
        let held: Vec<usize> = (0..5).map(|_| pool.alloc().expect("Failed to alloc")).collect();
        assert_eq!(pool.free_count(), 3);
        for &i in &held {
            // A handed-out index must not be reachable from the head.
            let mut cur = pool.head.load(Ordering::Acquire);
            while cur >= 0 {
                assert_ne!(cur as usize, i);
                cur = pool.slots[cur as usize].next_avail.load(Ordering::Relaxed);
            }
        }
    }

    #[test]
    fn test_concurrent_alloc_free_keeps_every_element() {
        let pool = Arc::new(counter_pool(16));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                for _ in 0..2_000 {
                    if let Some(i) = pool.alloc() {
                        pool.free(i);
                    }
                }
            }));
        }
        for h in handles {
            h.join().expect("Failed to join pool thread");
        }
        assert_eq!(pool.free_count(), 16);
    }
}
