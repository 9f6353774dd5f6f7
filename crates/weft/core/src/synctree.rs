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

//! Fan-in synchronization trees for grain fan-outs.
//!
//! An [`Arriver`] is an implicit binary tree of arrival counters over `G`
//! leaves. Each terminating grain ascends from its leaf; the first arrival
//! at an internal node stops, the second continues, and the grain that
//! completes the ascent is LAST and owns the cleanup.
//!
//! A [`Reducer`] is a tree of value slots aligned with an arriver. Grains
//! write their value at their leaf; each second arrival combines the value
//! it carries with the sibling subtree's slot and stores the combination at
//! the parent, so the LAST grain leaves the root holding the full reduction.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicI16, Ordering};

use crate::pool::PoolItem;
use crate::task::{ReduceFn, Value};

/// Arrival-counter tree over `grains` leaves: `grains - 1` internal nodes.
/// Every counter is zero whenever the arriver is on the free list.
pub(crate) struct Arriver {
    counts: Box<[AtomicI16]>,
}

impl Arriver {
    pub fn new(grains: usize) -> Self {
        let counts = (0..grains.saturating_sub(1)).map(|_| AtomicI16::new(0)).collect();
        Self { counts }
    }

    /// Ascend from `grain_num`'s leaf. Returns true when the caller is LAST.
    pub fn arrive(&self, grains: usize, grain_num: usize) -> bool {
        let mut aidx = leaf_index(grains, grain_num);
        while aidx > 0 {
            aidx = (aidx - 1) >> 1;
            let prev = self.counts[aidx].fetch_add(1, Ordering::AcqRel);
            if prev == 0 {
                return false;
            }
            debug_assert_eq!(prev, 1, "arrival counter overflow at node {aidx}");
        }
        true
    }
}

impl PoolItem for Arriver {
    fn reset(&self) {
        for c in &self.counts {
            c.store(0, Ordering::Relaxed);
        }
    }
}

/// Value-slot tree of `2 * grains - 1` nodes. All slots are empty whenever
/// the reducer is on the free list.
pub(crate) struct Reducer {
    vals: Box<[Mutex<Option<Value>>]>,
}

impl Reducer {
    pub fn new(grains: usize) -> Self {
        let vals = (0..2 * grains - 1).map(|_| Mutex::new(None)).collect();
        Self { vals }
    }

    /// Combined ascent and pairwise reduction for `grain_num`, contributing
    /// `val`. Returns `Some(root value)` when the caller is LAST, `None`
    /// otherwise.
    ///
    /// Both reduction operands come from the tree: the value the ascending
    /// grain carries (the content of its own node) and the sibling subtree's
    /// slot. Slot visibility between the two arrivals rides the
    /// acquire/release ordering of the arrival counters.
    pub fn arrive_reduce(
        &self,
        arriver: &Arriver,
        reduce: &ReduceFn,
        grains: usize,
        grain_num: usize,
        val: Value,
    ) -> Option<Value> {
        let mut ridx = leaf_index(grains, grain_num);
        *self.vals[ridx].lock() = Some(val.clone());
        let mut acc = val;
        let mut aidx = ridx;
        while aidx > 0 {
            let nidx = if ridx % 2 == 1 { ridx + 1 } else { ridx - 1 };
            aidx = (aidx - 1) >> 1;
            let prev = arriver.counts[aidx].fetch_add(1, Ordering::AcqRel);
            if prev == 0 {
                return None;
            }
            debug_assert_eq!(prev, 1, "arrival counter overflow at node {aidx}");
            let sibling = self.vals[nidx]
                .lock()
                .take()
                .expect("sibling slot empty at second arrival");
            acc = reduce(acc, sibling);
            ridx = aidx;
            *self.vals[ridx].lock() = Some(acc.clone());
        }
        Some(acc)
    }
}

impl PoolItem for Reducer {
    fn reset(&self) {
        for v in &self.vals {
            v.lock().take();
        }
    }
}

/// Leaf of grain `i` in the implicit tree of `2G - 1` nodes.
fn leaf_index(grains: usize, grain_num: usize) -> usize {
    debug_assert!(grain_num < grains);
    grain_num + grains - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::value;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn sum_reducer() -> ReduceFn {
        Arc::new(|a: Value, b: Value| {
            let a = *a.downcast_ref::<u64>().expect("Failed to downcast operand");
            let b = *b.downcast_ref::<u64>().expect("Failed to downcast operand");
            value(a + b)
        })
    }

    #[test]
    fn test_exactly_one_last_sequential() {
        for grains in [1usize, 2, 3, 8, 13] {
            let arriver = Arriver::new(grains);
            let last: Vec<bool> = (0..grains).map(|i| arriver.arrive(grains, i)).collect();
            assert_eq!(
                last.iter().filter(|&&l| l).count(),
                1,
                "grains = {grains}: exactly one LAST expected"
            );
        }
    }

    #[test]
    fn test_exactly_one_last_concurrent() {
        let grains = 16;
        let arriver = Arc::new(Arriver::new(grains));
        let lasts = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for i in 0..grains {
            let arriver = Arc::clone(&arriver);
            let lasts = Arc::clone(&lasts);
            handles.push(std::thread::spawn(move || {
                if arriver.arrive(grains, i) {
                    lasts.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().expect("Failed to join arriver thread");
        }
        assert_eq!(lasts.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_counters_zero_after_reset() {
        let grains = 8;
        let arriver = Arriver::new(grains);
        for i in 0..grains {
            arriver.arrive(grains, i);
        }
        arriver.reset();
        for c in arriver.counts.iter() {
            assert_eq!(c.load(Ordering::Relaxed), 0);
        }
    }

    #[test]
    fn test_reduction_sums_all_grains() {
        let grains = 8;
        let arriver = Arriver::new(grains);
        let reducer = Reducer::new(grains);
        let reduce = sum_reducer();

        let mut root = None;
        for i in 0..grains {
            if let Some(v) = reducer.arrive_reduce(&arriver, &reduce, grains, i, value(i as u64)) {
                assert!(root.is_none(), "two grains claimed LAST");
                root = Some(v);
            }
        }
        let root = root.expect("Failed to produce a root value");
        assert_eq!(root.downcast_ref::<u64>(), Some(&28)); // 0 + 1 + .. + 7
    }

    #[test]
    fn test_concurrent_reduction() {
        let grains = 16;
        let arriver = Arc::new(Arriver::new(grains));
        let reducer = Arc::new(Reducer::new(grains));
        let reduce = sum_reducer();

        let mut handles = Vec::new();
        for i in 0..grains {
            let arriver = Arc::clone(&arriver);
            let reducer = Arc::clone(&reducer);
            let reduce = Arc::clone(&reduce);
            handles.push(std::thread::spawn(move || {
                reducer
                    .arrive_reduce(&arriver, &reduce, grains, i, value(i as u64))
                    .map(|v| *v.downcast_ref::<u64>().expect("Failed to downcast root"))
            }));
        }
        let roots: Vec<u64> = handles
            .into_iter()
            .filter_map(|h| h.join().expect("Failed to join reducer thread"))
            .collect();
        assert_eq!(roots, vec![120]); // 0 + 1 + .. + 15
    }

    #[test]
    fn test_single_grain_is_immediately_last() {
        let arriver = Arriver::new(1);
        assert!(arriver.arrive(1, 0));

        let reducer = Reducer::new(1);
        let root = reducer
            .arrive_reduce(&arriver, &sum_reducer(), 1, 0, value(9u64))
            .expect("single grain must be LAST");
        assert_eq!(root.downcast_ref::<u64>(), Some(&9));
    }

    #[test]
    fn test_reducer_slots_empty_after_reset() {
        let grains = 4;
        let arriver = Arriver::new(grains);
        let reducer = Reducer::new(grains);
        let reduce = sum_reducer();
        for i in 0..grains {
            reducer.arrive_reduce(&arriver, &reduce, grains, i, value(1u64));
        }
        reducer.reset();
        for slot in reducer.vals.iter() {
            assert!(slot.lock().is_none());
        }
    }
}
