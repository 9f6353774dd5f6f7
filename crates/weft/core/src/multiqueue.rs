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

//! Concurrent priority multiqueue.
//!
//! `heap_c * W` independently locked 8-ary min-heaps of fixed capacity,
//! each publishing its current root priority in an atomic summary. Inserts
//! pick a random heap (redrawing while the lock is contended); extraction
//! samples two heaps, commits to the better summary, and re-validates it
//! under the lock. The result is approximate min-priority extraction with
//! no global lock.
//!
//! The published summary is advisory: readers may observe a stale value and
//! must re-validate under the heap lock before extracting.

use std::sync::Arc;
use std::sync::atomic::{AtomicI16, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::config::{HEAP_D, PRIO_EMPTY, TASKS_PER_HEAP};
use crate::error::{RuntimeError, RuntimeResult};
use crate::sched::rng::HeapPicker;
use crate::task::Task;

struct Heap {
    slots: Mutex<Vec<Arc<Task>>>,
    /// Published root priority, `PRIO_EMPTY` when the heap is empty.
    prio: AtomicI16,
}

impl Heap {
    fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::with_capacity(TASKS_PER_HEAP)),
            prio: AtomicI16::new(PRIO_EMPTY),
        }
    }
}

pub(crate) struct MultiQueue {
    heaps: Box<[CachePadded<Heap>]>,
    /// Probe rounds for `delete_min` (the worker count).
    probe_rounds: usize,
}

impl MultiQueue {
    pub fn new(heap_count: usize, probe_rounds: usize) -> Self {
        let heaps = (0..heap_count).map(|_| CachePadded::new(Heap::new())).collect();
        Self {
            heaps,
            probe_rounds: probe_rounds.max(1),
        }
    }

    pub fn heap_count(&self) -> usize {
        self.heaps.len()
    }

    /// Store `task` at `prio` in one randomly chosen heap.
    ///
    /// Fails with `QueueFull` when the chosen heap is at capacity; per the
    /// enqueue contract there is no retry on another heap.
    pub fn insert(&self, task: Arc<Task>, prio: i16, picker: &mut HeapPicker) -> RuntimeResult<()> {
        task.set_prio(prio);
        let mut r = picker.pick();
        let mut slots = loop {
            match self.heaps[r].slots.try_lock() {
                Some(guard) => break guard,
                None => r = picker.pick(),
            }
        };

        if slots.len() == TASKS_PER_HEAP {
            drop(slots);
            tracing::debug!(heap = r, "multiqueue heap at capacity");
            return Err(RuntimeError::QueueFull);
        }
        slots.push(task);
        sift_up(&mut slots);
        drop(slots);

        // Advisory summary bump: one CAS, no loop. A concurrent insert or
        // delete may legitimately win the race.
        let published = self.heaps[r].prio.load(Ordering::Acquire);
        if prio < published {
            let _ = self.heaps[r].prio.compare_exchange(
                published,
                prio,
                Ordering::Release,
                Ordering::Relaxed,
            );
        }
        Ok(())
    }

    /// Extract a task of approximately minimum priority, or `None` when all
    /// probed heaps appear empty for `probe_rounds` rounds.
    pub fn delete_min(&self, picker: &mut HeapPicker) -> Option<Arc<Task>> {
        for _ in 0..self.probe_rounds {
            let (r1, r2) = picker.pick_pair();
            let p1 = self.heaps[r1].prio.load(Ordering::Acquire);
            let p2 = self.heaps[r2].prio.load(Ordering::Acquire);
            let (r, observed) = if p2 < p1 { (r2, p2) } else { (r1, p1) };
            if observed == PRIO_EMPTY {
                continue;
            }
            let Some(mut slots) = self.heaps[r].slots.try_lock() else {
                continue;
            };
            // The summary may have moved since the unlocked read; only a
            // still-matching heap is committed to.
            if self.heaps[r].prio.load(Ordering::Acquire) != observed {
                continue;
            }
            if slots.is_empty() {
                // An insert-side CAS can publish the priority of a task that
                // was already extracted; heal the summary and move on.
                self.heaps[r].prio.store(PRIO_EMPTY, Ordering::Release);
                continue;
            }

            let task = if slots.len() == 1 {
                slots.pop().expect("heap summary valid but heap empty")
            } else {
                let task = slots.swap_remove(0);
                sift_down(&mut slots, 0);
                task
            };
            let new_prio = slots.first().map(|t| t.prio()).unwrap_or(PRIO_EMPTY);
            self.heaps[r].prio.store(new_prio, Ordering::Release);
            return Some(task);
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        for (i, heap) in self.heaps.iter().enumerate() {
            let slots = heap.slots.lock();
            for c in 1..slots.len() {
                let parent = (c - 1) / HEAP_D;
                assert!(
                    slots[parent].prio() <= slots[c].prio(),
                    "heap {i}: order violated at slot {c}"
                );
            }
            let published = heap.prio.load(Ordering::Acquire);
            match slots.first() {
                Some(root) => assert_eq!(published, root.prio(), "heap {i}: stale summary"),
                None => assert_eq!(published, PRIO_EMPTY, "heap {i}: summary of empty heap"),
            }
        }
    }
}

/// Bubble the just-appended last slot up while it beats its parent.
fn sift_up(slots: &mut [Arc<Task>]) {
    let mut i = slots.len() - 1;
    while i > 0 {
        let parent = (i - 1) / HEAP_D;
        if slots[i].prio() <= slots[parent].prio() {
            slots.swap(i, parent);
            i = parent;
        } else {
            break;
        }
    }
}

/// Restore heap order below `i` after the root was replaced by the last
/// slot. Children are scanned in index order; every child that beats the
/// current value is swapped in and its subtree repaired, so the node ends
/// holding the minimum of itself and its children.
fn sift_down(slots: &mut Vec<Arc<Task>>, i: usize) {
    let len = slots.len();
    let first = HEAP_D * i + 1;
    if first >= len {
        return;
    }
    let last = (HEAP_D * i + HEAP_D).min(len - 1);
    for child in first..=last {
        if slots[child].prio() <= slots[i].prio() {
            slots.swap(i, child);
            sift_down(slots, child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::test_support::dummy_task;
    use proptest::prelude::*;

    fn single_heap_queue() -> (MultiQueue, HeapPicker) {
        (MultiQueue::new(1, 1), HeapPicker::new(1))
    }

    #[test]
    fn test_insert_then_delete_min_orders_by_priority() {
        let (mq, mut picker) = single_heap_queue();
        for prio in [5i16, -3, 9, 0, 2, -3, 7] {
            mq.insert(dummy_task(), prio, &mut picker).expect("Failed to insert");
        }
        mq.check_invariants();

        let mut drained = Vec::new();
        while let Some(task) = mq.delete_min(&mut picker) {
            drained.push(task.prio());
        }
        assert_eq!(drained, vec![-3, -3, 0, 2, 5, 7, 9]);
        mq.check_invariants();
    }

    #[test]
    fn test_empty_queue_returns_none() {
        let (mq, mut picker) = single_heap_queue();
        assert!(mq.delete_min(&mut picker).is_none());
    }

    #[test]
    fn test_full_heap_rejects_insert_and_keeps_state() {
        let (mq, mut picker) = single_heap_queue();
        for i in 0..TASKS_PER_HEAP {
            mq.insert(dummy_task(), i as i16, &mut picker).expect("Failed to fill heap");
        }
        assert!(matches!(
            mq.insert(dummy_task(), 0, &mut picker),
            Err(RuntimeError::QueueFull)
        ));
        mq.check_invariants();

        let mut count = 0;
        while mq.delete_min(&mut picker).is_some() {
            count += 1;
        }
        assert_eq!(count, TASKS_PER_HEAP);
    }

    #[test]
    fn test_multi_heap_drains_every_task() {
        let mq = MultiQueue::new(8, 4);
        let mut picker = HeapPicker::new(8);
        for i in 0..200 {
            mq.insert(dummy_task(), (i % 17) as i16, &mut picker).expect("Failed to insert");
        }
        mq.check_invariants();

        let mut drained = 0;
        let mut misses = 0;
        while misses < 100 {
            match mq.delete_min(&mut picker) {
                Some(_) => {
                    drained += 1;
                    misses = 0;
                }
                None => misses += 1,
            }
        }
        assert_eq!(drained, 200);
        mq.check_invariants();
    }

    #[test]
    fn test_concurrent_insert_delete_loses_nothing() {
        let mq = std::sync::Arc::new(MultiQueue::new(4, 4));
        let inserted = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let drained = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let mq = std::sync::Arc::clone(&mq);
            let inserted = std::sync::Arc::clone(&inserted);
            handles.push(std::thread::spawn(move || {
                let mut picker = HeapPicker::new(mq.heap_count());
                for i in 0..500 {
                    if mq.insert(dummy_task(), (i % 11) as i16, &mut picker).is_ok() {
                        inserted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }));
        }
        for h in handles {
            h.join().expect("Failed to join inserter");
        }

        let mut handles = Vec::new();
        for _ in 0..2 {
            let mq = std::sync::Arc::clone(&mq);
            let drained = std::sync::Arc::clone(&drained);
            handles.push(std::thread::spawn(move || {
                let mut picker = HeapPicker::new(mq.heap_count());
                let mut misses = 0;
                while misses < 200 {
                    match mq.delete_min(&mut picker) {
                        Some(_) => {
                            drained.fetch_add(1, Ordering::Relaxed);
                            misses = 0;
                        }
                        None => misses += 1,
                    }
                }
            }));
        }
        for h in handles {
            h.join().expect("Failed to join drainer");
        }
        // Under concurrency the published summaries are advisory, so only
        // the conservation property is checked here.
        assert_eq!(drained.load(Ordering::Relaxed), inserted.load(Ordering::Relaxed));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_heap_invariants_hold_under_mixed_ops(ops in proptest::collection::vec(
            prop_oneof![
                (-50i16..50).prop_map(Some),
                Just(None),
            ],
            1..120,
        )) {
            let (mq, mut picker) = single_heap_queue();
            let mut live = 0usize;
            for op in ops {
                match op {
                    Some(prio) => {
                        if mq.insert(dummy_task(), prio, &mut picker).is_ok() {
                            live += 1;
                        }
                    }
                    None => {
                        if mq.delete_min(&mut picker).is_some() {
                            live -= 1;
                        }
                    }
                }
                mq.check_invariants();
            }
            let mut drained = 0;
            while mq.delete_min(&mut picker).is_some() {
                drained += 1;
            }
            prop_assert_eq!(drained, live);
        }
    }
}
