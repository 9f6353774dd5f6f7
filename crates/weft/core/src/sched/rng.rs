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

//! Per-worker heap sampling.
//!
//! Each worker owns a small fast RNG and a precomputed uniform distribution
//! over `[0, heap_count)`; the distribution's rejection sampling removes
//! modulo bias from the draws.

use rand::SeedableRng;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::SmallRng;

pub(crate) struct HeapPicker {
    rng: SmallRng,
    dist: Uniform<usize>,
    heap_count: usize,
}

impl HeapPicker {
    pub fn new(heap_count: usize) -> Self {
        debug_assert!(heap_count > 0);
        Self {
            rng: SmallRng::from_entropy(),
            dist: Uniform::new(0, heap_count),
            heap_count,
        }
    }

    /// Uniform draw in `[0, heap_count)`.
    pub fn pick(&mut self) -> usize {
        self.dist.sample(&mut self.rng)
    }

    /// Two distinct uniform draws; degenerates to a repeated index when only
    /// one heap exists.
    pub fn pick_pair(&mut self) -> (usize, usize) {
        let a = self.pick();
        if self.heap_count == 1 {
            return (a, a);
        }
        loop {
            let b = self.pick();
            if b != a {
                return (a, b);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_picks_stay_in_range() {
        let mut picker = HeapPicker::new(7);
        for _ in 0..10_000 {
            assert!(picker.pick() < 7);
        }
    }

    #[test]
    fn test_pair_is_distinct() {
        let mut picker = HeapPicker::new(4);
        for _ in 0..1_000 {
            let (a, b) = picker.pick_pair();
            assert_ne!(a, b);
            assert!(a < 4 && b < 4);
        }
    }

    #[test]
    fn test_single_heap_pair_degenerates() {
        let mut picker = HeapPicker::new(1);
        assert_eq!(picker.pick_pair(), (0, 0));
    }

    #[test]
    fn test_draws_cover_all_heaps() {
        let mut picker = HeapPicker::new(8);
        let mut seen = [false; 8];
        for _ in 0..10_000 {
            seen[picker.pick()] = true;
        }
        assert!(seen.iter().all(|&s| s), "uniform draws should hit every heap");
    }
}
