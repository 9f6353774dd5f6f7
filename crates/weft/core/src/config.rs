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

//! Runtime tunables and compile-time scheduling constants.

use std::fmt;
use std::sync::Arc;

use crate::error::{RuntimeError, RuntimeResult};

/// Arity of each multiqueue heap.
pub const HEAP_D: usize = 8;

/// Fixed slot capacity of each multiqueue heap.
pub const TASKS_PER_HEAP: usize = 129;

/// Published priority summary of an empty heap. Lower values are higher
/// priority, so the empty sentinel sorts after every real task.
pub const PRIO_EMPTY: i16 = i16::MAX;

/// Default heaps per worker.
pub const DEFAULT_HEAP_C: usize = 4;

/// Default grains per worker for data-parallel fan-outs.
pub const DEFAULT_GRAIN_K: usize = 4;

/// Default arriver pool exponent: the pool holds `G^ARRIVERS_P + 1` trees,
/// where `G` is the total grain count.
pub const DEFAULT_ARRIVERS_P: u32 = 2;

/// Default reducer pool multiplier relative to the arriver pool.
pub const DEFAULT_REDUCERS_FRAC: usize = 1;

/// Default fiber stack size (1 MiB, rounded up to page size at allocation).
pub const DEFAULT_STACK_SIZE: usize = 1 << 20;

/// Callback invoked by worker 0 at its event-loop integration points.
pub type WorkerHook = Arc<dyn Fn() + Send + Sync>;

/// Runtime configuration.
///
/// All fields default to the values above; `workers` defaults to the number
/// of available CPUs.
#[derive(Clone)]
pub struct Config {
    /// Number of OS worker threads.
    pub workers: usize,
    /// Grains per worker: a fan-out produces `grain_k * workers` tasks.
    pub grain_k: usize,
    /// Heaps per worker: the multiqueue holds `heap_c * workers` heaps.
    pub heap_c: usize,
    /// Arriver pool exponent (`G^arrivers_p + 1` preallocated trees).
    pub arrivers_p: u32,
    /// Reducer pool multiplier (`num_arrivers * reducers_frac` trees).
    pub reducers_frac: usize,
    /// Fiber stack size in bytes.
    pub stack_size: usize,
    /// Invoked by worker 0 on each idle scheduler pass.
    pub idle_hook: Option<WorkerHook>,
    /// Invoked by worker 0 after a fiber resumes from a yield.
    pub resume_hook: Option<WorkerHook>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            grain_k: DEFAULT_GRAIN_K,
            heap_c: DEFAULT_HEAP_C,
            arrivers_p: DEFAULT_ARRIVERS_P,
            reducers_frac: DEFAULT_REDUCERS_FRAC,
            stack_size: DEFAULT_STACK_SIZE,
            idle_hook: None,
            resume_hook: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("workers", &self.workers)
            .field("grain_k", &self.grain_k)
            .field("heap_c", &self.heap_c)
            .field("arrivers_p", &self.arrivers_p)
            .field("reducers_frac", &self.reducers_frac)
            .field("stack_size", &self.stack_size)
            .field("idle_hook", &self.idle_hook.as_ref().map(|_| ".."))
            .field("resume_hook", &self.resume_hook.as_ref().map(|_| ".."))
            .finish()
    }
}

impl Config {
    /// Total grain count `G` for fan-outs.
    pub fn grains(&self) -> usize {
        self.grain_k * self.workers
    }

    /// Total heap count of the multiqueue.
    pub fn heap_count(&self) -> usize {
        self.heap_c * self.workers
    }

    /// Number of preallocated arriver trees.
    pub fn num_arrivers(&self) -> usize {
        self.grains().pow(self.arrivers_p) + 1
    }

    /// Number of preallocated reducer trees.
    pub fn num_reducers(&self) -> usize {
        self.num_arrivers() * self.reducers_frac
    }

    pub(crate) fn validate(&self) -> RuntimeResult<()> {
        if self.workers == 0 {
            return Err(RuntimeError::InvalidConfig("workers must be at least 1".into()));
        }
        if self.grain_k == 0 || self.heap_c == 0 {
            return Err(RuntimeError::InvalidConfig("grain_k and heap_c must be at least 1".into()));
        }
        if self.stack_size < 4096 {
            return Err(RuntimeError::InvalidConfig("stack_size must be at least one page".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().expect("Failed to validate default config");
        assert_eq!(config.grains(), DEFAULT_GRAIN_K * config.workers);
        assert_eq!(config.heap_count(), DEFAULT_HEAP_C * config.workers);
    }

    #[test]
    fn test_pool_sizing() {
        let config = Config {
            workers: 2,
            grain_k: 4,
            ..Config::default()
        };
        // G = 8, so 8^2 + 1 arrivers and the same number of reducers.
        assert_eq!(config.num_arrivers(), 65);
        assert_eq!(config.num_reducers(), 65);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let zero_workers = Config {
            workers: 0,
            ..Config::default()
        };
        assert!(matches!(zero_workers.validate(), Err(RuntimeError::InvalidConfig(_))));

        let tiny_stack = Config {
            stack_size: 128,
            ..Config::default()
        };
        assert!(matches!(tiny_stack.validate(), Err(RuntimeError::InvalidConfig(_))));
    }
}
