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

//! weft-core: the scheduling core of a parallel task runtime.
//!
//! A fixed pool of worker threads drives lightweight stackful fibers
//! through a randomized, lock-striped priority multiqueue. Tasks spawn
//! children, join on them, yield cooperatively, and wait on one-shot
//! condition latches; data-parallel fan-outs split a loop across
//! `grain_k * workers` sibling grains that meet in a lock-free arrival tree
//! with optional pairwise reduction.
//!
//! ```no_run
//! use weft_core::{Config, Runtime, value};
//!
//! let rt = Runtime::new(Config::default()).unwrap();
//! let out = {
//!     let rt2 = rt.clone();
//!     rt.block_on(move || {
//!         let task = rt2.task_new(|| value(41u64 + 1)).unwrap();
//!         rt2.task_spawn(&task, false, false).unwrap();
//!         rt2.task_sync(&task).unwrap().unwrap()
//!     })
//!     .unwrap()
//! };
//! assert_eq!(out.downcast_ref::<u64>(), Some(&42));
//! rt.shutdown();
//! ```

mod condition;
mod config;
mod error;
mod fiber;
mod multiqueue;
mod pool;
mod runtime;
mod sched;
mod synctree;
mod task;

pub use condition::Condition;
pub use config::{
    Config, DEFAULT_ARRIVERS_P, DEFAULT_GRAIN_K, DEFAULT_HEAP_C, DEFAULT_REDUCERS_FRAC,
    DEFAULT_STACK_SIZE, HEAP_D, PRIO_EMPTY, TASKS_PER_HEAP, WorkerHook,
};
pub use error::{RuntimeError, RuntimeResult};
pub use runtime::Runtime;
pub use task::{ReduceFn, Task, TaskState, Value, value};
