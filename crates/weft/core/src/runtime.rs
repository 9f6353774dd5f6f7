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

//! The runtime handle: worker lifecycle and the task / condition API.
//!
//! A [`Runtime`] is a cheap clone over shared scheduler state; capture one
//! in task bodies to spawn and sync from inside the fiber world, and use
//! [`Runtime::block_on`] to enter it from an ordinary thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::condition::Condition;
use crate::config::Config;
use crate::error::{RuntimeError, RuntimeResult};
use crate::sched::{self, ParkAction, Shared};
use crate::task::{
    GATE_EMPTY, GrainBody, GrainMeta, ReduceFn, SETTING_DETACHED, SETTING_STICKY, Task, TaskState,
    Value,
};

#[derive(Clone)]
pub struct Runtime {
    shared: Arc<Shared>,
    threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Runtime {
    /// Allocate the scheduling infrastructure (multiqueue, pools, sticky
    /// queues) and start the worker threads. Returns once every worker has
    /// finished its thread-local bootstrap.
    pub fn new(config: Config) -> RuntimeResult<Self> {
        config.validate()?;
        let shared = Arc::new(Shared::new(config));
        let barrier = Arc::new(Barrier::new(shared.config.workers + 1));

        let mut threads = Vec::with_capacity(shared.config.workers);
        for id in 0..shared.config.workers {
            let shared = Arc::clone(&shared);
            let barrier = Arc::clone(&barrier);
            let handle = thread::Builder::new()
                .name(format!("weft-worker-{id}"))
                .spawn(move || sched::worker_main(id, shared, barrier))
                .map_err(|e| RuntimeError::ThreadSpawn(e.to_string()))?;
            threads.push(handle);
        }
        barrier.wait();
        tracing::info!(workers = shared.config.workers, "runtime started");

        Ok(Self {
            shared,
            threads: Arc::new(Mutex::new(threads)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Worker index of the calling thread, or `None` off the worker pool.
    pub fn worker_id(&self) -> Option<usize> {
        sched::current_worker_id()
    }

    /// Create a task around `body`. The fiber gets a fresh guarded stack and
    /// first resumes into the trampoline.
    pub fn task_new<F>(&self, body: F) -> RuntimeResult<Arc<Task>>
    where
        F: FnOnce() -> Value + Send + 'static,
    {
        Task::new_single(
            Box::new(body),
            self.shared.config.stack_size,
            sched::task_trampoline,
        )
    }

    /// Create a grain fan-out over `[0, count)`: `G = grain_k * workers`
    /// sibling tasks sharing one arriver (and one reducer when `reduce` is
    /// given). Returns the parent (grain 0); the remaining grains stay
    /// attached to it until [`Runtime::task_spawn_multi`].
    ///
    /// `count` splits via truncated division, with the remainder given to
    /// the lowest-numbered grains; when `count < G`, trailing grains get an
    /// empty range but still take part in the barrier.
    pub fn task_new_multi<F>(
        &self,
        body: F,
        count: usize,
        reduce: Option<ReduceFn>,
    ) -> RuntimeResult<Arc<Task>>
    where
        F: Fn(usize, usize) -> Value + Send + Sync + 'static,
    {
        let grains = self.shared.grains;
        let arriver = self.shared.arrivers.alloc().ok_or(RuntimeError::PoolExhausted)?;
        let reducer = match &reduce {
            Some(_) => match self.shared.reducers.alloc() {
                Some(r) => Some(r),
                None => {
                    self.shared.arrivers.free(arriver);
                    return Err(RuntimeError::PoolExhausted);
                }
            },
            None => None,
        };
        let release_trees = |shared: &Shared| {
            shared.arrivers.free(arriver);
            if let Some(r) = reducer {
                shared.reducers.free(r);
            }
        };

        let body: GrainBody = Arc::new(body);
        let stack_size = self.shared.config.stack_size;
        let split = |i: usize| {
            let base = count / grains;
            let rem = count % grains;
            let start = i * base + i.min(rem);
            (start, start + base + usize::from(i < rem))
        };
        let meta = |i: usize, parent: Option<Arc<Task>>| {
            let (start, end) = split(i);
            GrainMeta {
                grain_num: i,
                start,
                end,
                body: Arc::clone(&body),
                reduce: reduce.clone(),
                arriver,
                reducer,
                parent,
                siblings: Mutex::new(Vec::new()),
                gate: AtomicU8::new(GATE_EMPTY),
                fanin_done: AtomicBool::new(false),
            }
        };

        let parent = match Task::new_grain(meta(0, None), stack_size, sched::task_trampoline) {
            Ok(t) => t,
            Err(e) => {
                release_trees(&self.shared);
                return Err(e);
            }
        };
        for i in 1..grains {
            match Task::new_grain(
                meta(i, Some(Arc::clone(&parent))),
                stack_size,
                sched::task_trampoline,
            ) {
                Ok(t) => {
                    let pmeta = parent.grain.as_ref().expect("parent grain metadata missing");
                    pmeta.siblings.lock().push(t);
                }
                Err(e) => {
                    release_trees(&self.shared);
                    return Err(e);
                }
            }
        }
        Ok(parent)
    }

    /// Hand `task` to the scheduler at the spawning worker's priority
    /// (priority 0 from non-worker threads). A current task that is not
    /// sticky yields behind it.
    pub fn task_spawn(&self, task: &Arc<Task>, sticky: bool, detached: bool) -> RuntimeResult<()> {
        if !task.started() {
            let mut bits = 0u8;
            if sticky {
                bits |= SETTING_STICKY;
            }
            if detached {
                bits |= SETTING_DETACHED;
            }
            if bits != 0 {
                task.add_settings(bits);
            }
        }
        let prio = sched::current_worker_id().map_or(0, |id| id as i16);
        task.set_spawned(true);
        // A sticky task reaches the multiqueue only on its very first
        // enqueue; once pinned it goes straight to its worker.
        let queued = if task.is_sticky() && task.sticky_tid() >= 0 {
            sched::enqueue_task(&self.shared, Arc::clone(task))
        } else {
            sched::insert_multiq(&self.shared, Arc::clone(task), prio)
        };
        if let Err(e) = queued {
            task.set_spawned(false);
            return Err(e);
        }
        self.yield_after_spawn();
        Ok(())
    }

    /// Spawn every grain of a fan-out created by [`Runtime::task_new_multi`].
    pub fn task_spawn_multi(&self, parent: &Arc<Task>) -> RuntimeResult<()> {
        let expected = self.shared.grains;
        let meta = parent
            .grain
            .as_ref()
            .filter(|m| m.grain_num == 0)
            .ok_or(RuntimeError::MissingSibling { expected, found: 0 })?;

        let siblings = std::mem::take(&mut *meta.siblings.lock());
        if siblings.len() + 1 != expected {
            return Err(RuntimeError::MissingSibling {
                expected,
                found: siblings.len() + 1,
            });
        }

        let prio = sched::current_worker_id().map_or(0, |id| id as i16);
        parent.set_spawned(true);
        sched::insert_multiq(&self.shared, Arc::clone(parent), prio)?;
        for sibling in siblings {
            sibling.set_spawned(true);
            sched::insert_multiq(&self.shared, sibling, prio)?;
        }
        self.yield_after_spawn();
        Ok(())
    }

    fn yield_after_spawn(&self) {
        if let Some(current) = sched::current_task() {
            // Sticky tasks stay put on their pinned worker.
            if !current.is_sticky() {
                sched::park_current(ParkAction::Requeue);
            }
        }
    }

    /// Wait for `task` and return its value.
    ///
    /// Returns `Ok(None)` for tasks that were never spawned and for
    /// detached tasks. For a grain parent with a reduction, the value is the
    /// reduction over all grains; a failed task surfaces as
    /// [`RuntimeError::TaskFailed`] with the payload left on the task.
    pub fn task_sync(&self, task: &Arc<Task>) -> RuntimeResult<Option<Value>> {
        if !task.spawned() || task.is_detached() {
            return Ok(None);
        }
        if task.state() != TaskState::Runnable && task.fanin_complete() {
            return Self::finish_sync(task);
        }
        sched::park_current(ParkAction::SyncOn(Arc::clone(task)));
        Self::finish_sync(task)
    }

    fn finish_sync(task: &Arc<Task>) -> RuntimeResult<Option<Value>> {
        match task.state() {
            TaskState::Done => {
                if task.is_reducing_parent() {
                    Ok(task.red_result())
                } else {
                    Ok(task.result())
                }
            }
            TaskState::Failed => Err(RuntimeError::TaskFailed),
            TaskState::Runnable => unreachable!("sync waiter resumed before target terminated"),
        }
    }

    /// Hand the CPU back to the scheduler; with `requeue` the task returns
    /// to its queue, otherwise it suspends until something re-enqueues it.
    pub fn task_yield(&self, requeue: bool) {
        sched::park_current(if requeue {
            ParkAction::Requeue
        } else {
            ParkAction::Suspend
        });
    }

    pub fn condition_new(&self) -> Arc<Condition> {
        Condition::new()
    }

    /// Block the current task on `cond`; returns immediately once the latch
    /// has ever fired.
    pub fn task_wait(&self, cond: &Arc<Condition>) {
        if cond.is_notified() {
            return;
        }
        sched::park_current(ParkAction::WaitOn(Arc::clone(cond)));
    }

    /// Fire the latch and re-enqueue every waiter in FIFO order. One-shot:
    /// the latch never resets.
    pub fn task_notify(&self, cond: &Arc<Condition>) {
        cond.set_notified();
        let waiters = std::mem::take(&mut *cond.waitq.lock());
        for waiter in waiters {
            sched::enqueue_task(&self.shared, waiter)
                .expect("re-enqueue of a condition waiter failed");
        }
    }

    /// Run `f` as a task and block the calling (non-worker) thread until it
    /// completes.
    pub fn block_on<F>(&self, f: F) -> RuntimeResult<Value>
    where
        F: FnOnce() -> Value + Send + 'static,
    {
        assert!(
            sched::current_worker_id().is_none(),
            "block_on called from a worker thread"
        );
        type Slot = (Mutex<Option<Result<Value, ()>>>, Condvar);
        let done: Arc<Slot> = Arc::new((Mutex::new(None), Condvar::new()));
        let signal = Arc::clone(&done);

        let task = self.task_new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(f));
            let (lock, cvar) = &*signal;
            match outcome {
                Ok(v) => {
                    *lock.lock() = Some(Ok(Arc::clone(&v)));
                    cvar.notify_all();
                    v
                }
                Err(payload) => {
                    *lock.lock() = Some(Err(()));
                    cvar.notify_all();
                    // Fail the task itself as well.
                    panic::resume_unwind(payload)
                }
            }
        })?;
        self.task_spawn(&task, false, false)?;

        let (lock, cvar) = &*done;
        let mut slot = lock.lock();
        while slot.is_none() {
            cvar.wait(&mut slot);
        }
        match slot.take().expect("completion slot emptied concurrently") {
            Ok(v) => Ok(v),
            Err(()) => Err(RuntimeError::TaskFailed),
        }
    }

    /// Ask the workers to exit once idle and join them. Must be called from
    /// a non-worker thread; idempotent.
    pub fn shutdown(&self) {
        assert!(
            sched::current_worker_id().is_none(),
            "shutdown called from a worker thread"
        );
        self.shared.shutdown.store(true, Ordering::Release);
        let handles = std::mem::take(&mut *self.threads.lock());
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            let _ = handle.join();
        }
        tracing::info!("runtime stopped");
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("workers", &self.shared.config.workers)
            .field("grains", &self.shared.grains)
            .finish()
    }
}
