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

//! The scheduler: worker threads, fiber dispatch, and the park protocol.
//!
//! Each worker owns a root context. Fibers never hand control to each other
//! directly: a suspending fiber records a [`ParkAction`] and switches back
//! to its worker's root context, and the root loop performs the queue
//! insertion *after* the fiber is off its stack. This makes it impossible
//! for another worker to resume a fiber whose stack is still live.

pub(crate) mod rng;

use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};

use parking_lot::Mutex;

use crate::condition::Condition;
use crate::config::Config;
use crate::error::RuntimeResult;
use crate::fiber::{Context, ctx_switch};
use crate::multiqueue::MultiQueue;
use crate::pool::Pool;
use crate::sched::rng::HeapPicker;
use crate::synctree::{Arriver, Reducer};
use crate::task::{GATE_EMPTY, GATE_NOTIFIED, GATE_PARKED, Task, TaskState, Value, value};

/// Scheduler state shared by all workers and every runtime handle.
pub(crate) struct Shared {
    pub config: Config,
    /// Total grain count `G` for fan-outs.
    pub grains: usize,
    pub multiq: MultiQueue,
    /// Per-worker FIFO of pinned tasks.
    pub sticky: Box<[Mutex<VecDeque<Arc<Task>>>]>,
    pub arrivers: Pool<Arriver>,
    pub reducers: Pool<Reducer>,
    pub shutdown: AtomicBool,
}

impl Shared {
    pub fn new(config: Config) -> Self {
        let workers = config.workers;
        let grains = config.grains();
        let multiq = MultiQueue::new(config.heap_count(), workers);
        let sticky = (0..workers).map(|_| Mutex::new(VecDeque::new())).collect();
        let arrivers = Pool::new(config.num_arrivers(), || Arriver::new(grains));
        let reducers = Pool::new(config.num_reducers(), || Reducer::new(grains));
        Self {
            config,
            grains,
            multiq,
            sticky,
            arrivers,
            reducers,
            shutdown: AtomicBool::new(false),
        }
    }
}

/// What a suspending fiber asks its worker to do once it is off-stack.
pub(crate) enum ParkAction {
    /// Put the task straight back on its queue.
    Requeue,
    /// Suspend without requeueing; some other mechanism resumes the task.
    Suspend,
    /// Append the task to `target`'s completion queue (re-checking that the
    /// target is still live).
    SyncOn(Arc<Task>),
    /// Append the task to the condition's wait queue (re-checking the latch).
    WaitOn(Arc<Condition>),
    /// Grain parent awaiting fan-in; serialized with the LAST grain's wake
    /// through the parent's gate.
    GrainPark,
    /// The fiber ran to completion; the worker just drops its reference.
    Finished,
}

struct Worker {
    id: usize,
    shared: Arc<Shared>,
    picker: HeapPicker,
    root_ctx: Context,
    current: Option<Arc<Task>>,
    park: Option<ParkAction>,
}

thread_local! {
    static CURRENT_WORKER: Cell<*mut Worker> = const { Cell::new(ptr::null_mut()) };
}

/// Worker index of the calling thread, when it is a worker.
pub(crate) fn current_worker_id() -> Option<usize> {
    CURRENT_WORKER.with(|c| {
        let wp = c.get();
        // SAFETY: wp is null or points at this thread's worker.
        if wp.is_null() { None } else { Some(unsafe { (*wp).id }) }
    })
}

/// Task currently executing on the calling worker, if any.
pub(crate) fn current_task() -> Option<Arc<Task>> {
    CURRENT_WORKER.with(|c| {
        let wp = c.get();
        // SAFETY: wp is null or points at this thread's worker.
        if wp.is_null() { None } else { unsafe { (*wp).current.clone() } }
    })
}

/// Worker thread entry: bind TLS, rendezvous with the runtime constructor,
/// then run the scheduling loop until shutdown finds the worker idle.
pub(crate) fn worker_main(id: usize, shared: Arc<Shared>, barrier: Arc<Barrier>) {
    let picker = HeapPicker::new(shared.multiq.heap_count());
    let mut worker = Box::new(Worker {
        id,
        shared,
        picker,
        root_ctx: Context::empty(),
        current: None,
        park: None,
    });
    let wp: *mut Worker = &mut *worker;
    CURRENT_WORKER.with(|c| c.set(wp));
    barrier.wait();
    tracing::debug!(worker = id, "worker started");

    // SAFETY: wp points at this thread's boxed worker; from here on all
    // access goes through the pointer so fibers (which reach the worker via
    // TLS) never alias a long-lived reference.
    unsafe { run_worker(wp) };

    CURRENT_WORKER.with(|c| c.set(ptr::null_mut()));
    tracing::debug!(worker = id, "worker stopped");
}

unsafe fn run_worker(wp: *mut Worker) {
    // SAFETY: short borrows of this thread's worker.
    let shared = unsafe { Arc::clone(&(*wp).shared) };
    let id = unsafe { (*wp).id };
    let mut idle_spins = 0u32;

    loop {
        let task = shared.sticky[id].lock().pop_front();
        let task = task.or_else(|| {
            // SAFETY: the picker is only ever touched by its own thread.
            let picker = unsafe { &mut (*wp).picker };
            shared.multiq.delete_min(picker)
        });

        match task {
            Some(task) => {
                idle_spins = 0;
                // SAFETY: wp is this thread's worker.
                unsafe { dispatch(wp, &shared, task) };
            }
            None => {
                if shared.shutdown.load(Ordering::Acquire) {
                    break;
                }
                if id == 0 {
                    if let Some(hook) = shared.config.idle_hook.clone() {
                        hook();
                    }
                } else {
                    std::hint::spin_loop();
                }
                idle_spins = idle_spins.saturating_add(1);
                if idle_spins > 4096 {
                    // Long-idle worker: back off so spinning pools do not
                    // starve the rest of the process.
                    std::thread::sleep(std::time::Duration::from_micros(50));
                } else if idle_spins % 64 == 0 {
                    std::thread::yield_now();
                }
            }
        }
    }
}

/// Run one slice of `task` on this worker, then carry out whatever park
/// action the fiber left behind.
unsafe fn dispatch(wp: *mut Worker, shared: &Arc<Shared>, task: Arc<Task>) {
    // SAFETY (throughout): wp is this thread's worker; borrows are short and
    // none is live across the context switch.
    let id = unsafe { (*wp).id };
    if task.is_sticky() && task.sticky_tid() == -1 {
        // A sticky task reaches the multiqueue only on its first enqueue.
        task.set_sticky_tid(id as i16);
    }
    task.set_current_tid(id as i16);
    tracing::trace!(worker = id, ?task, "dispatch");

    unsafe {
        (*wp).current = Some(Arc::clone(&task));
        let root: *mut Context = &mut (*wp).root_ctx;
        ctx_switch(root, task.ctx.get());
    }

    // Back on the root stack: the fiber suspended or finished.
    task.set_current_tid(-1);
    let action = unsafe {
        (*wp).current = None;
        (*wp).park.take().expect("fiber returned without a park action")
    };

    match action {
        ParkAction::Finished | ParkAction::Suspend => {}
        ParkAction::Requeue => {
            enqueue_task(shared, task).expect("re-enqueue of a yielded task failed");
        }
        ParkAction::SyncOn(target) => {
            let mut cq = target.cq.lock();
            if target.state() == TaskState::Runnable || !target.fanin_complete() {
                cq.push_back(task);
            } else {
                // Terminal before the waiter parked: resume it immediately.
                drop(cq);
                enqueue_task(shared, task).expect("re-enqueue of a sync waiter failed");
            }
        }
        ParkAction::WaitOn(cond) => {
            let mut waitq = cond.waitq.lock();
            if cond.is_notified() {
                drop(waitq);
                enqueue_task(shared, task).expect("re-enqueue of a condition waiter failed");
            } else {
                waitq.push_back(task);
            }
        }
        ParkAction::GrainPark => {
            let meta = task.grain.as_ref().expect("grain park on a plain task");
            if meta
                .gate
                .compare_exchange(GATE_EMPTY, GATE_PARKED, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // The LAST grain has already notified; resume instead.
                enqueue_task(shared, task).expect("re-enqueue of a grain parent failed");
            }
        }
    }
}

/// Record `action` for the current fiber and switch back to the worker's
/// root context. Returns when the task is next dispatched, possibly on a
/// different worker.
///
/// Panics when called outside a fiber: suspension has no meaning there.
pub(crate) fn park_current(action: ParkAction) {
    let (tctx, root) = CURRENT_WORKER.with(|c| {
        let wp = c.get();
        assert!(!wp.is_null(), "task suspension outside a worker fiber");
        // SAFETY: wp is this thread's worker; the borrow ends before the
        // context switch below.
        unsafe {
            let w = &mut *wp;
            let task = w.current.as_ref().expect("parking with no current task");
            w.park = Some(action);
            let tctx: *mut Context = task.ctx.get();
            let root: *mut Context = &mut w.root_ctx;
            (tctx, root)
        }
    });
    // SAFETY: tctx is the current fiber's context slot, root the dispatching
    // worker's; the scheduling protocol guarantees exclusive access to both.
    unsafe { ctx_switch(tctx, root as *const Context) };
    run_resume_hook();
}

/// Worker 0 drains non-blocking event-loop work after a fiber resumes.
fn run_resume_hook() {
    let hook = CURRENT_WORKER.with(|c| {
        let wp = c.get();
        if wp.is_null() {
            return None;
        }
        // SAFETY: short borrow of this thread's worker.
        let w = unsafe { &*wp };
        if w.id == 0 { w.shared.config.resume_hook.clone() } else { None }
    });
    if let Some(hook) = hook {
        hook();
    }
}

/// Fiber entry point; runs exactly once per task, on the task's own stack.
pub(crate) extern "C" fn task_trampoline() -> ! {
    let (task, shared) = CURRENT_WORKER.with(|c| {
        let wp = c.get();
        assert!(!wp.is_null(), "trampoline outside a worker");
        // SAFETY: short borrow of this thread's worker.
        let w = unsafe { &*wp };
        (
            w.current.clone().expect("trampoline with no current task"),
            Arc::clone(&w.shared),
        )
    });
    task.mark_started();

    let outcome = match &task.grain {
        Some(meta) => {
            let body = Arc::clone(&meta.body);
            let (start, end) = (meta.start, meta.end);
            panic::catch_unwind(AssertUnwindSafe(move || body(start, end)))
        }
        None => {
            let body = task.body.lock().take().expect("task body already taken");
            panic::catch_unwind(AssertUnwindSafe(body))
        }
    };

    let grain_val = match outcome {
        Ok(v) => {
            task.set_result(Arc::clone(&v));
            task.set_state(TaskState::Done);
            v
        }
        Err(payload) => {
            task.set_panic_payload(payload);
            task.set_state(TaskState::Failed);
            tracing::debug!(?task, "task failed with captured panic");
            // A failed grain still joins the barrier; it contributes a unit
            // placeholder to any reduction.
            value(())
        }
    };

    if let Some(meta) = &task.grain {
        sync_grains(&shared, &task, grain_val);
        if meta.grain_num == 0 {
            meta.fanin_done.store(true, Ordering::Release);
        }
    }

    if !task.is_detached() {
        let waiters = std::mem::take(&mut *task.cq.lock());
        for waiter in waiters {
            enqueue_task(&shared, waiter).expect("re-enqueue of a completion waiter failed");
        }
    }

    // Nothing on this stack may own references past this point: the stack is
    // never unwound once the fiber reports Finished.
    drop(task);
    drop(shared);
    park_current(ParkAction::Finished);
    unreachable!("finished fiber resumed");
}

/// Fan-in (and optional reduction) at grain termination.
///
/// The LAST arriving grain owns the cleanup: it stores the reduction on the
/// parent, returns both trees to their pools, and wakes the parent at top
/// priority if the parent was not itself last. The parent, when not last,
/// parks here and resumes once the fan-in completes.
fn sync_grains(shared: &Arc<Shared>, task: &Arc<Task>, val: Value) {
    let meta = task.grain.as_ref().expect("sync_grains on a plain task");
    let grains = shared.grains;
    let arriver = shared.arrivers.get(meta.arriver);

    let root_val = match (meta.reducer, &meta.reduce) {
        (Some(ridx), Some(reduce)) => {
            shared
                .reducers
                .get(ridx)
                .arrive_reduce(arriver, reduce, grains, meta.grain_num, val)
        }
        _ => arriver.arrive(grains, meta.grain_num).then_some(val),
    };

    match root_val {
        Some(root_val) => {
            let parent = meta.parent.as_ref().unwrap_or(task);
            if meta.reduce.is_some() {
                parent.set_red_result(root_val);
            }
            // No grain may touch the trees after publishing its arrival, so
            // the LAST grain is their sole owner here.
            shared.arrivers.free(meta.arriver);
            if let Some(ridx) = meta.reducer {
                shared.reducers.free(ridx);
            }
            if meta.grain_num != 0 {
                let pmeta = parent.grain.as_ref().expect("grain parent without metadata");
                if pmeta
                    .gate
                    .compare_exchange(GATE_EMPTY, GATE_NOTIFIED, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // Parent already parked: wake it ahead of everything else.
                    insert_multiq(shared, Arc::clone(parent), 0)
                        .expect("re-enqueue of a grain parent failed");
                }
            }
        }
        None => {
            if meta.grain_num == 0 {
                park_current(ParkAction::GrainPark);
            }
        }
    }
}

/// Route a previously dispatched task back to its queue: pinned sticky tasks
/// to their worker's sticky queue, everything else to the multiqueue at the
/// task's current priority.
pub(crate) fn enqueue_task(shared: &Arc<Shared>, task: Arc<Task>) -> RuntimeResult<()> {
    if task.is_sticky() {
        let tid = task.sticky_tid();
        debug_assert!(tid >= 0, "sticky task re-enqueued before first dispatch");
        shared.sticky[tid as usize].lock().push_back(task);
        return Ok(());
    }
    let prio = task.prio();
    insert_multiq(shared, task, prio)
}

/// Insert into the multiqueue using the calling worker's sampler, or a
/// throwaway sampler on non-worker (bootstrap) threads.
pub(crate) fn insert_multiq(shared: &Arc<Shared>, task: Arc<Task>, prio: i16) -> RuntimeResult<()> {
    CURRENT_WORKER.with(|c| {
        let wp = c.get();
        if wp.is_null() {
            let mut picker = HeapPicker::new(shared.multiq.heap_count());
            shared.multiq.insert(task, prio, &mut picker)
        } else {
            // SAFETY: the picker is only ever touched by its own thread.
            let picker = unsafe { &mut (*wp).picker };
            shared.multiq.insert(task, prio, picker)
        }
    })
}
