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

//! The task object: user work, lifecycle state, result channels, the
//! completion queue, grain metadata and the fiber backing it all.

use std::any::Any;
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI16, AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::error::RuntimeResult;
use crate::fiber::{Context, FiberStack, ctx_init};

/// The opaque value user work produces. Shared so that every `task_sync`
/// caller can observe the same result.
pub type Value = Arc<dyn Any + Send + Sync>;

/// Box an arbitrary result into a [`Value`].
pub fn value<T: Send + Sync + 'static>(v: T) -> Value {
    Arc::new(v)
}

pub(crate) type TaskBody = Box<dyn FnOnce() -> Value + Send + 'static>;
pub(crate) type GrainBody = Arc<dyn Fn(usize, usize) -> Value + Send + Sync + 'static>;

/// A user-supplied binary reduction over grain results.
pub type ReduceFn = Arc<dyn Fn(Value, Value) -> Value + Send + Sync + 'static>;

/// Task lifecycle. Terminal states are sticky.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Runnable = 0,
    Done = 1,
    Failed = 2,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Runnable,
            1 => Self::Done,
            _ => Self::Failed,
        }
    }
}

pub(crate) const SETTING_STICKY: u8 = 1 << 0;
pub(crate) const SETTING_DETACHED: u8 = 1 << 1;

/// Park/wake handshake states for the grain parent (see `sched`).
pub(crate) const GATE_EMPTY: u8 = 0;
pub(crate) const GATE_PARKED: u8 = 1;
pub(crate) const GATE_NOTIFIED: u8 = 2;

/// Fan-out metadata shared by the sibling tasks of one `task_new_multi`.
pub(crate) struct GrainMeta {
    /// This task's grain index in `[0, G)`; grain 0 is the parent.
    pub grain_num: usize,
    /// Half-open range of the data-parallel loop assigned to this grain.
    pub start: usize,
    pub end: usize,
    pub body: GrainBody,
    pub reduce: Option<ReduceFn>,
    /// Pool index of the arriver tree shared by the fan-out.
    pub arriver: usize,
    /// Pool index of the reducer tree, when reducing.
    pub reducer: Option<usize>,
    /// Strong reference to grain 0; `None` on the parent itself. The LAST
    /// arriving grain needs it to deliver the reduction and wake the parent.
    pub parent: Option<Arc<Task>>,
    /// Grains 1..G, held by the parent until `task_spawn_multi` drains them
    /// into the multiqueue (this breaks the parent<->child reference cycle).
    pub siblings: Mutex<Vec<Arc<Task>>>,
    /// Parent park/wake handshake; only the parent's instance is used.
    pub gate: AtomicU8,
    /// Set on the parent once the fan-in (and reduction) has completed;
    /// gates the terminal fast path of `task_sync`.
    pub fanin_done: AtomicBool,
}

/// A lightweight user-space task with its own guarded stack.
///
/// Created by `Runtime::task_new` / `task_new_multi`; owned by whichever
/// queue currently references it, and by the executing worker while running.
pub struct Task {
    /// Single-task work, taken exactly once by the trampoline. `None` for
    /// grain tasks, which run `grain.body` instead.
    pub(crate) body: Mutex<Option<TaskBody>>,
    state: AtomicU8,
    started: AtomicBool,
    spawned: AtomicBool,
    settings: AtomicU8,
    prio: AtomicI16,
    current_tid: AtomicI16,
    sticky_tid: AtomicI16,
    result: Mutex<Option<Value>>,
    panic_payload: Mutex<Option<Box<dyn Any + Send>>>,
    red_result: Mutex<Option<Value>>,
    /// Completion queue: tasks suspended in `task_sync` on this task.
    /// Drained exactly once, at termination, unless DETACHED.
    pub(crate) cq: Mutex<VecDeque<Arc<Task>>>,
    pub(crate) grain: Option<GrainMeta>,
    /// Saved machine context. Only the worker that owns the current dispatch
    /// (or park) of this task may touch it.
    pub(crate) ctx: UnsafeCell<Context>,
    #[allow(dead_code)]
    stack: FiberStack,
}

// SAFETY: `ctx` and the stack are accessed only under the scheduling
// protocol (a task is dispatched by at most one worker at a time, and a
// suspended task's context is touched only by the worker resuming it).
// Every other field is atomic or lock-protected.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    pub(crate) fn new_single(
        body: TaskBody,
        stack_size: usize,
        entry: extern "C" fn() -> !,
    ) -> RuntimeResult<Arc<Self>> {
        Self::build(Some(body), None, stack_size, entry)
    }

    pub(crate) fn new_grain(
        meta: GrainMeta,
        stack_size: usize,
        entry: extern "C" fn() -> !,
    ) -> RuntimeResult<Arc<Self>> {
        Self::build(None, Some(meta), stack_size, entry)
    }

    fn build(
        body: Option<TaskBody>,
        grain: Option<GrainMeta>,
        stack_size: usize,
        entry: extern "C" fn() -> !,
    ) -> RuntimeResult<Arc<Self>> {
        let stack = FiberStack::new(stack_size)?;
        let mut ctx = Context::empty();
        // SAFETY: the stack top is fresh, page-aligned memory owned by this
        // task; the first resume enters `entry` on it.
        unsafe { ctx_init(&mut ctx, stack.top(), entry) };

        Ok(Arc::new(Self {
            body: Mutex::new(body),
            state: AtomicU8::new(TaskState::Runnable as u8),
            started: AtomicBool::new(false),
            spawned: AtomicBool::new(false),
            settings: AtomicU8::new(0),
            prio: AtomicI16::new(0),
            current_tid: AtomicI16::new(-1),
            sticky_tid: AtomicI16::new(-1),
            result: Mutex::new(None),
            panic_payload: Mutex::new(None),
            red_result: Mutex::new(None),
            cq: Mutex::new(VecDeque::new()),
            grain,
            ctx: UnsafeCell::new(ctx),
            stack,
        }))
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    /// Whether the task has ever been handed to the scheduler. `task_sync`
    /// refuses to wait on a task nobody spawned; waiting on a spawned task
    /// whose fiber has not yet begun is fine.
    pub fn spawned(&self) -> bool {
        self.spawned.load(Ordering::Acquire)
    }

    pub(crate) fn set_spawned(&self, spawned: bool) {
        self.spawned.store(spawned, Ordering::Release);
    }

    pub(crate) fn add_settings(&self, bits: u8) {
        self.settings.fetch_or(bits, Ordering::AcqRel);
    }

    pub fn is_sticky(&self) -> bool {
        self.settings.load(Ordering::Acquire) & SETTING_STICKY != 0
    }

    pub fn is_detached(&self) -> bool {
        self.settings.load(Ordering::Acquire) & SETTING_DETACHED != 0
    }

    pub(crate) fn prio(&self) -> i16 {
        self.prio.load(Ordering::Relaxed)
    }

    pub(crate) fn set_prio(&self, prio: i16) {
        self.prio.store(prio, Ordering::Relaxed);
    }

    pub(crate) fn set_current_tid(&self, tid: i16) {
        self.current_tid.store(tid, Ordering::Release);
    }

    /// Worker currently executing this task, or -1.
    pub fn current_tid(&self) -> i16 {
        self.current_tid.load(Ordering::Acquire)
    }

    /// Worker this task is pinned to, or -1 before the first sticky dispatch.
    pub fn sticky_tid(&self) -> i16 {
        self.sticky_tid.load(Ordering::Acquire)
    }

    pub(crate) fn set_sticky_tid(&self, tid: i16) {
        self.sticky_tid.store(tid, Ordering::Release);
    }

    pub(crate) fn set_result(&self, v: Value) {
        *self.result.lock() = Some(v);
    }

    pub(crate) fn result(&self) -> Option<Value> {
        self.result.lock().clone()
    }

    pub(crate) fn set_red_result(&self, v: Value) {
        *self.red_result.lock() = Some(v);
    }

    pub(crate) fn red_result(&self) -> Option<Value> {
        self.red_result.lock().clone()
    }

    pub(crate) fn set_panic_payload(&self, p: Box<dyn Any + Send>) {
        *self.panic_payload.lock() = Some(p);
    }

    /// Take the payload captured from a failed task's panic, if any.
    pub fn take_panic_payload(&self) -> Option<Box<dyn Any + Send>> {
        self.panic_payload.lock().take()
    }

    /// True once a grain parent's fan-in has fully completed; vacuously true
    /// for plain tasks.
    pub(crate) fn fanin_complete(&self) -> bool {
        match &self.grain {
            Some(meta) => meta.fanin_done.load(Ordering::Acquire),
            None => true,
        }
    }

    /// Whether `task_sync` should report the reduction result.
    pub(crate) fn is_reducing_parent(&self) -> bool {
        matches!(&self.grain, Some(meta) if meta.grain_num == 0 && meta.reduce.is_some())
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("state", &self.state())
            .field("started", &self.started())
            .field("prio", &self.prio())
            .field("sticky_tid", &self.sticky_tid())
            .field("grain", &self.grain.as_ref().map(|g| g.grain_num))
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub(crate) extern "C" fn never_entered() -> ! {
        unreachable!("test task dispatched")
    }

    /// A small-stack task for data-structure tests that never run fibers.
    pub(crate) fn dummy_task() -> Arc<Task> {
        Task::new_single(Box::new(|| value(())), 16 * 1024, never_entered)
            .expect("Failed to build test task")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::test_support::dummy_task;

    #[test]
    fn test_initial_task_state() {
        let task = dummy_task();
        assert_eq!(task.state(), TaskState::Runnable);
        assert!(!task.started());
        assert!(!task.is_sticky());
        assert!(!task.is_detached());
        assert_eq!(task.sticky_tid(), -1);
        assert_eq!(task.current_tid(), -1);
    }

    #[test]
    fn test_settings_accumulate() {
        let task = dummy_task();
        task.add_settings(SETTING_STICKY);
        assert!(task.is_sticky());
        assert!(!task.is_detached());
        task.add_settings(SETTING_DETACHED);
        assert!(task.is_sticky());
        assert!(task.is_detached());
    }

    #[test]
    fn test_result_shared_between_readers() {
        let task = dummy_task();
        task.set_result(value(7u32));
        let a = task.result().expect("Failed to read result");
        let b = task.result().expect("Failed to read result");
        assert_eq!(a.downcast_ref::<u32>(), Some(&7));
        assert_eq!(b.downcast_ref::<u32>(), Some(&7));
    }
}
