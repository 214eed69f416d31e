//! Single-threaded work queues: [`immediate::ImmediateQueue`] (C3) and
//! [`deferred::DeferredQueue`] (C4).

pub mod deferred;
pub mod immediate;

use crate::task::deferred::{DeferredTask, DynamicDeferredTask};
use crate::task::{DynamicTask, OwnerHandle, Task, TaskCore, TaskState};
use std::sync::Arc;

/// Internal representation of a linked plain task: either a shared
/// handle to a STATIC task or sole ownership of a DYNAMIC one.
///
/// This plays the role of the C++ original's intrusive
/// `prev`/`next`-linked `WorkPackage` stored directly in the list; in
/// safe Rust we use a reference-counted slot inside an ordinary
/// `VecDeque`/`Vec` instead of raw pointer links (see `DESIGN.md`).
pub(crate) enum Slot {
    Static(Arc<TaskCore>),
    Dynamic(Box<TaskCore>),
}

impl Slot {
    pub(crate) fn core(&self) -> &TaskCore {
        match self {
            Slot::Static(core) => core,
            Slot::Dynamic(core) => core,
        }
    }

    pub(crate) fn owner(&self) -> Option<OwnerHandle> {
        self.core().owner
    }

    pub(crate) fn tag(&self) -> u32 {
        self.core().tag
    }

    /// Address-based identity, used only for equality comparisons —
    /// never dereferenced from this value. Kept as a plain `usize` so
    /// that queue state stays `Send`/`Sync` without unsafe impls.
    pub(crate) fn identity(&self) -> usize {
        let ptr = match self {
            Slot::Static(core) => Arc::as_ptr(core),
            Slot::Dynamic(core) => &**core as *const TaskCore,
        };
        ptr as usize
    }

    pub(crate) fn run(&self) {
        self.core().run();
    }

    /// Expiry of a deferred slot. Panics if called on a plain-task slot
    /// (never routed into a deferred list by construction).
    pub(crate) fn expiry(&self) -> std::time::Instant {
        self.core().expiry()
    }

    /// Reverts the slot to its post-run resting state and, for a
    /// DYNAMIC slot, drops it. Called after a task's functor has
    /// returned and it was not re-enqueued from within itself.
    pub(crate) fn finish(self) {
        match self {
            Slot::Static(core) => *core.state.lock() = TaskState::Free,
            Slot::Dynamic(core) => {
                *core.state.lock() = TaskState::Free;
                drop(core);
            }
        }
    }
}

impl From<Task> for Slot {
    fn from(task: Task) -> Self {
        Slot::Static(task.0)
    }
}

impl From<DynamicTask> for Slot {
    fn from(task: DynamicTask) -> Self {
        Slot::Dynamic(task.0)
    }
}

impl From<DeferredTask> for Slot {
    fn from(task: DeferredTask) -> Self {
        Slot::Static(task.0)
    }
}

impl From<DynamicDeferredTask> for Slot {
    fn from(task: DynamicDeferredTask) -> Self {
        Slot::Dynamic(task.0)
    }
}

/// Validates and commits the pre-link state transition for a task
/// being pushed into a queue, per `spec.md` §4.2:
///
/// - DYNAMIC must be `Free`.
/// - STATIC must be `Free`, unless it is the task currently running in
///   *this* queue, in which case it transitions `Running` ->
///   `RunningAndRequeued`.
///
/// Returns `Ok(true)` if the task was re-enqueued from within its own
/// functor (the caller must not physically link it a second time —
/// it stays where it is and the queue will re-run it once the
/// functor returns), `Ok(false)` if it should be linked normally.
pub(crate) fn validate_and_commit_push(
    core: &TaskCore,
    is_self_reenqueue: bool,
) -> Result<bool, crate::error::Error> {
    let mut state = core.state.lock();
    if core.dynamic {
        assert!(
            *state == TaskState::Free,
            "dynamic task enqueued while already queued or running",
        );
        *state = TaskState::Queued;
        Ok(false)
    } else {
        match *state {
            TaskState::Free => {
                *state = TaskState::Queued;
                Ok(false)
            }
            TaskState::Running if is_self_reenqueue => {
                *state = TaskState::RunningAndRequeued;
                Ok(true)
            }
            _ => Err(crate::error::Error::logic(
                "static task is already queued, running, or belongs to another queue",
            )),
        }
    }
}
