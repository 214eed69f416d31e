//! `spec.md` component C3: a single-threaded FIFO executor for plain
//! tasks.

use super::{validate_and_commit_push, Slot};
use crate::error::Result;
use crate::task::{DynamicTask, OwnerHandle, Task};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

/// Where a self-requeued task should be relinked once its functor
/// returns. Only meaningful while that task is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequeuePosition {
    Back,
    Front,
}

struct Inner {
    list: VecDeque<Slot>,
    running_identity: Option<usize>,
    running_owner: Option<OwnerHandle>,
    /// Set by a `push_back`/`push_front` call made against the task
    /// that is currently running in this queue; consumed once that
    /// task's functor returns.
    pending_requeue: Option<RequeuePosition>,
    stop_requested: bool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        while let Some(slot) = self.list.pop_front() {
            slot.finish();
        }
    }
}

/// Single-threaded FIFO task queue.
///
/// `ImmediateQueue` has no bound on its length: enqueue never fails for
/// capacity reasons (Design Note 9). Only one thread may ever call
/// [`Self::run_loop`] at a time; nothing here prevents a second caller
/// from doing so, but the state machine was designed, and is only
/// tested, for a single drainer.
pub struct ImmediateQueue {
    inner: Mutex<Inner>,
    /// Signaled on new work and on `request_stop`.
    work_available: Condvar,
    /// Signaled whenever the running owner changes (including to/from
    /// "nothing running").
    owner_changed: Condvar,
    /// Held for the duration of a functor's execution so that
    /// `flush_immediate`'s fence task is a full barrier, per `spec.md`
    /// §4.2/§5.
    flush_mutex: Mutex<()>,
}

impl Default for ImmediateQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ImmediateQueue {
    /// Creates an empty, not-yet-started queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                list: VecDeque::new(),
                running_identity: None,
                running_owner: None,
                pending_requeue: None,
                stop_requested: false,
            }),
            work_available: Condvar::new(),
            owner_changed: Condvar::new(),
            flush_mutex: Mutex::new(()),
        }
    }

    /// Enqueues `task` at the tail. Re-enqueueing a STATIC task from
    /// within its own running functor is recognized and transitions it
    /// `Running` -> `RunningAndRequeued` instead of linking it a second
    /// time; the existing docs on "empty DYNAMIC handle" don't apply
    /// here because a `DynamicTask`/`Task` value is never empty in
    /// Rust's ownership model.
    pub fn push_back(&self, task: impl Into<Slot>) -> Result<()> {
        self.push(task.into(), RequeuePosition::Back)
    }

    /// Enqueues `task` at the head; it runs next.
    pub fn push_front(&self, task: impl Into<Slot>) -> Result<()> {
        self.push(task.into(), RequeuePosition::Front)
    }

    fn push(&self, slot: Slot, position: RequeuePosition) -> Result<()> {
        let mut inner = self.inner.lock();
        let is_self_reenqueue = inner.running_identity == Some(slot.identity());
        let requeued_while_running = validate_and_commit_push(slot.core(), is_self_reenqueue)?;
        if requeued_while_running {
            inner.pending_requeue = Some(position);
            // `slot` referred to the same task object already held by
            // the running invocation; dropping our handle here just
            // releases this call's reference, it does not unlink
            // anything.
            drop(slot);
        } else {
            match position {
                RequeuePosition::Back => inner.list.push_back(slot),
                RequeuePosition::Front => inner.list.push_front(slot),
            }
            self.work_available.notify_one();
        }
        Ok(())
    }

    /// Removes `task` if it is linked and not currently running.
    /// Returns `true` if it was removed. A no-op, not an error, if the
    /// task is running or not linked — matching the "self-removal"
    /// rule in `spec.md` §4.2.
    pub fn remove(&self, task: &Task) -> bool {
        let mut inner = self.inner.lock();
        if inner.running_identity == Some(task.identity()) {
            return false;
        }
        if let Some(pos) = inner
            .list
            .iter()
            .position(|slot| slot.identity() == task.identity())
        {
            let slot = inner.list.remove(pos).expect("position just found");
            drop(inner);
            slot.finish();
            true
        } else {
            false
        }
    }

    /// Removes every queued (not running) task owned by `owner`.
    /// Returns the number removed.
    pub fn remove_by_owner(&self, owner: OwnerHandle) -> usize {
        self.remove_by(|slot| slot.owner() == Some(owner))
    }

    /// Removes every queued (not running) task owned by `owner` whose
    /// tag equals `tag`.
    pub fn remove_by_owner_and_tag(&self, owner: OwnerHandle, tag: u32) -> usize {
        self.remove_by(|slot| slot.owner() == Some(owner) && slot.tag() == tag)
    }

    fn remove_by(&self, predicate: impl Fn(&Slot) -> bool) -> usize {
        let mut removed = Vec::new();
        {
            let mut inner = self.inner.lock();
            let mut i = 0;
            while i < inner.list.len() {
                if predicate(&inner.list[i]) {
                    removed.push(inner.list.remove(i).expect("index in range"));
                } else {
                    i += 1;
                }
            }
        }
        let count = removed.len();
        for slot in removed {
            slot.finish();
        }
        count
    }

    /// Blocks the caller until the running task's owner is no longer
    /// `owner` (including "nothing is running").
    ///
    /// Calling this from inside the queue's own `run_loop` thread with
    /// a matching owner self-deadlocks; that is documented programmer
    /// error, not guarded against here (`spec.md` §4.2).
    pub fn wait_until_current_finished(&self, owner: OwnerHandle) {
        let mut inner = self.inner.lock();
        while inner.running_owner == Some(owner) {
            self.owner_changed.wait(&mut inner);
        }
    }

    /// Whether any queued (not currently running) task belongs to
    /// `owner`.
    pub fn any_queued(&self, owner: OwnerHandle) -> bool {
        let inner = self.inner.lock();
        inner.list.iter().any(|slot| slot.owner() == Some(owner))
    }

    /// Number of tasks currently linked (excludes the running task).
    pub fn len(&self) -> usize {
        self.inner.lock().list.len()
    }

    /// Whether the queue has no linked tasks (excludes the running
    /// task).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Posts a fence task, waits for it to run, then waits for the
    /// flush barrier to clear — guaranteeing every task enqueued
    /// before this call has fully finished running. Must not be
    /// called from this queue's own `run_loop` thread.
    pub fn flush_immediate(&self) {
        let pair = std::sync::Arc::new((Mutex::new(false), Condvar::new()));
        let pair_in_fence = pair.clone();
        let fence = DynamicTask::new(None, 0, move || {
            let (done, cv) = &*pair_in_fence;
            *done.lock() = true;
            cv.notify_all();
        });
        self.push_back(fence)
            .expect("fence task is freshly constructed and cannot fail validation");

        let (done, cv) = &*pair;
        let mut guard = done.lock();
        while !*guard {
            cv.wait(&mut guard);
        }
        drop(guard);

        // Barrier: blocks until `run_loop` has released the flush
        // mutex, i.e. until the fence's functor has fully returned.
        drop(self.flush_mutex.lock());
    }

    /// Latches cancellation: `run_loop` returns once the in-flight
    /// task (if any) completes, or immediately if the queue is idle.
    /// Idempotent.
    pub fn request_stop(&self) {
        let mut inner = self.inner.lock();
        inner.stop_requested = true;
        self.work_available.notify_all();
    }

    /// Single-threaded entry point: drains tasks in FIFO order until
    /// [`Self::request_stop`] is latched and the queue runs dry.
    ///
    /// Functor panics propagate out of this call after task state has
    /// been restored to a consistent value (strong guarantee on state,
    /// not on side effects, per `spec.md` §4.2/§7).
    pub fn run_loop(&self) {
        loop {
            let slot = {
                let mut inner = self.inner.lock();
                loop {
                    if let Some(slot) = inner.list.pop_front() {
                        break slot;
                    }
                    if inner.stop_requested {
                        return;
                    }
                    self.work_available.wait(&mut inner);
                }
            };
            self.run_one(slot);
        }
    }

    fn run_one(&self, slot: Slot) {
        use crate::task::TaskState;

        let identity = slot.identity();
        let owner = slot.owner();
        *slot.core().state.lock() = TaskState::Running;
        {
            let mut inner = self.inner.lock();
            inner.running_identity = Some(identity);
            inner.running_owner = owner;
        }
        self.owner_changed.notify_all();

        struct RunGuard<'a> {
            queue: &'a ImmediateQueue,
        }
        impl Drop for RunGuard<'_> {
            fn drop(&mut self) {
                let mut inner = self.queue.inner.lock();
                inner.running_identity = None;
                inner.running_owner = None;
                drop(inner);
                self.queue.owner_changed.notify_all();
            }
        }
        let _clear_running = RunGuard { queue: self };

        {
            let _flush_guard = self.flush_mutex.lock();
            slot.run();
        }

        let requeued = *slot.core().state.lock() == TaskState::RunningAndRequeued;
        if requeued {
            let mut inner = self.inner.lock();
            let position = inner
                .pending_requeue
                .take()
                .expect("RunningAndRequeued implies a recorded requeue position");
            *slot.core().state.lock() = TaskState::Queued;
            match position {
                RequeuePosition::Back => inner.list.push_back(slot),
                RequeuePosition::Front => inner.list.push_front(slot),
            }
            drop(inner);
            self.work_available.notify_one();
        } else {
            slot.finish();
        }
    }
}
