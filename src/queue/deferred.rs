//! `spec.md` component C4: a superset of [`super::immediate::ImmediateQueue`]
//! that also drains a time-ordered stream of deferred tasks, with
//! precedence given to any deferred task whose expiry has elapsed.

use super::{validate_and_commit_push, Slot};
use crate::clock::{MonotonicClock, SystemClock};
use crate::error::Result;
use crate::task::deferred::DeferredTask;
use crate::task::{DynamicTask, OwnerHandle, Task, TaskState};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequeuePosition {
    ImmediateBack,
    ImmediateFront,
    Deferred,
}

struct Inner {
    immediate: VecDeque<Slot>,
    /// Sorted strictly ascending by expiry; FIFO among ties.
    deferred: VecDeque<Slot>,
    running_identity: Option<usize>,
    running_owner: Option<OwnerHandle>,
    pending_requeue: Option<RequeuePosition>,
    stop_requested: bool,
}

impl Inner {
    fn insert_deferred_sorted(&mut self, slot: Slot) -> bool {
        let expiry = slot.expiry();
        let pos = self
            .deferred
            .iter()
            .position(|existing| existing.expiry() > expiry)
            .unwrap_or(self.deferred.len());
        self.deferred.insert(pos, slot);
        pos == 0
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        while let Some(slot) = self.immediate.pop_front() {
            slot.finish();
        }
        while let Some(slot) = self.deferred.pop_front() {
            slot.finish();
        }
    }
}

/// Single-threaded executor merging an immediate FIFO stream with a
/// time-ordered deferred stream. See `spec.md` §4.3 for the scheduling
/// rule: a deferred task whose expiry has elapsed always runs before
/// any immediate task.
pub struct DeferredQueue {
    inner: Mutex<Inner>,
    work_available: Condvar,
    owner_changed: Condvar,
    flush_mutex: Mutex<()>,
    clock: Arc<dyn MonotonicClock>,
}

impl Default for DeferredQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferredQueue {
    /// Creates an empty, not-yet-started queue backed by the system
    /// monotonic clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates a queue backed by an injected clock, for deterministic
    /// tests of deferred ordering.
    pub fn with_clock(clock: Arc<dyn MonotonicClock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                immediate: VecDeque::new(),
                deferred: VecDeque::new(),
                running_identity: None,
                running_owner: None,
                pending_requeue: None,
                stop_requested: false,
            }),
            work_available: Condvar::new(),
            owner_changed: Condvar::new(),
            flush_mutex: Mutex::new(()),
            clock,
        }
    }

    /// Enqueues a plain task at the tail of the immediate stream.
    pub fn push_back(&self, task: impl Into<Slot>) -> Result<()> {
        self.push_immediate(task.into(), RequeuePosition::ImmediateBack)
    }

    /// Enqueues a plain task at the head of the immediate stream.
    pub fn push_front(&self, task: impl Into<Slot>) -> Result<()> {
        self.push_immediate(task.into(), RequeuePosition::ImmediateFront)
    }

    fn push_immediate(&self, slot: Slot, position: RequeuePosition) -> Result<()> {
        let mut inner = self.inner.lock();
        let is_self_reenqueue = inner.running_identity == Some(slot.identity());
        let requeued_while_running = validate_and_commit_push(slot.core(), is_self_reenqueue)?;
        if requeued_while_running {
            inner.pending_requeue = Some(position);
        } else {
            match position {
                RequeuePosition::ImmediateBack => inner.immediate.push_back(slot),
                RequeuePosition::ImmediateFront => inner.immediate.push_front(slot),
                RequeuePosition::Deferred => unreachable!("immediate push never uses this arm"),
            }
            self.work_available.notify_one();
        }
        Ok(())
    }

    /// Enqueues a deferred task at the position that preserves
    /// ascending-expiry order (FIFO among equal expiries). Signals the
    /// run loop if this becomes the new earliest deferred task, so a
    /// blocked timed wait is recomputed against the new deadline.
    pub fn push_deferred(&self, task: impl Into<Slot>) -> Result<()> {
        let slot = task.into();
        let mut inner = self.inner.lock();
        let is_self_reenqueue = inner.running_identity == Some(slot.identity());
        let requeued_while_running = validate_and_commit_push(slot.core(), is_self_reenqueue)?;
        if requeued_while_running {
            inner.pending_requeue = Some(RequeuePosition::Deferred);
        } else {
            let became_head = inner.insert_deferred_sorted(slot);
            if became_head {
                self.work_available.notify_all();
            } else {
                self.work_available.notify_one();
            }
        }
        Ok(())
    }

    /// Removes `task` from whichever list currently holds it (or does
    /// nothing if it is running or not linked). Returns `true` if
    /// removed.
    pub fn remove(&self, task: &Task) -> bool {
        let mut inner = self.inner.lock();
        if inner.running_identity == Some(task.identity()) {
            return false;
        }
        if let Some(pos) = inner
            .immediate
            .iter()
            .position(|slot| slot.identity() == task.identity())
        {
            let slot = inner.immediate.remove(pos).expect("position just found");
            drop(inner);
            slot.finish();
            return true;
        }
        if let Some(pos) = inner
            .deferred
            .iter()
            .position(|slot| slot.identity() == task.identity())
        {
            let was_head = pos == 0;
            let slot = inner.deferred.remove(pos).expect("position just found");
            drop(inner);
            slot.finish();
            if was_head {
                self.work_available.notify_all();
            }
            return true;
        }
        false
    }

    /// As [`Self::remove`], but takes a deferred task directly (`spec.md`
    /// §4.3 "`remove(T_def &)`") instead of requiring the caller to name
    /// the plain-task type. Only ever finds the task in the deferred
    /// list — a `DeferredTask` is never linked into the immediate one.
    pub fn remove_deferred(&self, task: &DeferredTask) -> bool {
        let mut inner = self.inner.lock();
        if inner.running_identity == Some(task.identity()) {
            return false;
        }
        if let Some(pos) = inner
            .deferred
            .iter()
            .position(|slot| slot.identity() == task.identity())
        {
            let was_head = pos == 0;
            let slot = inner.deferred.remove(pos).expect("position just found");
            drop(inner);
            slot.finish();
            if was_head {
                self.work_available.notify_all();
            }
            return true;
        }
        false
    }

    /// Removes every queued (not running) task owned by `owner` from
    /// both lists.
    pub fn remove_by_owner(&self, owner: OwnerHandle) -> usize {
        self.remove_by(|slot| slot.owner() == Some(owner))
    }

    /// Removes every queued (not running) task owned by `owner` whose
    /// tag equals `tag`, from both lists.
    pub fn remove_by_owner_and_tag(&self, owner: OwnerHandle, tag: u32) -> usize {
        self.remove_by(|slot| slot.owner() == Some(owner) && slot.tag() == tag)
    }

    fn remove_by(&self, predicate: impl Fn(&Slot) -> bool) -> usize {
        let mut removed = Vec::new();
        let mut head_removed = false;
        {
            let mut inner = self.inner.lock();
            let mut i = 0;
            while i < inner.immediate.len() {
                if predicate(&inner.immediate[i]) {
                    removed.push(inner.immediate.remove(i).expect("index in range"));
                } else {
                    i += 1;
                }
            }
            let mut i = 0;
            while i < inner.deferred.len() {
                if predicate(&inner.deferred[i]) {
                    if i == 0 {
                        head_removed = true;
                    }
                    removed.push(inner.deferred.remove(i).expect("index in range"));
                } else {
                    i += 1;
                }
            }
        }
        let count = removed.len();
        for slot in removed {
            slot.finish();
        }
        if head_removed {
            self.work_available.notify_all();
        }
        count
    }

    /// Blocks until the running task's owner is no longer `owner`.
    pub fn wait_until_current_finished(&self, owner: OwnerHandle) {
        let mut inner = self.inner.lock();
        while inner.running_owner == Some(owner) {
            self.owner_changed.wait(&mut inner);
        }
    }

    /// Whether any queued (not running) task in either list belongs to
    /// `owner`.
    pub fn any_queued(&self, owner: OwnerHandle) -> bool {
        let inner = self.inner.lock();
        inner.immediate.iter().any(|s| s.owner() == Some(owner))
            || inner.deferred.iter().any(|s| s.owner() == Some(owner))
    }

    /// Number of linked immediate tasks (excludes the running task).
    pub fn len(&self) -> usize {
        self.inner.lock().immediate.len()
    }

    /// Whether the immediate list is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of linked deferred tasks (excludes the running task).
    pub fn deferred_len(&self) -> usize {
        self.inner.lock().deferred.len()
    }

    /// Same barrier as [`super::immediate::ImmediateQueue::flush_immediate`],
    /// via a fence posted to the immediate stream. Note this does not
    /// wait for pending deferred tasks whose expiry has not yet
    /// elapsed — only for work already runnable.
    pub fn flush_immediate(&self) {
        let pair = Arc::new((Mutex::new(false), Condvar::new()));
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

        drop(self.flush_mutex.lock());
    }

    /// Latches cancellation; idempotent.
    pub fn request_stop(&self) {
        let mut inner = self.inner.lock();
        inner.stop_requested = true;
        self.work_available.notify_all();
    }

    /// Single-threaded entry point implementing the scheduling rule in
    /// `spec.md` §4.3: a deferred task whose expiry has elapsed always
    /// preempts any immediate task; ties among deferred tasks break
    /// FIFO; otherwise the loop blocks, timed against the earliest
    /// deferred expiry if one exists.
    pub fn run_loop(&self) {
        loop {
            let slot = match self.wait_for_work() {
                Some(slot) => slot,
                None => return,
            };
            self.run_one(slot);
        }
    }

    fn wait_for_work(&self) -> Option<Slot> {
        let mut inner = self.inner.lock();
        loop {
            let now = self.clock.now();
            let deferred_runnable = matches!(
                inner.deferred.front(),
                Some(front) if front.expiry() <= now
            );
            if deferred_runnable {
                return inner.deferred.pop_front();
            }
            if !inner.immediate.is_empty() {
                return inner.immediate.pop_front();
            }
            if inner.stop_requested {
                return None;
            }
            match inner.deferred.front().map(|front| front.expiry()) {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(now);
                    self.work_available.wait_for(&mut inner, timeout);
                }
                None => {
                    self.work_available.wait(&mut inner);
                }
            }
            // Loop back around: re-check wall-clock and list state
            // rather than trusting the wait outcome, since the head of
            // the deferred list may have changed while we waited.
        }
    }

    fn run_one(&self, slot: Slot) {
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
            queue: &'a DeferredQueue,
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
                RequeuePosition::ImmediateBack => {
                    inner.immediate.push_back(slot);
                    drop(inner);
                    self.work_available.notify_one();
                }
                RequeuePosition::ImmediateFront => {
                    inner.immediate.push_front(slot);
                    drop(inner);
                    self.work_available.notify_one();
                }
                RequeuePosition::Deferred => {
                    let became_head = inner.insert_deferred_sorted(slot);
                    drop(inner);
                    if became_head {
                        self.work_available.notify_all();
                    } else {
                        self.work_available.notify_one();
                    }
                }
            }
        } else {
            slot.finish();
        }
    }
}
