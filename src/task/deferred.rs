//! Deferred tasks (`spec.md` component C2): a [`super::Task`]/
//! [`super::DynamicTask`] extended by an absolute expiry timestamp on
//! a monotonic clock.

use super::{OwnerHandle, TaskCore, TaskState};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// STATIC deferred task: becomes runnable once its expiry is reached.
#[derive(Clone, Debug)]
pub struct DeferredTask(pub(crate) Arc<TaskCore>);

impl DeferredTask {
    /// Creates a STATIC deferred task with an absolute expiry.
    pub fn new_at(
        owner: Option<OwnerHandle>,
        tag: u32,
        functor: impl FnMut() + Send + 'static,
        expiry: Instant,
    ) -> Self {
        Self(Arc::new(TaskCore {
            owner,
            tag,
            dynamic: false,
            state: Mutex::new(TaskState::Free),
            functor: Mutex::new(super::FunctorSlot::Reusable(Box::new(functor))),
            expiry: Some(Mutex::new(expiry)),
        }))
    }

    /// Creates a STATIC deferred task that expires `delay` from `now`.
    pub fn new_in(
        owner: Option<OwnerHandle>,
        tag: u32,
        functor: impl FnMut() + Send + 'static,
        now: Instant,
        delay: Duration,
    ) -> Self {
        Self::new_at(owner, tag, functor, now + delay)
    }

    /// Owner of this task (`None` = anonymous).
    pub fn owner(&self) -> Option<OwnerHandle> {
        self.0.owner
    }

    /// Owner-assigned tag.
    pub fn tag(&self) -> u32 {
        self.0.tag
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        *self.0.state.lock()
    }

    /// Current expiry.
    pub fn expiry(&self) -> Instant {
        self.0.expiry()
    }

    /// Reassigns the expiry.
    ///
    /// Only legal while the task is [`TaskState::Free`] or
    /// [`TaskState::Running`] (i.e. not currently linked into a
    /// queue's deferred list) — reassigning the sort key of a linked
    /// task would corrupt the list's ordering invariant.
    pub fn set_expiry(&self, expiry: Instant) -> Result<()> {
        let state = *self.0.state.lock();
        match state {
            TaskState::Free | TaskState::Running => {
                *self.0.expiry.as_ref().unwrap().lock() = expiry;
                Ok(())
            }
            TaskState::Queued | TaskState::RunningAndRequeued => Err(Error::logic(
                "cannot reassign the expiry of a task that is linked into a deferred queue",
            )),
        }
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

/// DYNAMIC deferred task: ownership transfers to the queue on enqueue.
pub struct DynamicDeferredTask(pub(crate) Box<TaskCore>);

impl Debug for DynamicDeferredTask {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(&*self.0, f)
    }
}

impl DynamicDeferredTask {
    /// Creates a DYNAMIC deferred task with an absolute expiry.
    pub fn new_at(
        owner: Option<OwnerHandle>,
        tag: u32,
        functor: impl FnOnce() + Send + 'static,
        expiry: Instant,
    ) -> Self {
        Self(Box::new(TaskCore {
            owner,
            tag,
            dynamic: true,
            state: Mutex::new(TaskState::Free),
            functor: Mutex::new(super::FunctorSlot::OneShot(Some(Box::new(functor)))),
            expiry: Some(Mutex::new(expiry)),
        }))
    }

    /// Creates a DYNAMIC deferred task that expires `delay` from `now`.
    pub fn new_in(
        owner: Option<OwnerHandle>,
        tag: u32,
        functor: impl FnOnce() + Send + 'static,
        now: Instant,
        delay: Duration,
    ) -> Self {
        Self::new_at(owner, tag, functor, now + delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_reassignment_rejected_while_queued() {
        let t = DeferredTask::new_at(None, 0, || {}, Instant::now());
        *t.0.state.lock() = TaskState::Queued;
        let err = t.set_expiry(Instant::now()).unwrap_err();
        assert!(matches!(err, Error::Logic(_)));
        *t.0.state.lock() = TaskState::Free;
    }

    #[test]
    fn expiry_reassignment_allowed_while_running() {
        let t = DeferredTask::new_at(None, 0, || {}, Instant::now());
        *t.0.state.lock() = TaskState::Running;
        let new_expiry = Instant::now() + Duration::from_secs(1);
        t.set_expiry(new_expiry).unwrap();
        assert_eq!(t.expiry(), new_expiry);
        *t.0.state.lock() = TaskState::Free;
    }
}
