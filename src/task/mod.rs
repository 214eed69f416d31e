//! Work packages: one-shot functors with an owner identity and a
//! lifecycle state, queued by [`crate::queue::immediate::ImmediateQueue`]
//! and [`crate::queue::deferred::DeferredQueue`].
//!
//! This module implements `spec.md` component C1 (plain [`Task`] /
//! [`DynamicTask`]); [`crate::task::deferred`] layers the expiry
//! timestamp of C2 on top of the same core.

pub mod deferred;

use parking_lot::Mutex;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::Instant;

/// Opaque identity used to group tasks for bulk removal and for
/// [`crate::queue::immediate::ImmediateQueue::wait_until_current_finished`].
///
/// Two handles compare equal iff they were derived from the same
/// address. A `None` owner (at the call site, `Option<OwnerHandle>`)
/// means "anonymous" — the C++ original's `nullptr` owner.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerHandle(usize);

impl OwnerHandle {
    /// Derives an owner handle from the address of `value`.
    ///
    /// The handle is only ever compared for equality, never
    /// dereferenced, so it remains valid to use even after `value` is
    /// dropped (though reusing the same address for an unrelated
    /// owner will make the handles alias, same as in the original).
    pub fn from_ref<T: ?Sized>(value: &T) -> Self {
        Self(value as *const T as *const () as usize)
    }
}

impl Debug for OwnerHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerHandle({:#x})", self.0)
    }
}

/// Lifecycle state of a [`Task`]/[`DynamicTask`].
///
/// STATIC tasks may occupy any of the four states; DYNAMIC tasks are
/// never seen in [`TaskState::RunningAndRequeued`] because a dynamic
/// task is not callable by anything other than the queue that owns
/// it and ceases to exist once it has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Not linked into any queue and not running.
    Free,
    /// Linked into exactly one queue, not yet started.
    Queued,
    /// Currently executing its functor.
    Running,
    /// Executing its functor, and re-enqueued itself (or was
    /// re-enqueued from elsewhere) while doing so; the queue will
    /// re-link it as [`TaskState::Queued`] once the functor returns.
    RunningAndRequeued,
}

/// A one-shot or repeatable functor, depending on [`FunctorSlot`] kind.
enum FunctorSlot {
    /// Owner-retained task: the functor is invoked again on every
    /// enqueue/run cycle.
    Reusable(Box<dyn FnMut() + Send>),
    /// Queue-owned task: the functor is invoked exactly once and then
    /// consumed.
    OneShot(Option<Box<dyn FnOnce() + Send>>),
}

impl FunctorSlot {
    fn invoke(&mut self) {
        match self {
            FunctorSlot::Reusable(f) => f(),
            FunctorSlot::OneShot(slot) => {
                let f = slot
                    .take()
                    .expect("dynamic task functor invoked more than once");
                f();
            }
        }
    }
}

impl Debug for FunctorSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FunctorSlot::Reusable(_) => f.write_str("Reusable(..)"),
            FunctorSlot::OneShot(Some(_)) => f.write_str("OneShot(pending)"),
            FunctorSlot::OneShot(None) => f.write_str("OneShot(consumed)"),
        }
    }
}

/// Shared representation of C1 (plain task) and C2 (deferred task):
/// the expiry is simply absent for a plain task.
pub(crate) struct TaskCore {
    pub(crate) owner: Option<OwnerHandle>,
    pub(crate) tag: u32,
    pub(crate) dynamic: bool,
    pub(crate) state: Mutex<TaskState>,
    functor: Mutex<FunctorSlot>,
    pub(crate) expiry: Option<Mutex<Instant>>,
}

impl Debug for TaskCore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCore")
            .field("owner", &self.owner)
            .field("tag", &self.tag)
            .field("dynamic", &self.dynamic)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl TaskCore {
    pub(crate) fn run(&self) {
        self.functor.lock().invoke();
    }

    pub(crate) fn expiry(&self) -> Instant {
        self.expiry
            .as_ref()
            .expect("task is not a deferred task")
            .lock()
            .to_owned()
    }
}

impl Drop for TaskCore {
    fn drop(&mut self) {
        let state = *self.state.lock();
        assert!(
            state == TaskState::Free,
            "task destroyed while in state {state:?}; a task must be \
             STATIC_FREE or DYNAMIC_FREE at destruction time",
        );
    }
}

/// STATIC plain task: the caller retains ownership across enqueues and
/// may re-enqueue it, including from within its own functor.
///
/// Cloning a `Task` shares the same underlying slot (it is an `Arc`
/// handle); this is how the caller keeps using the task after handing
/// a clone to a queue.
#[derive(Clone, Debug)]
pub struct Task(pub(crate) Arc<TaskCore>);

impl Task {
    /// Creates a STATIC task. The functor is invoked once per run and
    /// may be invoked again on a later re-enqueue.
    pub fn new(
        owner: Option<OwnerHandle>,
        tag: u32,
        functor: impl FnMut() + Send + 'static,
    ) -> Self {
        Self(Arc::new(TaskCore {
            owner,
            tag,
            dynamic: false,
            state: Mutex::new(TaskState::Free),
            functor: Mutex::new(FunctorSlot::Reusable(Box::new(functor))),
            expiry: None,
        }))
    }

    /// Owner of this task (`None` = anonymous).
    pub fn owner(&self) -> Option<OwnerHandle> {
        self.0.owner
    }

    /// Owner-assigned tag.
    pub fn tag(&self) -> u32 {
        self.0.tag
    }

    /// Current lifecycle state. Exposed for introspection/testing.
    pub fn state(&self) -> TaskState {
        *self.0.state.lock()
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

/// DYNAMIC plain task: ownership transfers to the queue on enqueue and
/// the queue destroys it once it has run.
pub struct DynamicTask(pub(crate) Box<TaskCore>);

impl Debug for DynamicTask {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(&*self.0, f)
    }
}

impl DynamicTask {
    /// Creates a DYNAMIC task. The functor is invoked exactly once.
    pub fn new(
        owner: Option<OwnerHandle>,
        tag: u32,
        functor: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self(Box::new(TaskCore {
            owner,
            tag,
            dynamic: true,
            state: Mutex::new(TaskState::Free),
            functor: Mutex::new(FunctorSlot::OneShot(Some(Box::new(functor)))),
            expiry: None,
        }))
    }
}
