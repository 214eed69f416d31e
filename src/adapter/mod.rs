//! `spec.md` component C6: the two execution adapters that drive
//! [`crate::server::RequestServerCore::work`] — [`thread::ThreadAdapter`]
//! owns a dedicated OS thread, [`workqueue::WorkQueueAdapter`] posts
//! reusable tasks into a caller-supplied [`crate::queue::deferred::DeferredQueue`].
//!
//! Both implement [`crate::server::WorkInvocationHook`] and are
//! attached to a core via [`crate::server::RequestServerCore::attach_hook`]
//! at construction time.

pub mod thread;
pub mod workqueue;
