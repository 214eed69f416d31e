//! `spec.md` component C6a: the thread-based execution adapter. Owns
//! an OS thread plus a condition variable/mutex pair; `request_work_invocation`
//! sets a flag and signals the thread, which wakes, clears the flag,
//! and calls [`RequestServerCore::work`].

use crate::config::ThreadAdapterConfig;
use crate::error::{Error, Result};
use crate::server::{OutOfMemory, RequestServerCore, WorkInvocationHook};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

struct State {
    invoke_pending: bool,
    cancel_requested: bool,
}

/// Owns the OS thread that drives a [`RequestServerCore`]. Deferred
/// cancellation is never used (`spec.md` §5 "Deferred-cancellation
/// discipline"); cancellation is cooperative via `state.cancel_requested`,
/// checked before every wait and after every OOM retry sleep.
pub struct ThreadAdapter {
    core: Arc<RequestServerCore>,
    state: Mutex<State>,
    cv: Condvar,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadAdapter {
    /// Creates an adapter for `core`, attaching itself as `core`'s
    /// work-invocation hook. Not started until [`Self::start`].
    pub fn new(core: Arc<RequestServerCore>) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            core.attach_hook(weak.clone());
            Self {
                core,
                state: Mutex::new(State {
                    invoke_pending: false,
                    cancel_requested: false,
                }),
                cv: Condvar::new(),
                join: Mutex::new(None),
            }
        })
    }

    /// Spawns the worker thread, which immediately calls `on_start`
    /// and then loops waiting for work. `config.sched_policy`/`priority`
    /// have no portable stable-Rust mapping and are only logged
    /// (`DESIGN.md`); `stack_size` maps directly onto
    /// [`std::thread::Builder::stack_size`].
    pub fn start(self: &Arc<Self>, config: ThreadAdapterConfig) -> Result<()> {
        let mut join = self.join.lock();
        if join.is_some() {
            return Err(Error::logic("thread adapter is already started"));
        }
        {
            let mut state = self.state.lock();
            state.cancel_requested = false;
            state.invoke_pending = false;
        }

        tracing::debug!(
            thread_name = %config.thread_name,
            sched_policy = ?config.sched_hint.policy,
            priority = config.sched_hint.priority,
            "starting request-server thread (policy/priority are advisory only on stable Rust)",
        );

        let this = Arc::clone(self);
        let mut builder = std::thread::Builder::new().name(config.thread_name.clone());
        if config.sched_hint.stack_size > 0 {
            builder = builder.stack_size(config.sched_hint.stack_size);
        }
        let handle = builder
            .spawn(move || this.run(config.oom_retry_delay))
            .expect("failed to spawn request-server thread");
        *join = Some(handle);
        Ok(())
    }

    /// Signals cancellation and joins the worker thread, which runs
    /// `on_stop` before exiting. Idempotent; a no-op if never started
    /// or already stopped.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            state.cancel_requested = true;
        }
        self.cv.notify_all();
        if let Some(handle) = self.join.lock().take() {
            handle.join().expect("request-server thread panicked");
        }
    }

    fn run(&self, oom_retry_delay: Duration) {
        self.core.on_start();
        loop {
            {
                let mut state = self.state.lock();
                while !state.invoke_pending && !state.cancel_requested {
                    self.cv.wait(&mut state);
                }
                if state.cancel_requested {
                    break;
                }
                state.invoke_pending = false;
            }
            loop {
                match self.core.work() {
                    Ok(()) => break,
                    Err(OutOfMemory) => {
                        tracing::warn!(?oom_retry_delay, "request server out of memory, retrying");
                        if self.sleep_cancellable(oom_retry_delay) {
                            self.core.on_stop();
                            return;
                        }
                    }
                }
            }
        }
        self.core.on_stop();
    }

    /// Sleeps up to `dur`, waking early if cancellation is requested.
    /// Returns `true` if cancellation fired during (or before) the
    /// sleep.
    fn sleep_cancellable(&self, dur: Duration) -> bool {
        let mut state = self.state.lock();
        if state.cancel_requested {
            return true;
        }
        let result = self.cv.wait_for(&mut state, dur);
        let _ = result;
        state.cancel_requested
    }
}

impl WorkInvocationHook for ThreadAdapter {
    /// Idempotent: sets the pending flag and signals the thread,
    /// regardless of how many times this is called before the thread
    /// wakes and clears it (`spec.md` §4.5).
    fn request_work_invocation(&self) {
        let mut state = self.state.lock();
        state.invoke_pending = true;
        drop(state);
        self.cv.notify_one();
    }
}

impl Drop for ThreadAdapter {
    fn drop(&mut self) {
        if self.join.lock().is_some() {
            self.stop();
        }
    }
}
