//! `spec.md` component C5: the Remote-Access Server. Serializes a
//! registered client's requests against an [`notifiable::ObjectDictionaryAccess`]
//! collaborator, one `work()` call at a time, driven by whichever
//! execution adapter in [`crate::adapter`] owns this core.

pub mod notifiable;
pub mod request;

use crate::config::ServerLimits;
use crate::error::{DictionaryError, Error, Result};
use notifiable::{Notifiable, ObjectDictionaryAccess};
use parking_lot::Mutex;
use request::{Request, RequestKind, Response, ResponseBody};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// The out-of-memory condition `work()` reports instead of answering a
/// request: the execution adapter is expected to retry after
/// `oom_retry_delay` (`spec.md` §4.4/§7). Never crosses the notifiable
/// interface.
pub use crate::error::OutOfMemory;

/// Observable server state (`spec.md` §3 "Server State") — exposed for
/// introspection/testing; `RequestServerCore` itself only tracks the
/// handful of bits this is computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    UnregOff,
    UnregOn,
    RegOff,
    RegJustRegistered,
    RegIdle,
    RegBusy,
}

/// The capability a [`crate::adapter`] hook provides to the core: "make
/// sure `work()` runs again soon." Expressed as a trait per Design
/// Note 9 ("a capability required by the server on its execution
/// adapter; express as an interface/trait with a single method, not
/// inheritance"). The core holds only a [`Weak`] reference — the
/// adapter owns the core, never the reverse (Design Note 9, "Cyclic
/// references").
pub trait WorkInvocationHook: Send + Sync {
    fn request_work_invocation(&self);
}

struct ClientState {
    notifiable: Option<Arc<dyn Notifiable>>,
    /// Mirrors the on/off half of `spec.md`'s state diagram; flipped by
    /// `on_start`/`on_stop`, independent of registration.
    on: bool,
    /// Whether `OnReady` has fired for the current on+registered
    /// episode; reset whenever registration or on/off state changes.
    ready_emitted: bool,
}

struct ApiState {
    queue: std::collections::VecDeque<Request>,
    loan_requested: bool,
}

thread_local! {
    /// Set for the duration of any call into the registered client's
    /// [`Notifiable`] methods, so [`RequestServerCore::unregister`] can
    /// reject the documented-forbidden reentrant call from inside one.
    static IN_NOTIFIABLE_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// Component C5. See the module doc comment and `spec.md` §4.4 for the
/// full contract.
pub struct RequestServerCore {
    dictionary: Arc<dyn ObjectDictionaryAccess>,
    limits: ServerLimits,
    oom_retry_delay: Duration,
    span: Option<tracing::Span>,
    client: Mutex<ClientState>,
    api: Mutex<ApiState>,
    /// Set by `unregister()` while the server is ON; observed and
    /// acted on by `work()` "before starting each new unit of work"
    /// (`spec.md` §4.4) so an unregistering caller is never starved by
    /// a busy execution thread.
    unregister_pending: AtomicBool,
    hook: Mutex<Option<Weak<dyn WorkInvocationHook>>>,
}

impl RequestServerCore {
    /// Constructs a core against `dictionary`, validating `limits`
    /// (already done by [`ServerLimits::new`]) and `oom_retry_delay`
    /// (`spec.md` §7: must be `> 0`). `span` is the optional "logger"
    /// construction parameter from `spec.md` §4.4.
    pub fn new(
        dictionary: Arc<dyn ObjectDictionaryAccess>,
        limits: ServerLimits,
        oom_retry_delay: Duration,
        span: Option<tracing::Span>,
    ) -> Result<Self> {
        if oom_retry_delay.is_zero() {
            return Err(Error::invalid_argument("oom_retry_delay_ms must be > 0"));
        }
        Ok(Self {
            dictionary,
            limits,
            oom_retry_delay,
            span,
            client: Mutex::new(ClientState {
                notifiable: None,
                on: false,
                ready_emitted: false,
            }),
            api: Mutex::new(ApiState {
                queue: std::collections::VecDeque::new(),
                loan_requested: false,
            }),
            unregister_pending: AtomicBool::new(false),
            hook: Mutex::new(None),
        })
    }

    /// Attaches the execution adapter's hook. Called once by the
    /// adapter during its own construction.
    pub fn attach_hook(&self, hook: Weak<dyn WorkInvocationHook>) {
        *self.hook.lock() = Some(hook);
    }

    /// The configured negotiated size limits.
    pub fn limits(&self) -> ServerLimits {
        self.limits
    }

    /// Current state, for introspection/testing. Locks `client` then
    /// `api`, matching this core's locking discipline (`spec.md` §5).
    pub fn state(&self) -> ServerState {
        let client = self.client.lock();
        let api = self.api.lock();
        match (client.on, &client.notifiable) {
            (false, None) => ServerState::UnregOff,
            (true, None) => ServerState::UnregOn,
            (false, Some(_)) => ServerState::RegOff,
            (true, Some(_)) => {
                if !client.ready_emitted {
                    ServerState::RegJustRegistered
                } else if api.queue.is_empty() {
                    ServerState::RegIdle
                } else {
                    ServerState::RegBusy
                }
            }
        }
    }

    fn poke_hook(&self) {
        if let Some(hook) = self.hook.lock().as_ref().and_then(Weak::upgrade) {
            hook.request_work_invocation();
        }
    }

    fn call_notifiable(&self, f: impl FnOnce()) {
        struct ResetGuard;
        impl Drop for ResetGuard {
            fn drop(&mut self) {
                IN_NOTIFIABLE_CALLBACK.with(|flag| flag.set(false));
            }
        }
        IN_NOTIFIABLE_CALLBACK.with(|flag| flag.set(true));
        let _reset = ResetGuard;
        f();
    }

    // ---- Submission interface -------------------------------------

    /// Binds `notifiable` as the registered client. `spec.md` §4.4:
    /// throws if one is already bound, does not itself call back.
    pub fn register(&self, notifiable: Arc<dyn Notifiable>) -> Result<()> {
        let mut client = self.client.lock();
        if client.notifiable.is_some() {
            return Err(Error::logic("a client is already registered"));
        }
        client.notifiable = Some(notifiable);
        client.ready_emitted = false;
        Ok(())
    }

    /// Unbinds the registered client. Must not be called from inside a
    /// [`Notifiable`] callback (`spec.md` §4.4).
    ///
    /// While the server is ON, this only latches a flag that `work()`
    /// observes promptly and pokes the execution hook so a busy
    /// drain doesn't starve it; while OFF (no execution loop is
    /// running to observe the flag) it unbinds immediately.
    pub fn unregister(&self) -> Result<()> {
        if IN_NOTIFIABLE_CALLBACK.with(Cell::get) {
            return Err(Error::logic(
                "unregister() must not be called from inside a notifiable callback",
            ));
        }
        let is_on = self.client.lock().on;
        if is_on {
            self.unregister_pending.store(true, Ordering::SeqCst);
            self.poke_hook();
        } else {
            self.finalize_unregister();
        }
        Ok(())
    }

    fn finalize_unregister(&self) {
        {
            let mut client = self.client.lock();
            client.notifiable = None;
            client.ready_emitted = false;
        }
        let mut api = self.api.lock();
        api.queue.clear();
        api.loan_requested = false;
    }

    /// Takes ownership of `request`. Rejects an oversized serialized
    /// request with `InvalidArgument`; range/permission/value errors on
    /// the payload are reported as a response, not here (`spec.md`
    /// §4.4/§7). Pokes the execution hook once enqueued.
    pub fn send(&self, request: Request) -> Result<()> {
        if request.serialized_len() > self.limits.max_request_size {
            return Err(Error::invalid_argument(
                "request serialized size exceeds max_request_size",
            ));
        }
        self.api.lock().queue.push_back(request);
        self.poke_hook();
        Ok(())
    }

    /// Requests exactly one future `loan_execution_context` callback.
    /// Coalescing: any number of calls before the callback fires
    /// produce exactly one (`spec.md` §4.4).
    pub fn request_execution_context(&self) {
        self.api.lock().loan_requested = true;
        self.poke_hook();
    }

    // ---- Execution interface ---------------------------------------

    /// Runs exactly once per OFF->ON transition. Flips the on/off bit;
    /// `work()`'s next call will emit `OnReady` if a client is bound.
    pub fn on_start(&self) {
        if let Some(span) = &self.span {
            let _enter = span.enter();
            tracing::debug!("request server starting");
        }
        self.client.lock().on = true;
    }

    /// Runs exactly once per ON->OFF transition. Drops any queued or
    /// in-flight request without a response and, if a client is (and
    /// was) registered, delivers exactly one `OnDisconnected`
    /// (`spec.md` §4.4 invariant (d)). Registration itself survives —
    /// the state diagram's "any ON --on_stop--> corresponding OFF"
    /// keeps a registered client registered, just no longer ON.
    pub fn on_stop(&self) {
        let notifiable = {
            let mut client = self.client.lock();
            let was_on = client.on;
            client.on = false;
            client.ready_emitted = false;
            if was_on {
                client.notifiable.clone()
            } else {
                None
            }
        };
        {
            let mut api = self.api.lock();
            api.queue.clear();
            api.loan_requested = false;
        }
        if let Some(notifiable) = notifiable {
            if let Some(span) = &self.span {
                let _enter = span.enter();
                tracing::debug!("request server stopping, notifying client of disconnect");
            }
            self.call_notifiable(|| notifiable.on_disconnected());
        }
    }

    /// Drains whatever is queued, dispatching each request against the
    /// object dictionary and delivering its response, honoring a
    /// pending `request_execution_context` loan, and checking for a
    /// pending `unregister()` before each unit of work (`spec.md`
    /// §4.4). Returns `Err(OutOfMemory)` if a handler ran out of
    /// memory; the caller (an execution adapter) is expected to retry
    /// after `oom_retry_delay` — see `spec.md` §4.4/§7/§9.
    pub fn work(&self) -> std::result::Result<(), OutOfMemory> {
        if self.unregister_pending.swap(false, Ordering::SeqCst) {
            self.finalize_unregister();
            return Ok(());
        }

        let ready_target = {
            let mut client = self.client.lock();
            if client.on && client.notifiable.is_some() && !client.ready_emitted {
                client.ready_emitted = true;
                client.notifiable.clone()
            } else {
                None
            }
        };
        if let Some(notifiable) = ready_target {
            let (max_request_size, max_response_size) =
                (self.limits.max_request_size, self.limits.max_response_size);
            self.call_notifiable(|| notifiable.on_ready(max_request_size, max_response_size));
        }

        let notifiable = self.client.lock().notifiable.clone();

        loop {
            if self.unregister_pending.swap(false, Ordering::SeqCst) {
                self.finalize_unregister();
                return Ok(());
            }
            let next = self.api.lock().queue.pop_front();
            let request = match next {
                Some(request) => request,
                None => break,
            };
            // Cloned so the original can be put back at the head of the
            // queue if the handler runs out of memory — a retried
            // `work()` call must see the same request again, not an
            // empty queue (`spec.md` §4.4/§7).
            match self.process_one(request.clone()) {
                Ok(response) => {
                    if let Some(notifiable) = &notifiable {
                        self.call_notifiable(|| notifiable.on_request_processed(response));
                    }
                }
                Err(OutOfMemory) => {
                    self.api.lock().queue.push_front(request);
                    if let Some(span) = &self.span {
                        let _enter = span.enter();
                        tracing::warn!("object dictionary out of memory, will retry");
                    }
                    return Err(OutOfMemory);
                }
            }
        }

        let loan_target = {
            let mut api = self.api.lock();
            if api.loan_requested {
                api.loan_requested = false;
                true
            } else {
                false
            }
        };
        if loan_target {
            if let Some(notifiable) = &notifiable {
                self.call_notifiable(|| notifiable.loan_execution_context());
            }
        }
        Ok(())
    }

    /// The retry delay an execution adapter should sleep for after a
    /// `work()` call returns `Err(OutOfMemory)`.
    pub fn oom_retry_delay(&self) -> Duration {
        self.oom_retry_delay
    }

    fn process_one(&self, request: Request) -> std::result::Result<Response, OutOfMemory> {
        let Request { kind, return_stack } = request;
        let header_and_stack = 4 + return_stack.len() * 8;
        let body = match kind {
            RequestKind::Ping => ResponseBody::Ping,
            RequestKind::ObjectEnum {
                first,
                last,
                selectors,
            } => {
                if first > last {
                    ResponseBody::Error(crate::error::ServeError::OutOfRange)
                } else {
                    match self.dictionary.enumerate(first, last, selectors) {
                        Ok(codes) => ResponseBody::ObjectEnum { codes },
                        Err(DictionaryError::Serve(e)) => ResponseBody::Error(e),
                        Err(DictionaryError::OutOfMemory) => return Err(OutOfMemory),
                    }
                }
            }
            RequestKind::ObjectInfo {
                index,
                first_subindex,
                last_subindex,
                include_names,
                include_app_meta,
            } => {
                if first_subindex > last_subindex {
                    ResponseBody::Error(crate::error::ServeError::OutOfRange)
                } else {
                    match self.dictionary.object_info(
                        index,
                        first_subindex,
                        last_subindex,
                        include_names,
                        include_app_meta,
                    ) {
                        Ok(info) => {
                            let (info, continue_at_subindex) = request::truncate_object_info(
                                info,
                                self.limits.max_response_size,
                                header_and_stack,
                            );
                            ResponseBody::ObjectInfo {
                                info,
                                continue_at_subindex,
                            }
                        }
                        Err(DictionaryError::Serve(e)) => ResponseBody::Error(e),
                        Err(DictionaryError::OutOfMemory) => return Err(OutOfMemory),
                    }
                }
            }
            RequestKind::Read {
                index,
                subindex,
                attrs,
            } => match self.dictionary.read(index, subindex, attrs) {
                Ok(data) => {
                    if header_and_stack + data.len() > self.limits.max_response_size {
                        ResponseBody::Error(crate::error::ServeError::SizeExceeded)
                    } else {
                        ResponseBody::Read { data }
                    }
                }
                Err(DictionaryError::Serve(e)) => ResponseBody::Error(e),
                Err(DictionaryError::OutOfMemory) => return Err(OutOfMemory),
            },
            RequestKind::Write {
                index,
                subindex,
                attrs,
                data,
            } => match self.dictionary.write(index, subindex, attrs, &data) {
                Ok(()) => ResponseBody::Write,
                Err(DictionaryError::Serve(e)) => ResponseBody::Error(e),
                Err(DictionaryError::OutOfMemory) => return Err(OutOfMemory),
            },
        };
        Ok(Response::ok(body, return_stack))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::notifiable::DictionaryResult;
    use crate::server::request::{AccessAttributes, EnumSelectors, ObjectInfoResult};
    use std::sync::Mutex as StdMutex;

    struct NullDictionary;
    impl ObjectDictionaryAccess for NullDictionary {
        fn enumerate(&self, _: u16, _: u16, _: EnumSelectors) -> DictionaryResult<Vec<u16>> {
            Ok(vec![])
        }
        fn object_info(
            &self,
            _: u16,
            _: u8,
            _: u8,
            _: bool,
            _: bool,
        ) -> DictionaryResult<ObjectInfoResult> {
            Ok(ObjectInfoResult::default())
        }
        fn read(&self, _: u16, _: u8, _: AccessAttributes) -> DictionaryResult<Vec<u8>> {
            Ok(vec![])
        }
        fn write(&self, _: u16, _: u8, _: AccessAttributes, _: &[u8]) -> DictionaryResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingClient {
        events: StdMutex<Vec<String>>,
    }
    impl Notifiable for RecordingClient {
        fn on_ready(&self, max_request_size: usize, max_response_size: usize) {
            self.events
                .lock()
                .unwrap()
                .push(format!("ready({max_request_size},{max_response_size})"));
        }
        fn on_disconnected(&self) {
            self.events.lock().unwrap().push("disconnected".into());
        }
        fn on_request_processed(&self, response: Response) {
            self.events
                .lock()
                .unwrap()
                .push(format!("processed({:?})", response.body));
        }
        fn loan_execution_context(&self) {
            self.events.lock().unwrap().push("loan".into());
        }
    }

    fn core() -> RequestServerCore {
        RequestServerCore::new(
            Arc::new(NullDictionary),
            ServerLimits::new(256, 256).unwrap(),
            Duration::from_millis(10),
            None,
        )
        .unwrap()
    }

    #[test]
    fn register_twice_is_logic_error() {
        let core = core();
        let client = Arc::new(RecordingClient::default());
        core.register(client.clone()).unwrap();
        assert!(matches!(
            core.register(client).unwrap_err(),
            Error::Logic(_)
        ));
    }

    #[test]
    fn on_ready_fires_once_before_any_response() {
        let core = core();
        let client = Arc::new(RecordingClient::default());
        core.register(client.clone()).unwrap();
        core.on_start();
        core.send(Request::new(RequestKind::Ping)).unwrap();
        core.work().unwrap();
        core.send(Request::new(RequestKind::Ping)).unwrap();
        core.work().unwrap();
        let events = client.events.lock().unwrap();
        assert_eq!(events[0], "ready(256,256)");
        assert_eq!(
            events.iter().filter(|e| e.starts_with("ready")).count(),
            1
        );
    }

    #[test]
    fn register_while_off_defers_ready_until_start() {
        let core = core();
        let client = Arc::new(RecordingClient::default());
        core.register(client.clone()).unwrap();
        assert!(client.events.lock().unwrap().is_empty());
        core.on_start();
        core.work().unwrap();
        assert_eq!(client.events.lock().unwrap()[0], "ready(256,256)");
    }

    #[test]
    fn on_stop_drops_pending_and_notifies_disconnected_once() {
        let core = core();
        let client = Arc::new(RecordingClient::default());
        core.register(client.clone()).unwrap();
        core.on_start();
        core.work().unwrap();
        for _ in 0..5 {
            core.send(Request::new(RequestKind::Ping)).unwrap();
        }
        core.on_stop();
        let events = client.events.lock().unwrap();
        assert_eq!(events.iter().filter(|e| **e == "disconnected").count(), 1);
        assert_eq!(
            events.iter().filter(|e| e.starts_with("processed")).count(),
            0
        );
    }

    #[test]
    fn oversized_request_rejected_synchronously() {
        let core = RequestServerCore::new(
            Arc::new(NullDictionary),
            ServerLimits::new(8, 8).unwrap(),
            Duration::from_millis(10),
            None,
        )
        .unwrap();
        let big = Request::new(RequestKind::Write {
            index: 0,
            subindex: 0,
            attrs: AccessAttributes::default(),
            data: vec![0u8; 64],
        });
        assert!(matches!(
            core.send(big).unwrap_err(),
            Error::InvalidArgument(_)
        ));
    }

    #[test]
    fn object_enum_range_rejected_as_response_not_error() {
        let core = core();
        let client = Arc::new(RecordingClient::default());
        core.register(client.clone()).unwrap();
        core.on_start();
        core.work().unwrap();
        core.send(Request::new(RequestKind::ObjectEnum {
            first: 5,
            last: 1,
            selectors: EnumSelectors::default(),
        }))
        .unwrap();
        core.work().unwrap();
        let events = client.events.lock().unwrap();
        assert!(events.iter().any(|e| e.contains("Error(OutOfRange)")));
    }

    #[test]
    fn request_execution_context_coalesces() {
        let core = core();
        let client = Arc::new(RecordingClient::default());
        core.register(client.clone()).unwrap();
        core.on_start();
        core.work().unwrap();
        core.request_execution_context();
        core.request_execution_context();
        core.request_execution_context();
        core.work().unwrap();
        let events = client.events.lock().unwrap();
        assert_eq!(events.iter().filter(|e| **e == "loan").count(), 1);
    }

    #[test]
    fn unregister_from_inside_callback_is_rejected() {
        struct SelfUnregistering<'a>(&'a RequestServerCore);
        impl Notifiable for SelfUnregistering<'_> {
            fn on_ready(&self, _: usize, _: usize) {
                assert!(matches!(
                    self.0.unregister().unwrap_err(),
                    Error::Logic(_)
                ));
            }
            fn on_disconnected(&self) {}
            fn on_request_processed(&self, _: Response) {}
            fn loan_execution_context(&self) {}
        }
        // Leak the core to satisfy the 'a borrow across `register`,
        // which expects `Arc<dyn Notifiable>` (`'static`).
        let core: &'static RequestServerCore = Box::leak(Box::new(core()));
        let client = Arc::new(SelfUnregistering(core));
        core.register(client).unwrap();
        core.on_start();
        core.work().unwrap();
    }
}
