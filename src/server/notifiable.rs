//! Client-side collaborator interfaces: the notifiable callback
//! interface the server calls into, and the object-dictionary accessor
//! it dispatches requests against. Both are opaque collaborators per
//! `spec.md` §1 — this module only states their contract.

use super::request::{AccessAttributes, EnumSelectors, ObjectInfoResult, Response};

/// Client-side callback interface (`spec.md` §6 GLOSSARY "Notifiable").
///
/// `RequestServerCore` guarantees every call happens with no internal
/// mutex held (`spec.md` §4.4 invariant (e)), so an implementation is
/// free to call back into the server (e.g. `send` a follow-up request)
/// from within one of these methods — except `unregister`, which is
/// documented as forbidden from inside a callback.
pub trait Notifiable: Send + Sync {
    /// Called exactly once after registration, before any
    /// `on_request_processed`, with the negotiated size limits.
    fn on_ready(&self, max_request_size: usize, max_response_size: usize);

    /// The server stopped (or the registration was dropped from under
    /// an ON server); no further notification follows for this
    /// registration. Any request queued or in flight at the time is
    /// discarded without a response.
    fn on_disconnected(&self);

    /// Delivers the response to one previously `send`-ed request, in
    /// the order it was produced.
    fn on_request_processed(&self, response: Response);

    /// Fired once per consumption cycle when `request_execution_context`
    /// was called at least once since the last delivery.
    fn loan_execution_context(&self);
}

pub use crate::error::DictionaryResult;

/// The object-dictionary backing store, treated as an opaque
/// collaborator per `spec.md` §1. Assumed internally thread-safe by
/// its own contract (`spec.md` §5).
pub trait ObjectDictionaryAccess: Send + Sync {
    /// Lists the object codes discovered in `[first, last]` matching
    /// `selectors`. The caller (`RequestServerCore`) has already
    /// rejected `first > last` before this is called.
    fn enumerate(
        &self,
        first: u16,
        last: u16,
        selectors: EnumSelectors,
    ) -> DictionaryResult<Vec<u16>>;

    /// Metadata for `[first_subindex, last_subindex]` of `index`. The
    /// caller truncates the result to fit `max_response_size`; this
    /// method should return the full, untruncated set.
    fn object_info(
        &self,
        index: u16,
        first_subindex: u8,
        last_subindex: u8,
        include_names: bool,
        include_app_meta: bool,
    ) -> DictionaryResult<ObjectInfoResult>;

    /// Reads `index`/`subindex`, asserting `attrs`. `Err(ServeError::Permission)`
    /// if the object's attributes forbid it.
    fn read(
        &self,
        index: u16,
        subindex: u8,
        attrs: AccessAttributes,
    ) -> DictionaryResult<Vec<u8>>;

    /// Writes `data` to `index`/`subindex`, asserting `attrs`.
    fn write(
        &self,
        index: u16,
        subindex: u8,
        attrs: AccessAttributes,
        data: &[u8],
    ) -> DictionaryResult<()>;
}
