//! Crate-wide error type.
//!
//! Synchronous, caller-visible operations (constructing a task, pushing
//! onto a queue, registering a client) fail with [`Error`]. Per-request
//! protocol failures (permission, range, size) are never reported this
//! way; they travel back to the client as a response with a failure
//! status, see [`crate::server::request::ServeError`]. Invariant
//! breaches (destroying a queued task, observing an impossible task
//! state) are not representable as an `Error` at all: they are
//! programming errors and are reported via `panic!`.

use thiserror::Error;

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Synchronous failure of a public API call.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied argument violates a documented precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The call was made while the receiver was in a state that
    /// forbids it (double registration, stop while not started, ...).
    #[error("logic error: {0}")]
    Logic(&'static str),
}

impl Error {
    pub(crate) fn invalid_argument(reason: &'static str) -> Self {
        Self::InvalidArgument(reason)
    }

    pub(crate) fn logic(reason: &'static str) -> Self {
        Self::Logic(reason)
    }
}

/// Per-request protocol failure, returned as a response status rather
/// than as an `Err`: `RequestServerCore::work` never fails a request by
/// propagating an error, it always produces a response, and a failed
/// one simply carries one of these in its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ServeError {
    /// The requested access is not permitted by the object's attributes.
    #[error("permission denied")]
    Permission,
    /// An index, subindex, or index range does not exist or is invalid
    /// (including `first > last`).
    #[error("index or subindex out of range")]
    OutOfRange,
    /// The request or the value it carries exceeds the negotiated size
    /// limit.
    #[error("size limit exceeded")]
    SizeExceeded,
    /// The supplied value is not acceptable for the target subindex.
    #[error("invalid value")]
    InvalidValue,
}

/// A handler-level failure that must never cross the notifiable
/// interface: the object-dictionary accessor ran out of memory while
/// servicing a request. `RequestServerCore::work` turns this into a
/// retry rather than a response, see `spec.md` §4.4/§7.
///
/// Modeled as a value instead of an exception per Design Note 9: "a
/// handler returns a temporarily out of resources marker, the loop
/// schedules itself again after the delay."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;

/// Outcome of a dictionary-accessor call: either the protocol-level
/// result/error, or a transient out-of-memory condition.
pub type DictionaryResult<T> = std::result::Result<T, DictionaryError>;

/// Failure mode of an [`crate::server::notifiable::ObjectDictionaryAccess`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictionaryError {
    /// A protocol-level failure that belongs in the response.
    Serve(ServeError),
    /// A transient allocation failure; never surfaced to the client.
    OutOfMemory,
}

impl From<ServeError> for DictionaryError {
    fn from(e: ServeError) -> Self {
        DictionaryError::Serve(e)
    }
}
