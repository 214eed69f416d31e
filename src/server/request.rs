//! Wire-opaque request/response types consumed by
//! [`super::RequestServerCore`]. `spec.md` §1 treats the actual byte
//! encoding as a collaborator outside this crate's scope; what's
//! modeled here is the shape the core needs to dispatch on and the
//! return-stack discipline it must preserve (`spec.md` §6, GLOSSARY).

use crate::error::ServeError;

/// One frame of the return stack accumulated by intermediate routers
/// on the way in, so a response can find its way back to the
/// originator without shared state (GLOSSARY: "Return stack").
///
/// `RequestServerCore` never interprets these frames; it only moves
/// them, unmodified, from a request onto its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnStackItem(pub u64);

/// A LIFO stack of [`ReturnStackItem`] frames.
pub type ReturnStack = Vec<ReturnStackItem>;

/// Selects which kinds of entries `ObjectEnum` should report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnumSelectors {
    pub include_readable: bool,
    pub include_writable: bool,
    pub include_rpc: bool,
}

/// Access attributes carried by `Read`/`Write` requests, describing
/// the permission class the client is asserting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessAttributes {
    pub read: bool,
    pub write: bool,
}

/// Per-subindex metadata returned by an `ObjectInfo` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubIndexInfo {
    pub subindex: u8,
    pub name: Option<String>,
    pub app_metadata: Option<String>,
    pub size_hint: usize,
}

/// Approximate serialized size of a [`SubIndexInfo`] entry, used only
/// to decide where an `ObjectInfo` response must be truncated — the
/// real encoding lives outside this crate.
fn subindex_info_len(info: &SubIndexInfo) -> usize {
    let mut len = 1 + 8; // subindex + size_hint
    if let Some(name) = &info.name {
        len += name.len();
    }
    if let Some(meta) = &info.app_metadata {
        len += meta.len();
    }
    len
}

/// The full, untruncated result an `ObjectDictionaryAccess` produces
/// for an `ObjectInfo` request; `RequestServerCore` truncates it to
/// fit `max_response_size` before handing it to the client.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectInfoResult {
    pub entries: Vec<SubIndexInfo>,
}

/// What kind of request this is, and its kind-specific payload.
/// Mirrors the table in `spec.md` §4.4.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Ping,
    ObjectEnum {
        first: u16,
        last: u16,
        selectors: EnumSelectors,
    },
    ObjectInfo {
        index: u16,
        first_subindex: u8,
        last_subindex: u8,
        include_names: bool,
        include_app_meta: bool,
    },
    Read {
        index: u16,
        subindex: u8,
        attrs: AccessAttributes,
    },
    Write {
        index: u16,
        subindex: u8,
        attrs: AccessAttributes,
        data: Vec<u8>,
    },
}

/// A client request, as accepted by [`super::RequestServerCore::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub kind: RequestKind,
    pub return_stack: ReturnStack,
}

impl Request {
    pub fn new(kind: RequestKind) -> Self {
        Self {
            kind,
            return_stack: ReturnStack::new(),
        }
    }

    pub fn with_return_stack(kind: RequestKind, return_stack: ReturnStack) -> Self {
        Self { kind, return_stack }
    }

    /// Approximate serialized length, used to enforce `max_request_size`
    /// at `send()` time. The real encoding is an external collaborator;
    /// this is a conservative stand-in good enough to enforce the
    /// documented size contract.
    pub(crate) fn serialized_len(&self) -> usize {
        let header = 4usize;
        let return_stack = self.return_stack.len() * 8;
        let payload = match &self.kind {
            RequestKind::Ping => 0,
            RequestKind::ObjectEnum { .. } => 4 + 1,
            RequestKind::ObjectInfo { .. } => 2 + 1 + 1 + 2,
            RequestKind::Read { .. } => 2 + 1 + 1,
            RequestKind::Write { data, .. } => 2 + 1 + 1 + data.len(),
        };
        header + return_stack + payload
    }
}

/// Body of a response, one variant per [`RequestKind`] plus a terminal
/// failure variant carrying a [`ServeError`] (never thrown, always
/// returned — `spec.md` §7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Ping,
    ObjectEnum {
        codes: Vec<u16>,
    },
    ObjectInfo {
        info: ObjectInfoResult,
        /// Set when the full `[first_subindex, last_subindex]` range
        /// didn't fit in `max_response_size`; the client is expected
        /// to re-request starting here.
        continue_at_subindex: Option<u8>,
    },
    Read {
        data: Vec<u8>,
    },
    Write,
    Error(ServeError),
}

/// A response, inheriting its originating request's return stack
/// unchanged (`spec.md` §4.4/§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub body: ResponseBody,
    pub return_stack: ReturnStack,
}

impl Response {
    pub(crate) fn ok(body: ResponseBody, return_stack: ReturnStack) -> Self {
        Self { body, return_stack }
    }

    pub(crate) fn error(err: ServeError, return_stack: ReturnStack) -> Self {
        Self {
            body: ResponseBody::Error(err),
            return_stack,
        }
    }

    /// Approximate serialized length; used to decide `ObjectInfo`
    /// truncation against `max_response_size`.
    pub(crate) fn serialized_len(&self) -> usize {
        let header = 4usize;
        let return_stack = self.return_stack.len() * 8;
        let payload = match &self.body {
            ResponseBody::Ping | ResponseBody::Write => 0,
            ResponseBody::ObjectEnum { codes } => codes.len() * 2,
            ResponseBody::ObjectInfo { info, .. } => {
                info.entries.iter().map(subindex_info_len).sum()
            }
            ResponseBody::Read { data } => data.len(),
            ResponseBody::Error(_) => 1,
        };
        header + return_stack + payload
    }
}

pub(super) fn truncate_object_info(
    mut info: ObjectInfoResult,
    max_response_size: usize,
    header_and_stack: usize,
) -> (ObjectInfoResult, Option<u8>) {
    let budget = max_response_size.saturating_sub(header_and_stack);
    let mut used = 0usize;
    let mut cutoff = None;
    for (i, entry) in info.entries.iter().enumerate() {
        let len = subindex_info_len(entry);
        if used + len > budget {
            cutoff = Some(i);
            break;
        }
        used += len;
    }
    if let Some(cutoff) = cutoff {
        let continue_at = info.entries[cutoff].subindex;
        info.entries.truncate(cutoff);
        (info, Some(continue_at))
    } else {
        (info, None)
    }
}
