//! Ambient configuration structs for [`crate::server::RequestServerCore`]
//! and the execution adapters in [`crate::adapter`] — `spec.md` §6's
//! configuration table made concrete.

use crate::error::{Error, Result};
use std::time::Duration;

/// Protocol-defined bounds a [`ServerLimits`] must fall within.
///
/// The actual wire protocol is out of this crate's scope (`spec.md`
/// §1); these are conservative stand-ins large enough for any
/// reasonable object-dictionary payload and small enough to catch a
/// caller passing `0` or `usize::MAX` by mistake.
pub const MIN_SERVER_SIZE: usize = 8;
pub const MAX_SERVER_SIZE: usize = 1 << 20;

/// Negotiated request/response size ceilings, validated at
/// construction against [`MIN_SERVER_SIZE`]/[`MAX_SERVER_SIZE`]
/// (`spec.md` §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerLimits {
    pub max_request_size: usize,
    pub max_response_size: usize,
}

impl ServerLimits {
    /// Validates both bounds and returns the limits, or
    /// `Error::InvalidArgument` if either is outside the protocol's
    /// documented minimum/maximum.
    pub fn new(max_request_size: usize, max_response_size: usize) -> Result<Self> {
        let in_range = |n: usize| (MIN_SERVER_SIZE..=MAX_SERVER_SIZE).contains(&n);
        if !in_range(max_request_size) {
            return Err(Error::invalid_argument(
                "max_request_size outside protocol-defined bounds",
            ));
        }
        if !in_range(max_response_size) {
            return Err(Error::invalid_argument(
                "max_response_size outside protocol-defined bounds",
            ));
        }
        Ok(Self {
            max_request_size,
            max_response_size,
        })
    }
}

/// Advisory OS scheduling policy for [`ThreadAdapterConfig`].
///
/// `policy`/`priority` have no portable stable-Rust equivalent; they
/// are recorded and logged by [`crate::adapter::thread::ThreadAdapter`]
/// but cannot be applied to the spawned thread (documented deviation,
/// see `DESIGN.md`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedPolicy {
    #[default]
    Default,
    Fifo,
    RoundRobin,
}

/// The `sched_policy`/`priority`/`stack_size` triple `spec.md` §6
/// groups under "thread adapter, at start".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedHint {
    pub policy: SchedPolicy,
    pub priority: i32,
    /// `0` leaves the platform default stack size in place.
    pub stack_size: usize,
}

/// Construction parameters for [`crate::adapter::thread::ThreadAdapter::start`].
#[derive(Debug, Clone)]
pub struct ThreadAdapterConfig {
    pub thread_name: String,
    pub oom_retry_delay: Duration,
    pub sched_hint: SchedHint,
}

impl ThreadAdapterConfig {
    /// Validates `oom_retry_delay > 0` per `spec.md` §7.
    pub fn new(thread_name: impl Into<String>, oom_retry_delay: Duration) -> Result<Self> {
        if oom_retry_delay.is_zero() {
            return Err(Error::invalid_argument("oom_retry_delay_ms must be > 0"));
        }
        Ok(Self {
            thread_name: thread_name.into(),
            oom_retry_delay,
            sched_hint: SchedHint::default(),
        })
    }

    pub fn with_sched_hint(mut self, sched_hint: SchedHint) -> Self {
        self.sched_hint = sched_hint;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_limits_reject_out_of_bounds() {
        assert!(ServerLimits::new(0, 64).is_err());
        assert!(ServerLimits::new(64, 0).is_err());
        assert!(ServerLimits::new(usize::MAX, 64).is_err());
        assert!(ServerLimits::new(64, 64).is_ok());
    }

    #[test]
    fn thread_adapter_config_rejects_zero_delay() {
        let err = ThreadAdapterConfig::new("x", Duration::ZERO).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
