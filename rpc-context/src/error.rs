//! Crate-wide error taxonomy.
//!
//! Mirrors the failure kinds a caller can observe at the library boundary
//! (spec §7): most are terminal completion reasons for a single request,
//! a few (`Invalid`, `NoMem`, `Busy`) are synchronous call failures.

use crate::request::{RequestId, RequestState};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error, Clone)]
pub enum Error {
    /// Programmer error at the API boundary: a bad argument, a call made
    /// on an uninitialized or already-destroyed object.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// Allocation failure.
    #[error("out of memory")]
    NoMem,

    /// Transient capacity failure. Never surfaced from `admit` (that path
    /// converts it into wait-queue parking); surfaced from `context_create`
    /// (registry full) and from non-force `destroy`/`abort` with
    /// outstanding work.
    #[error("busy: {0}")]
    Busy(String),

    /// The request, or the endpoint it targeted, was canceled.
    #[error("request {0} canceled")]
    Canceled(RequestId),

    /// The request's deadline elapsed with no reply. `None` when the
    /// deadline belongs to a bare `progress(cond_cb, finite_timeout)`
    /// call rather than any single request (spec §7 propagation policy).
    #[error("timed out (request: {0:?})")]
    Timeout(Option<RequestId>),

    /// The target rank could not be addressed (lookup failure or
    /// eviction).
    #[error("request {0} target unreachable")]
    Unreach(RequestId),

    /// Opaque wrapper around a `Transport` failure.
    #[error("transport failed: {0}")]
    TransportFailed(String),

    /// A request was found in a state where the requested operation is
    /// not valid (e.g. canceling an already-completed request).
    #[error("request {0} in state {1:?}, expected {2}")]
    InvalidState(RequestId, RequestState, &'static str),
}

impl Error {
    /// True for errors that terminate a request and are delivered to its
    /// `complete_cb` rather than bubbling out of the call that caused them.
    pub fn is_terminal_for_request(&self) -> bool {
        matches!(
            self,
            Error::Canceled(_) | Error::Timeout(_) | Error::Unreach(_) | Error::TransportFailed(_)
        )
    }
}
