//! `Request` and its lifecycle state machine (spec §3, §4.4).
//!
//! Every place the spec talks about the request's refcount is realized
//! here as an `Arc` clone of [`Request`]: the EPI queues, the timeout
//! heap, and any in-flight transport op each hold one clone, in addition
//! to the caller's own. The request is freed the instant the last clone
//! drops — no separate counter to get wrong.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::endpoint::{Endpoint, Opcode};
use crate::epi::EpiInner;
use crate::error::Error;

/// Process-unique identifier attached to every request for log/trace
/// correlation only (spec §3 ADDED); it plays no role in any invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    fn new() -> Self {
        RequestId(Uuid::new_v4())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Lifecycle states from spec §3/§4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Inited,
    Queued,
    UriLookup,
    AddrLookup,
    Sent,
    FwdUnreach,
    Timeout,
    Canceled,
    Completed,
}

impl RequestState {
    /// (R2): `in_heap ⇒ state ∈ {Sent, UriLookup, AddrLookup}`.
    pub fn heap_eligible(self) -> bool {
        matches!(
            self,
            RequestState::Sent | RequestState::UriLookup | RequestState::AddrLookup
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed
                | RequestState::Canceled
                | RequestState::Timeout
                | RequestState::FwdUnreach
        )
    }

    /// Maps a termination reason to its terminal state, the way
    /// `crt_rpc_complete()` in the original maps an `rc` to `crp_state`
    /// (spec.md §3 doesn't spell this mapping out; SPEC_FULL.md §3 adds
    /// it as a named operation).
    pub fn from_completion(err: Option<&Error>) -> RequestState {
        match err {
            Some(Error::Canceled(_)) => RequestState::Canceled,
            Some(Error::Timeout(_)) => RequestState::Timeout,
            Some(Error::Unreach(_)) => RequestState::FwdUnreach,
            _ => RequestState::Completed,
        }
    }
}

/// Outcome handed to a request's completion callback exactly once (R3).
pub struct CompletionInfo {
    pub request_id: RequestId,
    pub state: RequestState,
    pub result: Result<(), Error>,
}

pub type CompleteCb = Box<dyn FnOnce(CompletionInfo) + Send>;

struct Mutable {
    state: RequestState,
    deadline_us: u64,
    in_heap: bool,
    on_wire: bool,
    /// Position inside `TimeoutHeap`'s backing vector, maintained by the
    /// heap itself to support O(log n) removal/reposition.
    heap_index: Option<usize>,
    /// Weak back-reference to the EPI that owns this request's queue
    /// position. Only ever read or written while holding that EPI's
    /// mutex (spec §3 "epi_link").
    epi_link: Option<Weak<EpiInner>>,
}

struct RequestInner {
    id: RequestId,
    opcode: Opcode,
    endpoint: Endpoint,
    payload: Vec<u8>,
    reply: Mutex<Vec<u8>>,
    /// Whether the opcode opts into timer-reset-on-expiry (spec §4.9).
    reset_timer: bool,
    mutable: Mutex<Mutable>,
    complete_cb: Mutex<Option<CompleteCb>>,
}

static LIVE_REQUESTS: AtomicUsize = AtomicUsize::new(0);

/// Number of `Request`s currently allocated. Exposed for the
/// "refcount balance" testable property (spec §8): at quiescence this
/// must be zero.
pub fn live_request_count() -> usize {
    LIVE_REQUESTS.load(Ordering::SeqCst)
}

/// Crate-public alias for integration tests outside `src/`, which can't
/// reach `crate::request::live_request_count` directly.
pub fn live_request_count_for_tests() -> usize {
    live_request_count()
}

impl Drop for RequestInner {
    fn drop(&mut self) {
        LIVE_REQUESTS.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An RPC invocation, cheaply cloneable; each clone is one "reference"
/// in the spec's sense.
#[derive(Clone)]
pub struct Request(Arc<RequestInner>);

impl Request {
    pub fn new(
        opcode: Opcode,
        endpoint: Endpoint,
        payload: Vec<u8>,
        deadline_us: u64,
        reset_timer: bool,
        complete_cb: CompleteCb,
    ) -> Self {
        LIVE_REQUESTS.fetch_add(1, Ordering::SeqCst);
        Request(Arc::new(RequestInner {
            id: RequestId::new(),
            opcode,
            endpoint,
            payload,
            reply: Mutex::new(Vec::new()),
            reset_timer,
            mutable: Mutex::new(Mutable {
                state: RequestState::Inited,
                deadline_us,
                in_heap: false,
                on_wire: false,
                heap_index: None,
                epi_link: None,
            }),
            complete_cb: Mutex::new(Some(complete_cb)),
        }))
    }

    pub fn id(&self) -> RequestId {
        self.0.id
    }

    pub fn opcode(&self) -> Opcode {
        self.0.opcode
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.0.endpoint
    }

    pub fn payload(&self) -> &[u8] {
        &self.0.payload
    }

    pub fn set_reply(&self, data: Vec<u8>) {
        *self.0.reply.lock() = data;
    }

    pub fn reply(&self) -> Vec<u8> {
        self.0.reply.lock().clone()
    }

    pub fn reset_timer_opt_in(&self) -> bool {
        self.0.reset_timer
    }

    pub fn state(&self) -> RequestState {
        self.0.mutable.lock().state
    }

    pub fn set_state(&self, state: RequestState) {
        self.0.mutable.lock().state = state;
    }

    pub fn deadline_us(&self) -> u64 {
        self.0.mutable.lock().deadline_us
    }

    pub fn set_deadline_us(&self, deadline_us: u64) {
        self.0.mutable.lock().deadline_us = deadline_us;
    }

    pub fn in_heap(&self) -> bool {
        self.0.mutable.lock().in_heap
    }

    pub(crate) fn set_in_heap(&self, in_heap: bool) {
        self.0.mutable.lock().in_heap = in_heap;
    }

    pub fn on_wire(&self) -> bool {
        self.0.mutable.lock().on_wire
    }

    pub fn set_on_wire(&self, on_wire: bool) {
        self.0.mutable.lock().on_wire = on_wire;
    }

    pub(crate) fn heap_index(&self) -> Option<usize> {
        self.0.mutable.lock().heap_index
    }

    pub(crate) fn set_heap_index(&self, idx: Option<usize>) {
        self.0.mutable.lock().heap_index = idx;
    }

    pub(crate) fn set_epi_link(&self, epi: Option<Weak<EpiInner>>) {
        self.0.mutable.lock().epi_link = epi;
    }

    pub(crate) fn epi_link(&self) -> Option<Weak<EpiInner>> {
        self.0.mutable.lock().epi_link.clone()
    }

    /// Fires `complete_cb` with the terminal state derived from `outcome`
    /// (R3: exactly once — a second call is a silent no-op, the `Option`
    /// having already been taken).
    pub fn complete(&self, outcome: Result<(), Error>) {
        let state = RequestState::from_completion(outcome.as_ref().err());
        self.set_state(state);
        if let Some(cb) = self.0.complete_cb.lock().take() {
            cb(CompletionInfo {
                request_id: self.id(),
                state,
                result: outcome,
            });
        }
    }

    /// True if this and `other` refer to the same underlying request.
    pub fn is_same(&self, other: &Request) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id())
            .field("opcode", &self.opcode())
            .field("endpoint", &self.endpoint())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::GroupId;
    use rstest::rstest;

    #[rstest]
    #[case::success(None, RequestState::Completed)]
    #[case::canceled(Some(Error::Canceled(RequestId::new())), RequestState::Canceled)]
    #[case::timeout(Some(Error::Timeout(None)), RequestState::Timeout)]
    #[case::unreach(Some(Error::Unreach(RequestId::new())), RequestState::FwdUnreach)]
    #[case::transport_failure_still_terminates(
        Some(Error::TransportFailed("link down".to_string())),
        RequestState::Completed
    )]
    fn from_completion_maps_every_termination_reason(
        #[case] err: Option<Error>,
        #[case] expected: RequestState,
    ) {
        assert_eq!(RequestState::from_completion(err.as_ref()), expected);
    }

    #[test]
    fn completion_fires_callback_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let request = Request::new(
            1,
            Endpoint::new(GroupId::new("g"), 0, 0),
            Vec::new(),
            0,
            false,
            Box::new(move |_| {
                calls2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        request.complete(Ok(()));
        request.complete(Ok(())); // second call must be a silent no-op (R3)
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn live_request_count_drops_to_zero_once_last_clone_is_gone() {
        let before = live_request_count();
        let request = Request::new(
            1,
            Endpoint::new(GroupId::new("g"), 0, 0),
            Vec::new(),
            0,
            false,
            Box::new(|_| {}),
        );
        let clone = request.clone();
        assert_eq!(live_request_count(), before + 1);
        drop(request);
        drop(clone);
        assert_eq!(live_request_count(), before);
    }
}
