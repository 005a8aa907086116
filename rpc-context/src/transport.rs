//! Transport seam (spec §1 Non-goals: wire format and network I/O are out
//! of scope; this crate only needs something to drive and cancel).
//!
//! A real deployment plugs in whatever moves bytes between ranks; tests
//! use [`MockTransport`], grounded in the teacher's `MockHttpClient`
//! (`batcher/src/http.rs`): a `Clone`-able `Arc`-backed mock that records
//! every call and lets a test configure canned responses up front.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::request::{Request, RequestId};

/// Outcome of one `Transport::progress` call, reported back to
/// `Context::progress` (spec §4.7 step 4) so it can run `untrack` for
/// every request the transport finished — strictly outside any core lock,
/// matching the way `Context::untrack` itself defers re-send past its own
/// lock (spec §4.2 ADDED).
#[derive(Default)]
pub struct ProgressOutcome {
    /// Requests the transport finished since the last call, each paired
    /// with the completion's outcome ((i) local termination reason or
    /// (ii) the peer-reported status, whichever is non-success first per
    /// spec §7).
    pub completions: Vec<(Request, Result<()>)>,
}

impl ProgressOutcome {
    pub fn made_progress(&self) -> bool {
        !self.completions.is_empty()
    }
}

pub trait Transport: Send + Sync {
    /// Hands `request` to the network layer. Called with no context lock
    /// held (spec §5: never call into `Transport` while holding `ctx_mu`
    /// or an EPI mutex).
    fn send(&self, request: &Request) -> Result<()>;

    /// Asks the transport to cancel an in-flight request. Best-effort:
    /// the request may still complete normally before the cancellation
    /// takes effect; the transport is responsible for eventually
    /// surfacing a terminal completion for it either way (spec §4.9
    /// default case).
    fn cancel(&self, request: &Request);

    /// Blocks up to `timeout` waiting for network events and returns
    /// every request that finished during the call. Returning early
    /// (before `timeout` elapses) is always valid.
    fn progress(&self, timeout: Duration) -> ProgressOutcome;
}

/// Record of a call made to [`MockTransport`], mirroring `MockCall` in
/// the teacher's HTTP mock.
#[derive(Debug, Clone)]
pub enum MockCall {
    Send(Endpoint),
    Cancel(Endpoint),
}

enum Pending {
    Sent(Request),
    Canceled(Request),
}

/// In-memory transport for tests. `send` enqueues; `progress` drains the
/// queue and resolves each entry through a configurable responder
/// (default: immediate success with an empty reply), so a test can either
/// let requests auto-complete on the next `Context::progress` call or
/// install a responder that inspects the payload first.
#[derive(Clone)]
pub struct MockTransport {
    pending: Arc<Mutex<VecDeque<Pending>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    responder: Arc<Mutex<Responder>>,
    /// Optional hook consulted by `send` before queueing, so a test can
    /// simulate a re-send failing synchronously (spec §9 "Open question —
    /// promotion re-send failure"). `None` (the default) always succeeds.
    send_hook: Arc<Mutex<Option<SendHook>>>,
    /// Requests `progress` leaves pending instead of auto-resolving, so a
    /// test can simulate a peer that never replies until the request is
    /// separately canceled. Set via `hold`/`release`.
    held: Arc<Mutex<HashSet<RequestId>>>,
    /// Optional hook deciding what error a canceled request resolves to
    /// once `progress` drains it (default: `Error::Canceled`). Lets a test
    /// simulate the transport reporting a cancellation as a timeout or an
    /// unreachable-rank failure instead.
    cancel_reason: Arc<Mutex<Option<CancelReasonHook>>>,
}

type Responder = Box<dyn FnMut(&Request) -> Result<Vec<u8>> + Send>;
type SendHook = Box<dyn FnMut(&Request) -> Result<()> + Send>;
type CancelReasonHook = Box<dyn FnMut(&Request) -> Error + Send>;

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(MockTransport::default())
    }

    /// Installs a responder invoked once per request as `progress` drains
    /// it, deciding whether the request succeeds (with the returned
    /// payload as its reply) or fails.
    pub fn set_responder(&self, responder: impl FnMut(&Request) -> Result<Vec<u8>> + Send + 'static) {
        *self.responder.lock().unwrap() = Box::new(responder);
    }

    /// Installs a hook that `send` consults before queuing the request;
    /// returning `Err` makes that `send` call fail synchronously instead
    /// of queuing.
    pub fn set_send_hook(&self, hook: impl FnMut(&Request) -> Result<()> + Send + 'static) {
        *self.send_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Installs a hook controlling the error a canceled request resolves
    /// to; without one, a canceled request resolves as `Error::Canceled`.
    pub fn set_cancel_reason(&self, hook: impl FnMut(&Request) -> Error + Send + 'static) {
        *self.cancel_reason.lock().unwrap() = Some(Box::new(hook));
    }

    /// Marks `request` as held: `progress` leaves it pending instead of
    /// resolving it through the responder, until `release` is called or
    /// the request is canceled (cancellation always resolves, regardless
    /// of `held`).
    pub fn hold(&self, request_id: RequestId) {
        self.held.lock().unwrap().insert(request_id);
    }

    pub fn release(&self, request_id: RequestId) {
        self.held.lock().unwrap().remove(&request_id);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Number of sends still awaiting a `progress` call to resolve them.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        MockTransport {
            pending: Arc::new(Mutex::new(VecDeque::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            responder: Arc::new(Mutex::new(Box::new(|_req: &Request| Ok(Vec::new())))),
            send_hook: Arc::new(Mutex::new(None)),
            held: Arc::new(Mutex::new(HashSet::new())),
            cancel_reason: Arc::new(Mutex::new(None)),
        }
    }
}

impl Transport for MockTransport {
    fn send(&self, request: &Request) -> Result<()> {
        if let Some(hook) = self.send_hook.lock().unwrap().as_mut() {
            hook(request)?;
        }
        self.calls
            .lock()
            .unwrap()
            .push(MockCall::Send(request.endpoint().clone()));
        self.pending.lock().unwrap().push_back(Pending::Sent(request.clone()));
        Ok(())
    }

    fn cancel(&self, request: &Request) {
        self.calls
            .lock()
            .unwrap()
            .push(MockCall::Cancel(request.endpoint().clone()));
        let mut pending = self.pending.lock().unwrap();
        if let Some(slot) = pending.iter_mut().find(|p| matches!(p, Pending::Sent(r) if r.is_same(request))) {
            *slot = Pending::Canceled(request.clone());
        }
    }

    fn progress(&self, _timeout: Duration) -> ProgressOutcome {
        let held = self.held.lock().unwrap();
        let mut pending = self.pending.lock().unwrap();
        let mut remaining = VecDeque::with_capacity(pending.len());
        let mut completions = Vec::new();
        for entry in pending.drain(..) {
            match entry {
                Pending::Sent(request) if held.contains(&request.id()) => {
                    remaining.push_back(Pending::Sent(request));
                }
                Pending::Sent(request) => {
                    let outcome = {
                        let mut responder = self.responder.lock().unwrap();
                        responder(&request)
                    };
                    match outcome {
                        Ok(reply) => {
                            request.set_reply(reply);
                            completions.push((request, Ok(())));
                        }
                        Err(e) => completions.push((request, Err(e))),
                    }
                }
                Pending::Canceled(request) => {
                    let err = match self.cancel_reason.lock().unwrap().as_mut() {
                        Some(hook) => hook(&request),
                        None => Error::Canceled(request.id()),
                    };
                    completions.push((request, Err(err)));
                }
            }
        }
        *pending = remaining;
        ProgressOutcome { completions }
    }
}
