//! `Context`: one independent unit of request tracking and progress.
//!
//! Mirrors `crt_context.c`'s `crt_context` object. Each `Context` owns its
//! [`EpiTable`] and [`TimeoutHeap`] behind a single mutex (`ctx_mu`); every
//! other lock in the crate (an `Epi`'s own queue mutex, the hooks'
//! `RwLock`s) nests *inside* it, never the reverse (spec §5).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, instrument, warn};

use crate::endpoint::{Endpoint, Opcode, Rank, OPCODE_URI_LOOKUP};
use crate::epi::AdmitOutcome;
use crate::epi_table::EpiTable;
use crate::error::{Error, Result};
use crate::hooks::PluginHooks;
use crate::registry::ContextRegistry;
use crate::request::{CompleteCb, Request, RequestState};
use crate::timeout_heap::TimeoutHeap;
use crate::transport::Transport;

pub type RpcTaskCb = Arc<dyn Fn(Request) + Send + Sync>;

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_micros() as u64
}

/// Transport timeout cap for a single `progress` iteration: 1ms when the
/// caller wants to wait indefinitely, otherwise the smaller of the
/// remaining budget and 1s (spec §4.8, matching `crt_progress`'s own
/// `hg_timeout` clamp so a registered progress callback never starves).
const INFINITE_WAIT_SLICE: Duration = Duration::from_millis(1);
const MAX_WAIT_SLICE: Duration = Duration::from_secs(1);

struct ContextState {
    epi_table: EpiTable,
    timeout_heap: TimeoutHeap,
    /// Ranks the group layer has reported permanently unreachable (spec
    /// GLOSSARY "Eviction"). Consulted only by the timer-reset path in
    /// `handle_timeout`; tracking it here keeps it under `ctx_mu` with
    /// everything else the timeout handler reads.
    evicted: HashSet<Rank>,
}

/// Condition callback for `Context::progress`: returns `Ok(true)` once
/// the caller's wait condition is satisfied, `Ok(false)` to keep
/// looping, or `Err` to abort the wait (spec §4.7).
pub type CondCb = Box<dyn FnMut() -> Result<bool> + Send>;

pub struct Context {
    idx: usize,
    transport: Arc<dyn Transport>,
    hooks: Arc<PluginHooks>,
    state: Mutex<ContextState>,
    default_timeout_us: AtomicU64,
    credit_ep_ctx: u64,
    rpc_tasks: RwLock<HashMap<Opcode, RpcTaskCb>>,
    destroyed: AtomicBool,
}

impl Context {
    /// Creates and registers a new context (`crt_context_create`, spec §4.1).
    pub fn create(registry: &ContextRegistry, transport: Arc<dyn Transport>) -> Result<Arc<Context>> {
        let default_timeout_us = registry.config().default_timeout_us;
        let credit_ep_ctx = registry.config().credit_ep_ctx;
        let hooks = registry.hooks();
        registry.insert(move |idx| {
            Arc::new(Context {
                idx,
                transport,
                hooks,
                state: Mutex::new(ContextState {
                    epi_table: EpiTable::new(),
                    timeout_heap: TimeoutHeap::new(),
                    evicted: HashSet::new(),
                }),
                default_timeout_us: AtomicU64::new(default_timeout_us),
                credit_ep_ctx,
                rpc_tasks: RwLock::new(HashMap::new()),
                destroyed: AtomicBool::new(false),
            })
        })
    }

    pub fn index(&self) -> usize {
        self.idx
    }

    pub fn set_timeout(&self, timeout_us: u64) {
        self.default_timeout_us.store(timeout_us, Ordering::Relaxed);
    }

    /// Registers a local handler for `opcode`, used for the address-
    /// resolution sub-protocol (spec §4.5) and any other opcode a caller
    /// wants serviced without going through endpoint tracking.
    pub fn register_rpc_task(&self, opcode: Opcode, handler: RpcTaskCb) {
        self.rpc_tasks.write().insert(opcode, handler);
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Records a group-layer eviction notification for `rank` (spec
    /// GLOSSARY "Eviction"). Affects only the timer-reset path: once
    /// evicted, a `reset_timer`-opted-in request targeting this rank no
    /// longer gets its deadline refreshed and instead completes with
    /// `Unreach` on its next expiry.
    pub fn mark_rank_evicted(&self, rank: Rank) {
        self.state.lock().evicted.insert(rank);
    }

    pub fn is_rank_evicted(&self, rank: Rank) -> bool {
        self.state.lock().evicted.contains(&rank)
    }

    /// Admits a new outbound request for tracking (`crt_context_req_track`,
    /// spec §4.2/§4.4). `OPCODE_URI_LOOKUP` requests bypass EPI admission
    /// entirely per spec §4.5, going straight onto the wire and the
    /// timeout heap.
    #[instrument(skip(self, payload, complete_cb), fields(ctx = self.idx, rank = endpoint.rank, opcode))]
    pub fn track(
        &self,
        endpoint: Endpoint,
        opcode: Opcode,
        payload: Vec<u8>,
        reset_timer: bool,
        complete_cb: CompleteCb,
    ) -> Result<Request> {
        if self.is_destroyed() {
            return Err(Error::Invalid("context is destroyed".to_string()));
        }

        let deadline_us = now_us() + self.default_timeout_us.load(Ordering::Relaxed);
        let request = Request::new(opcode, endpoint.clone(), payload, deadline_us, reset_timer, complete_cb);

        if opcode == OPCODE_URI_LOOKUP {
            request.set_state(RequestState::UriLookup);
            request.set_on_wire(true);
            {
                let mut state = self.state.lock();
                state.timeout_heap.insert(request.clone());
            }
            if let Err(e) = self.transport.send(&request) {
                self.untrack(&request, Err(e.clone()));
                return Err(e);
            }
            return Ok(request);
        }

        let rank = endpoint.rank;
        let outcome = {
            let mut state = self.state.lock();
            let epi = state.epi_table.lookup_or_create(rank, self.credit_ep_ctx);
            epi.admit(request.clone())
        };

        match outcome {
            AdmitOutcome::Admitted => {
                request.set_state(RequestState::Sent);
                {
                    let mut state = self.state.lock();
                    state.timeout_heap.insert(request.clone());
                }
                if let Err(e) = self.transport.send(&request) {
                    self.untrack(&request, Err(e.clone()));
                    return Err(e);
                }
            }
            AdmitOutcome::Parked => {
                debug!("request parked: endpoint credit exhausted");
            }
        }

        Ok(request)
    }

    /// Completes a tracked request: removes it from the timeout heap (if
    /// present), releases its EPI credit, resends any promoted waiters —
    /// strictly outside the EPI lock (spec §4.2 ADDED) — and finally
    /// fires the request's own completion callback.
    ///
    /// This ordering matters: a promoted waiter's `send` can recurse back
    /// into this crate (a mock transport in tests completes synchronously),
    /// so nothing here may still be holding a lock when it happens.
    pub fn untrack(&self, request: &Request, outcome: Result<()>) {
        let rank = request.endpoint().rank;
        // Deliberately *not* `RequestState::from_completion(...) ==
        // Completed`: that mapping also treats a bare `TransportFailed`
        // as `Completed` (spec §7 has no separate failure state), but a
        // promoted waiter whose re-send itself fails recurses back into
        // this same function with a `TransportFailed` outcome — the
        // original's `crt_context_req_untrack` handles exactly this case
        // by forcing the request back to `RPC_STATE_INITED` before the
        // bookkeeping check, specifically so it decrements `req_num`
        // instead of crediting a `reply_num` that never happened (spec §9
        // "Open question — promotion re-send failure"). Keying `success`
        // on `outcome.is_ok()` gets the same outcome uniformly, without
        // needing a separate forced-state step.
        let success = outcome.is_ok();
        let promoted = {
            let mut state = self.state.lock();
            if request.in_heap() {
                state.timeout_heap.remove(request);
            }
            let promoted = if request.opcode() == OPCODE_URI_LOOKUP {
                Vec::new()
            } else if let Some(epi) = state.epi_table.lookup(rank) {
                let promoted = epi.complete(request, success);
                state.epi_table.evict_if_idle(rank);
                promoted
            } else {
                Vec::new()
            };
            promoted
        };

        request.complete(outcome);

        for waiter in promoted {
            {
                let mut state = self.state.lock();
                state.timeout_heap.insert(waiter.clone());
            }
            if let Err(e) = self.transport.send(&waiter) {
                self.untrack(&waiter, Err(e));
            }
        }
    }

    /// Runs the progress loop (spec §4.7, grounded in `crt_progress`).
    ///
    /// Step order per request: `cond_cb` first, then each iteration scans
    /// the timeout heap, fires progress hooks (only on context 0), polls
    /// the transport for a bounded slice, runs timeout handlers for
    /// whatever expired, then checks `cond_cb` again. The fast path —
    /// `timeout_us == Some(0)` or no `cond_cb` at all — runs exactly one
    /// iteration and returns, matching the C API's single-poll behavior
    /// when there's nothing to wait on.
    pub fn progress(&self, timeout_us: Option<u64>, mut cond_cb: Option<CondCb>) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::Invalid("context is destroyed".to_string()));
        }

        if let Some(cb) = cond_cb.as_mut() {
            if cb()? {
                return Ok(());
            }
        }

        let fast_path = matches!(timeout_us, Some(0)) || cond_cb.is_none();
        let start = now_us();

        loop {
            let now = now_us();
            let expired = {
                let mut state = self.state.lock();
                state.timeout_heap.pop_expired(now)
            };

            if self.idx == 0 {
                self.hooks.fire_progress();
            }

            let slice = match timeout_us {
                None => INFINITE_WAIT_SLICE,
                Some(0) => Duration::ZERO,
                Some(remaining_us) => {
                    let elapsed = now_us().saturating_sub(start);
                    let remaining = remaining_us.saturating_sub(elapsed);
                    if remaining == 0 {
                        Duration::ZERO
                    } else {
                        Duration::from_micros(remaining).min(MAX_WAIT_SLICE)
                    }
                }
            };

            let outcome = self.transport.progress(slice);
            for (request, result) in outcome.completions {
                self.untrack(&request, result);
            }

            let handler_now = now_us();
            for request in expired {
                self.handle_timeout(request, handler_now);
            }

            if fast_path {
                return Ok(());
            }

            if let Some(cb) = cond_cb.as_mut() {
                if cb()? {
                    return Ok(());
                }
            }

            if let Some(t) = timeout_us {
                if now_us().saturating_sub(start) >= t {
                    return Err(Error::Timeout(None));
                }
            }
        }
    }

    fn handle_timeout(&self, request: Request, now: u64) {
        let rank = request.endpoint().rank;
        let state_at_timeout = request.state();

        // Timer renewal (spec §4.9 step 1): only while the opcode opts in,
        // the rank hasn't been evicted, and the request hasn't already
        // reached a terminal state.
        if request.reset_timer_opt_in() && !state_at_timeout.is_terminal() {
            let evicted = self.state.lock().evicted.contains(&rank);
            if !evicted {
                let new_deadline = now + self.default_timeout_us.load(Ordering::Relaxed);
                request.set_deadline_us(new_deadline);
                let mut state = self.state.lock();
                state.timeout_heap.insert(request);
                return;
            }
        }

        self.hooks.fire_timeout(rank);

        match state_at_timeout {
            // The lookup sub-request is aborted; its own completion
            // callback is what completes the parent (spec §4.9
            // "UriLookup"). Completing it here too would fire `complete_cb`
            // twice once the sub-request's own callback runs.
            RequestState::UriLookup => {
                self.transport.cancel(&request);
            }
            RequestState::AddrLookup | RequestState::FwdUnreach => {
                self.untrack(&request, Err(Error::Unreach(request.id())));
            }
            // default (`Sent` et al., spec §4.9): ask the transport to
            // cancel and stop. The transport owns producing the final
            // completion — it may still be about to deliver a real reply,
            // so `untrack` must not run here (original `crt_req_timeout_hdlr`,
            // `crt_context.c`: "At this point, RPC should always be
            // completed by Mercury").
            _ => {
                self.transport.cancel(&request);
            }
        }
    }

    /// Forces `request` to expire right now: resets its deadline to zero
    /// and repositions it at the front of the timeout heap so the *next*
    /// `progress` pass runs the handler for it (spec §4.9 — this does not
    /// invoke the handler itself). Used by admin tooling and tests
    /// (`crt_req_force_timeout`).
    pub fn force_timeout(&self, request: &Request) {
        let mut state = self.state.lock();
        if request.in_heap() {
            state.timeout_heap.force_expire(request.clone());
        }
    }

    /// Cancels a single request (spec §5 "Cancellation: `cancel(req)`"):
    /// if it is still parked on its endpoint's wait queue, completes it
    /// synchronously with `Canceled`; if already inflight, asks the
    /// transport to cancel it and lets the normal completion path finish
    /// it asynchronously. Distinct from [`Context::ep_abort`] (every
    /// request targeting a rank) and `destroy` (every request in the
    /// context) — this one targets exactly `request`.
    pub fn cancel(&self, request: &Request) -> Result<()> {
        if request.state().is_terminal() {
            return Err(Error::InvalidState(request.id(), request.state(), "not yet terminal"));
        }

        if request.opcode() == OPCODE_URI_LOOKUP {
            self.transport.cancel(request);
            return Ok(());
        }

        let rank = request.endpoint().rank;
        let removed_from_wait = {
            let mut state = self.state.lock();
            let removed = state
                .epi_table
                .lookup(rank)
                .map(|epi| epi.cancel_waiter(request))
                .unwrap_or(false);
            if removed {
                state.epi_table.evict_if_idle(rank);
            }
            removed
        };

        if removed_from_wait {
            // R2 guarantees a parked (Queued-state) request is never in
            // the timeout heap, so there's nothing to unlink here.
            request.complete(Err(Error::Canceled(request.id())));
        } else {
            self.transport.cancel(request);
        }
        Ok(())
    }

    /// Tears down every EPI for `rank` in this context: waiters are
    /// canceled immediately, in-flight requests are asked to cancel but
    /// complete through their normal path (spec §4.7 "Cross-context
    /// ep_abort").
    pub fn ep_abort(&self, rank: Rank) -> Result<()> {
        let outcome = {
            let mut state = self.state.lock();
            state.epi_table.remove_and_abort(rank)
        };
        let Some(outcome) = outcome else {
            return Ok(());
        };

        for waiter in &outcome.waiters {
            if waiter.in_heap() {
                let mut state = self.state.lock();
                state.timeout_heap.remove(waiter);
            }
            waiter.complete(Err(Error::Canceled(waiter.id())));
        }
        for request in &outcome.inflight {
            self.transport.cancel(request);
        }
        Ok(())
    }

    /// Tears down the context. Non-force destroy fails with `Busy` while
    /// any EPI still has outstanding work; force destroy cancels
    /// everything first (spec §4.7).
    pub fn destroy(&self, registry: &ContextRegistry, force: bool) -> Result<()> {
        self.destroyed.store(true, Ordering::Release);
        // Rolls the flag back if we bail out early; defused once the
        // context is actually committed to tearing down.
        let rollback = scopeguard::guard(&self.destroyed, |flag| {
            flag.store(false, Ordering::Release);
        });

        let mut state = self.state.lock();
        if !force {
            let busy = state.epi_table.traverse().any(|e| !e.is_idle());
            if busy {
                return Err(Error::Busy(format!(
                    "context {} has outstanding requests",
                    self.idx
                )));
            }
        }
        scopeguard::ScopeGuard::into_inner(rollback);

        let aborted = state.epi_table.destroy_all();
        drop(state);

        for (rank, outcome) in aborted {
            for waiter in &outcome.waiters {
                waiter.complete(Err(Error::Canceled(waiter.id())));
            }
            for request in &outcome.inflight {
                self.transport.cancel(request);
                warn!(rank, "context destroyed with request still in flight");
            }
        }

        registry.remove(self.idx);
        Ok(())
    }

    /// Delivers a request the transport received locally, dispatching
    /// through a registered task handler if one matches the opcode
    /// (spec §4.5's lookup-handler pattern generalized to any opcode).
    pub fn deliver(&self, request: Request) {
        let handler = self.rpc_tasks.read().get(&request.opcode()).cloned();
        if let Some(handler) = handler {
            handler(request);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::endpoint::GroupId;
    use crate::transport::MockTransport;
    use std::sync::atomic::AtomicUsize;

    fn endpoint(rank: Rank) -> Endpoint {
        Endpoint::new(GroupId::new("g"), rank, 0)
    }

    #[test]
    fn track_and_untrack_balances_live_requests() {
        let registry = ContextRegistry::new(Config::default());
        let transport = MockTransport::new();
        let ctx = Context::create(&registry, transport.clone()).unwrap();

        let before = crate::request::live_request_count();
        let completed = Arc::new(AtomicUsize::new(0));
        let completed2 = completed.clone();
        let request = ctx
            .track(endpoint(1), 7, b"hi".to_vec(), false, Box::new(move |_| {
                completed2.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        ctx.untrack(&request, Ok(()));
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        drop(request);
        assert_eq!(crate::request::live_request_count(), before);
    }

    #[test]
    fn credit_parks_beyond_limit() {
        let mut config = Config::default();
        config.credit_ep_ctx = 1;
        let registry = ContextRegistry::new(config);
        let transport = MockTransport::new();
        let ctx = Context::create(&registry, transport).unwrap();

        let a = ctx.track(endpoint(1), 1, vec![], false, Box::new(|_| {})).unwrap();
        let b = ctx.track(endpoint(1), 1, vec![], false, Box::new(|_| {})).unwrap();
        assert_eq!(a.state(), RequestState::Sent);
        assert_eq!(b.state(), RequestState::Queued);

        ctx.untrack(&a, Ok(()));
        assert_eq!(b.state(), RequestState::Sent);
    }

    #[test]
    fn non_force_destroy_fails_with_outstanding_work() {
        let registry = ContextRegistry::new(Config::default());
        let transport = MockTransport::new();
        let ctx = Context::create(&registry, transport).unwrap();

        let _request = ctx.track(endpoint(1), 1, vec![], false, Box::new(|_| {})).unwrap();
        assert!(matches!(ctx.destroy(&registry, false), Err(Error::Busy(_))));
        assert!(ctx.destroy(&registry, true).is_ok());
    }

    #[test]
    fn force_timeout_defers_to_the_next_progress_pass() {
        let registry = ContextRegistry::new(Config::default());
        let transport = MockTransport::new();
        transport.set_cancel_reason(|req| Error::Timeout(Some(req.id())));
        let ctx = Context::create(&registry, transport.clone()).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let request = ctx
            .track(endpoint(1), 1, vec![], false, Box::new(move |info| {
                assert_eq!(info.state, RequestState::Timeout);
                fired2.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        transport.hold(request.id());

        ctx.force_timeout(&request);
        assert_eq!(request.state(), RequestState::Sent, "force_timeout only repositions the heap entry");
        assert_eq!(fired.load(Ordering::SeqCst), 0, "the handler hasn't run yet");

        // One progress call: the first internal iteration pops the expiry
        // and asks the transport to cancel; the transport's own completion
        // (reported on the next internal poll) is what finishes the
        // request, which the cond_cb loop here waits out.
        let fired_cb = fired.clone();
        ctx.progress(Some(1_000_000), Some(Box::new(move || Ok(fired_cb.load(Ordering::SeqCst) > 0))))
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn progress_drains_transport_completions() {
        let registry = ContextRegistry::new(Config::default());
        let transport = MockTransport::new();
        let ctx = Context::create(&registry, transport.clone()).unwrap();

        let completed = Arc::new(AtomicUsize::new(0));
        let completed2 = completed.clone();
        let _request = ctx
            .track(endpoint(1), 1, vec![], false, Box::new(move |_| {
                completed2.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        ctx.progress(Some(0), None).unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn uri_lookup_bypasses_epi_table() {
        use crate::endpoint::OPCODE_URI_LOOKUP;

        let registry = ContextRegistry::new(Config::default());
        let transport = MockTransport::new();
        let ctx = Context::create(&registry, transport).unwrap();

        let request = ctx
            .track(endpoint(9), OPCODE_URI_LOOKUP, vec![], false, Box::new(|_| {}))
            .unwrap();
        assert_eq!(request.state(), RequestState::UriLookup);

        let state = ctx.state.lock();
        assert!(state.epi_table.lookup(9).is_none());
    }

    #[test]
    fn timer_reset_then_eviction_completes_fwd_unreach() {
        let registry = ContextRegistry::new(Config::default());
        let transport = MockTransport::new();
        transport.set_cancel_reason(|req| Error::Unreach(req.id()));
        let ctx = Context::create(&registry, transport.clone()).unwrap();

        let state = Arc::new(Mutex::new(None));
        let state2 = state.clone();
        let request = ctx
            .track(endpoint(3), 1, vec![], true, Box::new(move |info| {
                *state2.lock() = Some(info.state);
            }))
            .unwrap();
        transport.hold(request.id());

        ctx.force_timeout(&request);
        assert_eq!(request.state(), RequestState::Sent, "force_timeout only repositions the heap entry");

        ctx.progress(Some(0), None).unwrap();
        assert_eq!(request.state(), RequestState::Sent, "renewed in place, rank not evicted yet");
        assert!(state.lock().is_none());

        ctx.mark_rank_evicted(3);
        ctx.force_timeout(&request);
        let state_cb = state.clone();
        ctx.progress(Some(1_000_000), Some(Box::new(move || Ok(state_cb.lock().is_some()))))
            .unwrap();
        assert_eq!(state.lock().unwrap(), RequestState::FwdUnreach);
    }

    #[test]
    fn ep_abort_cancels_inflight_and_waiters() {
        let mut config = Config::default();
        config.credit_ep_ctx = 1;
        let registry = ContextRegistry::new(config);
        let transport = MockTransport::new();
        let ctx = Context::create(&registry, transport).unwrap();

        let results = Arc::new(Mutex::new(Vec::new()));
        let r1 = results.clone();
        let r2 = results.clone();
        let a = ctx
            .track(endpoint(5), 1, vec![], false, Box::new(move |info| r1.lock().push(info.state)))
            .unwrap();
        let b = ctx
            .track(endpoint(5), 1, vec![], false, Box::new(move |info| r2.lock().push(info.state)))
            .unwrap();
        assert_eq!(a.state(), RequestState::Sent);
        assert_eq!(b.state(), RequestState::Queued);

        ctx.ep_abort(5).unwrap();
        assert_eq!(*results.lock(), vec![RequestState::Canceled]);
    }

    #[test]
    fn cancel_parked_waiter_completes_synchronously() {
        let mut config = Config::default();
        config.credit_ep_ctx = 1;
        let registry = ContextRegistry::new(config);
        let transport = MockTransport::new();
        let ctx = Context::create(&registry, transport.clone()).unwrap();

        let a = ctx.track(endpoint(2), 1, vec![], false, Box::new(|_| {})).unwrap();
        let b_state = Arc::new(Mutex::new(None));
        let b_state2 = b_state.clone();
        let b = ctx
            .track(endpoint(2), 1, vec![], false, Box::new(move |info| {
                *b_state2.lock() = Some(info.state);
            }))
            .unwrap();
        assert_eq!(b.state(), RequestState::Queued);

        ctx.cancel(&b).unwrap();
        assert_eq!(*b_state.lock(), Some(RequestState::Canceled));
        assert_eq!(transport.call_count(), 1, "b never reached the transport");

        // a is still inflight and untouched by b's cancellation.
        assert_eq!(a.state(), RequestState::Sent);
    }

    #[test]
    fn cancel_inflight_request_asks_transport_and_defers_completion() {
        let registry = ContextRegistry::new(Config::default());
        let transport = MockTransport::new();
        let ctx = Context::create(&registry, transport.clone()).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let request = ctx
            .track(endpoint(2), 1, vec![], false, Box::new(move |_| {
                fired2.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        ctx.cancel(&request).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0, "completion is async, via the transport");
        assert!(matches!(transport.calls().last(), Some(crate::transport::MockCall::Cancel(_))));

        ctx.progress(Some(0), None).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_already_terminal_request_is_invalid() {
        let registry = ContextRegistry::new(Config::default());
        let transport = MockTransport::new();
        let ctx = Context::create(&registry, transport).unwrap();

        let request = ctx.track(endpoint(2), 1, vec![], false, Box::new(|_| {})).unwrap();
        ctx.untrack(&request, Ok(()));

        assert!(matches!(ctx.cancel(&request), Err(Error::InvalidState(..))));
    }

    /// Open question (spec §9): a promoted waiter whose re-send fails must
    /// still complete exactly once, and `req_num`/`reply_num` must stay
    /// balanced — not double-counted by the recursive `untrack` call the
    /// re-send failure triggers.
    #[test]
    fn promotion_resend_failure_completes_once_without_double_counting() {
        let mut config = Config::default();
        config.credit_ep_ctx = 1;
        let registry = ContextRegistry::new(config);
        let transport = MockTransport::new();
        let fail_rank_5 = transport.clone();
        fail_rank_5.set_send_hook(|req| {
            if req.endpoint().rank == 5 && req.payload() == b"second".as_slice() {
                Err(Error::TransportFailed("link down".to_string()))
            } else {
                Ok(())
            }
        });
        let ctx = Context::create(&registry, transport).unwrap();

        let a_calls = Arc::new(AtomicUsize::new(0));
        let b_calls = Arc::new(AtomicUsize::new(0));
        let b_state = Arc::new(Mutex::new(None));
        let (a_calls2, b_calls2, b_state2) = (a_calls.clone(), b_calls.clone(), b_state.clone());

        let a = ctx
            .track(endpoint(5), 1, b"first".to_vec(), false, Box::new(move |_| {
                a_calls2.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        let _b = ctx
            .track(endpoint(5), 1, b"second".to_vec(), false, Box::new(move |info| {
                b_calls2.fetch_add(1, Ordering::SeqCst);
                *b_state2.lock() = Some(info.state);
            }))
            .unwrap();

        // `a` completes successfully, freeing a credit; `b` is promoted
        // and its re-send fails per the hook above.
        ctx.untrack(&a, Ok(()));

        assert_eq!(a_calls.load(Ordering::SeqCst), 1, "a's callback must fire exactly once");
        assert_eq!(b_calls.load(Ordering::SeqCst), 1, "b's callback must fire exactly once");
        assert_eq!(*b_state.lock(), Some(RequestState::Completed));

        let epi = {
            let state = ctx.state.lock();
            state.epi_table.lookup(5)
        };
        // Both requests are now accounted for: the table entry is idle
        // and evicted once both `a` and `b` have been fully retired.
        assert!(epi.is_none(), "idle EPI must be evicted from the table");
    }
}
