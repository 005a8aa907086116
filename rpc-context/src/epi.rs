//! Endpoint Inflight tracking (EPI): per-endpoint credit-based admission.
//!
//! One [`Epi`] exists per `(rank)` inside a context's [`crate::epi_table::EpiTable`]
//! while that rank has outstanding or parked work. Its own mutex is the
//! innermost lock in the hierarchy (spec §5): never held while invoking a
//! user callback or while holding nothing else, and never acquired with
//! `ctx_mu` already released — the table entry could otherwise be evicted
//! out from under it.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::endpoint::Rank;
use crate::request::{Request, RequestState};

pub enum AdmitOutcome {
    /// Under credit, sent immediately.
    Admitted,
    /// At credit, parked on the wait queue; the caller must not dispatch.
    Parked,
}

struct Queues {
    /// Requests currently holding a credit (on the wire or about to be).
    req_q: VecDeque<Request>,
    /// Requests waiting for a credit to free up, FIFO.
    wait_q: VecDeque<Request>,
    req_num: u64,
    reply_num: u64,
}

/// Shared state for one endpoint's inflight tracking. `pub(crate)` so
/// [`crate::request::Request`] can hold a `Weak` back-reference for
/// debug/consistency checks without exposing the type outside the crate.
pub(crate) struct EpiInner {
    rank: Rank,
    credit_limit: u64,
    queues: Mutex<Queues>,
}

#[derive(Clone)]
pub struct Epi(Arc<EpiInner>);

impl Epi {
    pub fn new(rank: Rank, credit_limit: u64) -> Self {
        Epi(Arc::new(EpiInner {
            rank,
            credit_limit,
            queues: Mutex::new(Queues {
                req_q: VecDeque::new(),
                wait_q: VecDeque::new(),
                req_num: 0,
                reply_num: 0,
            }),
        }))
    }

    pub fn rank(&self) -> Rank {
        self.0.rank
    }

    /// True once both queues are empty; the owning
    /// [`crate::epi_table::EpiTable`] entry is removed the moment this
    /// goes true, no separate refcount needed (spec §4.3 ADDED — the
    /// table entry's lifetime is exactly its queue occupancy).
    pub fn is_idle(&self) -> bool {
        let q = self.0.queues.lock();
        q.req_q.is_empty() && q.wait_q.is_empty()
    }

    /// Admits `request` under this endpoint's credit, or parks it if the
    /// credit is exhausted (spec §4.2 "Credit semantics"). Sets the
    /// request's `epi_link` either way so later `complete`/`abort` calls
    /// can find it without a second table lookup. `req_num` only counts
    /// requests that actually reached `req_q` — a parked request doesn't
    /// count until `complete`'s promotion step admits it (spec §4.2:
    /// `admit`'s `Admitted` branch increments `req_num`, its `Parked`
    /// branch doesn't; `promote_waiters` increments it instead).
    pub fn admit(&self, request: Request) -> AdmitOutcome {
        let mut q = self.0.queues.lock();
        request.set_epi_link(Some(Arc::downgrade(&self.0)));
        if self.0.credit_limit == 0 || (q.req_q.len() as u64) < self.0.credit_limit {
            q.req_num += 1;
            request.set_on_wire(true);
            q.req_q.push_back(request);
            AdmitOutcome::Admitted
        } else {
            request.set_state(RequestState::Queued);
            q.wait_q.push_back(request);
            AdmitOutcome::Parked
        }
    }

    /// Removes a completing request from `req_q` and promotes as many
    /// waiters as the freed credit allows. `success` is whether the
    /// request's terminal state will be `Completed` (a real reply) as
    /// opposed to `Canceled`/`Timeout`/`FwdUnreach`: per spec §4.2,
    /// `complete` "increments `reply_num`" only on a real reply,
    /// otherwise "decrements `req_num`" — retroactively treating the
    /// request as never admitted, so `req_num ≥ reply_num` (E1) keeps
    /// holding. The caller computes `success` from the same outcome it's
    /// about to hand to the request's own completion callback, *before*
    /// calling that callback (spec §9 "Open question — promotion re-send
    /// failure": the state transition this accounting depends on hasn't
    /// been applied to `request` yet when this runs).
    ///
    /// The returned requests must be resent by the caller *after*
    /// releasing this EPI's lock — never while holding it (spec §4.2
    /// ADDED, grounded in the original's `crt_context_req_untrack`
    /// ordering).
    pub fn complete(&self, request: &Request, success: bool) -> Vec<Request> {
        let mut q = self.0.queues.lock();
        if let Some(pos) = q.req_q.iter().position(|r| r.is_same(request)) {
            q.req_q.remove(pos);
        }
        if success {
            q.reply_num += 1;
        } else {
            q.req_num = q.req_num.saturating_sub(1);
        }
        debug_assert!(q.req_num >= q.reply_num, "req_num must never drop below reply_num");

        let mut promoted = Vec::new();
        let available = if self.0.credit_limit == 0 {
            q.wait_q.len()
        } else {
            (self.0.credit_limit as usize).saturating_sub(q.req_q.len())
        };
        for _ in 0..available.min(q.wait_q.len()) {
            if let Some(waiter) = q.wait_q.pop_front() {
                waiter.set_on_wire(true);
                waiter.set_state(RequestState::Sent);
                q.req_q.push_back(waiter.clone());
                q.req_num += 1;
                promoted.push(waiter);
            }
        }
        promoted
    }

    /// Removes `request` from the wait queue if it is still parked there
    /// (spec §5 "Cancellation: cancel(req) ... if in wait_q, synchronously
    /// complete with Canceled"). Returns `true` if it was found and
    /// removed; the caller is then responsible for firing the request's
    /// completion callback outside this lock. A request already promoted
    /// to `req_q` is untouched — the caller falls back to asking the
    /// transport to cancel it instead.
    pub fn cancel_waiter(&self, request: &Request) -> bool {
        let mut q = self.0.queues.lock();
        if let Some(pos) = q.wait_q.iter().position(|r| r.is_same(request)) {
            q.wait_q.remove(pos);
            true
        } else {
            false
        }
    }

    /// Drains this endpoint's queues for `ep_abort`/force-destroy (spec
    /// §4.3). Waiters never reached the wire, so they're canceled
    /// synchronously here; in-flight requests are returned separately so
    /// the caller can ask the transport to cancel them without removing
    /// them from `req_q` (their own completion still has to run the
    /// normal `complete` path).
    pub fn abort(&self) -> EpiAbortOutcome {
        let mut q = self.0.queues.lock();
        let waiters: Vec<Request> = q.wait_q.drain(..).collect();
        let inflight: Vec<Request> = q.req_q.iter().cloned().collect();
        EpiAbortOutcome { waiters, inflight }
    }

    pub fn req_num(&self) -> u64 {
        self.0.queues.lock().req_num
    }

    pub fn reply_num(&self) -> u64 {
        self.0.queues.lock().reply_num
    }
}

pub struct EpiAbortOutcome {
    /// Never dispatched; safe to complete as `Canceled` immediately.
    pub waiters: Vec<Request>,
    /// On the wire; the transport must be asked to cancel each one, but
    /// actual removal happens when their completion runs `complete()`.
    pub inflight: Vec<Request>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Endpoint, GroupId};

    fn req() -> Request {
        Request::new(
            1,
            Endpoint::new(GroupId::new("g"), 0, 0),
            Vec::new(),
            0,
            false,
            Box::new(|_| {}),
        )
    }

    #[test]
    fn admits_under_credit() {
        let epi = Epi::new(0, 2);
        assert!(matches!(epi.admit(req()), AdmitOutcome::Admitted));
        assert!(matches!(epi.admit(req()), AdmitOutcome::Admitted));
        assert!(matches!(epi.admit(req()), AdmitOutcome::Parked));
    }

    #[test]
    fn completion_promotes_one_waiter() {
        let epi = Epi::new(0, 1);
        let a = req();
        let b = req();
        epi.admit(a.clone());
        epi.admit(b.clone());
        assert_eq!(b.state(), RequestState::Queued);
        assert_eq!(epi.req_num(), 1); // only `a` reached req_q so far

        let promoted = epi.complete(&a, true);
        assert_eq!(promoted.len(), 1);
        assert!(promoted[0].is_same(&b));
        assert_eq!(b.state(), RequestState::Sent);
        assert_eq!(epi.req_num(), 2); // promotion counts `b` in
        assert_eq!(epi.reply_num(), 1);
    }

    #[test]
    fn failed_completion_decrements_req_num_not_reply_num() {
        let epi = Epi::new(0, 1);
        let a = req();
        epi.admit(a.clone());
        assert_eq!(epi.req_num(), 1);

        epi.complete(&a, false);
        assert_eq!(epi.req_num(), 0);
        assert_eq!(epi.reply_num(), 0);
    }

    #[test]
    fn zero_credit_is_unlimited() {
        let epi = Epi::new(0, 0);
        for _ in 0..100 {
            assert!(matches!(epi.admit(req()), AdmitOutcome::Admitted));
        }
    }

    #[test]
    fn cancel_waiter_removes_only_from_wait_q() {
        let epi = Epi::new(0, 1);
        let a = req();
        let b = req();
        epi.admit(a.clone());
        epi.admit(b.clone());
        assert_eq!(b.state(), RequestState::Queued);

        assert!(epi.cancel_waiter(&b));
        assert!(!epi.cancel_waiter(&b), "already removed, second call is a no-op");
        assert!(!epi.cancel_waiter(&a), "a is inflight, not parked");
    }

    #[test]
    fn abort_splits_waiters_and_inflight() {
        let epi = Epi::new(0, 1);
        let a = req();
        let b = req();
        epi.admit(a.clone());
        epi.admit(b.clone());

        let outcome = epi.abort();
        assert_eq!(outcome.waiters.len(), 1);
        assert!(outcome.waiters[0].is_same(&b));
        assert_eq!(outcome.inflight.len(), 1);
        assert!(outcome.inflight[0].is_same(&a));
    }
}
