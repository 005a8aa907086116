//! Process-wide registry of live [`crate::context::Context`]s.
//!
//! Styled after the teacher's `Daemon` singleton setup: one `RwLock`-guarded
//! table, a monotonic index handed out at creation, and a configurable cap
//! (spec §3 "ContextRegistry") enforced only when the deployment opts in
//! (`share_na`), matching transport backends that support one context per
//! network-address sharing the same address and therefore need no cap.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::Config;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::hooks::{PluginHooks, ProgressCb, TimeoutCb};

pub struct ContextRegistry {
    config: Config,
    contexts: RwLock<Vec<Option<Arc<Context>>>>,
    /// `register_progress_cb`/`register_timeout_cb` in spec §6 take no
    /// `ctx` argument — they're process-wide, not per-context — so the
    /// hook lists live here and each `Context` just holds an `Arc` to
    /// them, consulting the progress list only when it is context 0
    /// (spec §4.7 step 3).
    hooks: Arc<PluginHooks>,
}

impl ContextRegistry {
    pub fn new(config: Config) -> Self {
        ContextRegistry {
            config,
            contexts: RwLock::new(Vec::new()),
            hooks: Arc::new(PluginHooks::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn hooks(&self) -> Arc<PluginHooks> {
        self.hooks.clone()
    }

    /// `register_progress_cb` (spec §6): process-wide, fires once per
    /// progress pass through context 0 only.
    pub fn register_progress_cb(&self, cb: ProgressCb) {
        self.hooks.register_progress_cb(cb);
    }

    /// `register_timeout_cb` (spec §6): process-wide, fires for every
    /// expired request on whichever context it timed out on.
    pub fn register_timeout_cb(&self, cb: TimeoutCb) {
        self.hooks.register_timeout_cb(cb);
    }

    /// Allocates the next free index and inserts `context` under it,
    /// enforcing `ctx_max_num` when `share_na` is set.
    pub fn insert(&self, make_context: impl FnOnce(usize) -> Arc<Context>) -> Result<Arc<Context>> {
        let mut contexts = self.contexts.write();

        if self.config.share_na && contexts.len() >= self.config.ctx_max_num {
            let idx = contexts.iter().position(|c| c.is_none());
            if let Some(idx) = idx {
                let ctx = make_context(idx);
                contexts[idx] = Some(ctx.clone());
                return Ok(ctx);
            }
            return Err(Error::Busy(format!(
                "context registry full ({} contexts)",
                self.config.ctx_max_num
            )));
        }

        let idx = contexts.len();
        let ctx = make_context(idx);
        contexts.push(Some(ctx.clone()));
        Ok(ctx)
    }

    pub fn remove(&self, idx: usize) {
        let mut contexts = self.contexts.write();
        if let Some(slot) = contexts.get_mut(idx) {
            *slot = None;
        }
    }

    pub fn lookup(&self, idx: usize) -> Option<Arc<Context>> {
        self.contexts.read().get(idx).cloned().flatten()
    }

    pub fn list(&self) -> Vec<Arc<Context>> {
        self.contexts.read().iter().flatten().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.contexts.read().iter().filter(|c| c.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Broadcasts `ep_abort(rank)` to every live context (spec §4.5
    /// "Endpoint-wide abort"): acquires the registry read lock, locates
    /// the rank's EPI in each context in turn, and forcefully cancels it
    /// there. Propagates the first per-context failure but keeps going
    /// so a single misbehaving context doesn't leave the others' queues
    /// untouched (spec §6 "`ep_abort` | ... | first per-context error").
    pub fn ep_abort(&self, rank: crate::endpoint::Rank) -> Result<()> {
        let contexts = self.list();
        let mut first_err = None;
        for ctx in contexts {
            if let Err(e) = ctx.ep_abort(rank) {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
