//! Flat free-function surface mirroring spec §6's external interface
//! table, for callers that want the C-shaped API rather than the
//! idiomatic method calls on [`crate::Context`]/[`crate::ContextRegistry`]
//! directly. Each wrapper is a one-line forward; the real logic lives on
//! the types it delegates to.

use std::sync::Arc;

use crate::config::Config;
use crate::context::{CondCb, Context};
use crate::endpoint::{Endpoint, Opcode, Rank};
use crate::error::Result;
use crate::hooks::{ProgressCb, TimeoutCb};
use crate::registry::ContextRegistry;
use crate::request::{CompleteCb, Request};
use crate::transport::Transport;

/// `crt_init`-equivalent: builds a fresh registry for one process/test.
/// Unlike the original there is no process-wide global; callers own the
/// `ContextRegistry` and pass it to every other function here.
pub fn init(config: Config) -> ContextRegistry {
    ContextRegistry::new(config)
}

/// `crt_context_create`.
pub fn context_create(registry: &ContextRegistry, transport: Arc<dyn Transport>) -> Result<Arc<Context>> {
    Context::create(registry, transport)
}

/// `crt_context_destroy`.
pub fn context_destroy(ctx: &Context, registry: &ContextRegistry, force: bool) -> Result<()> {
    ctx.destroy(registry, force)
}

/// `crt_context_idx`.
pub fn context_idx(ctx: &Context) -> usize {
    ctx.index()
}

/// `crt_context_lookup`.
pub fn context_lookup(registry: &ContextRegistry, idx: usize) -> Option<Arc<Context>> {
    registry.lookup(idx)
}

/// `crt_context_num`.
pub fn context_num(registry: &ContextRegistry) -> usize {
    registry.count()
}

/// `crt_context_empty`.
pub fn context_empty(registry: &ContextRegistry) -> bool {
    registry.is_empty()
}

/// `crt_context_set_timeout`.
pub fn context_set_timeout(ctx: &Context, timeout_us: u64) {
    ctx.set_timeout(timeout_us);
}

/// `crt_register_rpc_task`.
pub fn register_rpc_task(ctx: &Context, opcode: Opcode, handler: crate::context::RpcTaskCb) {
    ctx.register_rpc_task(opcode, handler);
}

/// `crt_req_create` + `crt_context_req_track` combined, since this crate
/// has no separate RPC-object allocation step (spec §6 notes the two
/// collapse into one call at this layer).
pub fn context_req_track(
    ctx: &Context,
    endpoint: Endpoint,
    opcode: Opcode,
    payload: Vec<u8>,
    reset_timer: bool,
    complete_cb: CompleteCb,
) -> Result<Request> {
    ctx.track(endpoint, opcode, payload, reset_timer, complete_cb)
}

/// `crt_context_req_untrack`.
pub fn context_req_untrack(ctx: &Context, request: &Request, outcome: Result<()>) {
    ctx.untrack(request, outcome)
}

/// `crt_progress`.
pub fn progress(ctx: &Context, timeout_us: Option<u64>, cond_cb: Option<CondCb>) -> Result<()> {
    ctx.progress(timeout_us, cond_cb)
}

/// `crt_register_progress_cb`. Process-wide (spec §6 has no `ctx`
/// argument for this call): fires once per progress pass, through
/// whichever context happens to be index 0.
pub fn register_progress_cb(registry: &ContextRegistry, cb: ProgressCb) {
    registry.register_progress_cb(cb);
}

/// `crt_register_timeout_cb`. Process-wide, same reasoning.
pub fn register_timeout_cb(registry: &ContextRegistry, cb: TimeoutCb) {
    registry.register_timeout_cb(cb);
}

/// `crt_req_force_timeout`.
pub fn req_force_timeout(ctx: &Context, request: &Request) {
    ctx.force_timeout(request);
}

/// `crt_ep_abort`. Cross-context by design (spec §4.5): every live
/// context in `registry` gets its `rank` entry forcefully aborted, not
/// just one. Use [`Context::ep_abort`] directly when a single context's
/// endpoint needs tearing down instead.
pub fn ep_abort(registry: &ContextRegistry, rank: Rank) -> Result<()> {
    registry.ep_abort(rank)
}
