//! Context subsystem of a pluggable RPC dispatch core.
//!
//! A [`Context`] tracks outbound requests against per-endpoint credit
//! limits, drives a user-pluggable [`Transport`] to completion, and
//! expires requests whose deadline elapses — independently of every other
//! `Context` in the process, so a caller can run one per worker thread
//! without any cross-context locking. See `DESIGN.md` for how each piece
//! maps back to its grounding.

mod api;
mod config;
mod context;
mod endpoint;
mod epi;
mod epi_table;
mod error;
mod hooks;
mod registry;
mod request;
mod timeout_heap;
mod transport;

pub use api::*;
pub use config::Config;
pub use context::{CondCb, Context, RpcTaskCb};
pub use endpoint::{Endpoint, GroupId, Opcode, Rank, Tag, OPCODE_URI_LOOKUP};
pub use error::{Error, Result};
pub use hooks::{ProgressCb, TimeoutCb};
pub use registry::ContextRegistry;
pub use request::{
    live_request_count_for_tests, CompleteCb, CompletionInfo, Request, RequestId, RequestState,
};
pub use transport::{MockTransport, ProgressOutcome, Transport};
