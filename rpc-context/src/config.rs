//! Process-wide tunables for the context subsystem.
//!
//! Laid out the way the teacher crate's `DaemonConfig` is: a plain
//! `Deserialize`-able struct with a `Default` impl holding the stock
//! values, loaded once by the enclosing runtime and handed to
//! [`crate::registry::ContextRegistry::init`].

use serde::Deserialize;

/// Recognized options (spec §6 "Environment"): `timeout_sec` is a
/// per-context override on top of `default_timeout_us`; the rest are
/// process-wide.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default per-request timeout, in microseconds, used when a context
    /// has not called `set_timeout`.
    pub default_timeout_us: u64,

    /// `credit_ep_ctx`: per-endpoint inflight cap. Zero disables flow
    /// control entirely (spec §4.2 "Credit semantics").
    pub credit_ep_ctx: u64,

    /// `ctx_max_num`: upper bound on live contexts, enforced only when
    /// `share_na` is set (spec §3 "ContextRegistry").
    pub ctx_max_num: usize,

    /// `share_na`: whether the registry cap is enforced at all.
    pub share_na: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_timeout_us: 60_000_000,
            credit_ep_ctx: 32,
            ctx_max_num: 64,
            share_na: false,
        }
    }
}
