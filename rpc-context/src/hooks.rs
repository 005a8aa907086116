//! Registered progress/timeout callbacks (spec §4.8 "PluginHooks").
//!
//! Each list fires in registration order. The lock guarding a list is
//! released before any callback in it runs, so a callback is free to
//! register another hook of the same kind without deadlocking — the
//! original's `crt_exec_timeout_cb` relies on the same property against
//! its `rwlock`.

use std::sync::Arc;

use parking_lot::RwLock;

pub type ProgressCb = Arc<dyn Fn() + Send + Sync>;
pub type TimeoutCb = Arc<dyn Fn(crate::endpoint::Rank) + Send + Sync>;

#[derive(Default)]
pub struct PluginHooks {
    progress: RwLock<Vec<ProgressCb>>,
    timeout: RwLock<Vec<TimeoutCb>>,
}

impl PluginHooks {
    pub fn new() -> Self {
        PluginHooks::default()
    }

    pub fn register_progress_cb(&self, cb: ProgressCb) {
        self.progress.write().push(cb);
    }

    pub fn register_timeout_cb(&self, cb: TimeoutCb) {
        self.timeout.write().push(cb);
    }

    /// Invokes every registered progress callback. Called once per
    /// `Context::progress` iteration, before polling the transport
    /// (spec §4.8 "cond_cb-first"). The list is cloned out from behind
    /// the lock first, so a callback is free to register another hook
    /// without deadlocking or racing a concurrent `Vec` reallocation.
    pub fn fire_progress(&self) {
        let snapshot: Vec<ProgressCb> = self.progress.read().clone();
        for cb in snapshot {
            cb();
        }
    }

    /// Invokes every registered timeout callback for `rank`, in
    /// registration order.
    pub fn fire_timeout(&self, rank: crate::endpoint::Rank) {
        let snapshot: Vec<TimeoutCb> = self.timeout.read().clone();
        for cb in snapshot {
            cb(rank);
        }
    }
}
