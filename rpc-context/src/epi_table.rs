//! Per-context table of [`Epi`] entries, keyed by rank.
//!
//! Plain `HashMap`, no internal lock: spec §4.3 requires "the table is
//! never self-locking", since `lookup`-then-`admit` has to be atomic
//! under the context's own `ctx_mu`. A self-locking map (the teacher
//! reaches for `dashmap` for its analogous per-model semaphore table)
//! would let another thread observe the table between those two steps.

use std::collections::HashMap;

use crate::endpoint::Rank;
use crate::epi::{Epi, EpiAbortOutcome};

#[derive(Default)]
pub struct EpiTable {
    entries: HashMap<Rank, Epi>,
}

impl EpiTable {
    pub fn new() -> Self {
        EpiTable {
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up the entry for `rank`, creating one with `credit_limit` if
    /// absent.
    pub fn lookup_or_create(&mut self, rank: Rank, credit_limit: u64) -> Epi {
        self.entries
            .entry(rank)
            .or_insert_with(|| Epi::new(rank, credit_limit))
            .clone()
    }

    pub fn lookup(&self, rank: Rank) -> Option<Epi> {
        self.entries.get(&rank).cloned()
    }

    /// Drops `rank`'s entry if it is present and idle. Called after every
    /// completion and every abort outcome is processed — an EPI's table
    /// lifetime is exactly its queue occupancy (spec §4.3 ADDED).
    pub fn evict_if_idle(&mut self, rank: Rank) {
        if let Some(epi) = self.entries.get(&rank) {
            if epi.is_idle() {
                self.entries.remove(&rank);
            }
        }
    }

    pub fn traverse(&self) -> impl Iterator<Item = &Epi> {
        self.entries.values()
    }

    /// Drains every entry, returning each rank's abort outcome. Used by
    /// `Context::destroy(force = true)` (spec §4.7); the table is empty
    /// after this call.
    pub fn destroy_all(&mut self) -> Vec<(Rank, EpiAbortOutcome)> {
        self.entries
            .drain()
            .map(|(rank, epi)| (rank, epi.abort()))
            .collect()
    }

    /// Removes a single rank's entry and returns its abort outcome
    /// (`ep_abort`, spec §4.7 "Cross-context ep_abort").
    pub fn remove_and_abort(&mut self, rank: Rank) -> Option<EpiAbortOutcome> {
        self.entries.remove(&rank).map(|epi| epi.abort())
    }
}
