//! Indexed binary min-heap of in-flight requests, ordered by deadline.
//!
//! Plain `BinaryHeap` doesn't support removing an arbitrary element in
//! `O(log n)`, which `crt_req_timeout_untrack()` needs whenever a reply
//! lands before the deadline. This heap mirrors each request's position
//! back into the request itself ([`crate::request::Request::set_heap_index`])
//! so removal can start at the right slot instead of scanning.

use crate::request::Request;

struct Entry {
    deadline_us: u64,
    /// Tie-breaker so two requests sharing a deadline still have a
    /// total order; insertion-ordered, matching the original's
    /// "earliest submitted wins ties" behavior under `d_binheap`.
    seq: u64,
    request: Request,
}

fn less(a: &Entry, b: &Entry) -> bool {
    (a.deadline_us, a.seq) < (b.deadline_us, b.seq)
}

/// Owned by a single [`crate::context::Context`] and only ever touched
/// while holding that context's `ctx_mu` (spec §4.6).
pub struct TimeoutHeap {
    entries: Vec<Entry>,
    next_seq: u64,
}

impl TimeoutHeap {
    pub fn new() -> Self {
        TimeoutHeap {
            entries: Vec::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts `request` keyed on its current `deadline_us`. The request
    /// must not already be in the heap (`in_heap` is the caller's
    /// responsibility to check, per R2).
    pub fn insert(&mut self, request: Request) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let deadline_us = request.deadline_us();
        let idx = self.entries.len();
        request.set_in_heap(true);
        request.set_heap_index(Some(idx));
        self.entries.push(Entry {
            deadline_us,
            seq,
            request,
        });
        self.sift_up(idx);
    }

    /// Removes `request` from the heap using its cached index. No-op if
    /// the request isn't present (already popped by expiry, or never
    /// inserted).
    pub fn remove(&mut self, request: &Request) {
        let Some(idx) = request.heap_index() else {
            return;
        };
        debug_assert!(idx < self.entries.len());
        request.set_in_heap(false);
        request.set_heap_index(None);

        let last = self.entries.len() - 1;
        if idx != last {
            self.entries.swap(idx, last);
            self.entries[idx].request.set_heap_index(Some(idx));
        }
        self.entries.pop();

        if idx < self.entries.len() {
            if !self.sift_up(idx) {
                self.sift_down(idx);
            }
        }
    }

    /// Returns the smallest deadline currently tracked, without removing it.
    pub fn peek_deadline_us(&self) -> Option<u64> {
        self.entries.first().map(|e| e.deadline_us)
    }

    /// Forces `request` to the front of the heap (spec §4.1 `force_expire`:
    /// "equivalent to remove + set deadline_us = 0 + insert"). The request
    /// must already be in the heap; the caller checks `in_heap` first.
    pub fn force_expire(&mut self, request: Request) {
        self.remove(&request);
        request.set_deadline_us(0);
        self.insert(request);
    }

    /// Pops every entry whose deadline is `<= now_us`, in deadline order.
    /// Mirrors `crt_context_timeout_check()`'s "pop while top expired"
    /// loop: pure bookkeeping under the lock, no callback invoked here.
    pub fn pop_expired(&mut self, now_us: u64) -> Vec<Request> {
        let mut expired = Vec::new();
        while let Some(top) = self.entries.first() {
            if top.deadline_us > now_us {
                break;
            }
            let entry = self.pop_min();
            let request = entry.request;
            request.set_in_heap(false);
            request.set_heap_index(None);
            expired.push(request);
        }
        expired
    }

    fn pop_min(&mut self) -> Entry {
        let last = self.entries.len() - 1;
        self.entries.swap(0, last);
        let entry = self.entries.pop().expect("checked non-empty by caller");
        if !self.entries.is_empty() {
            self.entries[0].request.set_heap_index(Some(0));
            self.sift_down(0);
        }
        entry
    }

    fn sift_up(&mut self, mut idx: usize) -> bool {
        let mut moved = false;
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if less(&self.entries[idx], &self.entries[parent]) {
                self.entries.swap(idx, parent);
                self.entries[idx].request.set_heap_index(Some(idx));
                self.entries[parent].request.set_heap_index(Some(parent));
                idx = parent;
                moved = true;
            } else {
                break;
            }
        }
        moved
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * idx + 1;
            let right = 2 * idx + 2;
            let mut smallest = idx;
            if left < len && less(&self.entries[left], &self.entries[smallest]) {
                smallest = left;
            }
            if right < len && less(&self.entries[right], &self.entries[smallest]) {
                smallest = right;
            }
            if smallest == idx {
                break;
            }
            self.entries.swap(idx, smallest);
            self.entries[idx].request.set_heap_index(Some(idx));
            self.entries[smallest].request.set_heap_index(Some(smallest));
            idx = smallest;
        }
    }
}

impl Default for TimeoutHeap {
    fn default() -> Self {
        Self::new()
    }
}
