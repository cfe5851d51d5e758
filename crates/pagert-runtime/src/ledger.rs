//! Pending-operation ledger for a single request.
//!
//! The page body is itself a pending operation: it is registered before the page
//! runs and settled right after it returns or throws. A request therefore drains,
//! and finalizes, on exactly one code path no matter how many operations it starts.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(u64);

impl OpId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    /// Other operations are still outstanding.
    Pending,
    /// The set went from non-empty to empty with this settlement.
    Drained,
    /// The id was not (or no longer) pending.
    Unknown,
}

#[derive(Debug, Default)]
pub struct PendingLedger {
    next_id: u64,
    live: BTreeSet<OpId>,
    registered: u64,
}

impl PendingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self) -> OpId {
        self.next_id += 1;
        let id = OpId(self.next_id);
        self.live.insert(id);
        self.registered += 1;
        id
    }

    pub fn settle(&mut self, id: OpId) -> Settled {
        if !self.live.remove(&id) {
            return Settled::Unknown;
        }
        if self.live.is_empty() {
            Settled::Drained
        } else {
            Settled::Pending
        }
    }

    pub fn is_pending(&self, id: OpId) -> bool {
        self.live.contains(&id)
    }

    pub fn pending(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Number of operations registered over the request's lifetime.
    pub fn registered(&self) -> u64 {
        self.registered
    }
}

/// Single-writer latch guarding the finalize transition.
#[derive(Debug, Default)]
pub struct FinalizeLatch {
    closed: AtomicBool,
}

impl FinalizeLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true for exactly one caller; every later call returns false.
    pub fn close(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
