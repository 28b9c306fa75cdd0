//! Error types for the ingest dispatch engine.
//!
//! This module defines the primary error type, [`IngestError`], following the
//! taxonomy of the engine's failure modes: out-of-memory during pool overflow,
//! tree reservation failures (split into the transient "no space" case and
//! everything else), iterator failures during bundle pumping, tree write/flush
//! failures, and failures from the record-size oracle queried at engine
//! creation time.
//!
//! `#[from]` conversions are deliberately narrow: only the collaborator error
//! types that are genuinely reinterpreted 1:1 get one ([`std::io::Error`] for
//! tree I/O). Reservation failures carry their own `Other` payload because the
//! tree collaborator's error surface is engine-external (see `tree` module)
//! and not a concrete Rust error type we can wrap with `#[from]`.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

/// Convenience alias for results returned by this crate's fallible entry points.
pub type IngestResult<T> = std::result::Result<T, IngestError>;

/// Errors surfaced by the ingest dispatch engine and its collaborators.
#[derive(Error, Debug, Clone)]
pub enum IngestError {
    /// The work-item pool was empty and the overflow allocation itself failed.
    #[error("out of memory allocating work item")]
    Oom,

    /// A tree reservation call reported transient exhaustion (`ENOMEM`-class).
    ///
    /// Transient in the sense that a tree rollover may resolve it; the
    /// dispatcher retries exactly once (see `get_tree_txn`) before propagating.
    #[error("tree reservation out of space: {0}")]
    NoSpace(String),

    /// A tree reservation call failed for a reason other than exhaustion.
    #[error("tree reservation failed: {0}")]
    ReservationFailed(String),

    /// The bundle iterator reported an error while being pumped.
    #[error("iterator failure: {0}")]
    IteratorFailure(String),

    /// The tree's write path (`issue_txn`/`issue_kvb`) failed.
    #[error("tree write failed: {0}")]
    TreeWriteFailure(String),

    /// The tree's flush path failed.
    #[error("tree flush failed: {0}")]
    TreeFlushFailure(String),

    /// The record-size oracle (`record_type2len`) failed to report a size.
    #[error("record size oracle failed for {record_type}: {reason}")]
    RecordSizeOracle {
        /// Which record type (`KVT`, `VT`, `KVB`, `TXN`) the query was for.
        record_type: &'static str,
        /// Oracle-reported reason.
        reason: String,
    },
}

impl IngestError {
    /// True for the subset of [`IngestError::NoSpace`] that the dispatcher
    /// treats as eligible for a single tree rollover + retry.
    #[must_use]
    pub fn is_no_space(&self) -> bool {
        matches!(self, IngestError::NoSpace(_))
    }
}

/// A one-shot "poison" flag shared by the engine and its workers.
///
/// Once a worker latches an error, every worker loop and dispatcher
/// operation that checks this flag sees it: the write that stores the
/// error happens-before the store that sets the flag (`Release`), and
/// every read of the flag (`Acquire`) happens-before the read of the
/// stored error. The first error latched wins; later ones are dropped,
/// matching the source's "loss of a race yields at worst a missed error"
/// tolerance (see the concurrency notes in `SPEC_FULL.md` §5).
pub struct ErrLatch {
    set: AtomicBool,
    error: Mutex<Option<IngestError>>,
}

impl ErrLatch {
    /// Create an unlatched flag.
    #[must_use]
    pub fn new() -> Self {
        ErrLatch {
            set: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    /// Latch `err` as the engine's poisoning error, unless an error was
    /// already latched first.
    pub fn latch(&self, err: IngestError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
        drop(slot);
        self.set.store(true, Ordering::Release);
    }

    /// True once any error has been latched. Stays true for the life of
    /// the engine.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// The latched error, if any.
    #[must_use]
    pub fn get(&self) -> Option<IngestError> {
        if !self.is_set() {
            return None;
        }
        self.error.lock().clone()
    }
}

impl Default for ErrLatch {
    fn default() -> Self {
        Self::new()
    }
}
