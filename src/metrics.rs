//! Operational counters for the ingest dispatch engine.
//!
//! Plain atomic counters, not a metrics-registry client: the enclosing
//! database engine and its performance-counter infrastructure are external
//! collaborators (see the crate-level docs), so this stays a small struct
//! of independently readable/incrementable counters in the spirit of the
//! teacher's `StreamStats`/`ReaderStats`.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters tracking dispatcher throughput and health.
#[derive(Debug, Default)]
pub struct IngestMetrics {
    items_queued: AtomicU64,
    items_processed: AtomicU64,
    fences_issued: AtomicU64,
    errors_latched: AtomicU64,
    pool_overflow_allocations: AtomicU64,
    tree_rollovers: AtomicU64,
    txn_begins: AtomicU64,
    txn_commits: AtomicU64,
    txn_aborts: AtomicU64,
}

impl IngestMetrics {
    /// Construct a fresh, zeroed counter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc_items_queued(&self) {
        self.items_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_items_processed(&self) {
        self.items_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_fences_issued(&self) {
        self.fences_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_errors_latched(&self) {
        self.errors_latched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_pool_overflow_allocations(&self) {
        self.pool_overflow_allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_tree_rollovers(&self) {
        self.tree_rollovers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_txn_begins(&self) {
        self.txn_begins.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_txn_commits(&self) {
        self.txn_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_txn_aborts(&self) {
        self.txn_aborts.fetch_add(1, Ordering::Relaxed);
    }

    /// Total work items enqueued since engine creation.
    #[must_use]
    pub fn items_queued(&self) -> u64 {
        self.items_queued.load(Ordering::Relaxed)
    }

    /// Total work items popped and dispatched by a worker.
    #[must_use]
    pub fn items_processed(&self) -> u64 {
        self.items_processed.load(Ordering::Relaxed)
    }

    /// Total `issue_sync(SYNC)` fences that actually blocked on a worker.
    #[must_use]
    pub fn fences_issued(&self) -> u64 {
        self.fences_issued.load(Ordering::Relaxed)
    }

    /// Total times a worker-side failure latched `err_latched`.
    #[must_use]
    pub fn errors_latched(&self) -> u64 {
        self.errors_latched.load(Ordering::Relaxed)
    }

    /// Total work items allocated outside the preallocated pool.
    #[must_use]
    pub fn pool_overflow_allocations(&self) -> u64 {
        self.pool_overflow_allocations.load(Ordering::Relaxed)
    }

    /// Total tree rollovers triggered by a `NoSpace` reservation failure.
    #[must_use]
    pub fn tree_rollovers(&self) -> u64 {
        self.tree_rollovers.load(Ordering::Relaxed)
    }

    /// Total `txn_begin` calls.
    #[must_use]
    pub fn txn_begins(&self) -> u64 {
        self.txn_begins.load(Ordering::Relaxed)
    }

    /// Total `txn_commit` calls.
    #[must_use]
    pub fn txn_commits(&self) -> u64 {
        self.txn_commits.load(Ordering::Relaxed)
    }

    /// Total `txn_abort` calls.
    #[must_use]
    pub fn txn_aborts(&self) -> u64 {
        self.txn_aborts.load(Ordering::Relaxed)
    }
}
