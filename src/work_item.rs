//! Work items and the free-pool that recycles them.
//!
//! A work item is the unit the dispatcher hands to exactly one worker:
//! either a transaction boundary record, a key/value bundle iterator to
//! pump, or a fence. The pool amortizes allocation: `POOL_SIZE` items are
//! preallocated up front and recycled; only when the pool runs dry does an
//! operation pay for a heap allocation, tagged `from_pool = false` so
//! release knows to simply drop it rather than return it to the free list.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::iter::BundleIter;
use crate::metrics::IngestMetrics;
use crate::tree::{SyncMode, Tree, TxnRecord};

/// Number of work items preallocated into the free pool at engine creation.
pub const POOL_SIZE: usize = 61;

/// A caller-owned rendezvous for a fence work item.
///
/// The dispatcher's stack-resident fence in the original design is
/// reexpressed here as a reference-counted slot: the calling thread holds
/// one handle and blocks on it, the fence work item carries a clone, and
/// the worker that processes the fence marks it done and drops its clone
/// without touching it again. This sidesteps unsafe lifetime-pinning of a
/// borrowed stack reference while preserving the "worker signals and
/// forgets" contract.
#[derive(Debug, Default)]
pub struct FenceSlot {
    done: Mutex<bool>,
    cv: Condvar,
}

impl FenceSlot {
    /// Create a not-yet-done fence slot.
    #[must_use]
    pub fn new() -> Self {
        FenceSlot::default()
    }

    /// Mark the fence done and wake any waiter. Called by the worker
    /// exactly once; the worker must not touch the slot afterward.
    pub fn mark_done(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cv.notify_all();
    }

    /// Block until [`mark_done`](Self::mark_done) has been called.
    pub fn wait_until_done(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cv.wait(&mut done);
        }
    }

    /// Non-blocking check, used by the worker loop's wake-up broadcast to
    /// decide whether anything needs announcing.
    #[must_use]
    pub fn is_done(&self) -> bool {
        *self.done.lock()
    }
}

/// The tagged variant distinguishing the three kinds of work a dispatcher
/// operation can enqueue. `TxnRecord` and `KvbIter` are mutually exclusive
/// by construction (an enum, not a union-with-a-null-check convention).
pub enum WorkKind {
    /// Between uses: a pool slot that has been allocated but not yet filled
    /// in by a dispatcher operation's prologue. Never observed by a worker.
    Empty,
    /// A transaction boundary record (begin/commit/abort).
    TxnRecord(TxnRecord),
    /// A batch of key/value bundles to pump from an iterator.
    KvbIter(Box<dyn BundleIter>),
    /// A sync fence; carries the slot the worker marks done.
    Fence(Arc<FenceSlot>),
}

/// A unit of work routed to exactly one worker.
pub struct WorkItem {
    /// Which of the three kinds this item carries.
    pub kind: WorkKind,
    /// The log tree this item reserved space against.
    pub tree: Option<Arc<dyn Tree>>,
    /// Worker slot chosen at reservation time.
    pub worker_idx: usize,
    /// Mutation id returned by space reservation; defines per-tree order.
    pub mutation_id: u64,
    /// Transaction id (ignored for `Fence`).
    pub txn_id: u64,
    /// Requested durability mode.
    pub sync: SyncMode,
    /// Timestamp this item was handed to a worker's FIFO, for queue-latency
    /// metrics.
    pub enqueue_time: Option<Instant>,
    from_pool: bool,
}

impl WorkItem {
    fn empty(from_pool: bool) -> Self {
        WorkItem {
            kind: WorkKind::Empty,
            tree: None,
            worker_idx: 0,
            mutation_id: 0,
            txn_id: 0,
            sync: SyncMode::Async,
            enqueue_time: None,
            from_pool,
        }
    }

    /// True if this item originated from the preallocated pool rather than
    /// an overflow allocation.
    #[must_use]
    pub fn from_pool(&self) -> bool {
        self.from_pool
    }

    /// Build a fence work item. Fences never come from the pool — they are
    /// the caller's own rendezvous handle, dropped (not recycled) the
    /// moment the worker marks them done.
    #[must_use]
    pub fn new_fence(slot: Arc<FenceSlot>, worker_idx: usize, sync: SyncMode) -> Box<WorkItem> {
        Box::new(WorkItem {
            kind: WorkKind::Fence(slot),
            tree: None,
            worker_idx,
            mutation_id: 0,
            txn_id: 0,
            sync,
            enqueue_time: None,
            from_pool: false,
        })
    }
}

/// The preallocated free-pool plus overflow allocation path.
///
/// Guards exactly the free list; callers that also need to serialize tree
/// reservation against the same mutex (see the dispatcher's `space_mutex`)
/// wrap a `Pool` alongside their own reservation calls under one lock,
/// matching the original design's single combined mutex.
pub struct Pool {
    free: Mutex<Vec<Box<WorkItem>>>,
}

impl Pool {
    /// Build a pool preloaded with [`POOL_SIZE`] items.
    #[must_use]
    pub fn new() -> Self {
        let free = (0..POOL_SIZE).map(|_| Box::new(WorkItem::empty(true))).collect();
        Pool { free: Mutex::new(free) }
    }

    /// Take an item from the free list, or allocate one if the pool is
    /// empty. `metrics` is bumped on the overflow path.
    #[must_use]
    pub fn acquire(&self, metrics: &IngestMetrics) -> Box<WorkItem> {
        if let Some(item) = self.free.lock().pop() {
            return item;
        }
        tracing::error!("work item pool exhausted, allocating overflow item");
        metrics.inc_pool_overflow_allocations();
        Box::new(WorkItem::empty(false))
    }

    /// Return a single item: recycled if it came from the pool, dropped
    /// (freeing its heap allocation) otherwise.
    pub fn release(&self, mut item: Box<WorkItem>) {
        if item.from_pool {
            *item = WorkItem::empty(true);
            self.free.lock().push(item);
        }
        // else: drop, deallocating the overflow item.
    }

    /// Return a batch of items in one lock acquisition, amortizing the
    /// mutex cost the way the worker loop's `qfree` batching does.
    pub fn release_batch(&self, items: impl IntoIterator<Item = Box<WorkItem>>) {
        let mut recycled = Vec::new();
        for mut item in items {
            if item.from_pool {
                *item = WorkItem::empty(true);
                recycled.push(item);
            }
        }
        if !recycled.is_empty() {
            self.free.lock().extend(recycled);
        }
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}
