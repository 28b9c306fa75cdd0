//! The per-worker FIFO and its processing loop.
//!
//! Each worker owns a mutex-protected FIFO of pending work items and a
//! condition variable used both to wake the worker and (via the dedicated
//! [`FenceSlot`](crate::work_item::FenceSlot) a fence item carries) to wake
//! whatever client is blocked on that fence. Workers run on their own OS
//! thread for the life of the engine; there is no async runtime here.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::error::ErrLatch;
use crate::metrics::IngestMetrics;
use crate::work_item::{Pool, WorkItem, WorkKind};

struct WorkerState {
    fifo: VecDeque<Box<WorkItem>>,
    stop: bool,
}

/// One worker's FIFO, condition variable, and stop flag.
pub struct Worker {
    idx: usize,
    state: Mutex<WorkerState>,
    cv: Condvar,
}

impl Worker {
    /// Create an idle worker for the given slot index.
    #[must_use]
    pub fn new(idx: usize) -> Self {
        Worker {
            idx,
            state: Mutex::new(WorkerState {
                fifo: VecDeque::new(),
                stop: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// This worker's slot index.
    #[must_use]
    pub fn idx(&self) -> usize {
        self.idx
    }

    /// Push a work item onto this worker's FIFO and wake it.
    pub fn enqueue(&self, item: Box<WorkItem>) {
        let mut state = self.state.lock();
        state.fifo.push_back(item);
        self.cv.notify_one();
    }

    /// Signal this worker to stop after draining nothing further; its
    /// processing loop observes this the next time its FIFO goes empty.
    pub fn request_stop(&self) {
        let mut state = self.state.lock();
        state.stop = true;
        self.cv.notify_all();
    }
}

/// The shared collaborators a worker's processing loop needs, independent
/// of how many workers exist.
#[derive(Clone)]
pub struct WorkerContext {
    pub(crate) pool: Arc<Pool>,
    pub(crate) metrics: Arc<IngestMetrics>,
    pub(crate) err_latch: Arc<ErrLatch>,
    pub(crate) pending_count: Arc<std::sync::atomic::AtomicU64>,
}

/// Run a worker's processing loop until it is told to stop.
///
/// Intended to be the body of a dedicated OS thread, one per worker.
pub fn run(worker: Arc<Worker>, ctx: WorkerContext) {
    let mut qfree: Vec<Box<WorkItem>> = Vec::new();
    let mut nfree: u32 = 0;

    loop {
        let mut item = {
            let mut state = worker.state.lock();
            while state.fifo.is_empty() {
                if state.stop {
                    if !qfree.is_empty() {
                        ctx.pool.release_batch(qfree.drain(..));
                    }
                    return;
                }
                worker.cv.wait(&mut state);
            }
            state.fifo.pop_front().expect("fifo non-empty under lock")
        };

        debug_assert_eq!(item.worker_idx, worker.idx);
        ctx.pending_count.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        ctx.metrics.inc_items_processed();
        if let Some(enqueued_at) = item.enqueue_time {
            trace!(worker_idx = worker.idx, latency_us = ?enqueued_at.elapsed().as_micros(), "dequeued work item");
        }

        let reclaim = match std::mem::replace(&mut item.kind, WorkKind::Empty) {
            WorkKind::Empty => {
                debug_assert!(false, "pool handed out an unfilled work item");
                true
            }
            WorkKind::TxnRecord(record) => {
                let tree = item.tree.as_deref().expect("txn record item missing tree");
                if let Err(err) = tree.issue_txn(item.worker_idx, item.mutation_id, &record) {
                    warn!(worker_idx = worker.idx, txn_id = item.txn_id, error = %err, "tree write failed for txn record");
                    ctx.err_latch.latch(err);
                    ctx.metrics.inc_errors_latched();
                }
                true
            }
            WorkKind::Fence(slot) => {
                slot.mark_done();
                ctx.metrics.inc_fences_issued();
                false
            }
            WorkKind::KvbIter(iter) => {
                if ctx.err_latch.is_set() {
                    debug!(worker_idx = worker.idx, txn_id = item.txn_id, "engine error latched, draining iterator without writing");
                    iter.put();
                } else {
                    pump_iterator(&worker, &item, iter, &ctx);
                }
                true
            }
        };

        if reclaim {
            qfree.push(item);
            if nfree > 1 {
                ctx.pool.release_batch(qfree.drain(..));
                nfree = 0;
            } else {
                nfree += 1;
            }
        }
        // Fence items are dropped immediately here (not pushed to `qfree`):
        // they never came from the pool, and the invariant that the engine
        // must not touch them again after `mark_done` is upheld by having
        // already matched them out of `item.kind` above.
    }
}

fn pump_iterator(
    worker: &Worker,
    item: &WorkItem,
    mut iter: Box<dyn crate::iter::BundleIter>,
    ctx: &WorkerContext,
) {
    let tree = item.tree.as_deref().expect("kvb iter item missing tree");
    let ingest_id = iter.ingest_id();
    let vsize = iter.vsize();

    loop {
        match iter.get_next() {
            Ok(Some(bundle)) => {
                if let Err(err) = tree.issue_kvb(
                    ingest_id,
                    vsize,
                    item.worker_idx,
                    item.txn_id,
                    item.mutation_id,
                    bundle,
                    item.sync,
                    item.worker_idx,
                ) {
                    warn!(worker_idx = worker.idx, txn_id = item.txn_id, error = %err, "tree write failed for bundle");
                    ctx.err_latch.latch(err);
                    ctx.metrics.inc_errors_latched();
                    iter.put();
                    return;
                }
            }
            Ok(None) => {
                iter.put();
                return;
            }
            Err(err) => {
                warn!(worker_idx = worker.idx, txn_id = item.txn_id, error = %err, "iterator failed while pumping");
                ctx.err_latch.latch(err);
                ctx.metrics.inc_errors_latched();
                iter.put();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iter::Bundle;
    use crate::tree::mock::InMemoryTreeSource;
    use crate::tree::{SyncMode, TreeSource, TxnCmd, TxnRecord};
    use std::sync::atomic::AtomicU64;

    struct VecIter {
        bundles: std::vec::IntoIter<Bundle>,
    }

    impl crate::iter::BundleIter for VecIter {
        fn get_next(&mut self) -> crate::error::IngestResult<Option<Bundle>> {
            Ok(self.bundles.next())
        }
        fn put(self: Box<Self>) {}
        fn ingest_id(&self) -> u64 {
            7
        }
        fn vsize(&self) -> u64 {
            100
        }
    }

    fn ctx() -> (WorkerContext, Arc<InMemoryTreeSource>) {
        let source = Arc::new(InMemoryTreeSource::new());
        let ctx = WorkerContext {
            pool: Arc::new(Pool::new()),
            metrics: Arc::new(IngestMetrics::new()),
            err_latch: Arc::new(ErrLatch::new()),
            pending_count: Arc::new(AtomicU64::new(0)),
        };
        (ctx, source)
    }

    #[test]
    fn processes_items_in_fifo_order() {
        let (worker_ctx, source) = ctx();
        let worker = Arc::new(Worker::new(0));
        let tree = source.current_tree();

        for i in 0..3u64 {
            let mut item = worker_ctx.pool.acquire(&worker_ctx.metrics);
            item.kind = WorkKind::TxnRecord(TxnRecord {
                ingest_id: crate::tree::INVALID_INGEST_ID,
                txn_id: i,
                cmd: TxnCmd::Begin,
                sync: SyncMode::Async,
                segno: tree.seqno(),
                gen: tree.gen(),
            });
            item.tree = Some(tree.clone());
            item.worker_idx = 0;
            item.mutation_id = i;
            item.txn_id = i;
            item.enqueue_time = Some(Instant::now());
            worker_ctx.pending_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            worker.enqueue(item);
        }

        worker.request_stop();
        run(worker.clone(), worker_ctx.clone());

        let observed = source.current().observed();
        assert_eq!(observed.len(), 3);
        for (i, entry) in observed.iter().enumerate() {
            match entry {
                crate::tree::mock::Observed::Txn(rec) => assert_eq!(rec.txn_id, i as u64),
                _ => panic!("expected txn record"),
            }
        }
    }

    #[test]
    fn fence_wakes_waiter_without_touching_pool() {
        let (worker_ctx, _source) = ctx();
        let worker = Arc::new(Worker::new(0));

        let slot = Arc::new(crate::work_item::FenceSlot::new());
        let item = crate::work_item::WorkItem::new_fence(slot.clone(), 0, SyncMode::Sync);
        worker.enqueue(item);
        worker.request_stop();

        let worker_clone = worker.clone();
        let ctx_clone = worker_ctx.clone();
        let handle = std::thread::spawn(move || run(worker_clone, ctx_clone));

        slot.wait_until_done();
        handle.join().expect("worker thread panicked");
    }
}
