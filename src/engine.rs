//! The dispatch engine: reservation, work routing, and the public ingest
//! surface (`issue_iter`, `issue_sync`, `txn_begin`, `txn_commit`,
//! `txn_abort`).
//!
//! This is the ~70%-of-the-source component described in `SPEC_FULL.md` §2:
//! queue lifecycle, tree-space reservation, the worker loop's call site
//! (see [`crate::worker`]), and the sync fence. Every public operation
//! shares the prologue/epilogue shape from §4.3: acquire a work item from
//! the [`Pool`], fill in its shared fields under reservation, splice it onto
//! the chosen worker's FIFO, bump metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, instrument, warn};

use crate::error::{ErrLatch, IngestError, IngestResult};
use crate::iter::{BundleIter, IterInfo, KvInfo};
use crate::metrics::IngestMetrics;
use crate::tree::{RecordType, SyncMode, Tree, TreeSource, TxnCmd, TxnRecord, INVALID_INGEST_ID};
use crate::work_item::{FenceSlot, Pool, WorkItem, WorkKind};
use crate::worker::{self, Worker, WorkerContext};

/// Construction-time tunables for [`Engine::create`].
///
/// Deliberately a plain data bag, not a parsed config file or env layer:
/// per `SPEC_FULL.md` §1A this crate exposes no CLI/env surface of its own,
/// callers (the enclosing database engine) pass these in directly. Embed it
/// inside a larger configuration document if one is needed upstream.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of worker threads to start, fixed for the engine's lifetime.
    pub threads: usize,
    /// Name of the mpool storage substrate backing the log trees. Opaque
    /// to this crate; threaded through purely for logging/diagnostics.
    pub mpool_name: String,
    /// Flush/drain deadline hint passed through to collaborators that
    /// need it; unused by the dispatcher itself beyond logging.
    pub dtime: Duration,
}

/// Record-size oracle results cached once at engine creation (`SPEC_FULL.md`
/// §3's "record_sizes for the three record types KVT, VT, KVB"), plus the
/// TXN boundary-record length needed by the transactional reservation path.
struct RecordSizes {
    /// Per-key meta overhead (`KVT` record length).
    kmeta: u32,
    /// Per-value meta overhead (`VT` record length).
    vmeta: u32,
    /// Per-bundle-strip meta overhead (`KVB` record length).
    kvbmeta: u32,
    /// Length of a single transaction boundary record.
    txn_len: u32,
}

/// The ingest dispatch engine.
///
/// Owns the worker pool, the work-item free pool, the reservation
/// serialization point, and the latched error. No persistent state of its
/// own is kept across process restarts — per `SPEC_FULL.md` §6, that's the
/// tree's job.
pub struct Engine {
    workers: Vec<Arc<Worker>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    pool: Arc<Pool>,
    metrics: Arc<IngestMetrics>,
    err_latch: Arc<ErrLatch>,
    pending_count: Arc<AtomicU64>,
    /// Serializes calls into the tree's space-reservation surface so that
    /// `mutation_id` stays monotonic per tree (`SPEC_FULL.md` §5). Kept as
    /// its own lock rather than literally sharing `Pool`'s internal free-list
    /// mutex — see `DESIGN.md` for why that split is a faithful, not a
    /// simplified, reading of the "space_mutex" invariant.
    reservation: Mutex<()>,
    tree_source: Arc<dyn TreeSource>,
    sizes: RecordSizes,
    config: EngineConfig,
}

impl Engine {
    /// Create the engine: preallocate the work-item pool, query and cache
    /// record sizes, start `config.threads` workers (`SPEC_FULL.md` §4.2).
    ///
    /// # Errors
    ///
    /// Propagates a [`IngestError::RecordSizeOracle`]-class failure from the
    /// `tree_source` if any of the startup record-size queries fail; no
    /// threads are started in that case.
    pub fn create(tree_source: Arc<dyn TreeSource>, config: EngineConfig) -> IngestResult<Arc<Engine>> {
        let sizes = RecordSizes {
            kmeta: tree_source.record_len(RecordType::Kvt)?,
            vmeta: tree_source.record_len(RecordType::Vt)?,
            kvbmeta: tree_source.record_len(RecordType::Kvb)?,
            txn_len: tree_source.record_len(RecordType::Txn)?,
        };

        let pool = Arc::new(Pool::new());
        let metrics = Arc::new(IngestMetrics::new());
        let err_latch = Arc::new(ErrLatch::new());
        let pending_count = Arc::new(AtomicU64::new(0));

        let workers: Vec<Arc<Worker>> = (0..config.threads.max(1)).map(|idx| Arc::new(Worker::new(idx))).collect();

        let mut handles = Vec::with_capacity(workers.len());
        for w in &workers {
            let w = w.clone();
            let ctx = WorkerContext {
                pool: pool.clone(),
                metrics: metrics.clone(),
                err_latch: err_latch.clone(),
                pending_count: pending_count.clone(),
            };
            let idx = w.idx();
            let handle = thread::Builder::new()
                .name(format!("c1-ingest-worker-{idx}"))
                .spawn(move || worker::run(w, ctx))
                .expect("failed to spawn ingest worker thread");
            handles.push(handle);
        }

        info!(
            threads = workers.len(),
            mpool_name = %config.mpool_name,
            "c1 ingest engine created"
        );

        Ok(Arc::new(Engine {
            workers,
            threads: Mutex::new(handles),
            pool,
            metrics,
            err_latch,
            pending_count,
            reservation: Mutex::new(()),
            tree_source,
            sizes,
            config,
        }))
    }

    /// Operational counters for this engine.
    #[must_use]
    pub fn metrics(&self) -> &IngestMetrics {
        &self.metrics
    }

    /// Number of worker threads this engine was created with.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// The tunables this engine was created with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Items enqueued but not yet popped by a worker, across every FIFO.
    /// Exposed for the conservation-invariant test harness described in
    /// `SPEC_FULL.md` §8.
    #[must_use]
    pub fn pending_count(&self) -> u64 {
        self.pending_count.load(Ordering::Relaxed)
    }

    /// True once a worker has latched an error.
    #[must_use]
    pub fn is_err_latched(&self) -> bool {
        self.err_latch.is_set()
    }

    /// Tear the engine down: signal every worker to stop, join its thread,
    /// splice residual FIFOs back to the free pool (handled by the worker
    /// loop itself on exit). Idempotent — safe to call more than once, and
    /// called automatically on [`Drop`] if not called explicitly.
    ///
    /// Teardown never fails observably (`SPEC_FULL.md` §7): thread join
    /// errors are logged, not propagated.
    pub fn destroy(&self) {
        for w in &self.workers {
            w.request_stop();
        }
        let mut handles = self.threads.lock();
        for handle in handles.drain(..) {
            if let Err(panic) = handle.join() {
                warn!(?panic, "ingest worker thread panicked during teardown");
            }
        }
    }

    /// `issue_iter` — §4.3.1. Routes a batch of key/value bundles to a
    /// worker. A `None` iterator degenerates to a plain sync fence.
    ///
    /// # Errors
    ///
    /// Propagates tree reservation failures, or the latched engine error if
    /// one was set before this item could be enqueued.
    #[instrument(skip(self, iter, kv_info), fields(txn_id, sync_mode = ?sync))]
    pub fn issue_iter(
        &self,
        iter: Option<Box<dyn BundleIter>>,
        txn_id: u64,
        kv_info: KvInfo,
        sync: SyncMode,
    ) -> IngestResult<()> {
        let Some(iter) = iter else {
            return self.issue_sync(sync, false);
        };

        let mut item = self.pool.acquire(&self.metrics);

        let (tree, worker_idx, mutation_id) = match self.get_tree(kv_info) {
            Ok(reserved) => reserved,
            Err(err) => {
                self.pool.release(item);
                iter.put();
                return Err(err);
            }
        };

        if let Some(err) = self.err_latch.get() {
            self.pool.release(item);
            iter.put();
            return Err(err);
        }

        item.tree = Some(tree);
        item.worker_idx = worker_idx;
        item.mutation_id = mutation_id;
        item.txn_id = txn_id;
        item.sync = sync;
        item.kind = WorkKind::KvbIter(iter);

        self.enqueue(worker_idx, item);
        Ok(())
    }

    /// `issue_sync` — §4.3.2. A fence: blocks until workers have drained
    /// prior work on worker 0's FIFO (see the design notes on why worker 0
    /// specifically), then optionally flushes the current tree.
    ///
    /// Preserves the source's documented race: `pending_count` is read
    /// without synchronization before deciding whether to wait at all. A
    /// concurrent `issue_iter` landing after this check is simply not
    /// covered by this fence (`SPEC_FULL.md` §9).
    ///
    /// # Errors
    ///
    /// Returns the latched engine error (without clearing it) if one has
    /// been set, or a flush failure from the tree.
    #[instrument(skip(self), fields(sync_mode = ?sync, skip_flush))]
    pub fn issue_sync(&self, sync: SyncMode, skip_flush: bool) -> IngestResult<()> {
        if sync != SyncMode::Sync {
            return self.latched_or_ok();
        }

        if self.pending_count.load(Ordering::Relaxed) == 0 {
            if !skip_flush {
                self.flush_current()?;
            }
            return self.latched_or_ok();
        }

        let slot = Arc::new(FenceSlot::new());
        let item = WorkItem::new_fence(slot.clone(), 0, sync);
        self.pending_count.fetch_add(1, Ordering::Relaxed);
        self.metrics.inc_items_queued();
        self.workers[0].enqueue(item);

        slot.wait_until_done();
        drop(slot);

        if let Some(err) = self.err_latch.get() {
            return Err(err);
        }
        if !skip_flush {
            self.flush_current()?;
        }
        Ok(())
    }

    /// `txn_begin` — §4.3.3.
    ///
    /// # Errors
    ///
    /// Propagates reservation failures from [`get_tree_txn`](Self::get_tree_txn).
    #[instrument(skip(self, iter_info), fields(txn_id, sync_mode = ?sync))]
    pub fn txn_begin(&self, txn_id: u64, iter_info: IterInfo, sync: SyncMode) -> IngestResult<()> {
        let mut item = self.pool.acquire(&self.metrics);

        let (tree, worker_idx, mutation_id) = match self.get_tree_txn(&iter_info) {
            Ok(reserved) => reserved,
            Err(err) => {
                self.pool.release(item);
                return Err(err);
            }
        };

        let record = TxnRecord {
            ingest_id: INVALID_INGEST_ID,
            txn_id,
            cmd: TxnCmd::Begin,
            sync,
            segno: tree.seqno(),
            gen: tree.gen(),
        };

        item.kind = WorkKind::TxnRecord(record);
        item.tree = Some(tree);
        item.worker_idx = worker_idx;
        item.mutation_id = mutation_id;
        item.txn_id = txn_id;
        item.sync = sync;

        self.enqueue(worker_idx, item);
        self.metrics.inc_txn_begins();
        Ok(())
    }

    /// `txn_commit` — §4.3.4. Reserves room for a doubled TXN-record length
    /// (begin + commit), enqueues the commit record, then issues a
    /// fence-without-flush to make the commit durable before returning, and
    /// finally refreshes the tree's free-space estimate.
    ///
    /// # Errors
    ///
    /// Propagates reservation failures, the fence's latched/flush error, or
    /// the record-size oracle if it was not cached successfully at creation
    /// (unreachable in practice since `create` would have failed first).
    #[instrument(skip(self), fields(txn_id, ingest_id, sync_mode = ?sync))]
    pub fn txn_commit(&self, txn_id: u64, ingest_id: u64, sync: SyncMode) -> IngestResult<()> {
        let mut item = self.pool.acquire(&self.metrics);

        let kv_info = KvInfo {
            kcnt: 0,
            vcnt: 0,
            kvsz: 2 * u64::from(self.sizes.txn_len),
        };

        let (tree, worker_idx, mutation_id) = match self.get_tree(kv_info) {
            Ok(reserved) => reserved,
            Err(err) => {
                self.pool.release(item);
                return Err(err);
            }
        };

        let record = TxnRecord {
            ingest_id,
            txn_id,
            cmd: TxnCmd::Commit,
            sync,
            segno: tree.seqno(),
            gen: tree.gen(),
        };

        let tree_for_refresh = tree.clone();
        item.kind = WorkKind::TxnRecord(record);
        item.tree = Some(tree);
        item.worker_idx = worker_idx;
        item.mutation_id = mutation_id;
        item.txn_id = txn_id;
        item.sync = sync;

        self.enqueue(worker_idx, item);
        self.metrics.inc_txn_commits();

        self.issue_sync(sync, true)?;
        tree_for_refresh.refresh_space();
        Ok(())
    }

    /// `txn_abort` — §4.3.5. As commit, but writes an `ABORT` record
    /// asynchronously and issues no fence: abort is best-effort, not a
    /// durability guarantee the caller waits on.
    ///
    /// # Errors
    ///
    /// Propagates reservation failures.
    #[instrument(skip(self), fields(txn_id))]
    pub fn txn_abort(&self, txn_id: u64) -> IngestResult<()> {
        let mut item = self.pool.acquire(&self.metrics);

        let kv_info = KvInfo {
            kcnt: 0,
            vcnt: 0,
            kvsz: 2 * u64::from(self.sizes.txn_len),
        };

        let (tree, worker_idx, mutation_id) = match self.get_tree(kv_info) {
            Ok(reserved) => reserved,
            Err(err) => {
                self.pool.release(item);
                return Err(err);
            }
        };

        let record = TxnRecord {
            ingest_id: INVALID_INGEST_ID,
            txn_id,
            cmd: TxnCmd::Abort,
            sync: SyncMode::Async,
            segno: tree.seqno(),
            gen: tree.gen(),
        };

        item.kind = WorkKind::TxnRecord(record);
        item.tree = Some(tree);
        item.worker_idx = worker_idx;
        item.mutation_id = mutation_id;
        item.txn_id = txn_id;
        item.sync = SyncMode::Async;

        self.enqueue(worker_idx, item);
        self.metrics.inc_txn_aborts();
        Ok(())
    }

    /// `get_tree` — §4.5, used for single-bundle and boundary-record
    /// reservations. Falls back to spare capacity on `NoSpace` without
    /// triggering a rollover; rollover only ever happens in
    /// [`get_tree_txn`](Self::get_tree_txn).
    fn get_tree(&self, kv_info: KvInfo) -> IngestResult<(Arc<dyn Tree>, usize, u64)> {
        let size = self.encoded_size(kv_info.kvsz, kv_info.kcnt, kv_info.vcnt);

        let _guard = self.reservation.lock();
        let tree = self.tree_source.current_tree();
        match tree.reserve_space(size, false) {
            Ok((idx, mutation_id)) => Ok((tree, idx, mutation_id)),
            Err(err) if err.is_no_space() => {
                warn!(seqno = tree.seqno(), size, "reservation exhausted, falling back to spare capacity");
                let (idx, mutation_id) = tree.reserve_space(size, true)?;
                Ok((tree, idx, mutation_id))
            }
            Err(err) => Err(err),
        }
    }

    /// `get_tree_txn` — §4.5, used for a transactional mutation set that
    /// must fit contiguously. At most one rollover-and-retry across the
    /// whole three-step reservation (`reserve_space_txn`, `reserve_space`,
    /// `reserve_space_iter`); a second `NoSpace` anywhere propagates.
    fn get_tree_txn(&self, iter_info: &IterInfo) -> IngestResult<(Arc<dyn Tree>, usize, u64)> {
        let total = 2 * u64::from(self.sizes.txn_len)
            + self.encoded_size(iter_info.total.kvsz, iter_info.total.kcnt, iter_info.total.vcnt);

        let mut retried = false;
        loop {
            match self.try_reserve_txn(total, iter_info) {
                Ok(reserved) => return Ok(reserved),
                Err(err) if err.is_no_space() && !retried => {
                    retried = true;
                    self.roll_tree()?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn try_reserve_txn(&self, total: u64, iter_info: &IterInfo) -> IngestResult<(Arc<dyn Tree>, usize, u64)> {
        let _guard = self.reservation.lock();
        let tree = self.tree_source.current_tree();
        tree.reserve_space_txn(total)?;
        let (worker_idx, mutation_id) = tree.reserve_space(u64::from(self.sizes.txn_len), false)?;
        tree.reserve_space_iter(
            self.sizes.kmeta,
            self.sizes.vmeta,
            self.sizes.kvbmeta,
            self.tree_source.stripe_size(),
            iter_info,
        )?;
        Ok((tree, worker_idx, mutation_id))
    }

    fn roll_tree(&self) -> IngestResult<()> {
        let _guard = self.reservation.lock();
        let tree = self.tree_source.current_tree();
        warn!(seqno = tree.seqno(), "tree exhausted mid-transaction, rolling over");
        self.tree_source.mark_tree_complete(tree.as_ref())?;
        self.tree_source.alloc_next_tree()?;
        self.metrics.inc_tree_rollovers();
        Ok(())
    }

    fn encoded_size(&self, kvsz: u64, kcnt: u32, vcnt: u32) -> u64 {
        let stripe_size = self.tree_source.stripe_size();
        let strip_count = kvsz / stripe_size + 1;
        kvsz + u64::from(self.sizes.kmeta) * u64::from(kcnt)
            + u64::from(self.sizes.vmeta) * u64::from(vcnt)
            + u64::from(self.sizes.kvbmeta) * strip_count
    }

    fn enqueue(&self, worker_idx: usize, mut item: Box<WorkItem>) {
        item.enqueue_time = Some(Instant::now());
        self.pending_count.fetch_add(1, Ordering::Relaxed);
        self.metrics.inc_items_queued();
        self.workers[worker_idx].enqueue(item);
    }

    fn flush_current(&self) -> IngestResult<()> {
        let _guard = self.reservation.lock();
        self.tree_source.current_tree().flush()
    }

    fn latched_or_ok(&self) -> IngestResult<()> {
        match self.err_latch.get() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            threads: 4,
            mpool_name: String::from("default"),
            dtime: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iter::Bundle;
    use crate::tree::mock::InMemoryTreeSource;

    struct VecIter {
        bundles: std::vec::IntoIter<Bundle>,
        ingest_id: u64,
        vsize: u64,
        fail: bool,
    }

    impl BundleIter for VecIter {
        fn get_next(&mut self) -> IngestResult<Option<Bundle>> {
            if self.fail {
                return Err(IngestError::IteratorFailure("injected".into()));
            }
            Ok(self.bundles.next())
        }
        fn put(self: Box<Self>) {}
        fn ingest_id(&self) -> u64 {
            self.ingest_id
        }
        fn vsize(&self) -> u64 {
            self.vsize
        }
    }

    fn test_engine(threads: usize) -> (Arc<Engine>, Arc<InMemoryTreeSource>) {
        let source = Arc::new(InMemoryTreeSource::new());
        let engine = Engine::create(
            source.clone(),
            EngineConfig {
                threads,
                mpool_name: "test".into(),
                dtime: Duration::from_secs(1),
            },
        )
        .expect("engine creation should not fail against a healthy mock tree source");
        (engine, source)
    }

    #[test]
    fn single_small_write_drains_to_zero_pending() {
        let (engine, source) = test_engine(2);
        let iter = Box::new(VecIter {
            bundles: vec![Bundle::new(vec![1, 2, 3])].into_iter(),
            ingest_id: 7,
            vsize: 3,
            fail: false,
        });

        engine
            .issue_iter(
                Some(iter),
                7,
                KvInfo {
                    kcnt: 1,
                    vcnt: 1,
                    kvsz: 100,
                },
                SyncMode::Async,
            )
            .expect("issue_iter should succeed against a healthy tree");

        engine.issue_sync(SyncMode::Sync, false).expect("fence should drain");
        assert_eq!(engine.pending_count(), 0);

        let observed = source.current().observed();
        assert!(observed
            .iter()
            .any(|o| matches!(o, crate::tree::mock::Observed::Kvb { txn_id: 7, .. })));
    }

    #[test]
    fn txn_begin_commit_round_trip() {
        let (engine, source) = test_engine(2);

        engine
            .txn_begin(42, IterInfo::default(), SyncMode::Sync)
            .expect("begin should succeed");

        let iter = Box::new(VecIter {
            bundles: vec![Bundle::new(vec![9; 8])].into_iter(),
            ingest_id: 99,
            vsize: 8,
            fail: false,
        });
        engine
            .issue_iter(
                Some(iter),
                42,
                KvInfo {
                    kcnt: 1,
                    vcnt: 1,
                    kvsz: 8,
                },
                SyncMode::Sync,
            )
            .expect("bundle write should succeed");

        engine.txn_commit(42, 99, SyncMode::Sync).expect("commit should succeed");

        let observed = source.current().observed();
        let mut saw_begin = false;
        let mut saw_commit = false;
        let mut saw_flush = false;
        for entry in &observed {
            match entry {
                crate::tree::mock::Observed::Txn(rec) if rec.cmd == TxnCmd::Begin => saw_begin = true,
                crate::tree::mock::Observed::Txn(rec) if rec.cmd == TxnCmd::Commit && rec.ingest_id == 99 => {
                    saw_commit = true;
                }
                crate::tree::mock::Observed::Flush => saw_flush = true,
                _ => {}
            }
        }
        assert!(saw_begin, "expected a BEGIN record: {observed:?}");
        assert!(saw_commit, "expected a COMMIT record: {observed:?}");
        // `txn_commit` fences with `skip_flush = true` (matching the original
        // `c1_issue_sync(c1, sync, true)`), so no flush is ever issued here.
        assert!(!saw_flush, "commit should not flush: {observed:?}");
    }

    #[test]
    fn sync_fence_with_no_pending_work_flushes_once() {
        let (engine, source) = test_engine(1);
        engine.issue_sync(SyncMode::Sync, false).expect("fence should succeed");

        let flushes = source
            .current()
            .observed()
            .iter()
            .filter(|o| matches!(o, crate::tree::mock::Observed::Flush))
            .count();
        assert_eq!(flushes, 1);
    }

    #[test]
    fn rollover_triggers_exactly_once_then_succeeds() {
        let (engine, source) = test_engine(1);
        source.current().set_out_of_space(true);

        // The first reservation attempt fails, which triggers exactly one
        // mark_complete + alloc_next_tree; the retry lands on a fresh tree
        // that is not out-of-space.
        engine
            .txn_begin(1, IterInfo::default(), SyncMode::Async)
            .expect("txn_begin should succeed after one rollover");

        assert_eq!(source.rollovers(), 1);
    }

    /// A [`TreeSource`] where every tree it ever hands out, including ones
    /// minted by `alloc_next_tree`, is permanently out of space. Used to
    /// exercise the "second NoSpace after the single retry propagates"
    /// property, which `InMemoryTreeSource` alone can't: its rolled-over
    /// trees always start healthy.
    struct AlwaysFullTreeSource {
        inner: InMemoryTreeSource,
    }

    impl TreeSource for AlwaysFullTreeSource {
        fn current_tree(&self) -> Arc<dyn Tree> {
            let concrete = self.inner.current();
            concrete.set_out_of_space(true);
            concrete as Arc<dyn Tree>
        }
        fn mark_tree_complete(&self, tree: &dyn Tree) -> IngestResult<()> {
            self.inner.mark_tree_complete(tree)
        }
        fn alloc_next_tree(&self) -> IngestResult<()> {
            self.inner.alloc_next_tree()
        }
        fn record_len(&self, record_type: RecordType) -> IngestResult<u32> {
            self.inner.record_len(record_type)
        }
        fn stripe_size(&self) -> u64 {
            self.inner.stripe_size()
        }
    }

    #[test]
    fn second_no_space_after_retry_propagates() {
        let source = Arc::new(AlwaysFullTreeSource {
            inner: InMemoryTreeSource::new(),
        });
        let engine = Engine::create(
            source.clone(),
            EngineConfig {
                threads: 1,
                mpool_name: "test".into(),
                dtime: Duration::from_secs(1),
            },
        )
        .expect("engine creation should not fail");

        let err = engine
            .txn_begin(1, IterInfo::default(), SyncMode::Async)
            .expect_err("every tree is out of space, even after the single retry");
        assert!(err.is_no_space());
        assert_eq!(source.inner.rollovers(), 1);
    }

    #[test]
    fn error_latch_blocks_future_kvb_iter_but_not_abort() {
        let (engine, source) = test_engine(1);

        source.current().fail_next_write();
        let iter = Box::new(VecIter {
            bundles: vec![Bundle::new(vec![1])].into_iter(),
            ingest_id: 1,
            vsize: 1,
            fail: false,
        });
        let err = engine.issue_iter(
            Some(iter),
            1,
            KvInfo {
                kcnt: 1,
                vcnt: 1,
                kvsz: 1,
            },
            SyncMode::Sync,
        );
        // The write itself is dispatched to a worker and fails there; the
        // public call returns Ok (the failure latches asynchronously), but
        // the fence we issue next must observe it.
        assert!(err.is_ok());
        engine.issue_sync(SyncMode::Sync, true).expect_err("fence should surface the latched error");
        assert!(engine.is_err_latched());

        // txn_abort must still enqueue and be written, even though the
        // engine is poisoned.
        engine.txn_abort(1).expect("abort should still enqueue despite latch");
        engine.issue_sync(SyncMode::Sync, true).expect_err("latch stays latched");

        let observed = source.current().observed();
        assert!(observed
            .iter()
            .any(|o| matches!(o, crate::tree::mock::Observed::Txn(r) if r.cmd == TxnCmd::Abort)));
    }

    #[test]
    fn free_pool_conserved_across_many_operations() {
        let (engine, _source) = test_engine(2);
        let overflow_before = engine.metrics().pool_overflow_allocations();

        for i in 0..500u64 {
            let iter = Box::new(VecIter {
                bundles: vec![Bundle::new(vec![0; 4])].into_iter(),
                ingest_id: i,
                vsize: 4,
                fail: false,
            });
            engine
                .issue_iter(
                    Some(iter),
                    i,
                    KvInfo {
                        kcnt: 1,
                        vcnt: 1,
                        kvsz: 16,
                    },
                    SyncMode::Async,
                )
                .expect("issue_iter should succeed");
        }
        engine.issue_sync(SyncMode::Sync, true).expect("final fence should drain everything");
        assert_eq!(engine.pending_count(), 0);

        let overflow_after = engine.metrics().pool_overflow_allocations();
        // Under a realistic pool size (61) and 500 operations, overflow
        // allocation is expected; the conservation property under test is
        // that it never exceeds the number of operations submitted.
        assert!(overflow_after - overflow_before <= 500);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (engine, _source) = test_engine(3);
        engine.destroy();
        engine.destroy();
        assert_eq!(engine.worker_count(), 3);
    }

    #[test]
    fn fence_with_skip_flush_does_not_call_flush() {
        let (engine, source) = test_engine(1);
        engine.issue_sync(SyncMode::Sync, true).expect("fence with nothing pending succeeds");

        let flushes = source
            .current()
            .observed()
            .iter()
            .filter(|o| matches!(o, crate::tree::mock::Observed::Flush))
            .count();
        assert_eq!(flushes, 0);
    }
}
