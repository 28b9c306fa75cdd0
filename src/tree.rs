//! The append-only log tree collaborator.
//!
//! The on-disk log tree itself — its record byte layout, its recovery path,
//! and its storage substrate — is out of scope for this crate entirely; it
//! is consumed here purely through the [`Tree`] and [`TreeSource`] trait
//! contracts. An in-memory reference implementation lives in
//! [`mock`] for use by this crate's own tests and by downstream
//! integration tests.

use std::sync::Arc;

use crate::error::IngestResult;
use crate::iter::{Bundle, IterInfo};

/// Durability mode requested for a dispatcher operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Fire-and-forget; no fence is issued.
    Async,
    /// The caller blocks until the record (and, for fences, prior work) is
    /// durable.
    Sync,
}

/// The three boundary-record commands a transaction can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnCmd {
    /// Opens a transaction.
    Begin,
    /// Closes a transaction successfully.
    Commit,
    /// Closes a transaction unsuccessfully.
    Abort,
}

/// The record-size oracle's record types, queried once at engine creation
/// and cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// Key-tuple record.
    Kvt,
    /// Value-tuple record.
    Vt,
    /// Key/value-bundle record.
    Kvb,
    /// Transaction boundary record.
    Txn,
}

/// Sentinel ingest id for boundary records that don't carry one
/// (`begin`/`abort`).
pub const INVALID_INGEST_ID: u64 = u64::MAX;

/// An inline-owned transaction boundary record.
#[derive(Debug, Clone)]
pub struct TxnRecord {
    /// The ingest id this record commits, or [`INVALID_INGEST_ID`] for
    /// `begin`/`abort`.
    pub ingest_id: u64,
    /// Transaction id.
    pub txn_id: u64,
    /// Which boundary this record marks.
    pub cmd: TxnCmd,
    /// Durability mode carried on the record itself (distinct from the
    /// fence the dispatcher may additionally issue).
    pub sync: SyncMode,
    /// Sequence number of the tree this record was reserved against.
    pub segno: u64,
    /// Generation of the tree this record was reserved against.
    pub gen: u64,
}

/// A single append-only log segment.
///
/// All reservation calls are serialized by the dispatcher's space mutex;
/// implementations don't need their own internal locking for reservation
/// ordering, only for whatever storage they actually touch.
pub trait Tree: Send + Sync {
    /// Tree sequence number (monotonic across rollovers).
    fn seqno(&self) -> u64;

    /// Tree generation.
    fn gen(&self) -> u64;

    /// Reserve `size` bytes for a single record or bundle. `spare` draws on
    /// reserved backup capacity used only to finish a mutation set already
    /// in flight. Returns the assigned worker slot and the mutation id.
    fn reserve_space(&self, size: u64, spare: bool) -> IngestResult<(usize, u64)>;

    /// Pre-check that the tree has room for an entire mutation set
    /// (`size` includes the boundary records).
    fn reserve_space_txn(&self, size: u64) -> IngestResult<()>;

    /// Stage per-bundle reservations for a transactional mutation set.
    fn reserve_space_iter(
        &self,
        kmeta: u32,
        vmeta: u32,
        kvbmeta: u32,
        stripe_size: u64,
        info: &IterInfo,
    ) -> IngestResult<()>;

    /// Write a boundary record.
    fn issue_txn(&self, worker_idx: usize, mutation_id: u64, record: &TxnRecord) -> IngestResult<()>;

    /// Write a bundle.
    #[allow(clippy::too_many_arguments)]
    fn issue_kvb(
        &self,
        ingest_id: u64,
        vsize: u64,
        worker_idx: usize,
        txn_id: u64,
        mutation_id: u64,
        bundle: Bundle,
        sync: SyncMode,
        tidx: usize,
    ) -> IngestResult<()>;

    /// Force durability of everything written so far.
    fn flush(&self) -> IngestResult<()>;

    /// Recompute the tree's free-space estimate after a commit.
    fn refresh_space(&self);
}

/// Owns "the current tree" and rollover to a new one on exhaustion, plus
/// the record-size oracle queried once at engine creation.
pub trait TreeSource: Send + Sync {
    /// The tree currently accepting reservations.
    fn current_tree(&self) -> Arc<dyn Tree>;

    /// Mark the given tree complete (exhausted); a subsequent
    /// [`alloc_next_tree`](Self::alloc_next_tree) call makes a new tree
    /// current.
    fn mark_tree_complete(&self, tree: &dyn Tree) -> IngestResult<()>;

    /// Allocate a new tree and make it current.
    fn alloc_next_tree(&self) -> IngestResult<()>;

    /// The record-size oracle, queried once per `record_type` at engine
    /// creation and cached by the engine.
    fn record_len(&self, record_type: RecordType) -> IngestResult<u32>;

    /// The ingest stripe size used to compute per-bundle meta overhead.
    fn stripe_size(&self) -> u64;
}

/// An in-memory [`Tree`]/[`TreeSource`] pair for tests.
pub mod mock {
    use super::{RecordType, SyncMode, Tree, TreeSource, TxnRecord};
    use crate::error::{IngestError, IngestResult};
    use crate::iter::{Bundle, IterInfo};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    /// One write or flush observed by [`InMemoryTree`].
    #[derive(Debug, Clone)]
    pub enum Observed {
        /// `issue_txn` was called with this record.
        Txn(TxnRecord),
        /// `issue_kvb` was called with these arguments (bundle payload
        /// recorded by length only, to keep assertions terse).
        Kvb {
            /// Ingest id passed through from the iterator.
            ingest_id: u64,
            /// Value size passed through from the iterator.
            vsize: u64,
            /// Worker slot the write was dispatched from.
            worker_idx: usize,
            /// Transaction id this bundle belongs to.
            txn_id: u64,
            /// Mutation id assigned at reservation time.
            mutation_id: u64,
            /// Durability mode requested.
            sync: SyncMode,
            /// Worker-local index, mirrors `worker_idx` in this engine.
            tidx: usize,
            /// Length of the bundle payload written.
            bundle_len: usize,
        },
        /// `flush` was called.
        Flush,
    }

    /// A single in-memory log segment. Reservation always succeeds unless
    /// `out_of_space` has been set, in which case every reservation call
    /// returns [`IngestError::NoSpace`].
    pub struct InMemoryTree {
        seqno: u64,
        gen: u64,
        out_of_space: AtomicBool,
        next_mutation_id: AtomicU64,
        log: Mutex<Vec<Observed>>,
        fail_next_write: AtomicBool,
    }

    impl InMemoryTree {
        /// Create a tree with the given identity.
        #[must_use]
        pub fn new(seqno: u64, gen: u64) -> Self {
            InMemoryTree {
                seqno,
                gen,
                out_of_space: AtomicBool::new(false),
                next_mutation_id: AtomicU64::new(1),
                log: Mutex::new(Vec::new()),
                fail_next_write: AtomicBool::new(false),
            }
        }

        /// Make every subsequent reservation call fail with `NoSpace`.
        pub fn set_out_of_space(&self, out: bool) {
            self.out_of_space.store(out, Ordering::SeqCst);
        }

        /// Make the next `issue_txn`/`issue_kvb` call fail once.
        pub fn fail_next_write(&self) {
            self.fail_next_write.store(true, Ordering::SeqCst);
        }

        /// Snapshot of everything observed so far, in call order.
        #[must_use]
        pub fn observed(&self) -> Vec<Observed> {
            self.log.lock().expect("mock tree lock poisoned").clone()
        }

        fn next_id(&self) -> u64 {
            self.next_mutation_id.fetch_add(1, Ordering::SeqCst)
        }
    }

    impl Tree for InMemoryTree {
        fn seqno(&self) -> u64 {
            self.seqno
        }

        fn gen(&self) -> u64 {
            self.gen
        }

        fn reserve_space(&self, _size: u64, spare: bool) -> IngestResult<(usize, u64)> {
            if self.out_of_space.load(Ordering::SeqCst) && !spare {
                return Err(IngestError::NoSpace("mock tree exhausted".into()));
            }
            Ok((0, self.next_id()))
        }

        fn reserve_space_txn(&self, _size: u64) -> IngestResult<()> {
            if self.out_of_space.load(Ordering::SeqCst) {
                return Err(IngestError::NoSpace("mock tree exhausted".into()));
            }
            Ok(())
        }

        fn reserve_space_iter(
            &self,
            _kmeta: u32,
            _vmeta: u32,
            _kvbmeta: u32,
            _stripe_size: u64,
            _info: &IterInfo,
        ) -> IngestResult<()> {
            if self.out_of_space.load(Ordering::SeqCst) {
                return Err(IngestError::NoSpace("mock tree exhausted".into()));
            }
            Ok(())
        }

        fn issue_txn(
            &self,
            _worker_idx: usize,
            _mutation_id: u64,
            record: &TxnRecord,
        ) -> IngestResult<()> {
            if self.fail_next_write.swap(false, Ordering::SeqCst) {
                return Err(IngestError::TreeWriteFailure("injected failure".into()));
            }
            self.log
                .lock()
                .expect("mock tree lock poisoned")
                .push(Observed::Txn(record.clone()));
            Ok(())
        }

        fn issue_kvb(
            &self,
            ingest_id: u64,
            vsize: u64,
            worker_idx: usize,
            txn_id: u64,
            mutation_id: u64,
            bundle: Bundle,
            sync: SyncMode,
            tidx: usize,
        ) -> IngestResult<()> {
            if self.fail_next_write.swap(false, Ordering::SeqCst) {
                return Err(IngestError::TreeWriteFailure("injected failure".into()));
            }
            self.log.lock().expect("mock tree lock poisoned").push(Observed::Kvb {
                ingest_id,
                vsize,
                worker_idx,
                txn_id,
                mutation_id,
                sync,
                tidx,
                bundle_len: bundle.payload.len(),
            });
            Ok(())
        }

        fn flush(&self) -> IngestResult<()> {
            self.log.lock().expect("mock tree lock poisoned").push(Observed::Flush);
            Ok(())
        }

        fn refresh_space(&self) {}
    }

    /// A [`TreeSource`] that hands out [`InMemoryTree`]s, rolling to a new
    /// one each time [`alloc_next_tree`](TreeSource::alloc_next_tree) is
    /// called.
    pub struct InMemoryTreeSource {
        current: Mutex<Arc<InMemoryTree>>,
        next_seqno: AtomicU64,
        rollovers: AtomicU64,
        record_len: u32,
        stripe_size: u64,
    }

    impl InMemoryTreeSource {
        /// Create a source with one tree already current.
        #[must_use]
        pub fn new() -> Self {
            InMemoryTreeSource {
                current: Mutex::new(Arc::new(InMemoryTree::new(1, 1))),
                next_seqno: AtomicU64::new(2),
                rollovers: AtomicU64::new(0),
                record_len: 64,
                stripe_size: 4096,
            }
        }

        /// Number of times `alloc_next_tree` has been called.
        #[must_use]
        pub fn rollovers(&self) -> u64 {
            self.rollovers.load(Ordering::SeqCst)
        }

        /// Directly access the current tree for assertions.
        #[must_use]
        pub fn current(&self) -> Arc<InMemoryTree> {
            self.current.lock().expect("mock tree source lock poisoned").clone()
        }
    }

    impl Default for InMemoryTreeSource {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TreeSource for InMemoryTreeSource {
        fn current_tree(&self) -> Arc<dyn Tree> {
            self.current.lock().expect("mock tree source lock poisoned").clone() as Arc<dyn Tree>
        }

        fn mark_tree_complete(&self, _tree: &dyn Tree) -> IngestResult<()> {
            Ok(())
        }

        fn alloc_next_tree(&self) -> IngestResult<()> {
            let seqno = self.next_seqno.fetch_add(1, Ordering::SeqCst);
            let mut current = self.current.lock().expect("mock tree source lock poisoned");
            *current = Arc::new(InMemoryTree::new(seqno, seqno));
            self.rollovers.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn record_len(&self, _record_type: RecordType) -> IngestResult<u32> {
            Ok(self.record_len)
        }

        fn stripe_size(&self) -> u64 {
            self.stripe_size
        }
    }
}
