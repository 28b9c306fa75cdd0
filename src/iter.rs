//! Types describing the key/value bundle iterator collaborator.
//!
//! The iterator that produces bundles for a mutation set is owned by the
//! caller (the ingest path above this crate); the dispatcher only ever
//! pumps it to completion or abandons it on the first error. Its internal
//! bundle representation is opaque here — this crate only needs to move
//! bundles from the iterator to the tree unmodified.

/// An opaque key/value batch, the unit a [`BundleIter`] produces.
///
/// Carried through unexamined; its encoding is owned by the collaborator
/// that builds it and the tree that writes it.
#[derive(Debug, Clone)]
pub struct Bundle {
    /// Opaque bundle payload.
    pub payload: Vec<u8>,
}

impl Bundle {
    /// Wrap a raw payload as a bundle.
    #[must_use]
    pub fn new(payload: Vec<u8>) -> Self {
        Bundle { payload }
    }
}

/// Aggregate key/value size accounting for a mutation set, used to size
/// tree-space reservations.
#[derive(Debug, Clone, Copy, Default)]
pub struct KvInfo {
    /// Number of keys.
    pub kcnt: u32,
    /// Number of values.
    pub vcnt: u32,
    /// Total encoded key+value size in bytes, before per-record meta
    /// overhead is added by the reservation path.
    pub kvsz: u64,
}

/// Per-transaction aggregate sizing info, used by the transactional
/// reservation path (`get_tree_txn`).
#[derive(Debug, Clone, Copy, Default)]
pub struct IterInfo {
    /// Totals across every bundle this iterator will emit.
    pub total: KvInfo,
}

/// Producer of key/value bundles for one mutation set.
///
/// Implementations are consumed by value via [`put`](BundleIter::put) once
/// the dispatcher has no further use for them — exactly once, whether the
/// pump ran to completion or aborted on the first error.
pub trait BundleIter: Send {
    /// Pull the next bundle. `Ok(None)` signals legitimate end-of-stream;
    /// `Err` signals a failure the dispatcher must latch.
    fn get_next(&mut self) -> crate::error::IngestResult<Option<Bundle>>;

    /// Release the iterator. Called exactly once, after the last call to
    /// [`get_next`](BundleIter::get_next) (successful or not).
    fn put(self: Box<Self>);

    /// Ingest id this iterator's bundles belong to, passed through to
    /// `tree.issue_kvb`.
    fn ingest_id(&self) -> u64;

    /// Total encoded value size across the iterator's bundles, passed
    /// through to `tree.issue_kvb`.
    fn vsize(&self) -> u64;
}
