//! Ingest dispatch engine and token-bucket rate limiter for the `c1`
//! key-value store's durability log.
//!
//! This crate implements the **ingest I/O core** described in
//! `SPEC_FULL.md`: a queue-and-worker pipeline that reserves space in an
//! active append-only log tree, routes transactional boundary records and
//! key/value bundle batches to a fixed pool of log-writing workers, and
//! honors flush/sync fences — plus the token-bucket primitive used to pace
//! ingest traffic ahead of the dispatcher.
//!
//! The on-disk log tree, its record byte layout, crash recovery, and
//! compaction scheduling are all out of scope here; this crate consumes
//! the tree purely through the [`tree::Tree`]/[`tree::TreeSource`] trait
//! contracts (see [`tree`] for the collaborator surface, and
//! [`tree::mock`] for an in-memory reference implementation used by this
//! crate's own tests).
//!
//! # Layout
//!
//! - [`token_bucket`] — the rate limiter, usable standalone.
//! - [`work_item`] — the recyclable work-item pool and fence rendezvous.
//! - [`worker`] — a single worker's FIFO and processing loop.
//! - [`engine`] — the dispatcher: reservation, routing, the public
//!   `issue_iter`/`issue_sync`/`txn_begin`/`txn_commit`/`txn_abort` surface.
//! - [`tree`] — the log-tree collaborator contract and in-memory mock.
//! - [`iter`] — the bundle iterator collaborator contract.
//! - [`error`] — the error taxonomy and the latched-error primitive.
//! - [`metrics`] — operational counters.

pub mod engine;
pub mod error;
pub mod iter;
pub mod metrics;
pub mod token_bucket;
pub mod tree;
pub mod work_item;
pub mod worker;

pub use engine::{Engine, EngineConfig};
pub use error::{ErrLatch, IngestError, IngestResult};
pub use iter::{Bundle, BundleIter, IterInfo, KvInfo};
pub use metrics::IngestMetrics;
pub use token_bucket::TokenBucket;
pub use tree::{RecordType, SyncMode, Tree, TreeSource, TxnCmd, TxnRecord};
pub use work_item::{FenceSlot, Pool, WorkItem, WorkKind, POOL_SIZE};
