//! EmberDB: an embedded, append-oriented store for time-ordered,
//! topic-addressed messages.
//!
//! Clients publish entries tagged with a hierarchical topic and optional
//! time-to-live, and query them back by topic pattern over a bounded time
//! horizon ("the last hour of `dev18.sensor.+`").
//!
//! # Architecture
//!
//! ```text
//!  put ──> memtable ──┬──> tiny batch ──> WAL (commit pool)
//!                     └──> time-window bucket ──> sync loop
//!                                                  │
//!                          ┌───────────────────────┤
//!                          ▼            ▼          ▼
//!                     window file   index file  data file
//!                       (chains)    (4K blocks) (messages)
//! ```
//!
//! A topic trie resolves query patterns to per-topic window chains; a
//! membership filter over sequence numbers short-circuits deletes; a lease
//! allocator recycles data-file holes. After an unclean shutdown the WAL is
//! replayed before the database accepts traffic.

pub mod batch;
pub mod block;
pub mod config;
pub mod data;
pub mod db;
pub mod dbsync;
pub mod entry;
pub mod error;
pub mod filter;
pub mod flock;
pub mod freelist;
pub mod fsys;
pub mod hasher;
pub mod iterator;
pub mod memtable;
pub mod scheduler;
pub mod timewindow;
pub mod topic;
pub mod trie;
pub mod varz;
pub mod wal;
pub mod winwriter;

pub use batch::Batch;
pub use config::{BatchOptions, Options};
pub use db::{Db, Query};
pub use entry::{Entry, Id, PayloadCodec};
pub use error::{Error, Result};
pub use iterator::{Item, ItemIterator};
pub use varz::Varz;

/// Size of every on-disk index and window block.
pub const BLOCK_SIZE: u64 = 4096;
/// Reserved header region at the head of the index file.
pub const INDEX_HEADER_SIZE: u64 = 8192;
/// Reserved region at the head of the data file; offset 0 is never a live
/// message.
pub const DATA_HEADER_SIZE: u64 = 512;
/// Shard count for the window bucket, lease pool and striped query locks.
pub const N_SHARDS: usize = 16;
/// Index slots per 4 KiB block.
pub const ENTRIES_PER_INDEX_BLOCK: usize = 255;
/// Window entries per 4 KiB block.
pub const SEQS_PER_WINDOW_BLOCK: usize = 339;
/// Maximum encodable topic size in bytes.
pub const MAX_TOPIC_LENGTH: usize = 1 << 16;
/// Maximum encodable payload size in bytes.
pub const MAX_VALUE_LENGTH: usize = 1 << 30;
/// Maximum number of live entries.
pub const MAX_KEYS: u64 = u32::MAX as u64;
