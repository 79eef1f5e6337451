#![forbid(unsafe_code)]

//! Page manager: cached page access, transactions, checkpoints and recovery
//! on top of the extent allocator and the log.

mod cache;
mod manager;
mod meta;
mod options;
mod recovery;
mod snapshot;
mod txn;

pub use manager::{
    wal_path, CheckpointMode, CheckpointReport, PageManager, PagerStats, PinnedPage,
};
pub use meta::{create_meta, load_meta, read_meta_page, write_meta, write_meta_page, Meta};
pub use options::{StorageMode, StorageOptions, Synchronous};
pub use recovery::RecoveryReport;
pub use snapshot::{
    decode_snapshot_page, encode_snapshot_page, read_snapshot, snapshot_page_capacity,
    snapshot_pages_needed, write_snapshot, LoadedSnapshot, SnapshotPage,
};
pub use txn::Transaction;

pub(crate) use manager::is_unwritten;
