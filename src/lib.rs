//! Strata: a page and extent storage manager.
//!
//! A database is one file of fixed-size pages plus a write-ahead log beside
//! it. [`PageManager`] hands out pages and contiguous extents through an
//! [`ExtentAllocator`], caches page images, groups commits into shared log
//! writes and checkpoints the free-space map into the file so it can be
//! reloaded and replayed after a crash.
//!
//! ```no_run
//! use strata::{PageKind, PageManager, StorageOptions, TableId};
//!
//! # fn main() -> strata::Result<()> {
//! let pm = PageManager::open("data.strata", StorageOptions::default())?;
//! let mut txn = pm.begin_transaction();
//! let page = txn.create_page(TableId(1), PageKind::Table)?;
//! txn.write_page(page, b"hello")?;
//! txn.commit()?;
//! pm.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod admin;
pub mod primitives;
pub mod types;

pub use primitives::alloc::{AllocationStrategy, Extent, ExtentAllocator};
pub use primitives::pager::{
    CheckpointMode, CheckpointReport, PageManager, PagerStats, RecoveryReport, StorageMode,
    StorageOptions, Synchronous, Transaction,
};
pub use types::page::PageKind;
pub use types::{Lsn, PageId, Result, StrataError, TableId};
