#![forbid(unsafe_code)]

//! Database administration and maintenance utilities.
//!
//! Each function opens the file (running recovery), performs one task and
//! returns a serializable report. The `strata` binary is a thin layer over
//! these.

mod checkpoint;
mod coalesce;
mod dump;
mod error;
mod init;
mod options;
mod stats;
mod util;
mod verify;

/// Runs one checkpoint and reports what it wrote.
pub use checkpoint::{checkpoint, CheckpointSummary};

/// Explicit merge of adjacent free extents.
pub use coalesce::{coalesce, CoalesceReport};

/// Raw page inspection.
pub use dump::{dump_page, PageDump};

/// Error types for administrative operations.
pub use error::{AdminError, Result};

/// Database creation.
pub use init::{init, InitReport};

/// Configuration options for opening a database in admin mode.
pub use options::AdminOpenOptions;

/// Statistics collection and reporting.
pub use stats::{
    stats, AllocatorStatsSection, FilesystemStats, PagerStatsSection, StatsReport, WalStatsSection,
};

/// Database integrity verification.
pub use verify::{verify, VerifyCounts, VerifyFinding, VerifyLevel, VerifyReport, VerifySeverity};

pub use crate::primitives::pager::{CheckpointMode, StorageOptions};

/// Opens a page manager the way every admin command does.
pub use util::open_manager;
