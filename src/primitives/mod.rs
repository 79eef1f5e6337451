//! Low-level building blocks of the storage manager.
//!
//! Byte helpers, positioned file I/O, the extent allocator, the write-ahead
//! log, and the page manager that ties them together.

/// Big-endian field readers and writers with bounds checks.
pub mod bytes;

/// Positioned file access.
pub mod io;

/// Extent allocator with an ordered free store and a size index.
///
/// Hands out contiguous page runs and merges freed neighbors.
pub mod alloc;

/// Page manager: cache, transactions, checkpoints and recovery.
pub mod pager;

/// Write-ahead logging (WAL) for crash recovery.
///
/// Ensures durability through sequential logging of page and allocator changes.
pub mod wal;
