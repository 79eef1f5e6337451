use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_manager;
use crate::admin::Result;
use crate::primitives::pager::{wal_path, PagerStats, RecoveryReport};
use crate::primitives::wal::{CommitterStats, WalStats};

/// Everything `strata stats` prints.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    /// Page manager configuration and counters.
    pub pager: PagerStatsSection,
    /// Free-space state.
    pub allocator: AllocatorStatsSection,
    /// Log state.
    pub wal: WalStatsSection,
    /// Replay performed while opening for this report.
    pub recovery: RecoveryReport,
    /// File sizes on disk.
    pub filesystem: FilesystemStats,
}

/// Page manager section of [`StatsReport`].
#[derive(Debug, Clone, Serialize)]
pub struct PagerStatsSection {
    /// Page size stored in the header.
    pub page_size: u32,
    /// Layout policy stored in the header.
    pub storage_mode: String,
    /// Effective allocation strategy.
    pub strategy: String,
    /// Configured cache capacity.
    pub cache_pages: usize,
    /// Counters since open.
    pub counters: PagerStats,
}

/// Allocator section of [`StatsReport`].
#[derive(Debug, Clone, Serialize)]
pub struct AllocatorStatsSection {
    /// Pages covered by the allocator.
    pub total_pages: u64,
    /// Pages in free extents.
    pub free_pages: u64,
    /// Pages handed out, including page 0.
    pub allocated_pages: u64,
    /// Free extents.
    pub extent_count: usize,
    /// Length of the largest free extent.
    pub largest_extent: u64,
    /// `1 - largest / free`, 0 when nothing is free.
    pub fragmentation: f64,
}

/// Log section of [`StatsReport`].
#[derive(Debug, Clone, Serialize)]
pub struct WalStatsSection {
    /// Log file location.
    pub path: String,
    /// Log length in bytes.
    pub size_bytes: u64,
    /// LSN recorded by the last checkpoint.
    pub last_checkpoint_lsn: u64,
    /// Append counters since open.
    pub counters: WalStats,
    /// Group commit counters since open.
    pub group_commit: CommitterStats,
}

/// File sizes on disk.
#[derive(Debug, Clone, Serialize)]
pub struct FilesystemStats {
    /// Database file location.
    pub db_path: String,
    /// Database file size.
    pub db_size_bytes: u64,
    /// Log file location.
    pub wal_path: String,
    /// Log file size, 0 if missing.
    pub wal_size_bytes: u64,
}

/// Opens the database and collects a [`StatsReport`].
pub fn stats(path: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<StatsReport> {
    let path = path.as_ref();
    let manager = open_manager(path, opts)?;
    let meta = manager.meta();
    let wal_path = wal_path(path);
    let wal_size = fs::metadata(&wal_path).map(|m| m.len()).unwrap_or(0);
    let snapshot = manager.allocator_snapshot();
    let free_pages: u64 = snapshot.extents.iter().map(|e| e.len).sum();
    let largest = snapshot.extents.iter().map(|e| e.len).max().unwrap_or(0);

    Ok(StatsReport {
        pager: PagerStatsSection {
            page_size: meta.page_size,
            storage_mode: meta.storage_mode.as_str().to_string(),
            strategy: manager.strategy().as_str().to_string(),
            cache_pages: opts.storage.cache_pages,
            counters: manager.stats(),
        },
        allocator: AllocatorStatsSection {
            total_pages: snapshot.total_pages,
            free_pages,
            allocated_pages: snapshot.total_pages - free_pages,
            extent_count: snapshot.extents.len(),
            largest_extent: largest,
            fragmentation: fragmentation(largest, free_pages),
        },
        wal: WalStatsSection {
            path: wal_path.display().to_string(),
            size_bytes: manager.wal_len()?,
            last_checkpoint_lsn: meta.last_checkpoint_lsn.0,
            counters: manager.wal_stats(),
            group_commit: manager.committer_stats(),
        },
        recovery: manager.recovery_report().clone(),
        filesystem: FilesystemStats {
            db_path: path.display().to_string(),
            db_size_bytes: fs::metadata(path)?.len(),
            wal_path: wal_path.display().to_string(),
            wal_size_bytes: wal_size,
        },
    })
}

fn fragmentation(largest: u64, free: u64) -> f64 {
    if free == 0 {
        0.0
    } else {
        1.0 - largest as f64 / free as f64
    }
}
