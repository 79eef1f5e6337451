use std::path::Path;

use serde::Serialize;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_manager;
use crate::admin::Result;
use crate::primitives::pager::CheckpointMode;

/// Result of an explicit coalesce pass.
#[derive(Debug, Clone, Serialize)]
pub struct CoalesceReport {
    /// Free extents recorded by the previous checkpoint.
    pub extents_before: u64,
    /// Adjacent pairs merged by this pass.
    pub merged: usize,
    /// Free extents after the pass.
    pub extents_after: usize,
    /// Length of the largest free extent afterwards.
    pub largest_extent: u64,
}

/// Merges adjacent free extents and checkpoints the result.
///
/// Frees merge with their neighbours as they happen, so on a healthy file
/// this mostly rewrites an identical snapshot.
pub fn coalesce(path: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<CoalesceReport> {
    let manager = open_manager(path.as_ref(), opts)?;
    let extents_before = manager.meta().snapshot_extents;
    let merged = manager.coalesce();
    let report = CoalesceReport {
        extents_before,
        merged,
        extents_after: manager.extent_count(),
        largest_extent: manager.largest_extent(),
    };
    manager.checkpoint(CheckpointMode::Force)?;
    manager.close()?;
    Ok(report)
}
