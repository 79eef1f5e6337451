use std::path::Path;
use std::time::Instant;

use serde::Serialize;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_manager;
use crate::admin::Result;
use crate::primitives::pager::CheckpointMode;

/// Report generated after executing a checkpoint operation.
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointSummary {
    /// The checkpoint mode used ("force" or "best_effort").
    pub mode: String,
    /// Duration of the checkpoint operation in milliseconds.
    pub duration_ms: f64,
    /// LSN recorded in the header afterwards.
    pub last_checkpoint_lsn: u64,
    /// Dirty pages written back first.
    pub pages_flushed: usize,
    /// Free extents in the snapshot.
    pub snapshot_extents: u64,
    /// Pages holding the snapshot.
    pub snapshot_pages: u64,
    /// False when the database was already checkpointed.
    pub wrote_snapshot: bool,
    /// True when a best-effort checkpoint found open transactions.
    pub skipped: bool,
}

/// Opens the database and runs one checkpoint.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or the checkpoint fails.
pub fn checkpoint(
    path: impl AsRef<Path>,
    opts: &AdminOpenOptions,
    mode: CheckpointMode,
) -> Result<CheckpointSummary> {
    let manager = open_manager(path.as_ref(), opts)?;
    let start = Instant::now();
    let report = manager.checkpoint(mode)?;
    let elapsed = start.elapsed();
    let meta = manager.meta();
    let summary = CheckpointSummary {
        mode: mode_string(mode),
        duration_ms: elapsed.as_secs_f64() * 1_000.0,
        last_checkpoint_lsn: meta.last_checkpoint_lsn.0,
        pages_flushed: report.as_ref().map_or(0, |r| r.pages_flushed),
        snapshot_extents: meta.snapshot_extents,
        snapshot_pages: meta.snapshot_pages,
        wrote_snapshot: report.as_ref().is_some_and(|r| r.wrote_snapshot),
        skipped: report.is_none(),
    };
    Ok(summary)
}

fn mode_string(mode: CheckpointMode) -> String {
    match mode {
        CheckpointMode::Force => "force",
        CheckpointMode::BestEffort => "best_effort",
    }
    .to_string()
}
