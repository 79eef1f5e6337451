//! Log replay at open time.
//!
//! Records are buffered per commit group and applied only when the group's
//! commit-flagged record arrives. A group cut short by a crash, or a torn
//! tail, is discarded. Records at or below the checkpoint LSN are already
//! reflected in the file and snapshot and are skipped, which makes replay
//! idempotent across repeated crashes.

use serde::Serialize;
use tracing::{debug, info, warn};

use super::meta::Meta;
use super::snapshot::page_offset;
use crate::primitives::alloc::ExtentAllocator;
use crate::primitives::io::FileIo;
use crate::primitives::wal::{Wal, WalRecord, WalRecordKind};
use crate::types::checksum::ChecksumPath;
use crate::types::page::{self, PAGE_HDR_LEN};
use crate::types::{Lsn, Result, StrataError};

/// Summary of the replay performed when a file was opened.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Valid records read from the log.
    pub records_scanned: u64,
    /// Records at or below the checkpoint LSN.
    pub records_skipped: u64,
    /// Records applied to the file or allocator.
    pub records_applied: u64,
    /// Records belonging to a group without a commit record.
    pub records_discarded: u64,
    /// Commit groups applied.
    pub transactions_applied: u64,
    /// Page images written to the file.
    pub pages_written: u64,
    /// True if bytes past the valid prefix were rejected.
    pub torn_tail: bool,
    /// Highest LSN applied, or the checkpoint LSN if nothing was.
    pub last_applied_lsn: Lsn,
}

impl RecoveryReport {
    /// True if replay changed the file or allocator.
    pub fn applied_anything(&self) -> bool {
        self.records_applied > 0
    }
}

/// Replays committed groups newer than `meta.last_checkpoint_lsn`.
///
/// Page images go straight to their file offsets; allocator records are
/// applied to `allocator`, which must already hold the checkpoint snapshot.
pub(crate) fn replay(
    io: &dyn FileIo,
    wal: &Wal,
    allocator: &ExtentAllocator,
    meta: &Meta,
    path: ChecksumPath,
) -> Result<RecoveryReport> {
    let checkpoint = meta.last_checkpoint_lsn;
    if wal.start_lsn().0 > checkpoint.0 + 1 {
        return Err(StrataError::TornWrite("log begins after the last checkpoint"));
    }
    let mut report = RecoveryReport {
        last_applied_lsn: checkpoint,
        ..RecoveryReport::default()
    };
    let mut group: Vec<WalRecord> = Vec::new();
    let mut last_seen = Lsn::ZERO;
    let mut iter = wal.iter()?;
    while let Some(record) = iter.next_record()? {
        report.records_scanned += 1;
        last_seen = last_seen.max(record.lsn);
        if record.lsn <= checkpoint {
            report.records_skipped += 1;
            continue;
        }
        let closes_group = record.is_commit();
        group.push(record);
        if closes_group {
            apply_group(io, allocator, meta, path, &group, &mut report)?;
            group.clear();
        }
    }
    report.torn_tail = iter.torn();
    wal.advance_past(last_seen);
    if !group.is_empty() {
        report.records_discarded = group.len() as u64;
        warn!(
            records = group.len(),
            first_lsn = group[0].lsn.0,
            "pager.recovery.discard_uncommitted"
        );
    }
    if report.applied_anything() {
        let min_len = allocator.total_pages() * meta.page_size as u64;
        if io.len()? < min_len {
            io.truncate(min_len)?;
        }
        io.sync_all()?;
    }
    info!(
        scanned = report.records_scanned,
        applied = report.records_applied,
        transactions = report.transactions_applied,
        discarded = report.records_discarded,
        torn = report.torn_tail,
        "pager.recovery.done"
    );
    Ok(report)
}

fn apply_group(
    io: &dyn FileIo,
    allocator: &ExtentAllocator,
    meta: &Meta,
    path: ChecksumPath,
    group: &[WalRecord],
    report: &mut RecoveryReport,
) -> Result<()> {
    let mut image = vec![0u8; meta.page_size as usize];
    for record in group {
        match record.kind {
            WalRecordKind::PageImage => {
                if record.payload.len() != image.len() || record.payload.len() < PAGE_HDR_LEN {
                    return Err(StrataError::Corruption("logged page image has wrong size"));
                }
                image.copy_from_slice(&record.payload);
                page::set_page_lsn(&mut image, record.lsn)?;
                page::seal(&mut image, record.page_id, meta.salt, path)?;
                io.write_at(page_offset(record.page_id, meta.page_size), &image)?;
                report.pages_written += 1;
            }
            WalRecordKind::Allocate => {
                allocator
                    .allocate_at(record.extent()?)
                    .map_err(|_| StrataError::Corruption("logged allocation conflicts with free space"))?;
            }
            WalRecordKind::Free => {
                allocator
                    .free(record.extent()?)
                    .map_err(|_| StrataError::Corruption("logged free conflicts with free space"))?;
            }
            WalRecordKind::Grow => {
                let target = record.grow_total()?;
                let current = allocator.total_pages();
                if target > current {
                    allocator.grow(target - current)?;
                }
            }
            WalRecordKind::Commit => {}
        }
        report.records_applied += 1;
        report.last_applied_lsn = record.lsn;
    }
    report.transactions_applied += 1;
    debug!(
        records = group.len(),
        last_lsn = report.last_applied_lsn.0,
        "pager.recovery.group_applied"
    );
    Ok(())
}
