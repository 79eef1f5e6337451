#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Once;

use strata::primitives::pager::{wal_path, PageManager, StorageOptions, Synchronous};
use strata::primitives::wal::{FILE_HEADER_LEN, RECORD_HEADER_LEN};
use strata::{Extent, PageKind, Result, TableId};
use tempfile::tempdir;

const PAGE: u32 = 1024;

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn options() -> StorageOptions {
    init_tracing();
    StorageOptions {
        page_size: PAGE,
        cache_pages: 16,
        growth_pages: 16,
        synchronous: Synchronous::Normal,
        ..StorageOptions::default()
    }
}

fn wal_len(db: &Path) -> u64 {
    std::fs::metadata(wal_path(db)).unwrap().len()
}

fn truncate_wal(db: &Path, len: u64) {
    let file = OpenOptions::new().write(true).open(wal_path(db)).unwrap();
    file.set_len(len).unwrap();
    file.sync_all().unwrap();
}

/// A released page is either free again or reused by the allocator
/// snapshot written at the checkpoint that followed the release.
fn assert_released(pm: &PageManager, extent: Extent) -> Result<()> {
    let snapshot = pm.snapshot_page_ids();
    for page in extent.iter_pages() {
        if pm.is_free(page) {
            assert!(pm.read_page(page).is_err());
        } else {
            assert!(snapshot.contains(&page), "page {} still allocated", page.0);
            let header = pm.page_header(page)?.expect("snapshot page header");
            assert_eq!(header.kind, PageKind::FreeList);
        }
    }
    Ok(())
}

#[test]
fn committed_pages_survive_drop_without_close() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("wal_replay.db");

    let pm = PageManager::create(&path, options())?;
    let mut txn = pm.begin_transaction();
    let page = txn.create_page(TableId(3), PageKind::Table)?;
    let pattern = 0xABCD_1234_5566_7788u64.to_be_bytes();
    txn.write_page(page, &pattern)?;
    let committed_lsn = txn.commit()?;
    let extents_before = pm.allocator_snapshot();
    drop(pm); // simulate crash before checkpoint

    assert!(wal_len(&path) > FILE_HEADER_LEN as u64);
    let reopened = PageManager::open(&path, options())?;
    let report = reopened.recovery_report().clone();
    assert!(report.transactions_applied >= 2, "grow and the transaction replay");
    assert_eq!(report.pages_written, 1);
    assert_eq!(report.records_discarded, 0);
    assert!(!report.torn_tail);
    assert_eq!(report.last_applied_lsn, committed_lsn);

    assert_eq!(&reopened.read_page(page)?[..8], &pattern);
    let header = reopened.page_header(page)?.expect("header written");
    assert_eq!(header.table_id, TableId(3));
    assert_eq!(header.page_lsn, committed_lsn);

    let meta = reopened.meta();
    assert!(
        meta.last_checkpoint_lsn.0 >= committed_lsn.0,
        "recovery should advance checkpoint to the committed LSN"
    );
    assert_eq!(reopened.allocator_snapshot().total_pages, extents_before.total_pages);
    assert!(!reopened.is_free(page));
    Ok(())
}

#[test]
fn checkpoint_after_recovery_covers_the_replayed_log() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("stale_log.db");

    let pm = PageManager::create(&path, options())?;
    let page = pm.create_page(TableId(4), PageKind::Table)?;
    let committed_lsn = pm.write_page(page, b"covered")?;
    drop(pm);

    // Keep the log as it was before recovery folded it into a checkpoint.
    let saved_log = std::fs::read(wal_path(&path)).unwrap();
    let pm = PageManager::open(&path, options())?;
    assert_eq!(pm.recovery_report().last_applied_lsn, committed_lsn);
    assert!(pm.meta().last_checkpoint_lsn >= committed_lsn);
    drop(pm);

    // A crash between the header write and the log reset leaves the old
    // records behind; they are all at or below the checkpoint.
    std::fs::write(wal_path(&path), &saved_log).unwrap();
    let pm = PageManager::open(&path, options())?;
    let report = pm.recovery_report();
    assert_eq!(report.records_applied, 0);
    assert_eq!(report.records_skipped, report.records_scanned);
    assert_eq!(&pm.read_page(page)?[..7], b"covered");
    pm.check_allocator()?;

    let next = pm.write_page(page, b"after")?;
    assert!(next > committed_lsn, "log numbering restarted below replayed records");
    Ok(())
}

#[test]
fn uncommitted_tail_is_not_applied() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("tail.db");

    let pm = PageManager::create(&path, options())?;
    let mut first = pm.begin_transaction();
    let a = first.create_page(TableId(1), PageKind::Table)?;
    first.write_page(a, b"first")?;
    first.commit()?;

    let mut second = pm.begin_transaction();
    let b = second.create_page(TableId(1), PageKind::Table)?;
    second.write_page(b, b"second")?;
    second.commit()?;
    drop(pm);

    // Cut the commit-flagged page image of the second transaction, leaving
    // its allocation record without a commit.
    let len = wal_len(&path);
    truncate_wal(&path, len - (RECORD_HEADER_LEN as u64 + PAGE as u64));

    let pm = PageManager::open(&path, options())?;
    let report = pm.recovery_report();
    assert_eq!(report.records_discarded, 1);
    assert!(!report.torn_tail);
    assert_eq!(&pm.read_page(a)?[..5], b"first");
    assert_released(&pm, Extent::new(b, 1))?;
    pm.check_allocator()?;
    Ok(())
}

#[test]
fn torn_tail_keeps_the_valid_prefix() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("torn.db");

    let pm = PageManager::create(&path, options())?;
    let page = pm.create_page(TableId(2), PageKind::Index)?;
    pm.write_page(page, b"durable")?;
    drop(pm);

    let mut wal = OpenOptions::new().append(true).open(wal_path(&path)).unwrap();
    wal.write_all(&[0xEE; 100]).unwrap();
    wal.sync_all().unwrap();
    drop(wal);

    let pm = PageManager::open(&path, options())?;
    assert!(pm.recovery_report().torn_tail);
    assert_eq!(pm.recovery_report().records_discarded, 0);
    assert_eq!(&pm.read_page(page)?[..7], b"durable");
    Ok(())
}

#[test]
fn half_written_record_is_a_torn_tail() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("half.db");

    let pm = PageManager::create(&path, options())?;
    let keep = pm.create_page(TableId(1), PageKind::Table)?;
    pm.write_page(keep, b"keep")?;
    pm.write_page(keep, b"lost")?;
    drop(pm);

    // The last record is the second page image; keep half of its payload.
    let len = wal_len(&path);
    truncate_wal(&path, len - (PAGE as u64 / 2));

    let pm = PageManager::open(&path, options())?;
    assert!(pm.recovery_report().torn_tail);
    assert_eq!(&pm.read_page(keep)?[..4], b"keep");
    Ok(())
}

#[test]
fn replay_is_idempotent_across_repeated_crashes() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("again.db");

    let pm = PageManager::create(&path, options())?;
    let extent = pm.allocate_extent(4)?;
    let page = pm.create_page(TableId(5), PageKind::Table)?;
    pm.write_page(page, b"v1")?;
    pm.free_extent(extent)?;
    drop(pm);

    let pm = PageManager::open(&path, options())?;
    assert!(pm.recovery_report().applied_anything());
    let snapshot = pm.allocator_snapshot();
    drop(pm);

    let pm = PageManager::open(&path, options())?;
    assert_eq!(pm.recovery_report().records_scanned, 0);
    assert_eq!(pm.allocator_snapshot(), snapshot);
    assert_released(&pm, extent)?;
    assert_eq!(&pm.read_page(page)?[..2], b"v1");

    pm.write_page(page, b"v2")?;
    drop(pm);
    let pm = PageManager::open(&path, options())?;
    assert_eq!(&pm.read_page(page)?[..2], b"v2");
    pm.check_allocator()?;
    Ok(())
}

#[test]
fn rolled_back_work_never_reaches_the_log() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("rollback.db");

    let pm = PageManager::create(&path, options())?;
    pm.allocate_extent(1)?;
    let len_before = wal_len(&path);
    {
        let mut txn = pm.begin_transaction();
        let id = txn.create_page(TableId(1), PageKind::Table)?;
        txn.write_page(id, b"never")?;
        txn.rollback();
    }
    assert_eq!(wal_len(&path), len_before);
    drop(pm);

    // Only the growth and the single-page allocation were logged.
    let pm = PageManager::open(&path, options())?;
    assert_eq!(pm.recovery_report().records_scanned, 2);
    assert_eq!(pm.recovery_report().transactions_applied, 2);
    assert_eq!(pm.recovery_report().pages_written, 0);
    Ok(())
}
