#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use strata::primitives::pager::{PageManager, StorageMode, StorageOptions};
use strata::types::page::PAGE_HDR_LEN;
use strata::{AllocationStrategy, CheckpointMode, Extent, PageId, PageKind, StrataError, TableId};
use tempfile::tempdir;

fn options() -> StorageOptions {
    StorageOptions {
        page_size: 1024,
        cache_pages: 8,
        growth_pages: 16,
        ..StorageOptions::default()
    }
}

fn flip_byte(path: &Path, offset: u64) {
    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.read_exact(&mut byte).unwrap();
    byte[0] ^= 0x40;
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&byte).unwrap();
    file.sync_all().unwrap();
}

/// A released page is either free again or reused by the allocator
/// snapshot written at the checkpoint that followed the release.
fn assert_released(pm: &PageManager, extent: Extent) {
    let snapshot = pm.snapshot_page_ids();
    for page in extent.iter_pages() {
        if pm.is_free(page) {
            assert!(matches!(pm.read_page(page), Err(StrataError::Invalid(_))));
        } else {
            assert!(snapshot.contains(&page), "page {} still allocated", page.0);
            let header = pm.page_header(page).unwrap().unwrap();
            assert_eq!(header.kind, PageKind::FreeList);
        }
    }
}

#[test]
fn transactions_survive_a_clean_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("e2e.db");
    let (kept, dropped, before) = {
        let pm = PageManager::create(&path, options()).unwrap();
        let mut txn = pm.begin_transaction();
        let kept: Vec<PageId> = (0..6u8)
            .map(|i| {
                let id = txn.create_page(TableId(9), PageKind::Table).unwrap();
                txn.write_page(id, &[i + 1; 32]).unwrap();
                id
            })
            .collect();
        let dropped = txn.allocate_extent(4).unwrap();
        txn.commit().unwrap();

        let mut txn = pm.begin_transaction();
        txn.free_extent(dropped).unwrap();
        txn.write_page(kept[0], b"rewritten").unwrap();
        txn.commit().unwrap();

        pm.checkpoint(CheckpointMode::Force).unwrap();
        let before = pm.allocator_snapshot();
        pm.close().unwrap();
        (kept, dropped, before)
    };

    let pm = PageManager::open(&path, options()).unwrap();
    assert_eq!(pm.recovery_report().records_scanned, 0);
    assert_eq!(pm.allocator_snapshot(), before);
    assert_eq!(&pm.read_page(kept[0]).unwrap()[..9], b"rewritten");
    for (i, id) in kept.iter().enumerate().skip(1) {
        assert_eq!(pm.read_page(*id).unwrap()[..32], [i as u8 + 1; 32]);
        let header = pm.page_header(*id).unwrap().unwrap();
        assert_eq!(header.kind, PageKind::Table);
        assert_eq!(header.table_id, TableId(9));
        assert_eq!(header.page_no, *id);
    }
    assert_released(&pm, dropped);
    pm.check_allocator().unwrap();
}

#[test]
fn file_grows_by_the_larger_of_increment_and_request() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("grow.db");
    let pm = PageManager::create(&path, options()).unwrap();
    let small = pm.allocate_extent(3).unwrap();
    assert_eq!(small.start, PageId(1));
    assert_eq!(pm.total_pages(), 17);

    let big = pm.allocate_extent(40).unwrap();
    assert_eq!(big.len, 40);
    assert_eq!(pm.stats().growths, 2);
    assert!(pm.total_pages() >= 57);
    pm.close().unwrap();

    let len = std::fs::metadata(&path).unwrap().len();
    let pm = PageManager::open(&path, options()).unwrap();
    assert!(len >= pm.total_pages() * 1024);
}

#[test]
fn header_values_win_over_open_options() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mode.db");
    let create = StorageOptions {
        page_size: 4096,
        storage_mode: StorageMode::AppendOnly,
        ..options()
    };
    PageManager::create(&path, create).unwrap().close().unwrap();

    let pm = PageManager::open(&path, options()).unwrap();
    assert_eq!(pm.page_size(), 4096);
    assert_eq!(pm.payload_size(), 4096 - PAGE_HDR_LEN);
    assert_eq!(pm.meta().storage_mode, StorageMode::AppendOnly);
    assert_eq!(pm.strategy(), AllocationStrategy::WorstFit);
}

#[test]
fn columnar_files_pack_best_fit() {
    let dir = tempdir().unwrap();
    let opts = StorageOptions {
        storage_mode: StorageMode::Columnar,
        ..options()
    };
    let pm = PageManager::create(dir.path().join("col.db"), opts).unwrap();
    assert_eq!(pm.strategy(), AllocationStrategy::BestFit);
    let a = pm.allocate_extent(2).unwrap();
    let _b = pm.allocate_extent(5).unwrap();
    let c = pm.allocate_extent(2).unwrap();
    pm.free_extent(a).unwrap();
    // [a] is a 2-page hole, the tail is larger; best fit reuses the hole.
    let d = pm.allocate_extent(2).unwrap();
    assert_eq!(d, a);
    assert_ne!(d, c);
}

#[test]
fn corrupted_page_fails_only_its_own_read() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("crc.db");
    let (good, bad) = {
        let pm = PageManager::create(&path, options()).unwrap();
        let good = pm.create_page(TableId(1), PageKind::Table).unwrap();
        let bad = pm.create_page(TableId(1), PageKind::Table).unwrap();
        pm.write_page(good, b"good").unwrap();
        pm.write_page(bad, b"bad!").unwrap();
        pm.close().unwrap();
        (good, bad)
    };
    flip_byte(&path, bad.0 * 1024 + PAGE_HDR_LEN as u64 + 2);

    let pm = PageManager::open(&path, options()).unwrap();
    match pm.read_page(bad) {
        Err(StrataError::ChecksumMismatch { page, .. }) => assert_eq!(page, bad.0),
        other => panic!("expected checksum mismatch, got {other:?}"),
    }
    assert_eq!(pm.stats().checksum_failures, 1);
    assert_eq!(&pm.read_page(good).unwrap()[..4], b"good");

    pm.set_checksum_verification(false);
    let raw = pm.read_page(bad).unwrap();
    assert_ne!(&raw[..4], b"bad!");
}

#[test]
fn checkpoint_then_reload_reproduces_extent_set() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("snap.db");
    let expected = {
        let pm = PageManager::create(&path, options()).unwrap();
        let mut extents = Vec::new();
        for len in [1u64, 3, 2, 5, 1, 4, 2] {
            extents.push(pm.allocate_extent(len).unwrap());
        }
        for extent in extents.iter().step_by(2) {
            pm.free_extent(*extent).unwrap();
        }
        pm.checkpoint(CheckpointMode::Force).unwrap();
        let snapshot = pm.allocator_snapshot();
        drop(pm);
        snapshot
    };
    let pm = PageManager::open(&path, options()).unwrap();
    assert_eq!(pm.allocator_snapshot(), expected);
    assert_eq!(pm.meta().snapshot_extents, expected.extents.len() as u64);
    for page in pm.snapshot_page_ids() {
        assert!(!pm.is_free(page));
    }
}

#[test]
fn mark_dirty_relogs_current_image() {
    let dir = tempdir().unwrap();
    let pm = PageManager::create(dir.path().join("dirty.db"), options()).unwrap();
    let id = pm.create_page(TableId(4), PageKind::Index).unwrap();
    let first = pm.write_page(id, b"same").unwrap();
    let second = pm.mark_dirty(id).unwrap();
    assert!(second > first);
    assert_eq!(pm.page_header(id).unwrap().unwrap().page_lsn, second);
    assert!(pm.flush_dirty_pages().unwrap() >= 1);
    assert_eq!(pm.stats().dirty_pages, 0);
}
