#![allow(missing_docs)]

use std::collections::HashSet;
use std::sync::{Barrier, Once};
use std::thread;

use strata::primitives::pager::{PageManager, StorageOptions, Synchronous};
use strata::{Lsn, PageId, PageKind, TableId};
use tempfile::tempdir;

const THREADS: usize = 8;
const COMMITS_PER_THREAD: usize = 25;

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
        page_size: 1024,
        cache_pages: 64,
        growth_pages: 64,
        synchronous: Synchronous::Full,
        group_commit_max_commits: 32,
        group_commit_max_wait_us: 5_000,
        ..StorageOptions::default()
    }
}

#[test]
fn concurrent_commits_share_log_writes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("group.db");
    let pm = PageManager::create(&path, options()).unwrap();
    let barrier = Barrier::new(THREADS);

    let results: Vec<Vec<(PageId, Lsn, u8)>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let pm = &pm;
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    let mut mine = Vec::with_capacity(COMMITS_PER_THREAD);
                    for i in 0..COMMITS_PER_THREAD {
                        let tag = (t * COMMITS_PER_THREAD + i) as u8;
                        let mut txn = pm.begin_transaction();
                        let id = txn.create_page(TableId(t as u32), PageKind::Table).unwrap();
                        txn.write_page(id, &[tag; 16]).unwrap();
                        let lsn = txn.commit().unwrap();
                        mine.push((id, lsn, tag));
                    }
                    mine
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let total = THREADS * COMMITS_PER_THREAD;
    let all: Vec<(PageId, Lsn, u8)> = results.into_iter().flatten().collect();
    let pages: HashSet<PageId> = all.iter().map(|(id, _, _)| *id).collect();
    let lsns: HashSet<Lsn> = all.iter().map(|(_, lsn, _)| *lsn).collect();
    assert_eq!(pages.len(), total, "every transaction got its own page");
    assert_eq!(lsns.len(), total, "every commit has a distinct last LSN");

    let stats = pm.committer_stats();
    assert_eq!(pm.stats().commits, total as u64);
    assert!(stats.commits >= total as u64);
    assert!(
        stats.batches < stats.commits,
        "expected grouping: {} batches for {} commits",
        stats.batches,
        stats.commits
    );
    assert!(stats.max_batch > 1);

    for (id, _, tag) in &all {
        assert_eq!(pm.read_page(*id).unwrap()[..16], [*tag; 16]);
    }
    pm.check_allocator().unwrap();
    drop(pm);

    // Nothing was checkpointed; every commit must come back from the log.
    let pm = PageManager::open(&path, options()).unwrap();
    assert_eq!(pm.recovery_report().records_discarded, 0);
    for (id, _, tag) in &all {
        assert_eq!(pm.read_page(*id).unwrap()[..16], [*tag; 16]);
    }
}

#[test]
fn commit_order_matches_log_order() {
    let dir = tempdir().unwrap();
    let pm = PageManager::create(dir.path().join("order.db"), options()).unwrap();
    let id = pm.create_page(TableId(1), PageKind::Table).unwrap();
    let mut last = Lsn::ZERO;
    for round in 0..20u8 {
        let lsn = pm.write_page(id, &[round; 4]).unwrap();
        assert!(lsn > last);
        last = lsn;
    }
    assert_eq!(pm.page_header(id).unwrap().unwrap().page_lsn, last);
    assert_eq!(pm.read_page(id).unwrap()[..4], [19u8; 4]);
}
