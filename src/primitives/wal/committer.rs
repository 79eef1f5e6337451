use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::debug;

use super::{clone_error, Wal, WalEntry};
use crate::types::{Lsn, Result, StrataError};

/// Synchronization mode for WAL commits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WalSyncMode {
    /// Sync before the commit is acknowledged.
    Immediate,
    /// Append now, sync at the next flush or checkpoint.
    Deferred,
    /// Never sync on commit.
    Off,
}

/// Configuration for batch commit behavior in WalCommitter.
#[derive(Clone, Copy, Debug)]
pub struct WalCommitConfig {
    /// Maximum number of commit requests to batch together.
    pub max_batch_commits: usize,
    /// Maximum total records across all batched commits.
    pub max_batch_records: usize,
    /// Maximum time to wait for additional commits before flushing a batch.
    pub max_batch_wait: Duration,
}

impl Default for WalCommitConfig {
    fn default() -> Self {
        Self {
            max_batch_commits: 32,
            max_batch_records: 512,
            max_batch_wait: Duration::from_millis(2),
        }
    }
}

impl WalCommitConfig {
    fn normalize(mut self) -> Self {
        if self.max_batch_commits == 0 {
            self.max_batch_commits = 1;
        }
        if self.max_batch_records == 0 {
            self.max_batch_records = 1;
        }
        if self.max_batch_wait.is_zero() {
            self.max_batch_wait = Duration::from_micros(100);
        }
        self
    }
}

/// Counters describing how commits were grouped.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CommitterStats {
    /// Requests acknowledged.
    pub commits: u64,
    /// Batches written.
    pub batches: u64,
    /// Largest number of requests in one batch.
    pub max_batch: u64,
}

/// Group committer.
///
/// Requests queue up and a background worker drains them in FIFO order,
/// appending each batch with one vectored write and at most one sync. Log
/// order therefore equals enqueue order.
pub struct WalCommitter {
    wal: Arc<Wal>,
    state: Arc<Mutex<CommitState>>,
    wakeup: Arc<Condvar>,
    config: Arc<Mutex<WalCommitConfig>>,
}

/// Ticket representing a pending commit.
pub struct WalCommitTicket {
    request: Arc<CommitRequest>,
}

impl WalCommitTicket {
    /// Blocks until the commit is durable per its sync mode. Returns the LSN
    /// of the request's last record.
    pub fn wait(self) -> Result<Lsn> {
        self.request.wait()
    }
}

impl WalCommitter {
    /// Creates a committer over `wal`. The worker thread starts lazily.
    pub fn new(wal: Arc<Wal>, config: WalCommitConfig) -> Self {
        Self {
            wal,
            state: Arc::new(Mutex::new(CommitState::default())),
            wakeup: Arc::new(Condvar::new()),
            config: Arc::new(Mutex::new(config.normalize())),
        }
    }

    /// Queues `entries` without blocking.
    pub fn enqueue(&self, entries: Vec<WalEntry>, sync_mode: WalSyncMode) -> WalCommitTicket {
        let request = Arc::new(CommitRequest::new(entries, sync_mode));
        let mut state = self.state.lock();
        state.pending.push_back(Arc::clone(&request));
        debug!(
            records = request.entries.len(),
            sync_mode = ?sync_mode,
            pending = state.pending.len(),
            worker_running = state.worker_running,
            "wal.committer.enqueue"
        );
        if !state.worker_running {
            let spawned = Self::spawn_worker(
                Arc::clone(&self.wal),
                Arc::clone(&self.state),
                Arc::clone(&self.wakeup),
                Arc::clone(&self.config),
            );
            match spawned {
                Ok(()) => state.worker_running = true,
                Err(err) => {
                    let failure = StrataError::Io(err);
                    while let Some(req) = state.pending.pop_front() {
                        req.finish(Err(clone_error(&failure)));
                    }
                }
            }
        } else {
            self.wakeup.notify_one();
        }
        WalCommitTicket { request }
    }

    /// Queues `entries` and waits for the outcome.
    pub fn commit(&self, entries: Vec<WalEntry>, sync_mode: WalSyncMode) -> Result<Lsn> {
        self.enqueue(entries, sync_mode).wait()
    }

    /// Updates the batching configuration at runtime.
    pub fn set_config(&self, config: WalCommitConfig) {
        *self.config.lock() = config.normalize();
        self.wakeup.notify_one();
    }

    /// Grouping counters.
    pub fn stats(&self) -> CommitterStats {
        self.state.lock().stats.clone()
    }

    /// The log this committer appends to.
    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    fn spawn_worker(
        wal: Arc<Wal>,
        state: Arc<Mutex<CommitState>>,
        wakeup: Arc<Condvar>,
        config: Arc<Mutex<WalCommitConfig>>,
    ) -> std::io::Result<()> {
        thread::Builder::new()
            .name("strata-wal-commit".into())
            .spawn(move || Self::worker_loop(wal, state, wakeup, config))
            .map(|_| ())
    }

    fn worker_loop(
        wal: Arc<Wal>,
        state: Arc<Mutex<CommitState>>,
        wakeup: Arc<Condvar>,
        config: Arc<Mutex<WalCommitConfig>>,
    ) {
        let mut batch = Vec::new();
        loop {
            batch.clear();
            {
                let mut guard = state.lock();
                let Some(first) = guard.pending.pop_front() else {
                    guard.worker_running = false;
                    debug!("wal.committer.worker_exit");
                    break;
                };
                batch.push(first);
            }
            let config_snapshot = *config.lock();
            Self::coalesce_batch(&state, &wakeup, &mut batch, config_snapshot);
            match Self::apply_batch(&wal, &batch) {
                Ok(lsns) => {
                    {
                        let mut guard = state.lock();
                        guard.stats.batches += 1;
                        guard.stats.commits += batch.len() as u64;
                        guard.stats.max_batch = guard.stats.max_batch.max(batch.len() as u64);
                    }
                    for (req, lsn) in batch.drain(..).zip(lsns) {
                        req.finish(Ok(lsn));
                    }
                }
                Err(err) => {
                    for req in &batch {
                        req.finish(Err(clone_error(&err)));
                    }
                    let mut guard = state.lock();
                    while let Some(req) = guard.pending.pop_front() {
                        req.finish(Err(clone_error(&err)));
                    }
                    guard.worker_running = false;
                    break;
                }
            }
        }
    }

    fn coalesce_batch(
        state: &Arc<Mutex<CommitState>>,
        wakeup: &Arc<Condvar>,
        batch: &mut Vec<Arc<CommitRequest>>,
        config: WalCommitConfig,
    ) {
        let start = Instant::now();
        let mut total_records: usize = batch.iter().map(|r| r.entries.len()).sum();
        while batch.len() < config.max_batch_commits && total_records < config.max_batch_records {
            let remaining = match config.max_batch_wait.checked_sub(start.elapsed()) {
                Some(dur) if !dur.is_zero() => dur,
                _ => break,
            };
            let mut guard = state.lock();
            if guard.pending.is_empty() {
                let wait_result = wakeup.wait_for(&mut guard, remaining);
                if wait_result.timed_out() && guard.pending.is_empty() {
                    break;
                }
            }
            if let Some(req) = guard.pending.pop_front() {
                total_records += req.entries.len();
                batch.push(req);
            }
        }
    }

    /// Appends the batch and returns each request's last LSN.
    fn apply_batch(wal: &Wal, batch: &[Arc<CommitRequest>]) -> Result<Vec<Lsn>> {
        let total_records: usize = batch.iter().map(|req| req.entries.len()).sum();
        let mut flat: Vec<&WalEntry> = Vec::with_capacity(total_records);
        for req in batch {
            flat.extend(req.entries.iter());
        }
        let last = wal.append(&flat)?;
        let mut lsns = Vec::with_capacity(batch.len());
        let mut cursor = last.0 + 1 - total_records as u64;
        for req in batch {
            cursor += req.entries.len() as u64;
            lsns.push(Lsn(cursor - 1));
        }
        if batch
            .iter()
            .any(|req| matches!(req.sync_mode, WalSyncMode::Immediate))
        {
            wal.sync()?;
        }
        debug!(
            batch_commits = batch.len(),
            total_records,
            last_lsn = last.0,
            "wal.committer.apply_batch"
        );
        Ok(lsns)
    }
}

#[derive(Default)]
struct CommitState {
    pending: VecDeque<Arc<CommitRequest>>,
    worker_running: bool,
    stats: CommitterStats,
}

struct CommitRequest {
    entries: Vec<WalEntry>,
    sync_mode: WalSyncMode,
    result: Mutex<Option<Result<Lsn>>>,
    cv: Condvar,
}

impl CommitRequest {
    fn new(entries: Vec<WalEntry>, sync_mode: WalSyncMode) -> Self {
        Self {
            entries,
            sync_mode,
            result: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn finish(&self, outcome: Result<Lsn>) {
        let mut result = self.result.lock();
        if result.is_none() {
            *result = Some(outcome);
            self.cv.notify_all();
        }
    }

    fn wait(&self) -> Result<Lsn> {
        let mut guard = self.result.lock();
        loop {
            if let Some(result) = guard.take() {
                return result;
            }
            self.cv.wait(&mut guard);
        }
    }
}
