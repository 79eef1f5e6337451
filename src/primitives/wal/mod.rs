#![forbid(unsafe_code)]
//! Write-ahead log.
//!
//! The log is a 32-byte file header followed by records. Each record is a
//! 48-byte header plus a variable payload (a full page image, an extent
//! length, or a page total). Records carry a CRC over their header, a CRC over
//! their payload, and a chain value folding in every earlier record, so a
//! reader can tell exactly where the durable prefix ends.

use std::borrow::Borrow;
use std::fmt;
use std::io::{ErrorKind, IoSlice};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::primitives::alloc::Extent;
use crate::primitives::bytes::be;
use crate::primitives::io::FileIo;
use crate::types::checksum::{Checksum, Crc32Fast};
use crate::types::{Lsn, PageId, Result, StrataError};

mod committer;

pub use committer::{CommitterStats, WalCommitConfig, WalCommitTicket, WalCommitter, WalSyncMode};

const WAL_MAGIC: [u8; 4] = *b"STRW";
const WAL_FORMAT_VERSION: u16 = 1;
/// Bytes in the log file header.
pub const FILE_HEADER_LEN: usize = 32;
/// Bytes in each record header.
pub const RECORD_HEADER_LEN: usize = 48;
const WAL_MAX_IO_SLICES: usize = 512;

/// Set on the last record of a committed group.
pub const FLAG_COMMIT: u8 = 0x01;

/// Configuration options for opening a write-ahead log.
#[derive(Clone, Debug, Default)]
pub struct WalOptions {
    /// Database page size; bounds record payloads.
    pub page_size: u32,
    /// Salt tying the log to its database file.
    pub wal_salt: u64,
    /// LSN given to the first record appended after a create or reset.
    pub start_lsn: Lsn,
}

impl WalOptions {
    /// Creates a new WalOptions with the specified configuration.
    pub fn new(page_size: u32, wal_salt: u64, start_lsn: Lsn) -> Self {
        Self {
            page_size,
            wal_salt,
            start_lsn,
        }
    }
}

/// Statistics tracking WAL operations.
#[derive(Clone, Debug, Default, Serialize)]
pub struct WalStats {
    /// Records appended since the last reset.
    pub records_appended: u64,
    /// Bytes appended since the last reset.
    pub bytes_appended: u64,
    /// Sync operations performed.
    pub syncs: u64,
    /// Vectored write calls issued.
    pub coalesced_writes: u64,
}

/// What a record describes.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum WalRecordKind {
    /// Full after-image of one page.
    PageImage = 1,
    /// Extent handed out; page id is the start, payload the length.
    Allocate = 2,
    /// Extent returned; page id is the start, payload the length.
    Free = 3,
    /// File grown; payload is the new page total.
    Grow = 4,
    /// Empty record closing a group with nothing else to log.
    Commit = 5,
}

impl WalRecordKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(WalRecordKind::PageImage),
            2 => Some(WalRecordKind::Allocate),
            3 => Some(WalRecordKind::Free),
            4 => Some(WalRecordKind::Grow),
            5 => Some(WalRecordKind::Commit),
            _ => None,
        }
    }

    /// Lowercase name used in tooling output.
    pub fn as_str(self) -> &'static str {
        match self {
            WalRecordKind::PageImage => "page_image",
            WalRecordKind::Allocate => "allocate",
            WalRecordKind::Free => "free",
            WalRecordKind::Grow => "grow",
            WalRecordKind::Commit => "commit",
        }
    }
}

/// Record submitted for appending; the log assigns its LSN.
#[derive(Clone, PartialEq, Eq)]
pub struct WalEntry {
    /// Page (or extent start) the record refers to.
    pub page_id: PageId,
    /// Record kind.
    pub kind: WalRecordKind,
    /// Record flags.
    pub flags: u8,
    /// Kind-specific payload.
    pub payload: Vec<u8>,
}

impl WalEntry {
    /// Full page image.
    pub fn page_image(page_id: PageId, image: Vec<u8>) -> Self {
        Self {
            page_id,
            kind: WalRecordKind::PageImage,
            flags: 0,
            payload: image,
        }
    }

    /// Extent allocation.
    pub fn allocate(extent: Extent) -> Self {
        Self {
            page_id: extent.start,
            kind: WalRecordKind::Allocate,
            flags: 0,
            payload: extent.len.to_be_bytes().to_vec(),
        }
    }

    /// Extent release.
    pub fn free(extent: Extent) -> Self {
        Self {
            page_id: extent.start,
            kind: WalRecordKind::Free,
            flags: 0,
            payload: extent.len.to_be_bytes().to_vec(),
        }
    }

    /// File growth to `total_pages`.
    pub fn grow(total_pages: u64) -> Self {
        Self {
            page_id: PageId(0),
            kind: WalRecordKind::Grow,
            flags: 0,
            payload: total_pages.to_be_bytes().to_vec(),
        }
    }

    /// Standalone commit marker.
    pub fn commit() -> Self {
        Self {
            page_id: PageId(0),
            kind: WalRecordKind::Commit,
            flags: FLAG_COMMIT,
            payload: Vec::new(),
        }
    }

    /// Returns the entry with the commit flag set.
    pub fn committing(mut self) -> Self {
        self.flags |= FLAG_COMMIT;
        self
    }
}

impl fmt::Debug for WalEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalEntry")
            .field("page_id", &self.page_id)
            .field("kind", &self.kind)
            .field("flags", &self.flags)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Record read back from the log.
#[derive(Clone)]
pub struct WalRecord {
    /// Sequence number assigned at append.
    pub lsn: Lsn,
    /// Page (or extent start) the record refers to.
    pub page_id: PageId,
    /// Record kind.
    pub kind: WalRecordKind,
    /// Record flags.
    pub flags: u8,
    /// Kind-specific payload.
    pub payload: Vec<u8>,
}

impl WalRecord {
    /// True if this record closes a committed group.
    pub fn is_commit(&self) -> bool {
        self.flags & FLAG_COMMIT != 0
    }

    /// Extent described by an `Allocate` or `Free` record.
    pub fn extent(&self) -> Result<Extent> {
        let len = be::u64_at(&self.payload, 0)?;
        Ok(Extent::new(self.page_id, len))
    }

    /// New page total carried by a `Grow` record.
    pub fn grow_total(&self) -> Result<u64> {
        be::u64_at(&self.payload, 0)
    }
}

impl fmt::Debug for WalRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalRecord")
            .field("lsn", &self.lsn)
            .field("page_id", &self.page_id)
            .field("kind", &self.kind)
            .field("flags", &self.flags)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

#[derive(Clone, Debug)]
struct FileHeader {
    page_size: u32,
    wal_salt: u64,
    start_lsn: Lsn,
}

impl FileHeader {
    fn new(page_size: u32, wal_salt: u64, start_lsn: Lsn) -> Self {
        Self {
            page_size,
            wal_salt,
            start_lsn,
        }
    }

    fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&WAL_MAGIC);
        buf[4..6].copy_from_slice(&WAL_FORMAT_VERSION.to_be_bytes());
        buf[8..12].copy_from_slice(&self.page_size.to_be_bytes());
        buf[12..20].copy_from_slice(&self.wal_salt.to_be_bytes());
        buf[20..28].copy_from_slice(&self.start_lsn.0.to_be_bytes());
        let crc = compute_crc32(&[&buf[..28]]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < FILE_HEADER_LEN {
            return Err(StrataError::Corruption("wal header truncated"));
        }
        if src[0..4] != WAL_MAGIC {
            return Err(StrataError::Corruption("wal magic mismatch"));
        }
        if be::u16_at(src, 4)? != WAL_FORMAT_VERSION {
            return Err(StrataError::Corruption("wal format version mismatch"));
        }
        if src[6..8] != [0, 0] {
            return Err(StrataError::Corruption("wal reserved header bytes non-zero"));
        }
        let stored_crc = be::u32_at(src, 28)?;
        if compute_crc32(&[&src[..28]]) != stored_crc {
            return Err(StrataError::Corruption("wal header crc mismatch"));
        }
        Ok(Self {
            page_size: be::u32_at(src, 8)?,
            wal_salt: be::u64_at(src, 12)?,
            start_lsn: Lsn(be::u64_at(src, 20)?),
        })
    }
}

#[derive(Clone, Debug)]
struct RecordHeader {
    lsn: Lsn,
    page_id: PageId,
    kind: u8,
    flags: u8,
    payload_len: u32,
    prev_chain: u64,
    payload_crc32: u32,
    header_crc32: u32,
}

impl RecordHeader {
    fn encode(&self) -> [u8; RECORD_HEADER_LEN] {
        let mut buf = [0u8; RECORD_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.lsn.0.to_be_bytes());
        buf[8..16].copy_from_slice(&self.page_id.0.to_be_bytes());
        buf[16] = self.kind;
        buf[17] = self.flags;
        buf[20..24].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[24..32].copy_from_slice(&self.prev_chain.to_be_bytes());
        buf[32..36].copy_from_slice(&self.payload_crc32.to_be_bytes());
        buf[44..48].copy_from_slice(&self.header_crc32.to_be_bytes());
        buf
    }

    fn encode_with_crc(&self) -> [u8; RECORD_HEADER_LEN] {
        let mut buf = self.encode();
        let crc = compute_crc32(&[&buf[..44]]);
        buf[44..48].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// `None` means the bytes are not a valid header (torn or garbage).
    fn decode(src: &[u8]) -> Result<Option<Self>> {
        if src.len() < RECORD_HEADER_LEN {
            return Ok(None);
        }
        let stored_crc = be::u32_at(src, 44)?;
        if compute_crc32(&[&src[..44]]) != stored_crc {
            return Ok(None);
        }
        if src[18..20] != [0, 0] || src[36..44].iter().any(|&b| b != 0) {
            return Err(StrataError::Corruption("wal record reserved bytes non-zero"));
        }
        Ok(Some(Self {
            lsn: Lsn(be::u64_at(src, 0)?),
            page_id: PageId(be::u64_at(src, 8)?),
            kind: src[16],
            flags: src[17],
            payload_len: be::u32_at(src, 20)?,
            prev_chain: be::u64_at(src, 24)?,
            payload_crc32: be::u32_at(src, 32)?,
            header_crc32: stored_crc,
        }))
    }
}

fn chain_value(prev_chain: u64, encoded_header: &[u8], payload: &[u8]) -> u64 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&prev_chain.to_be_bytes());
    hasher.update(encoded_header);
    hasher.update(payload);
    let record_size = (RECORD_HEADER_LEN + payload.len()) as u64;
    (record_size << 32) | u64::from(hasher.finalize())
}

struct WalState {
    header: FileHeader,
    append_offset: u64,
    prev_chain: u64,
    next_lsn: Lsn,
    durable_lsn: Lsn,
    stats: WalStats,
}

/// Write-ahead log that provides durability and crash recovery.
pub struct Wal {
    io: Arc<dyn FileIo>,
    page_size: usize,
    state: Mutex<WalState>,
}

impl Wal {
    /// Opens or creates a write-ahead log with the given options.
    ///
    /// An existing log must carry the same page size and salt. Its records
    /// are left in place for [`Wal::iter`]; callers replay them and then call
    /// [`Wal::reset`] before appending.
    pub fn open(io: Arc<dyn FileIo>, options: WalOptions) -> Result<Self> {
        if options.page_size == 0 {
            return Err(StrataError::Invalid("wal page size must be non-zero"));
        }
        if options.start_lsn == Lsn::ZERO {
            return Err(StrataError::Invalid("wal start lsn must be non-zero"));
        }
        let len = io.len()?;
        let header = if len < FILE_HEADER_LEN as u64 {
            let header = FileHeader::new(options.page_size, options.wal_salt, options.start_lsn);
            io.write_at(0, &header.encode())?;
            io.truncate(FILE_HEADER_LEN as u64)?;
            io.sync_all()?;
            header
        } else {
            let mut buf = [0u8; FILE_HEADER_LEN];
            io.read_at(0, &mut buf)?;
            let header = FileHeader::decode(&buf)?;
            if header.page_size != options.page_size {
                return Err(StrataError::Corruption("wal page size mismatch"));
            }
            if header.wal_salt != options.wal_salt {
                return Err(StrataError::Corruption("wal salt mismatch"));
            }
            header
        };
        let append_offset = io.len()?.max(FILE_HEADER_LEN as u64);
        let next_lsn = header.start_lsn;
        Ok(Self {
            io,
            page_size: options.page_size as usize,
            state: Mutex::new(WalState {
                header,
                append_offset,
                prev_chain: 0,
                next_lsn,
                durable_lsn: Lsn(next_lsn.0.saturating_sub(1)),
                stats: WalStats::default(),
            }),
        })
    }

    /// Truncates the log to its header and restarts numbering at `start_lsn`.
    pub fn reset(&self, start_lsn: Lsn) -> Result<()> {
        let mut state = self.state.lock();
        state.header = FileHeader::new(state.header.page_size, state.header.wal_salt, start_lsn);
        self.io.write_at(0, &state.header.encode())?;
        self.io.truncate(FILE_HEADER_LEN as u64)?;
        self.io.sync_all()?;
        state.prev_chain = 0;
        state.append_offset = FILE_HEADER_LEN as u64;
        state.next_lsn = start_lsn;
        state.durable_lsn = Lsn(start_lsn.0.saturating_sub(1));
        state.stats = WalStats::default();
        debug!(start_lsn = start_lsn.0, "wal.reset");
        Ok(())
    }

    /// Moves numbering past `lsn`, the last record read back from disk, so
    /// new records and checkpoints never reuse LSNs already in the log.
    pub fn advance_past(&self, lsn: Lsn) {
        let mut state = self.state.lock();
        if lsn >= state.next_lsn {
            state.next_lsn = lsn.next();
        }
    }

    /// Appends `entries` with consecutive LSNs. Returns the LSN of the last
    /// entry, or the last assigned LSN when `entries` is empty. Does not sync.
    pub fn append<E: Borrow<WalEntry>>(&self, entries: &[E]) -> Result<Lsn> {
        let mut state = self.state.lock();
        if entries.is_empty() {
            return Ok(Lsn(state.next_lsn.0.saturating_sub(1)));
        }
        for entry in entries {
            if entry.borrow().payload.len() > self.page_size {
                return Err(StrataError::Invalid("wal payload larger than a page"));
            }
        }
        let mut index = 0usize;
        while index < entries.len() {
            let chunk_end = (index + WAL_MAX_IO_SLICES / 2).min(entries.len());
            let chunk = &entries[index..chunk_end];
            let mut header_bufs: Vec<[u8; RECORD_HEADER_LEN]> = Vec::with_capacity(chunk.len());
            let mut chunk_bytes = 0u64;
            let mut prev_chain = state.prev_chain;
            let mut lsn = state.next_lsn;
            for entry in chunk {
                let entry = entry.borrow();
                let header = RecordHeader {
                    lsn,
                    page_id: entry.page_id,
                    kind: entry.kind as u8,
                    flags: entry.flags,
                    payload_len: entry.payload.len() as u32,
                    prev_chain,
                    payload_crc32: compute_crc32(&[&entry.payload]),
                    header_crc32: 0,
                };
                let encoded = header.encode_with_crc();
                prev_chain = chain_value(prev_chain, &encoded, &entry.payload);
                header_bufs.push(encoded);
                chunk_bytes += (RECORD_HEADER_LEN + entry.payload.len()) as u64;
                lsn = lsn.next();
            }
            let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(chunk.len() * 2);
            for (hdr, entry) in header_bufs.iter().zip(chunk) {
                slices.push(IoSlice::new(hdr));
                slices.push(IoSlice::new(&entry.borrow().payload));
            }
            self.io.writev_at(state.append_offset, &slices)?;
            state.append_offset += chunk_bytes;
            state.prev_chain = prev_chain;
            state.next_lsn = lsn;
            state.stats.records_appended += chunk.len() as u64;
            state.stats.bytes_appended += chunk_bytes;
            state.stats.coalesced_writes += 1;
            index = chunk_end;
        }
        Ok(Lsn(state.next_lsn.0 - 1))
    }

    /// Syncs all pending writes to persistent storage.
    pub fn sync(&self) -> Result<()> {
        let appended = Lsn(self.state.lock().next_lsn.0.saturating_sub(1));
        self.io.sync_all()?;
        let mut state = self.state.lock();
        state.stats.syncs += 1;
        if appended > state.durable_lsn {
            state.durable_lsn = appended;
        }
        Ok(())
    }

    /// Syncs only if records up to `lsn` are not yet durable.
    pub fn sync_to(&self, lsn: Lsn) -> Result<()> {
        if self.durable_lsn() >= lsn {
            return Ok(());
        }
        self.sync()
    }

    /// Highest LSN known to be on stable storage.
    pub fn durable_lsn(&self) -> Lsn {
        self.state.lock().durable_lsn
    }

    /// LSN the next appended record will receive.
    pub fn next_lsn(&self) -> Lsn {
        self.state.lock().next_lsn
    }

    /// LSN recorded in the file header.
    pub fn start_lsn(&self) -> Lsn {
        self.state.lock().header.start_lsn
    }

    /// Creates an iterator over the records currently on disk.
    pub fn iter(&self) -> Result<WalIterator> {
        let len = self.io.len()?;
        if len < FILE_HEADER_LEN as u64 {
            return Err(StrataError::Corruption("wal truncated header"));
        }
        let mut header_buf = [0u8; FILE_HEADER_LEN];
        self.io.read_at(0, &mut header_buf)?;
        let header = FileHeader::decode(&header_buf)?;
        Ok(WalIterator {
            io: Arc::clone(&self.io),
            page_size: self.page_size,
            offset: FILE_HEADER_LEN as u64,
            end: len,
            prev_chain: 0,
            valid_up_to: FILE_HEADER_LEN as u64,
            expected_lsn: header.start_lsn,
            torn: false,
            done: false,
        })
    }

    /// Returns current statistics for this WAL instance.
    pub fn stats(&self) -> WalStats {
        self.state.lock().stats.clone()
    }

    /// Returns the total size of the WAL file in bytes.
    pub fn len(&self) -> Result<u64> {
        self.io.len()
    }

    /// Returns true if the WAL holds no records.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? <= FILE_HEADER_LEN as u64)
    }
}

/// Sequential reader over log records.
///
/// Stops at the first short read, header or payload CRC failure, chain break
/// or LSN gap. Everything before that point is the valid prefix; anything
/// after it is reported as a torn tail.
pub struct WalIterator {
    io: Arc<dyn FileIo>,
    page_size: usize,
    offset: u64,
    end: u64,
    prev_chain: u64,
    valid_up_to: u64,
    expected_lsn: Lsn,
    torn: bool,
    done: bool,
}

impl WalIterator {
    /// Reads the next valid record, or `None` at the end of the valid prefix.
    pub fn next_record(&mut self) -> Result<Option<WalRecord>> {
        if self.done {
            return Ok(None);
        }
        if self.offset == self.end {
            self.done = true;
            return Ok(None);
        }
        if self.offset + RECORD_HEADER_LEN as u64 > self.end {
            return self.stop_torn("short record header");
        }
        let mut header_buf = [0u8; RECORD_HEADER_LEN];
        if let Some(result) = self.read_or_stop(self.offset, &mut header_buf)? {
            return Ok(result);
        }
        let Some(header) = RecordHeader::decode(&header_buf)? else {
            return self.stop_torn("record header crc mismatch");
        };
        if header.prev_chain != self.prev_chain {
            return self.stop_torn("record chain break");
        }
        if header.lsn != self.expected_lsn {
            return self.stop_torn("record lsn out of sequence");
        }
        let payload_len = header.payload_len as usize;
        if payload_len > self.page_size {
            return self.stop_torn("record payload longer than a page");
        }
        let Some(kind) = WalRecordKind::from_u8(header.kind) else {
            return Err(StrataError::Corruption("unknown wal record kind"));
        };
        let payload_off = self.offset + RECORD_HEADER_LEN as u64;
        if payload_off + payload_len as u64 > self.end {
            return self.stop_torn("short record payload");
        }
        let mut payload = vec![0u8; payload_len];
        if let Some(result) = self.read_or_stop(payload_off, &mut payload)? {
            return Ok(result);
        }
        if compute_crc32(&[&payload]) != header.payload_crc32 {
            return self.stop_torn("record payload crc mismatch");
        }
        let encoded = header.encode();
        debug_assert_eq!(
            be::u32_at(&encoded, 44).ok(),
            Some(header.header_crc32),
            "re-encoded header must match stored bytes"
        );
        self.prev_chain = chain_value(self.prev_chain, &encoded, &payload);
        self.offset = payload_off + payload_len as u64;
        self.valid_up_to = self.offset;
        self.expected_lsn = header.lsn.next();
        Ok(Some(WalRecord {
            lsn: header.lsn,
            page_id: header.page_id,
            kind,
            flags: header.flags,
            payload,
        }))
    }

    fn read_or_stop(&mut self, off: u64, dst: &mut [u8]) -> Result<Option<Option<WalRecord>>> {
        match self.io.read_at(off, dst) {
            Ok(()) => Ok(None),
            Err(StrataError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                Ok(Some(self.stop_torn("unexpected end of log")?))
            }
            Err(err) => Err(err),
        }
    }

    fn stop_torn(&mut self, reason: &'static str) -> Result<Option<WalRecord>> {
        warn!(offset = self.offset, end = self.end, reason, "wal.iter.torn_tail");
        self.torn = true;
        self.done = true;
        Ok(None)
    }

    /// File offset up to which records have been validated.
    pub fn valid_up_to(&self) -> u64 {
        self.valid_up_to
    }

    /// True if bytes past the valid prefix were found and rejected.
    pub fn torn(&self) -> bool {
        self.torn
    }
}

impl Iterator for WalIterator {
    type Item = Result<WalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

pub(crate) fn clone_error(err: &StrataError) -> StrataError {
    match err {
        StrataError::Io(io_err) => {
            StrataError::Io(std::io::Error::new(io_err.kind(), io_err.to_string()))
        }
        StrataError::OutOfSpace { requested } => StrataError::OutOfSpace {
            requested: *requested,
        },
        StrataError::ChecksumMismatch {
            page,
            expected,
            actual,
        } => StrataError::ChecksumMismatch {
            page: *page,
            expected: *expected,
            actual: *actual,
        },
        StrataError::TornWrite(msg) => StrataError::TornWrite(*msg),
        StrataError::InvalidExtent { start, len, reason } => StrataError::InvalidExtent {
            start: *start,
            len: *len,
            reason: *reason,
        },
        StrataError::Corruption(msg) => StrataError::Corruption(*msg),
        StrataError::Invalid(msg) => StrataError::Invalid(*msg),
    }
}

fn compute_crc32(chunks: &[&[u8]]) -> u32 {
    let mut hasher = Crc32Fast::default();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::StdFileIo;
    use tempfile::tempdir;

    const PAGE: usize = 4096;

    fn open_wal(path: &std::path::Path, salt: u64, start: u64) -> Result<(StdFileIo, Wal)> {
        let io = StdFileIo::open(path)?;
        let wal = Wal::open(Arc::new(io.clone()), WalOptions::new(PAGE as u32, salt, Lsn(start)))?;
        Ok((io, wal))
    }

    #[test]
    fn wal_append_and_iterate_roundtrip() -> Result<()> {
        let dir = tempdir().unwrap();
        let (_, wal) = open_wal(&dir.path().join("wal_roundtrip"), 42, 1)?;
        let image = vec![1u8; PAGE];
        let last = wal.append(&[
            WalEntry::allocate(Extent::new(PageId(3), 2)),
            WalEntry::page_image(PageId(3), image.clone()),
            WalEntry::grow(64).committing(),
        ])?;
        assert_eq!(last, Lsn(3));
        wal.sync()?;
        assert_eq!(wal.durable_lsn(), Lsn(3));

        let records: Vec<WalRecord> = wal.iter()?.collect::<Result<_>>()?;
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].kind, WalRecordKind::Allocate);
        assert_eq!(records[0].extent()?, Extent::new(PageId(3), 2));
        assert_eq!(records[1].lsn, Lsn(2));
        assert_eq!(records[1].payload, image);
        assert!(!records[1].is_commit());
        assert_eq!(records[2].grow_total()?, 64);
        assert!(records[2].is_commit());
        Ok(())
    }

    #[test]
    fn wal_detects_payload_corruption() -> Result<()> {
        let dir = tempdir().unwrap();
        let (io, wal) = open_wal(&dir.path().join("wal_corruption"), 777, 5)?;
        wal.append(&[WalEntry::page_image(PageId(7), vec![3u8; PAGE]).committing()])?;
        wal.sync()?;

        let off = (FILE_HEADER_LEN + RECORD_HEADER_LEN + 10) as u64;
        let mut byte = [0u8; 1];
        io.read_at(off, &mut byte)?;
        byte[0] ^= 0xFF;
        io.write_at(off, &byte)?;

        let mut iter = wal.iter()?;
        assert!(iter.next_record()?.is_none());
        assert!(iter.torn());
        assert_eq!(iter.valid_up_to(), FILE_HEADER_LEN as u64);
        Ok(())
    }

    #[test]
    fn truncated_tail_keeps_valid_prefix() -> Result<()> {
        let dir = tempdir().unwrap();
        let (io, wal) = open_wal(&dir.path().join("wal_torn"), 9, 1)?;
        wal.append(&[WalEntry::page_image(PageId(1), vec![5u8; PAGE]).committing()])?;
        wal.append(&[WalEntry::page_image(PageId(2), vec![6u8; PAGE]).committing()])?;
        let full = io.len()?;
        io.truncate(full - 100)?;

        let mut iter = wal.iter()?;
        let first = iter.next_record()?.expect("first record intact");
        assert_eq!(first.page_id, PageId(1));
        assert!(iter.next_record()?.is_none());
        assert!(iter.torn());
        assert_eq!(
            iter.valid_up_to(),
            (FILE_HEADER_LEN + RECORD_HEADER_LEN + PAGE) as u64
        );
        Ok(())
    }

    #[test]
    fn clean_end_is_not_torn() -> Result<()> {
        let dir = tempdir().unwrap();
        let (_, wal) = open_wal(&dir.path().join("wal_clean"), 1, 1)?;
        wal.append(&[WalEntry::commit()])?;
        let mut iter = wal.iter()?;
        assert!(iter.next_record()?.is_some());
        assert!(iter.next_record()?.is_none());
        assert!(!iter.torn());
        Ok(())
    }

    #[test]
    fn reset_restarts_numbering() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal_reset");
        let (_, wal) = open_wal(&path, 3, 1)?;
        wal.append(&[WalEntry::commit(), WalEntry::commit()])?;
        wal.reset(Lsn(10))?;
        assert!(wal.is_empty()?);
        assert_eq!(wal.append(&[WalEntry::commit()])?, Lsn(10));
        drop(wal);
        let (_, reopened) = open_wal(&path, 3, 1)?;
        assert_eq!(reopened.start_lsn(), Lsn(10));
        Ok(())
    }

    #[test]
    fn reopen_rejects_foreign_salt() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal_salt");
        drop(open_wal(&path, 100, 1)?);
        assert!(matches!(open_wal(&path, 101, 1), Err(StrataError::Corruption(_))));
        Ok(())
    }

    #[test]
    fn oversized_payload_is_rejected() -> Result<()> {
        let dir = tempdir().unwrap();
        let (_, wal) = open_wal(&dir.path().join("wal_big"), 1, 1)?;
        let err = wal
            .append(&[WalEntry::page_image(PageId(1), vec![0u8; PAGE + 1])])
            .unwrap_err();
        assert!(matches!(err, StrataError::Invalid(_)));
        Ok(())
    }
}
