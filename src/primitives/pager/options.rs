use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::primitives::alloc::AllocationStrategy;
use crate::primitives::wal::{WalCommitConfig, WalSyncMode};
use crate::types::checksum::ChecksumPath;
use crate::types::page::{validate_page_size, DEFAULT_PAGE_SIZE};
use crate::types::{Result, StrataError};

/// Durability mode for commits.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Synchronous {
    /// Sync the log before every commit is acknowledged.
    #[default]
    Full,
    /// Sync the log at flush and checkpoint time only.
    Normal,
    /// No explicit syncs (fastest but least durable).
    Off,
}

impl Synchronous {
    /// Returns the string representation of the synchronous mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Synchronous::Full => "full",
            Synchronous::Normal => "normal",
            Synchronous::Off => "off",
        }
    }

    /// Parses a synchronous mode from a string (case-insensitive).
    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "full" => Some(Synchronous::Full),
            "normal" => Some(Synchronous::Normal),
            "off" => Some(Synchronous::Off),
            _ => None,
        }
    }

    pub(crate) fn wal_sync_mode(self) -> WalSyncMode {
        match self {
            Synchronous::Full => WalSyncMode::Immediate,
            Synchronous::Normal => WalSyncMode::Deferred,
            Synchronous::Off => WalSyncMode::Off,
        }
    }
}

/// Physical layout policy fixed when the file is created.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// General paged storage using the configured strategy.
    #[default]
    Paged = 0,
    /// Append-heavy workloads; allocations come from the largest extent.
    AppendOnly = 1,
    /// Segment-oriented workloads; allocations pack into the tightest fit.
    Columnar = 2,
}

impl StorageMode {
    /// Strategy used by the page manager for this mode.
    pub fn strategy(self, configured: AllocationStrategy) -> AllocationStrategy {
        match self {
            StorageMode::Paged => configured,
            StorageMode::AppendOnly => AllocationStrategy::WorstFit,
            StorageMode::Columnar => AllocationStrategy::BestFit,
        }
    }

    /// Name used in reports.
    pub fn as_str(self) -> &'static str {
        match self {
            StorageMode::Paged => "paged",
            StorageMode::AppendOnly => "append_only",
            StorageMode::Columnar => "columnar",
        }
    }

    pub(crate) fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(StorageMode::Paged),
            1 => Ok(StorageMode::AppendOnly),
            2 => Ok(StorageMode::Columnar),
            _ => Err(StrataError::Corruption("unknown storage mode")),
        }
    }

    /// Parses a mode name (case-insensitive, `-` or `_`).
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().replace('-', "_").as_str() {
            "paged" => Some(StorageMode::Paged),
            "append_only" | "appendonly" => Some(StorageMode::AppendOnly),
            "columnar" => Some(StorageMode::Columnar),
            _ => None,
        }
    }
}

/// Settings read once when a database is opened.
///
/// `page_size` and `storage_mode` only matter at creation; an existing file
/// keeps the values stored in its header.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    /// Page size for new files (power of two, 1 KiB to 64 KiB).
    pub page_size: u32,
    /// Pages kept in the cache.
    pub cache_pages: usize,
    /// Strategy for `StorageMode::Paged` files.
    pub default_strategy: AllocationStrategy,
    /// Layout policy for new files.
    pub storage_mode: StorageMode,
    /// Log size in bytes that triggers an automatic checkpoint.
    pub wal_segment_size: u64,
    /// Pages added when the allocator runs out of space.
    pub growth_pages: u64,
    /// Durability mode for commits.
    pub synchronous: Synchronous,
    /// Maximum commits grouped into one log write.
    pub group_commit_max_commits: usize,
    /// Maximum records grouped into one log write.
    pub group_commit_max_records: usize,
    /// Maximum wait in microseconds for more commits to join a group.
    pub group_commit_max_wait_us: u64,
    /// CRC implementation for page checksums.
    pub checksum_path: ChecksumPath,
    /// Verify page checksums on every cache miss.
    pub verify_on_read: bool,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_pages: 1024,
            default_strategy: AllocationStrategy::FirstFit,
            storage_mode: StorageMode::Paged,
            wal_segment_size: 64 * 1024 * 1024,
            growth_pages: 256,
            synchronous: Synchronous::Full,
            group_commit_max_commits: 32,
            group_commit_max_records: 512,
            group_commit_max_wait_us: 2000,
            checksum_path: ChecksumPath::Auto,
            verify_on_read: true,
        }
    }
}

impl StorageOptions {
    /// Parses options from TOML; absent keys keep their defaults.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let opts: StorageOptions =
            toml::from_str(src).map_err(|_| StrataError::Invalid("malformed storage options"))?;
        opts.validate()?;
        Ok(opts)
    }

    /// Reads and parses a TOML options file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        validate_page_size(self.page_size)?;
        if self.cache_pages == 0 {
            return Err(StrataError::Invalid("cache_pages must be at least 1"));
        }
        if self.growth_pages == 0 {
            return Err(StrataError::Invalid("growth_pages must be at least 1"));
        }
        Ok(())
    }

    pub(crate) fn commit_config(&self) -> WalCommitConfig {
        WalCommitConfig {
            max_batch_commits: self.group_commit_max_commits,
            max_batch_records: self.group_commit_max_records,
            max_batch_wait: Duration::from_micros(self.group_commit_max_wait_us),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_overrides_only_given_keys() {
        let opts = StorageOptions::from_toml_str(
            r#"
            page_size = 4096
            default_strategy = "best_fit"
            synchronous = "normal"
            checksum_path = "portable"
            "#,
        )
        .unwrap();
        assert_eq!(opts.page_size, 4096);
        assert_eq!(opts.default_strategy, AllocationStrategy::BestFit);
        assert_eq!(opts.synchronous, Synchronous::Normal);
        assert_eq!(opts.checksum_path, ChecksumPath::Portable);
        assert_eq!(opts.cache_pages, StorageOptions::default().cache_pages);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(StorageOptions::from_toml_str("page_size = 3000").is_err());
        assert!(StorageOptions::from_toml_str("cache_pages = 0").is_err());
        assert!(StorageOptions::from_toml_str("default_strategy = \"random\"").is_err());
    }

    #[test]
    fn synchronous_parses_case_insensitively() {
        assert_eq!(Synchronous::from_str("FULL"), Some(Synchronous::Full));
        assert_eq!(Synchronous::from_str("Normal"), Some(Synchronous::Normal));
        assert_eq!(Synchronous::from_str("maybe"), None);
    }

    #[test]
    fn storage_mode_picks_strategy() {
        let configured = AllocationStrategy::FirstFit;
        assert_eq!(StorageMode::Paged.strategy(configured), configured);
        assert_eq!(
            StorageMode::AppendOnly.strategy(configured),
            AllocationStrategy::WorstFit
        );
        assert_eq!(
            StorageMode::Columnar.strategy(configured),
            AllocationStrategy::BestFit
        );
        assert_eq!(StorageMode::parse("append-only"), Some(StorageMode::AppendOnly));
    }
}
