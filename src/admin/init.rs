use std::path::Path;

use serde::Serialize;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::ensure_parent_dir;
use crate::admin::{AdminError, Result};
use crate::primitives::pager::{wal_path, PageManager};

/// Result of creating a database.
#[derive(Debug, Clone, Serialize)]
pub struct InitReport {
    /// Database file created.
    pub db_path: String,
    /// Log file created next to it.
    pub wal_path: String,
    /// Page size stored in the header.
    pub page_size: u32,
    /// Layout policy stored in the header.
    pub storage_mode: String,
    /// Allocation strategy the file will use.
    pub strategy: String,
}

/// Creates a new, empty database. Refuses to touch an existing file.
pub fn init(path: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<InitReport> {
    let path = path.as_ref();
    if path.exists() {
        return Err(AdminError::already_exists(path));
    }
    ensure_parent_dir(path)?;
    let manager = PageManager::create(path, opts.storage.clone())?;
    let meta = manager.meta();
    let report = InitReport {
        db_path: path.display().to_string(),
        wal_path: wal_path(path).display().to_string(),
        page_size: meta.page_size,
        storage_mode: meta.storage_mode.as_str().to_string(),
        strategy: manager.strategy().as_str().to_string(),
    };
    manager.close()?;
    Ok(report)
}
