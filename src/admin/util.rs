use std::fs;
use std::path::Path;

use crate::primitives::pager::PageManager;

use crate::admin::error::{AdminError, Result};
use crate::admin::options::AdminOpenOptions;

/// Opens (or, with `create_if_missing`, creates) the database at `path`.
///
/// # Errors
///
/// Returns an error if the database doesn't exist and `create_if_missing` is false,
/// or if opening it fails, including when log replay finds a gap.
pub fn open_manager(path: &Path, opts: &AdminOpenOptions) -> Result<PageManager> {
    if !path.exists() {
        if !opts.create_if_missing {
            return Err(AdminError::missing_database(path));
        }
        ensure_parent_dir(path)?;
        return Ok(PageManager::create(path, opts.storage.clone())?);
    }
    Ok(PageManager::open(path, opts.storage.clone())?)
}

pub(crate) fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
