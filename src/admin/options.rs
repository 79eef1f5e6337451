use std::path::Path;

use crate::admin::Result;
use crate::primitives::pager::StorageOptions;

/// Common options used when opening a database for administrative commands.
#[derive(Clone, Debug, Default)]
pub struct AdminOpenOptions {
    /// Storage configuration.
    pub storage: StorageOptions,
    /// Whether to create the database if it doesn't exist.
    pub create_if_missing: bool,
}

impl AdminOpenOptions {
    /// Starts from a TOML options file instead of the defaults.
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            storage: StorageOptions::from_toml_file(path)?,
            create_if_missing: false,
        })
    }
}
