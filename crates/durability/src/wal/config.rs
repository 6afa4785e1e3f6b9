//! WAL configuration.

use std::path::{Path, PathBuf};

use super::DurabilityMode;
use crate::error::WalError;

/// Default WAL file name inside the WAL directory
pub const DEFAULT_WAL_FILE: &str = "wal.log";

/// WAL configuration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalConfig {
    /// Directory holding the WAL file (created on open).
    pub dir: PathBuf,

    /// File name of the single WAL file.
    pub file_name: String,

    /// When appends reach the disk.
    pub durability: DurabilityMode,
}

impl WalConfig {
    /// Default configuration rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        WalConfig {
            dir: dir.into(),
            file_name: DEFAULT_WAL_FILE.to_string(),
            durability: DurabilityMode::default(),
        }
    }

    /// Set the file name (builder pattern).
    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = name.into();
        self
    }

    /// Set the durability mode (builder pattern).
    pub fn with_durability(mut self, durability: DurabilityMode) -> Self {
        self.durability = durability;
        self
    }

    /// Full path of the WAL file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), WalError> {
        if self.file_name.is_empty() {
            return Err(WalError::Config("WAL file name is empty".into()));
        }
        if Path::new(&self.file_name).components().count() != 1 {
            return Err(WalError::Config(format!(
                "WAL file name '{}' must not contain a path",
                self.file_name
            )));
        }
        Ok(())
    }

    /// Configuration for tests: fsync off, same layout.
    pub fn for_testing(dir: impl Into<PathBuf>) -> Self {
        WalConfig::new(dir).with_durability(DurabilityMode::Flush)
    }
}
