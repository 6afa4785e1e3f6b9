//! Durability errors

use std::io;
use thiserror::Error;

/// Why a single WAL line could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordParseError {
    /// Fewer than four `|`-separated fields
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    /// The first field is not an unsigned integer
    #[error("invalid log id '{0}'")]
    InvalidLogId(String),

    /// The operation tag is not a known operation type
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    /// A field that must not be empty was empty
    #[error("empty field '{0}'")]
    EmptyField(&'static str),

    /// The line is not valid UTF-8
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
}

/// WAL errors
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying file operation failed
    #[error("WAL I/O error: {0}")]
    Io(#[from] io::Error),

    /// A line in the WAL file is malformed
    #[error("malformed WAL line at byte {offset}: {source}")]
    Malformed {
        /// Byte offset of the start of the line
        offset: u64,
        /// Decode failure
        #[source]
        source: RecordParseError,
    },

    /// An append would break strict log id ordering
    #[error("log id {got} does not follow last written id {last}")]
    NonMonotonic {
        /// Highest id already in the file
        last: u64,
        /// Rejected id
        got: u64,
    },

    /// Configuration rejected by [`crate::WalConfig::validate`]
    #[error("invalid WAL configuration: {0}")]
    Config(String),
}

impl From<WalError> for vdb_core::VdbError {
    fn from(e: WalError) -> Self {
        match e {
            WalError::Io(io) => vdb_core::VdbError::WalIo(io),
            WalError::Config(msg) => vdb_core::VdbError::Config(msg),
            other => vdb_core::VdbError::WalIo(io::Error::new(
                io::ErrorKind::InvalidData,
                other.to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdb_core::{ErrorKind, VdbError};

    #[test]
    fn test_io_maps_to_wal_io() {
        let err: VdbError = WalError::Io(io::Error::new(io::ErrorKind::Other, "disk")).into();
        assert_eq!(err.kind(), ErrorKind::WalIo);
    }

    #[test]
    fn test_malformed_display_includes_offset() {
        let err = WalError::Malformed {
            offset: 12,
            source: RecordParseError::MissingField("payload"),
        };
        let msg = err.to_string();
        assert!(msg.contains("12"));
        assert!(msg.contains("payload"));
    }

    #[test]
    fn test_config_maps_to_config() {
        let err: VdbError = WalError::Config("bad".into()).into();
        assert!(matches!(err, VdbError::Config(_)));
    }
}
