//! WAL line codec
//!
//! One record per line:
//!
//! ```text
//! log_id|version|operation|payload\n
//! ```
//!
//! The payload is compact JSON and comes last, so it may itself contain `|`.
//! Compact JSON never contains a raw newline.

use std::fmt;

use vdb_core::OperationType;

use crate::error::RecordParseError;

/// One decoded WAL line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    /// Strictly increasing within a file
    pub log_id: u64,
    /// Command format version tag
    pub version: String,
    /// Operation the payload encodes
    pub op: OperationType,
    /// Raw encoded command
    pub payload: String,
}

impl WalRecord {
    /// Build a record
    pub fn new(
        log_id: u64,
        version: impl Into<String>,
        op: OperationType,
        payload: impl Into<String>,
    ) -> Self {
        WalRecord {
            log_id,
            version: version.into(),
            op,
            payload: payload.into(),
        }
    }

    /// Encode as a single line, including the trailing newline
    pub fn to_line(&self) -> String {
        format!("{}\n", self)
    }

    /// Decode one line (trailing `\n` or `\r\n` is ignored)
    pub fn parse_line(line: &str) -> Result<Self, RecordParseError> {
        let line = line.trim_end_matches(['\n', '\r']);
        let mut fields = line.splitn(4, '|');

        let log_id_str = fields.next().ok_or(RecordParseError::MissingField("log_id"))?;
        let version = fields.next().ok_or(RecordParseError::MissingField("version"))?;
        let op_str = fields.next().ok_or(RecordParseError::MissingField("operation"))?;
        let payload = fields.next().ok_or(RecordParseError::MissingField("payload"))?;

        let log_id = log_id_str
            .parse::<u64>()
            .map_err(|_| RecordParseError::InvalidLogId(log_id_str.to_string()))?;
        if version.is_empty() {
            return Err(RecordParseError::EmptyField("version"));
        }
        let op = op_str
            .parse::<OperationType>()
            .map_err(|_| RecordParseError::UnknownOperation(op_str.to_string()))?;
        if payload.is_empty() {
            return Err(RecordParseError::EmptyField("payload"));
        }

        Ok(WalRecord {
            log_id,
            version: version.to_string(),
            op,
            payload: payload.to_string(),
        })
    }
}

impl fmt::Display for WalRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.log_id,
            self.version,
            self.op.as_str(),
            self.payload
        )
    }
}
