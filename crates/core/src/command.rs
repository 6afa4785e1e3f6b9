//! Replicated commands and their versioned JSON encoding
//!
//! A [`Command`] is the unit that travels through consensus and is written to
//! every node's WAL. The encoded form is a JSON document wrapped in a
//! [`CommandEnvelope`] carrying a version tag so the format can evolve:
//!
//! ```text
//! {"version":"1.0","command":{"operation":"insert","record":{"id":42,"embedding":[1.0,0.0],"payload":null}}}
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, VdbError};
use crate::types::{VectorRecord, MAX_RECORD_ID};

/// Current command format version
pub const COMMAND_VERSION: &str = "1.0";

/// Operation tag written into the WAL's `operation_type` column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Single record insert
    Insert,
    /// Multi-record insert
    InsertBatch,
}

impl OperationType {
    /// Wire name of the operation
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::InsertBatch => "insert_batch",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = VdbError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(OperationType::Insert),
            "insert_batch" => Ok(OperationType::InsertBatch),
            other => Err(VdbError::Validation(format!(
                "unknown operation type '{}'",
                other
            ))),
        }
    }
}

/// A replicated mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Command {
    /// Insert one record
    Insert {
        /// Record to insert
        record: VectorRecord,
    },
    /// Insert several records in one replicated entry
    InsertBatch {
        /// Records to insert, applied in order
        records: Vec<VectorRecord>,
    },
}

impl Command {
    /// The WAL operation tag for this command
    pub fn operation_type(&self) -> OperationType {
        match self {
            Command::Insert { .. } => OperationType::Insert,
            Command::InsertBatch { .. } => OperationType::InsertBatch,
        }
    }

    /// Records carried by this command, in apply order
    pub fn records(&self) -> &[VectorRecord] {
        match self {
            Command::Insert { record } => std::slice::from_ref(record),
            Command::InsertBatch { records } => records,
        }
    }

    /// Structural validation, performed before a command reaches the WAL
    /// or consensus
    ///
    /// Checks for empty batches, ids above [`MAX_RECORD_ID`], empty or
    /// non-finite embeddings and mixed dimensions inside a batch. Dimension against the active index is
    /// checked by the engine, which knows it.
    pub fn validate(&self) -> Result<()> {
        let records = self.records();
        if records.is_empty() {
            return Err(VdbError::Validation("batch contains no records".into()));
        }
        let dim = records[0].embedding.len();
        for record in records {
            if record.id > MAX_RECORD_ID {
                return Err(VdbError::Validation(format!(
                    "record id {} exceeds the maximum {}",
                    record.id, MAX_RECORD_ID
                )));
            }
            if record.embedding.is_empty() {
                return Err(VdbError::Validation(format!(
                    "record {} has an empty embedding",
                    record.id
                )));
            }
            if record.embedding.len() != dim {
                return Err(VdbError::Validation(format!(
                    "record {} has dimension {}, batch dimension is {}",
                    record.id,
                    record.embedding.len(),
                    dim
                )));
            }
            if record.embedding.iter().any(|v| !v.is_finite()) {
                return Err(VdbError::Validation(format!(
                    "record {} contains a non-finite value",
                    record.id
                )));
            }
        }
        Ok(())
    }

    /// Split into the column form used by backend batch paths
    pub fn to_columns(&self) -> (Vec<u64>, Vec<Vec<f32>>) {
        self.records()
            .iter()
            .map(|r| (r.id, r.embedding.clone()))
            .unzip()
    }
}

/// Versioned wrapper around a [`Command`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Format version tag
    pub version: String,
    /// The wrapped command
    pub command: Command,
}

impl CommandEnvelope {
    /// Wrap a command with the current version tag
    pub fn new(command: Command) -> Self {
        CommandEnvelope {
            version: COMMAND_VERSION.to_string(),
            command,
        }
    }

    /// Encode as compact JSON (no embedded newlines)
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| VdbError::Serialization(e.to_string()))
    }

    /// Encode as bytes for proposal through consensus
    pub fn encode_bytes(&self) -> Result<Vec<u8>> {
        self.encode().map(String::into_bytes)
    }

    /// Decode from JSON text, rejecting unknown major versions
    pub fn decode(raw: &str) -> Result<Self> {
        let envelope: CommandEnvelope = serde_json::from_str(raw)
            .map_err(|e| VdbError::Validation(format!("malformed command: {}", e)))?;
        envelope.check_version()?;
        Ok(envelope)
    }

    /// Decode from bytes delivered by consensus
    pub fn decode_bytes(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| VdbError::Validation(format!("command is not UTF-8: {}", e)))?;
        Self::decode(text)
    }

    fn check_version(&self) -> Result<()> {
        let major = self.version.split('.').next().unwrap_or_default();
        let current = COMMAND_VERSION.split('.').next().unwrap_or_default();
        if major != current {
            return Err(VdbError::Validation(format!(
                "unsupported command version '{}'",
                self.version
            )));
        }
        Ok(())
    }
}
