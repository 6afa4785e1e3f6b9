//! Error types for the vector-index engine
//!
//! This module defines the error taxonomy surfaced to callers of the node.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! | Kind | Retry | Raised by |
//! |------|-------|-----------|
//! | Validation | never | command checks before WAL/consensus |
//! | NotLeader | against the leader | write on a follower |
//! | Replication | idempotently, outcome unknown | consensus timeout, membership change |
//! | Backend | never | dimension mismatch, unsupported op, untrained index |
//! | Storage | caller decides | object store |
//! | WalIo | n/a | WAL append or read |

use std::io;
use thiserror::Error;

use crate::types::{IndexKind, NodeId};

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, VdbError>;

/// Coarse classification of a [`VdbError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or incomplete request
    Validation,
    /// Write attempted on a non-leader
    NotLeader,
    /// Consensus failure with unknown outcome
    Replication,
    /// Index backend refused the operation
    Backend,
    /// Object store failure
    Storage,
    /// WAL read or write failure
    WalIo,
    /// Snapshot, serialization, configuration or other local I/O failure
    Internal,
}

/// Why a replicated write did not produce a definite outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicationFailure {
    /// The bounded wait for commit expired; the entry may still commit
    Timeout,
    /// Leadership changed and the entry was replaced by another leader's log
    Superseded,
    /// A membership change could not be proposed or committed
    MembershipChange,
    /// The consensus driver is shutting down
    Shutdown,
}

impl std::fmt::Display for ReplicationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReplicationFailure::Timeout => "timeout",
            ReplicationFailure::Superseded => "superseded",
            ReplicationFailure::MembershipChange => "membership change",
            ReplicationFailure::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Errors raised by index backends
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    /// Vector dimension does not match the index dimension
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Dimension the index was built with
        expected: usize,
        /// Dimension that was provided
        got: usize,
    },

    /// The backend has no implementation of this operation
    #[error("Unsupported operation '{operation}' for {backend} index")]
    Unsupported {
        /// Backend that refused
        backend: IndexKind,
        /// Operation name
        operation: &'static str,
    },

    /// Training must complete before vectors can be added
    #[error("{backend} index is not trained")]
    NotTrained {
        /// Backend that requires training
        backend: IndexKind,
    },

    /// Empty embedding
    #[error("Empty embedding")]
    EmptyEmbedding,

    /// Invalid construction or query parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Serialized index state failed validation
    #[error("Corrupt index data: {0}")]
    Corrupt(String),
}

/// Errors raised by the object store bridge
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// No document stored under this id
    #[error("Document not found: {0}")]
    NotFound(u64),

    /// Store-specific failure
    #[error("Object store failure: {0}")]
    Backend(String),
}

/// Error type surfaced by every public engine operation
#[derive(Debug, Error)]
pub enum VdbError {
    /// Malformed or incomplete command, rejected before WAL/consensus
    #[error("Validation error: {0}")]
    Validation(String),

    /// Batch columns have different lengths
    #[error("Data format error: {vectors} vectors cannot match {ids} ids")]
    DataFormat {
        /// Number of vectors supplied
        vectors: usize,
        /// Number of ids supplied
        ids: usize,
    },

    /// This node is not the leader
    #[error("Not leader (current leader: {leader:?})")]
    NotLeader {
        /// Leader this node last heard from, if any
        leader: Option<NodeId>,
    },

    /// Consensus could not confirm the outcome
    #[error("Replication error ({failure}): {message}")]
    Replication {
        /// Failure class
        failure: ReplicationFailure,
        /// Human-readable detail
        message: String,
    },

    /// Index backend error
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Object store error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// WAL append or read failure
    #[error("WAL I/O error: {0}")]
    WalIo(#[source] io::Error),

    /// Snapshot could not be written or read
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// I/O error outside the WAL
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl VdbError {
    /// Convenience constructor for replication failures
    pub fn replication(failure: ReplicationFailure, message: impl Into<String>) -> Self {
        VdbError::Replication {
            failure,
            message: message.into(),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            VdbError::Validation(_) | VdbError::DataFormat { .. } => ErrorKind::Validation,
            VdbError::NotLeader { .. } => ErrorKind::NotLeader,
            VdbError::Replication { .. } => ErrorKind::Replication,
            VdbError::Backend(_) => ErrorKind::Backend,
            VdbError::Storage(_) => ErrorKind::Storage,
            VdbError::WalIo(_) => ErrorKind::WalIo,
            VdbError::Snapshot(_)
            | VdbError::Io(_)
            | VdbError::Serialization(_)
            | VdbError::Config(_) => ErrorKind::Internal,
        }
    }

    /// True for errors the caller should retry (against the leader, or
    /// idempotently keyed on the record id)
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotLeader | ErrorKind::Replication)
    }
}

impl From<bincode::Error> for VdbError {
    fn from(e: bincode::Error) -> Self {
        VdbError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for VdbError {
    fn from(e: serde_json::Error) -> Self {
        VdbError::Serialization(e.to_string())
    }
}
