//! Core types for the replicated vector-index engine
//!
//! This crate defines the vocabulary shared by every other crate:
//! - VectorRecord: caller-supplied id, embedding and opaque payload
//! - Command: the replicated, WAL-logged unit of mutation
//! - SearchResult: fixed-size k-slot results with the `-1` sentinel
//! - ClusterMember: read-only membership view
//! - VdbError: the error taxonomy surfaced to callers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod command;
pub mod error;
pub mod member;
pub mod types;

pub use command::{Command, CommandEnvelope, OperationType, COMMAND_VERSION};
pub use error::{BackendError, ErrorKind, ReplicationFailure, Result, StorageError, VdbError};
pub use member::{ClusterMember, MemberRole};
pub use types::{
    IndexKind, MetricType, NodeId, SearchHit, SearchResult, VectorRecord, MAX_RECORD_ID,
    SENTINEL_ID,
};
