//! Consensus errors

use std::io;
use thiserror::Error;

use vdb_core::{NodeId, ReplicationFailure, VdbError};

/// Failures of persistent Raft state
#[derive(Debug, Error)]
pub enum RaftStorageError {
    /// Underlying file operation failed
    #[error("raft storage I/O error: {0}")]
    Io(#[from] io::Error),

    /// Persisted state could not be decoded
    #[error("raft storage corrupt: {0}")]
    Corrupt(String),
}

/// Failures of the network layer
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket operation failed
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),

    /// Outbound frame could not be encoded
    #[error("frame encode failed: {0}")]
    Encode(String),

    /// Inbound frame could not be decoded
    #[error("frame decode failed: {0}")]
    Decode(String),

    /// Declared frame length exceeds the limit
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
}

/// Errors returned by [`crate::ReplicatedLog`] operations
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// Only the leader accepts proposals and membership changes
    #[error("not leader (leader: {leader:?})")]
    NotLeader {
        /// Leader this node last heard from
        leader: Option<NodeId>,
    },

    /// No commit within the proposal timeout; the entry may still commit later
    #[error("proposal at index {index} not committed within {timeout_ms}ms")]
    Timeout {
        /// Log index the proposal was appended at
        index: u64,
        /// Configured timeout
        timeout_ms: u64,
    },

    /// A different entry was committed at the proposal's index
    #[error("proposal at index {index} was superseded by a new leader")]
    Superseded {
        /// Log index the proposal was appended at
        index: u64,
    },

    /// Another membership change is still uncommitted
    #[error("a membership change is already in progress")]
    MembershipChangeInProgress,

    /// The node is already part of the configuration
    #[error("node {0} is already a member")]
    AlreadyMember(NodeId),

    /// The replicated log is shutting down
    #[error("replicated log is shut down")]
    Shutdown,

    /// Persistent state could not be written
    #[error(transparent)]
    Storage(#[from] RaftStorageError),

    /// Network setup failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Invalid Raft configuration
    #[error("invalid raft configuration: {0}")]
    Config(String),

    /// The state machine rejected or failed the entry
    #[error("state machine error: {0}")]
    StateMachine(#[source] VdbError),
}

/// Result alias for consensus operations
pub type Result<T> = std::result::Result<T, ConsensusError>;

impl From<ConsensusError> for VdbError {
    fn from(e: ConsensusError) -> Self {
        match e {
            ConsensusError::NotLeader { leader } => VdbError::NotLeader { leader },
            ConsensusError::Timeout { .. } => {
                VdbError::replication(ReplicationFailure::Timeout, e.to_string())
            }
            ConsensusError::Superseded { .. } => {
                VdbError::replication(ReplicationFailure::Superseded, e.to_string())
            }
            ConsensusError::MembershipChangeInProgress => {
                VdbError::replication(ReplicationFailure::MembershipChange, e.to_string())
            }
            ConsensusError::AlreadyMember(_) => VdbError::Validation(e.to_string()),
            ConsensusError::Shutdown => {
                VdbError::replication(ReplicationFailure::Shutdown, e.to_string())
            }
            ConsensusError::Storage(RaftStorageError::Io(io))
            | ConsensusError::Transport(TransportError::Io(io)) => VdbError::Io(io),
            ConsensusError::Storage(other) => VdbError::Serialization(other.to_string()),
            ConsensusError::Transport(other) => VdbError::Serialization(other.to_string()),
            ConsensusError::Config(msg) => VdbError::Config(msg),
            ConsensusError::StateMachine(inner) => inner,
        }
    }
}
