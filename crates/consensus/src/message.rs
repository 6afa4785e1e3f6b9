//! Raft RPC messages
//!
//! Every message travels inside an [`Envelope`] that names sender and
//! receiver. The sender's endpoint rides along so a node that has not yet
//! learned the leader's address (a joining member) can still answer it.

use serde::{Deserialize, Serialize};

use vdb_core::NodeId;

use crate::log::{LogEntry, RaftMember};

/// All possible Raft messages between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    /// Request a vote during leader election
    VoteRequest {
        /// Candidate's term
        term: u64,
        /// Candidate requesting the vote
        candidate_id: NodeId,
        /// Index of the candidate's last log entry
        last_log_index: u64,
        /// Term of the candidate's last log entry
        last_log_term: u64,
    },
    /// Response to a vote request
    VoteResponse {
        /// Voter's current term
        term: u64,
        /// True if the vote was granted
        vote_granted: bool,
    },
    /// Replicate log entries (heartbeat when `entries` is empty)
    AppendEntries {
        /// Leader's term
        term: u64,
        /// Leader id, so followers can redirect clients
        leader_id: NodeId,
        /// Index of the entry preceding the new ones
        prev_log_index: u64,
        /// Term of the entry at `prev_log_index`
        prev_log_term: u64,
        /// Entries to store
        entries: Vec<LogEntry>,
        /// Leader's commit index
        leader_commit: u64,
    },
    /// Response to AppendEntries
    AppendEntriesResponse {
        /// Follower's current term
        term: u64,
        /// True if the follower's log matched `prev_log_index`
        success: bool,
        /// On success the follower's last matching index; on failure a hint
        /// for where the leader should retry from
        match_index: u64,
    },
    /// Replace a lagging follower's state with the leader's snapshot
    InstallSnapshot {
        /// Leader's term
        term: u64,
        /// Leader id
        leader_id: NodeId,
        /// Last log index covered by `data`
        last_included_index: u64,
        /// Term of `last_included_index`
        last_included_term: u64,
        /// Membership as of `last_included_index`
        members: Vec<RaftMember>,
        /// Position of `data` within the state machine blob
        offset: u64,
        /// Slice of the opaque state machine blob
        data: Vec<u8>,
        /// True on the blob's last slice
        done: bool,
    },
    /// Response to InstallSnapshot
    InstallSnapshotResponse {
        /// Follower's current term
        term: u64,
        /// Index the follower now holds
        match_index: u64,
        /// Blob bytes held while a transfer is unfinished; None once the
        /// snapshot is installed or was not needed
        next_offset: Option<u64>,
    },
}

impl RaftMessage {
    /// Term carried by the message
    pub fn term(&self) -> u64 {
        match self {
            RaftMessage::VoteRequest { term, .. }
            | RaftMessage::VoteResponse { term, .. }
            | RaftMessage::AppendEntries { term, .. }
            | RaftMessage::AppendEntriesResponse { term, .. }
            | RaftMessage::InstallSnapshot { term, .. }
            | RaftMessage::InstallSnapshotResponse { term, .. } => *term,
        }
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            RaftMessage::VoteRequest { .. } => "vote_request",
            RaftMessage::VoteResponse { .. } => "vote_response",
            RaftMessage::AppendEntries { .. } => "append_entries",
            RaftMessage::AppendEntriesResponse { .. } => "append_entries_response",
            RaftMessage::InstallSnapshot { .. } => "install_snapshot",
            RaftMessage::InstallSnapshotResponse { .. } => "install_snapshot_response",
        }
    }
}

/// Addressed message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender id
    pub from: NodeId,
    /// Sender's listening endpoint
    pub from_endpoint: String,
    /// Receiver id
    pub to: NodeId,
    /// Payload
    pub msg: RaftMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_accessor() {
        let msg = RaftMessage::AppendEntriesResponse {
            term: 7,
            success: true,
            match_index: 3,
        };
        assert_eq!(msg.term(), 7);
        assert_eq!(msg.kind(), "append_entries_response");
    }

    #[test]
    fn test_envelope_msgpack_roundtrip() {
        let env = Envelope {
            from: 1,
            from_endpoint: "127.0.0.1:9000".into(),
            to: 2,
            msg: RaftMessage::AppendEntries {
                term: 2,
                leader_id: 1,
                prev_log_index: 4,
                prev_log_term: 1,
                entries: vec![LogEntry::new(2, 5, b"cmd".to_vec())],
                leader_commit: 4,
            },
        };
        let bytes = rmp_serde::to_vec(&env).unwrap();
        let back: Envelope = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, env);
    }
}
