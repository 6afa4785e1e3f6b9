//! Raft replication for the vector-index engine
//!
//! - [`RaftNode`]: pure election, replication and commit logic
//! - [`RaftStorage`]: durable term, vote and log ([`FileStorage`], [`InMemoryStorage`])
//! - [`Transport`]: message delivery ([`TcpTransport`], [`LocalNetwork`])
//! - [`StateMachine`]: the seam to whatever the log replicates
//! - [`ReplicatedLog`]: the threaded driver tying them together
//!
//! Membership changes are single-step: a configuration entry carries the
//! full member list, takes effect as soon as it is appended, and only one
//! may be uncommitted at a time.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod replicated_log;
pub mod state_machine;
pub mod storage;
pub mod tcp;
pub mod transport;

pub use config::{RaftConfig, MAX_SNAPSHOT_CHUNK_BYTES};
pub use error::{ConsensusError, RaftStorageError, Result, TransportError};
pub use log::{EntryPayload, LogEntry, RaftLog, RaftMember};
pub use message::{Envelope, RaftMessage};
pub use node::{HardState, NodeState, PersistedState, RaftNode, SnapshotMeta};
pub use replicated_log::ReplicatedLog;
pub use state_machine::StateMachine;
pub use storage::{FileStorage, InMemoryStorage, RaftStorage};
pub use tcp::TcpTransport;
pub use transport::{Inbound, Inbox, LocalNetwork, LocalTransport, Transport};
