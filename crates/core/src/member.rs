//! Read-only cluster membership view

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::NodeId;

/// Role of a member as seen from the reporting node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    /// Current leader
    Leader,
    /// Any non-leader member
    Follower,
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberRole::Leader => f.write_str("leader"),
            MemberRole::Follower => f.write_str("follower"),
        }
    }
}

/// One row of the membership listing
///
/// Built on demand from the consensus layer's membership table and never
/// persisted. Replication progress (`last_log_idx`, `last_success_response_us`)
/// is only known on the leader; other nodes report their own log index and
/// zero for peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    /// Member id
    pub node_id: NodeId,
    /// Network endpoint (`host:port`)
    pub endpoint: String,
    /// Leader or follower
    pub role: MemberRole,
    /// Highest log index known to be stored on the member
    pub last_log_idx: u64,
    /// Microseconds since the member last answered successfully (0 if unknown)
    pub last_success_response_us: u64,
}

impl ClusterMember {
    /// True if this member is the leader
    pub fn is_leader(&self) -> bool {
        self.role == MemberRole::Leader
    }
}
