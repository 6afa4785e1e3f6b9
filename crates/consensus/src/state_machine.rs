//! The seam between the replicated log and whatever it replicates

use crate::log::RaftMember;

/// A deterministic state machine driven by committed log entries
///
/// Every method is called from the replication driver thread, one at a
/// time, in log order. `commit` may be called again for an index that was
/// already applied (after a restart replays the log), so implementations
/// must be idempotent per index.
pub trait StateMachine: Send + Sync {
    /// Apply a committed command; the returned value is handed back to the
    /// proposer
    fn commit(&self, index: u64, command: &[u8]) -> vdb_core::Result<u64>;

    /// Validate a command on the leader before it is appended
    fn pre_commit(&self, _index: u64, _command: &[u8]) -> vdb_core::Result<()> {
        Ok(())
    }

    /// An uncommitted entry was removed from the log by a new leader
    fn rollback(&self, _index: u64, _command: &[u8]) {}

    /// A configuration entry was committed
    fn commit_config(&self, _index: u64, _members: &[RaftMember]) {}

    /// Highest index reflected in the state machine's own durable state
    fn last_applied_index(&self) -> u64;

    /// Serialize the full state for a lagging follower
    fn snapshot_blob(&self) -> vdb_core::Result<Vec<u8>>;

    /// Replace local state with a leader's snapshot taken at `index`
    fn restore_blob(&self, index: u64, blob: &[u8]) -> vdb_core::Result<()>;
}
