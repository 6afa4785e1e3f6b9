//! Raft timing and log retention parameters

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConsensusError;
use crate::tcp::MAX_FRAME_BYTES;

/// Largest snapshot chunk that always fits a frame; MessagePack spends up to
/// two bytes per blob byte, and the envelope needs room too
pub const MAX_SNAPSHOT_CHUNK_BYTES: usize = (MAX_FRAME_BYTES - 64 * 1024) / 2;

/// Raft configuration
///
/// | Field | Default |
/// |-------|---------|
/// | heartbeat_interval_ms | 100 |
/// | election_timeout_min_ms | 200 |
/// | election_timeout_max_ms | 400 |
/// | propose_timeout_ms | 3000 |
/// | max_entries_per_append | 256 |
/// | snapshot_distance | 0 (never compact) |
/// | reserved_log_entries | 5 |
/// | snapshot_chunk_bytes | 4 MiB |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Leader heartbeat period
    pub heartbeat_interval_ms: u64,
    /// Lower bound of the randomized election timeout
    pub election_timeout_min_ms: u64,
    /// Upper bound of the randomized election timeout
    pub election_timeout_max_ms: u64,
    /// How long `propose` waits for commit and local apply
    pub propose_timeout_ms: u64,
    /// Cap on entries per AppendEntries message
    pub max_entries_per_append: usize,
    /// Compact after this many applied entries past the last compaction
    /// point; 0 disables compaction
    pub snapshot_distance: u64,
    /// Applied entries kept in the log behind the compaction point
    pub reserved_log_entries: u64,
    /// Snapshot blob bytes per InstallSnapshot message
    pub snapshot_chunk_bytes: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            heartbeat_interval_ms: 100,
            election_timeout_min_ms: 200,
            election_timeout_max_ms: 400,
            propose_timeout_ms: 3000,
            max_entries_per_append: 256,
            snapshot_distance: 0,
            reserved_log_entries: 5,
            snapshot_chunk_bytes: 4 * 1024 * 1024,
        }
    }
}

impl RaftConfig {
    /// Set the heartbeat interval (builder pattern)
    pub fn with_heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    /// Set the election timeout bounds (builder pattern)
    pub fn with_election_timeout_ms(mut self, min: u64, max: u64) -> Self {
        self.election_timeout_min_ms = min;
        self.election_timeout_max_ms = max;
        self
    }

    /// Set the proposal timeout (builder pattern)
    pub fn with_propose_timeout_ms(mut self, ms: u64) -> Self {
        self.propose_timeout_ms = ms;
        self
    }

    /// Set compaction parameters (builder pattern)
    pub fn with_compaction(mut self, snapshot_distance: u64, reserved_log_entries: u64) -> Self {
        self.snapshot_distance = snapshot_distance;
        self.reserved_log_entries = reserved_log_entries;
        self
    }

    /// Set the snapshot chunk size (builder pattern)
    pub fn with_snapshot_chunk_bytes(mut self, bytes: usize) -> Self {
        self.snapshot_chunk_bytes = bytes;
        self
    }

    /// Heartbeat period as a duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Proposal timeout as a duration
    pub fn propose_timeout(&self) -> Duration {
        Duration::from_millis(self.propose_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConsensusError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(ConsensusError::Config(
                "heartbeat_interval_ms must be positive".into(),
            ));
        }
        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            return Err(ConsensusError::Config(
                "election_timeout_min_ms exceeds election_timeout_max_ms".into(),
            ));
        }
        if self.election_timeout_min_ms <= self.heartbeat_interval_ms {
            return Err(ConsensusError::Config(
                "election timeout must exceed the heartbeat interval".into(),
            ));
        }
        if self.max_entries_per_append == 0 {
            return Err(ConsensusError::Config(
                "max_entries_per_append must be positive".into(),
            ));
        }
        if self.snapshot_chunk_bytes == 0 || self.snapshot_chunk_bytes > MAX_SNAPSHOT_CHUNK_BYTES {
            return Err(ConsensusError::Config(format!(
                "snapshot_chunk_bytes must be between 1 and {}",
                MAX_SNAPSHOT_CHUNK_BYTES
            )));
        }
        Ok(())
    }

    /// Short timeouts for tests
    pub fn for_testing() -> Self {
        RaftConfig {
            heartbeat_interval_ms: 20,
            election_timeout_min_ms: 100,
            election_timeout_max_ms: 200,
            propose_timeout_ms: 3000,
            max_entries_per_append: 64,
            snapshot_distance: 0,
            reserved_log_entries: 5,
            snapshot_chunk_bytes: 64 * 1024,
        }
    }
}
