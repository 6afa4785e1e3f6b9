//! Snapshot marker
//!
//! A tiny JSON file holding the log id covered by the last completed
//! on-disk snapshot. It is written only after every index file of that
//! snapshot is durable, so its presence is the snapshot's commit point.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;

use crate::atomic::write_atomic;

/// File name of the marker inside the snapshot directory
pub const MARKER_FILE_NAME: &str = "snapshot.marker";

/// Commit record of the last on-disk snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMarker {
    /// Highest WAL log id reflected in the snapshot's index files
    pub last_snapshot_log_id: u64,
}

impl SnapshotMarker {
    /// Marker for a snapshot covering everything up to `log_id`
    pub fn new(log_id: u64) -> Self {
        SnapshotMarker {
            last_snapshot_log_id: log_id,
        }
    }

    /// Read the marker; `Ok(None)` when no snapshot has completed yet
    pub fn read(path: &Path) -> io::Result<Option<Self>> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Persist the marker atomically
    pub fn write(&self, path: &Path) -> io::Result<()> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_atomic(path, &bytes)
    }
}
