//! Durability layer for vdb
//!
//! Everything in a node that touches disk outside the index files:
//!
//! - WAL: one append-only text file of `log_id|version|operation|payload` lines
//! - Durability modes: Cache, Flush (default), Always
//! - Forward replay cursor with torn-tail detection
//! - Snapshot marker: the commit point of an on-disk index snapshot
//! - Crash-safe whole-file replacement (temp file, fsync, rename, fsync dir)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod atomic;
pub mod error;
pub mod marker;
pub mod wal;

pub use atomic::{sync_parent_dir, write_atomic};
pub use error::{RecordParseError, WalError};
pub use marker::{SnapshotMarker, MARKER_FILE_NAME};
pub use wal::{
    DurabilityMode, ReadStopReason, WalConfig, WalCounters, WalManager, WalReader, WalRecord,
    WalWriter,
};
