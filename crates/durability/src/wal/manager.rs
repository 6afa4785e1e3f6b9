//! WAL manager: the per-node log id counter
//!
//! Owns the writer, the startup replay cursor and the counter that ties
//! them together. The counter is always at least the highest log id ever
//! read or written through this manager.

use std::path::{Path, PathBuf};

use vdb_core::OperationType;

use super::{WalConfig, WalCounters, WalReader, WalRecord, WalWriter};
use crate::error::WalError;

/// Single owner of one node's WAL file
pub struct WalManager {
    config: WalConfig,
    writer: WalWriter,
    cursor: WalReader,
    counter: u64,
}

impl WalManager {
    /// Open the WAL, repairing a torn tail and positioning the replay
    /// cursor at file position zero
    pub fn open(config: WalConfig) -> Result<Self, WalError> {
        let writer = WalWriter::open(&config)?;
        let cursor = if config.durability.requires_wal() {
            WalReader::open(&config.path())?
        } else {
            WalReader::empty()
        };
        let counter = writer.last_log_id();
        tracing::info!(
            target: "vdb::wal",
            path = %config.path().display(),
            last_log_id = counter,
            "WAL manager opened"
        );
        Ok(WalManager {
            config,
            writer,
            cursor,
            counter,
        })
    }

    /// Assign the next log id and append
    pub fn append_wal(
        &mut self,
        op: OperationType,
        payload: &str,
        version: &str,
    ) -> Result<u64, WalError> {
        let log_id = self.counter + 1;
        self.writer
            .append(&WalRecord::new(log_id, version, op, payload))?;
        self.counter = log_id;
        tracing::debug!(target: "vdb::wal", log_id, op = %op, "appended");
        Ok(log_id)
    }

    /// Append under an externally assigned id, advancing the counter to at
    /// least that id
    pub fn append_wal_with_id(
        &mut self,
        log_id: u64,
        op: OperationType,
        payload: &str,
        version: &str,
    ) -> Result<(), WalError> {
        self.writer
            .append(&WalRecord::new(log_id, version, op, payload))?;
        self.counter = self.counter.max(log_id);
        tracing::debug!(target: "vdb::wal", log_id, op = %op, "appended with assigned id");
        Ok(())
    }

    /// Next record from the replay cursor; `None` at end of file
    pub fn read_next(&mut self) -> Result<Option<WalRecord>, WalError> {
        let next = self.cursor.read_next()?;
        if let Some(record) = &next {
            self.counter = self.counter.max(record.log_id);
        }
        Ok(next)
    }

    /// Every record currently in the file, read with a fresh cursor
    pub fn read_all_records(&self) -> Result<Vec<WalRecord>, WalError> {
        if !self.config.durability.requires_wal() {
            return Ok(Vec::new());
        }
        WalReader::open(&self.config.path())?.read_all()
    }

    /// Highest log id read or written
    pub fn last_log_id(&self) -> u64 {
        self.counter
    }

    /// Writer counters
    pub fn counters(&self) -> WalCounters {
        self.writer.counters()
    }

    /// Lines the replay cursor skipped as corrupted
    pub fn skipped_corrupted(&self) -> u64 {
        self.cursor.skipped_corrupted()
    }

    /// Force the file to disk
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.writer.sync()
    }

    /// WAL file path
    pub fn path(&self) -> PathBuf {
        self.config.path()
    }

    /// WAL directory
    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Configuration this manager was opened with
    pub fn config(&self) -> &WalConfig {
        &self.config
    }
}
