//! WAL writer with durability mode support.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::{DurabilityMode, WalConfig, WalRecord};
use crate::error::WalError;

/// Cumulative WAL operation counters.
///
/// These counters accumulate over the lifetime of the writer and are never
/// reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalCounters {
    /// Records accepted by [`WalWriter::append`]
    pub wal_appends: u64,
    /// fsync calls
    pub sync_calls: u64,
    /// Bytes written to the file
    pub bytes_written: u64,
    /// Nanoseconds spent in fsync
    pub sync_nanos: u64,
}

/// Appends records to the single WAL file.
///
/// On open the existing file is scanned once: a trailing partial line left
/// by a crash is cut off so new appends start on a clean line, and the
/// highest log id is remembered to enforce strict ordering. A failed append
/// is cut back the same way, so the file only ever ends in complete lines.
pub struct WalWriter {
    /// None when DurabilityMode::Cache
    file: Option<File>,
    path: PathBuf,
    /// End of the last complete line
    committed_len: u64,
    /// A failed append could not be cut back yet; retried before the next write
    torn: bool,
    durability: DurabilityMode,
    last_log_id: u64,
    counters: WalCounters,
}

impl WalWriter {
    /// Open (or create) the WAL file described by `config`.
    pub fn open(config: &WalConfig) -> Result<Self, WalError> {
        config.validate()?;
        let path = config.path();

        if !config.durability.requires_wal() {
            return Ok(WalWriter {
                file: None,
                path,
                committed_len: 0,
                torn: false,
                durability: config.durability,
                last_log_id: 0,
                counters: WalCounters::default(),
            });
        }

        std::fs::create_dir_all(&config.dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let (valid_end, last_log_id) = scan_tail(&path)?;
        let len = file.metadata()?.len();
        if valid_end < len {
            tracing::warn!(
                target: "vdb::wal",
                path = %path.display(),
                valid_end,
                file_len = len,
                "truncating torn WAL tail"
            );
            file.set_len(valid_end)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::End(0))?;

        tracing::debug!(
            target: "vdb::wal",
            path = %path.display(),
            last_log_id,
            mode = config.durability.description(),
            "WAL opened for append"
        );

        Ok(WalWriter {
            file: Some(file),
            path,
            committed_len: valid_end,
            torn: false,
            durability: config.durability,
            last_log_id,
            counters: WalCounters::default(),
        })
    }

    /// Append one record.
    ///
    /// Blocks until the line has been flushed (and fsynced in Always mode).
    /// The record's id must exceed every id already in the file.
    pub fn append(&mut self, record: &WalRecord) -> Result<(), WalError> {
        if record.log_id <= self.last_log_id {
            return Err(WalError::NonMonotonic {
                last: self.last_log_id,
                got: record.log_id,
            });
        }

        if let Some(file) = self.file.as_mut() {
            if self.torn {
                cut_back(file, self.committed_len)?;
                self.torn = false;
                tracing::info!(target: "vdb::wal", len = self.committed_len, "torn WAL tail repaired");
            }

            let line = record.to_line();
            let fsync = self.durability.requires_fsync();
            let start = Instant::now();
            if let Err(e) = write_line(file, line.as_bytes(), fsync) {
                self.torn = cut_back(file, self.committed_len).is_err();
                tracing::warn!(
                    target: "vdb::wal",
                    log_id = record.log_id,
                    error = %e,
                    repaired = !self.torn,
                    "WAL append failed, partial line removed"
                );
                return Err(e.into());
            }
            self.committed_len += line.len() as u64;
            self.counters.bytes_written += line.len() as u64;
            if fsync {
                self.counters.sync_calls += 1;
                self.counters.sync_nanos += start.elapsed().as_nanos() as u64;
            }
        }

        self.last_log_id = record.log_id;
        self.counters.wal_appends += 1;
        Ok(())
    }

    /// Force an fsync regardless of mode.
    pub fn sync(&mut self) -> Result<(), WalError> {
        if let Some(file) = self.file.as_mut() {
            let start = Instant::now();
            file.sync_all()?;
            self.counters.sync_calls += 1;
            self.counters.sync_nanos += start.elapsed().as_nanos() as u64;
        }
        Ok(())
    }

    /// Highest log id in the file
    pub fn last_log_id(&self) -> u64 {
        self.last_log_id
    }

    /// Snapshot of the cumulative counters
    pub fn counters(&self) -> WalCounters {
        self.counters
    }

    /// Path of the WAL file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Configured durability mode
    pub fn durability(&self) -> DurabilityMode {
        self.durability
    }
}

fn write_line(file: &mut File, line: &[u8], fsync: bool) -> std::io::Result<()> {
    file.write_all(line)?;
    file.flush()?;
    if fsync {
        file.sync_data()?;
    }
    Ok(())
}

/// Drop everything after `len` and continue writing there
fn cut_back(file: &mut File, len: u64) -> std::io::Result<()> {
    file.set_len(len)?;
    file.seek(SeekFrom::Start(len))?;
    Ok(())
}

/// Returns (end of the last complete line, highest parsed log id).
///
/// Complete lines that fail to parse are left in place; the reader skips
/// them with a warning.
fn scan_tail(path: &Path) -> Result<(u64, u64), WalError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut line = Vec::new();
    let mut offset = 0u64;
    let mut last_log_id = 0u64;

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 || line.last() != Some(&b'\n') {
            break;
        }
        offset += n as u64;
        if let Some(record) = std::str::from_utf8(&line)
            .ok()
            .and_then(|l| WalRecord::parse_line(l).ok())
        {
            last_log_id = last_log_id.max(record.log_id);
        }
    }
    Ok((offset, last_log_id))
}
