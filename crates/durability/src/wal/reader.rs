//! Forward-only WAL cursor for startup replay.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use super::WalRecord;
use crate::error::{RecordParseError, WalError};

/// Why the reader stopped producing records
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStopReason {
    /// Not stopped yet
    Reading,
    /// Clean end of file
    EndOfData,
    /// The last line had no terminating newline (crash mid-append)
    PartialRecord {
        /// Byte offset where the partial line starts
        offset: u64,
    },
}

/// Sequential reader over one WAL file.
///
/// Complete lines that fail to decode are skipped with a warning; an
/// unterminated final line ends the stream.
pub struct WalReader {
    /// None when the file does not exist
    inner: Option<BufReader<File>>,
    offset: u64,
    records_read: u64,
    skipped_corrupted: u64,
    stop_reason: ReadStopReason,
    buf: Vec<u8>,
}

impl WalReader {
    /// Open `path` for reading from position zero.
    ///
    /// A missing file reads as empty.
    pub fn open(path: &Path) -> Result<Self, WalError> {
        let inner = match File::open(path) {
            Ok(file) => Some(BufReader::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(WalReader {
            inner,
            offset: 0,
            records_read: 0,
            skipped_corrupted: 0,
            stop_reason: ReadStopReason::Reading,
            buf: Vec::new(),
        })
    }

    /// A reader that yields nothing
    pub fn empty() -> Self {
        WalReader {
            inner: None,
            offset: 0,
            records_read: 0,
            skipped_corrupted: 0,
            stop_reason: ReadStopReason::EndOfData,
            buf: Vec::new(),
        }
    }

    /// Next record, or `None` at end of stream
    pub fn read_next(&mut self) -> Result<Option<WalRecord>, WalError> {
        let Some(inner) = self.inner.as_mut() else {
            self.stop_reason = ReadStopReason::EndOfData;
            return Ok(None);
        };
        if self.stop_reason != ReadStopReason::Reading {
            return Ok(None);
        }

        loop {
            self.buf.clear();
            let n = inner.read_until(b'\n', &mut self.buf)?;
            if n == 0 {
                self.stop_reason = ReadStopReason::EndOfData;
                return Ok(None);
            }
            if self.buf.last() != Some(&b'\n') {
                tracing::warn!(
                    target: "vdb::wal",
                    offset = self.offset,
                    bytes = n,
                    "WAL ends with a partial record"
                );
                self.stop_reason = ReadStopReason::PartialRecord {
                    offset: self.offset,
                };
                return Ok(None);
            }

            let line_start = self.offset;
            self.offset += n as u64;

            let parsed = match std::str::from_utf8(&self.buf) {
                Ok(line) => WalRecord::parse_line(line),
                Err(_) => Err(RecordParseError::InvalidUtf8),
            };
            match parsed {
                Ok(record) => {
                    self.records_read += 1;
                    return Ok(Some(record));
                }
                Err(source) => {
                    tracing::warn!(
                        target: "vdb::wal",
                        offset = line_start,
                        error = %WalError::Malformed { offset: line_start, source },
                        "skipping corrupted WAL record"
                    );
                    self.skipped_corrupted += 1;
                }
            }
        }
    }

    /// Drain the remaining records
    pub fn read_all(&mut self) -> Result<Vec<WalRecord>, WalError> {
        let mut records = Vec::new();
        while let Some(record) = self.read_next()? {
            records.push(record);
        }
        Ok(records)
    }

    /// Records returned so far
    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    /// Complete lines skipped because they did not decode
    pub fn skipped_corrupted(&self) -> u64 {
        self.skipped_corrupted
    }

    /// Current stop state
    pub fn stop_reason(&self) -> &ReadStopReason {
        &self.stop_reason
    }
}
