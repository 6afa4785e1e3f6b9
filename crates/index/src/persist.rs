//! Index file encoding
//!
//! # Format
//!
//! ```text
//! +------------------+
//! | Magic (8)        |  "VDBIDX01"
//! | Version (4)      |  format version, LE
//! | Kind (1)         |  IndexKind tag
//! | Metric (1)       |  MetricType tag
//! | Dimension (4)    |  LE
//! | Watermark (8)    |  highest WAL log id reflected in the body, LE
//! | Entries (8)      |  LE
//! | Body length (8)  |  LE
//! +------------------+
//! | Body             |  bincode(IndexBackend)
//! +------------------+
//! | CRC32 (4)        |  over header + body, LE
//! +------------------+
//! ```
//!
//! Writing the bytes to disk crash-safely is the caller's job.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use vdb_core::{BackendError, IndexKind, MetricType};

use crate::backend::IndexBackend;

const MAGIC: &[u8; 8] = b"VDBIDX01";

/// Current index file format version
pub const INDEX_FORMAT_VERSION: u32 = 1;

const HEADER_SIZE: usize = 8 + 4 + 1 + 1 + 4 + 8 + 8 + 8;

/// Decoded file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexFileHeader {
    /// Format version
    pub version: u32,
    /// Backend variant stored in the body
    pub kind: IndexKind,
    /// Metric of the stored backend
    pub metric: MetricType,
    /// Vector dimension
    pub dimension: u32,
    /// Highest WAL log id whose mutation is contained in the body
    pub watermark: u64,
    /// Number of stored entries
    pub entries: u64,
}

/// Serialize `backend` with its watermark into a self-checking byte image
pub fn encode_index(backend: &IndexBackend, watermark: u64) -> Result<Vec<u8>, BackendError> {
    let body = bincode::serialize(backend).map_err(|e| BackendError::Corrupt(e.to_string()))?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + body.len() + 4);
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&INDEX_FORMAT_VERSION.to_le_bytes());
    buf.push(backend.kind().to_byte());
    buf.push(backend.metric().to_byte());
    buf.extend_from_slice(&(backend.dimension() as u32).to_le_bytes());
    buf.extend_from_slice(&watermark.to_le_bytes());
    buf.extend_from_slice(&(backend.len() as u64).to_le_bytes());
    buf.extend_from_slice(&(body.len() as u64).to_le_bytes());
    buf.extend_from_slice(&body);

    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Parse and verify only the header
pub fn decode_header(bytes: &[u8]) -> Result<IndexFileHeader, BackendError> {
    let corrupt = |msg: &str| BackendError::Corrupt(msg.to_string());
    if bytes.len() < HEADER_SIZE + 4 {
        return Err(corrupt("index file too short"));
    }
    if &bytes[..8] != MAGIC {
        return Err(corrupt("bad index file magic"));
    }

    let mut cur = Cursor::new(&bytes[8..HEADER_SIZE]);
    let io = |e: std::io::Error| BackendError::Corrupt(e.to_string());
    let version = cur.read_u32::<LittleEndian>().map_err(io)?;
    if version != INDEX_FORMAT_VERSION {
        return Err(BackendError::Corrupt(format!(
            "unsupported index format version {}",
            version
        )));
    }
    let kind = IndexKind::from_byte(cur.read_u8().map_err(io)?)
        .ok_or_else(|| corrupt("unknown index kind"))?;
    let metric = MetricType::from_byte(cur.read_u8().map_err(io)?)
        .ok_or_else(|| corrupt("unknown metric"))?;
    let dimension = cur.read_u32::<LittleEndian>().map_err(io)?;
    let watermark = cur.read_u64::<LittleEndian>().map_err(io)?;
    let entries = cur.read_u64::<LittleEndian>().map_err(io)?;

    Ok(IndexFileHeader {
        version,
        kind,
        metric,
        dimension,
        watermark,
        entries,
    })
}

/// Verify and deserialize a byte image produced by [`encode_index`]
pub fn decode_index(bytes: &[u8]) -> Result<(IndexBackend, IndexFileHeader), BackendError> {
    let header = decode_header(bytes)?;

    let crc_offset = bytes.len() - 4;
    let mut crc_bytes = &bytes[crc_offset..];
    let stored_crc = crc_bytes
        .read_u32::<LittleEndian>()
        .map_err(|e| BackendError::Corrupt(e.to_string()))?;
    if crc32fast::hash(&bytes[..crc_offset]) != stored_crc {
        return Err(BackendError::Corrupt("index file checksum mismatch".into()));
    }

    let mut len_cur = Cursor::new(&bytes[HEADER_SIZE - 8..HEADER_SIZE]);
    let body_len = len_cur
        .read_u64::<LittleEndian>()
        .map_err(|e| BackendError::Corrupt(e.to_string()))? as usize;
    if HEADER_SIZE + body_len != crc_offset {
        return Err(BackendError::Corrupt("index body length mismatch".into()));
    }

    let backend: IndexBackend = bincode::deserialize(&bytes[HEADER_SIZE..crc_offset])
        .map_err(|e| BackendError::Corrupt(e.to_string()))?;
    if backend.kind() != header.kind {
        return Err(BackendError::Corrupt("header kind does not match body".into()));
    }
    backend.after_load();
    Ok((backend, header))
}
