//! On-disk index snapshots
//!
//! A snapshot is one index file named after the backend type
//! (`snapshot_<TYPE_ID>.index`) plus the marker file. The index file is
//! written atomically first and carries its own watermark; the marker is
//! written last and is the snapshot's commit point.

use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use vdb_core::{IndexKind, Result, VdbError};
use vdb_durability::{write_atomic, SnapshotMarker, MARKER_FILE_NAME};
use vdb_index::{decode_index, IndexBackend, IndexSpec};

use crate::engine::VectorIndexEngine;

/// File name of the index snapshot for a backend type
pub fn index_file_name(kind: IndexKind) -> String {
    format!("snapshot_{}.index", kind.type_id())
}

/// What a completed snapshot covered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// Backend variant written
    pub kind: IndexKind,
    /// Highest log id contained in the index file
    pub watermark: u64,
    /// Entries in the index file
    pub entries: usize,
    /// Size of the index file
    pub bytes: usize,
    /// Where it was written
    pub path: PathBuf,
}

/// A backend read back from disk
#[derive(Debug)]
pub struct LoadedSnapshot {
    /// The decoded backend
    pub backend: IndexBackend,
    /// Highest log id contained in it
    pub watermark: u64,
}

/// Writes and reads index snapshots in one directory
#[derive(Debug, Clone)]
pub struct SnapshotCoordinator {
    dir: PathBuf,
}

impl SnapshotCoordinator {
    /// Coordinator for `dir` (created on the first snapshot)
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        SnapshotCoordinator { dir: dir.into() }
    }

    /// Snapshot directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the index file for `kind`
    pub fn index_path(&self, kind: IndexKind) -> PathBuf {
        self.dir.join(index_file_name(kind))
    }

    /// Path of the marker file
    pub fn marker_path(&self) -> PathBuf {
        self.dir.join(MARKER_FILE_NAME)
    }

    /// Serialize the engine's backend, then commit the marker
    pub fn take_snapshot(&self, engine: &VectorIndexEngine) -> Result<SnapshotInfo> {
        std::fs::create_dir_all(&self.dir)?;
        let encoded = engine.encode_snapshot()?;
        let path = self.index_path(encoded.kind);
        write_atomic(&path, &encoded.bytes).map_err(|e| snapshot_io("write index file", &path, e))?;

        let marker = self.marker_path();
        SnapshotMarker::new(encoded.watermark)
            .write(&marker)
            .map_err(|e| snapshot_io("write marker", &marker, e))?;

        info!(
            target: "vdb::snapshot",
            kind = %encoded.kind,
            watermark = encoded.watermark,
            entries = encoded.entries,
            bytes = encoded.bytes.len(),
            "Snapshot taken"
        );
        Ok(SnapshotInfo {
            kind: encoded.kind,
            watermark: encoded.watermark,
            entries: encoded.entries,
            bytes: encoded.bytes.len(),
            path,
        })
    }

    /// Read the index file for `spec.kind`, if one exists
    ///
    /// A missing file is the first-run case and yields `Ok(None)`. A file
    /// that decodes to a different kind, metric or dimension than `spec`
    /// is an error.
    pub fn load_snapshot(&self, spec: &IndexSpec) -> Result<Option<LoadedSnapshot>> {
        let path = self.index_path(spec.kind);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(target: "vdb::snapshot", path = %path.display(), "No snapshot file, starting empty");
                return Ok(None);
            }
            Err(e) => return Err(snapshot_io("read index file", &path, e)),
        };
        let (backend, header) = decode_index(&bytes)
            .map_err(|e| VdbError::Snapshot(format!("{}: {}", path.display(), e)))?;
        if header.kind != spec.kind
            || header.metric != spec.metric
            || header.dimension as usize != spec.dimension
        {
            return Err(VdbError::Snapshot(format!(
                "{} holds a {} {} index of dimension {}, configured {} {} of dimension {}",
                path.display(),
                header.kind,
                header.metric,
                header.dimension,
                spec.kind,
                spec.metric,
                spec.dimension
            )));
        }

        match self.last_snapshot_log_id()? {
            Some(marked) if marked != header.watermark => warn!(
                target: "vdb::snapshot",
                marker = marked,
                file = header.watermark,
                "Snapshot marker disagrees with index file, using the file's watermark"
            ),
            None => warn!(
                target: "vdb::snapshot",
                watermark = header.watermark,
                "Index file present without a marker"
            ),
            _ => {}
        }

        info!(
            target: "vdb::snapshot",
            kind = %header.kind,
            watermark = header.watermark,
            entries = header.entries,
            "Snapshot loaded"
        );
        Ok(Some(LoadedSnapshot {
            backend,
            watermark: header.watermark,
        }))
    }

    /// Log id recorded by the last completed snapshot
    pub fn last_snapshot_log_id(&self) -> Result<Option<u64>> {
        let path = self.marker_path();
        let marker =
            SnapshotMarker::read(&path).map_err(|e| snapshot_io("read marker", &path, e))?;
        Ok(marker.map(|m| m.last_snapshot_log_id))
    }
}

fn snapshot_io(what: &str, path: &Path, e: io::Error) -> VdbError {
    VdbError::Snapshot(format!("{} {}: {}", what, path.display(), e))
}
