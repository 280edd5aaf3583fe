//! Snapshot directory scan.
//!
//! Each node inventories its snapshot directory once per restore: every
//! artifact named under the requested nonce is opened just far enough to
//! extract its metadata. Unreadable or incomplete artifacts become scan
//! warnings, never hard failures — the same data may exist intact on
//! another node, and it is the consistency validator's job to decide
//! whether enough readable copies survive cluster-wide.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use stratadb_types::{HostId, PartitionId};
use tracing::{debug, warn};

use crate::{
    chunked::{ChunkedTableFile, SAVE_FILE_EXT},
    digest::{read_digest, DigestDocument, DIGEST_EXT},
    hashinator::{read_hashinator, Hashinator, HASHINATOR_EXT},
};

/// Errors terminal for a whole directory scan.
#[derive(Debug, Snafu)]
pub enum ScanError {
    /// The snapshot directory itself could not be read.
    #[snafu(display("Cannot read snapshot directory {}: {source}", dir.display()))]
    Directory {
        /// The directory that failed to list.
        dir: PathBuf,
        /// The underlying IO error.
        source: std::io::Error,
    },
}

/// Result type for scan operations.
pub type Result<T> = std::result::Result<T, ScanError>;

/// One save file's metadata as observed by one node's scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRow {
    /// Host that performed the scan.
    pub scanning_host: HostId,
    /// Host that originally produced the file.
    pub source_host: HostId,
    /// Table the file holds rows for.
    pub table: String,
    /// Whether the table was replicated when saved.
    pub replicated: bool,
    /// Partition ids the file contains. Empty for replicated tables.
    pub partition_ids: Vec<PartitionId>,
    /// Total partition count at save time.
    pub total_partitions: u32,
    /// Whether the file is structurally complete.
    pub complete: bool,
    /// Where the file lives on the scanning host.
    pub path: PathBuf,
}

/// A snapshot artifact that could not be used, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanWarning {
    /// The offending file.
    pub path: PathBuf,
    /// Human-readable description of what went wrong.
    pub message: String,
}

/// Everything one node's scan found for one snapshot nonce.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeScan {
    /// Save file metadata rows.
    pub rows: Vec<ScanRow>,
    /// Artifacts that could not be scanned.
    pub warnings: Vec<ScanWarning>,
    /// Digest documents found on this node.
    pub digests: Vec<DigestDocument>,
    /// Hashinator copies found on this node.
    pub hashinators: Vec<Hashinator>,
}

/// Scans `dir` for all artifacts of the snapshot named `nonce`.
///
/// Incomplete save files are recorded both as rows (flagged incomplete) and
/// as warnings; the validator only counts complete files toward partition
/// coverage.
///
/// # Errors
///
/// Returns [`ScanError::Directory`] only if the directory itself cannot be
/// listed; per-file problems become [`ScanWarning`]s.
pub fn scan_snapshot_dir(dir: &Path, nonce: &str, scanning_host: HostId) -> Result<NodeScan> {
    let prefix = format!("{nonce}-");
    let mut scan = NodeScan::default();

    let entries = std::fs::read_dir(dir).context(DirectorySnafu { dir: dir.to_path_buf() })?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix))
        })
        .collect();
    paths.sort();

    for path in paths {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        match ext {
            SAVE_FILE_EXT => match ChunkedTableFile::open(&path) {
                Ok(file) => {
                    if !file.is_complete() {
                        warn!(path = %path.display(), "incomplete save file, abandoning");
                        scan.warnings.push(ScanWarning {
                            path: path.clone(),
                            message: "save file is structurally incomplete".to_string(),
                        });
                    }
                    scan.rows.push(ScanRow {
                        scanning_host,
                        source_host: file.source_host(),
                        table: file.table().to_string(),
                        replicated: file.is_replicated(),
                        partition_ids: file.partition_ids().to_vec(),
                        total_partitions: file.header().total_partitions,
                        complete: file.is_complete(),
                        path: path.clone(),
                    });
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable save file");
                    scan.warnings.push(ScanWarning { path, message: e.to_string() });
                }
            },
            DIGEST_EXT => match read_digest(&path) {
                Ok(doc) => scan.digests.push(doc),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable digest");
                    scan.warnings.push(ScanWarning { path, message: e.to_string() });
                }
            },
            HASHINATOR_EXT => match read_hashinator(&path) {
                Ok(h) => scan.hashinators.push(h),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable hashinator snapshot");
                    scan.warnings.push(ScanWarning { path, message: e.to_string() });
                }
            },
            _ => {}
        }
    }

    debug!(
        host = scanning_host,
        rows = scan.rows.len(),
        digests = scan.digests.len(),
        hashinators = scan.hashinators.len(),
        warnings = scan.warnings.len(),
        "snapshot directory scanned"
    );
    Ok(scan)
}
