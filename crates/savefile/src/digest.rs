//! Snapshot digests and their cluster-wide merge.
//!
//! Every host writes one digest per snapshot: a JSON document prefixed by a
//! CRC32 of its bytes, describing the snapshot's transaction id, table
//! list, and per-table/per-partition export and replication sequence
//! numbers. No single host's digest is authoritative — hosts may have been
//! added or removed since the save — so the restore engine merges all
//! readable copies into a [`DigestSet`] superset and validates agreement on
//! the identity fields while merging.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
};

use chrono::{DateTime, Utc};
use crc::{Crc, CRC_32_ISO_HDLC};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use stratadb_types::{ClusterInstanceId, HostId, PartitionId, TxnId};

/// File extension for digest sidecars.
pub const DIGEST_EXT: &str = "digest";

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Errors produced by digest reading, writing, and merging.
#[derive(Debug, Snafu)]
pub enum DigestError {
    /// I/O error.
    #[snafu(display("Digest I/O error: {source}"))]
    Io {
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// The digest file is shorter than its CRC prefix.
    #[snafu(display("Digest file truncated: {} bytes", len))]
    Truncated {
        /// Observed file length.
        len: usize,
    },

    /// The CRC prefix does not match the document bytes.
    #[snafu(display("Digest checksum mismatch: expected {expected:#010x}, got {actual:#010x}"))]
    ChecksumMismatch {
        /// CRC stored in the prefix.
        expected: u32,
        /// CRC computed over the document.
        actual: u32,
    },

    /// The digest document is not valid JSON for this schema.
    #[snafu(display("Digest JSON error: {source}"))]
    Json {
        /// The underlying serde_json error.
        source: serde_json::Error,
    },

    /// A merge was attempted over zero digests.
    #[snafu(display("No digests available to merge"))]
    NoDigests,

    /// Two digests disagree on the snapshot transaction id.
    #[snafu(display("Digest txn id mismatch: first saw {expected}, host {host} has {got}"))]
    TxnIdMismatch {
        /// Transaction id of the first digest observed.
        expected: TxnId,
        /// Transaction id in the disagreeing digest.
        got: TxnId,
        /// Host whose digest disagrees.
        host: HostId,
    },

    /// Two digests disagree on cluster instance identity.
    #[snafu(display("Digest cluster instance mismatch: {expected} vs {got} (host {host})"))]
    InstanceMismatch {
        /// Instance id of the first digest observed.
        expected: ClusterInstanceId,
        /// Instance id in the disagreeing digest.
        got: ClusterInstanceId,
        /// Host whose digest disagrees.
        host: HostId,
    },
}

/// Result type for digest operations.
pub type Result<T> = std::result::Result<T, DigestError>;

/// Export and replication sequence numbers for one (table, partition).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencePair {
    /// Export stream sequence number at snapshot time.
    pub export_seq: u64,
    /// Replication stream sequence number at snapshot time.
    pub replication_seq: u64,
}

impl SequencePair {
    /// Componentwise maximum, used by the merge.
    fn max(self, other: Self) -> Self {
        Self {
            export_seq: self.export_seq.max(other.export_seq),
            replication_seq: self.replication_seq.max(other.replication_seq),
        }
    }
}

/// One host's digest document for one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestDocument {
    /// Transaction id the snapshot was taken at. Identical in every digest
    /// of one snapshot.
    pub txn_id: TxnId,
    /// When the producing cluster was first created.
    pub cluster_create_time: DateTime<Utc>,
    /// Identity of the producing cluster instance.
    pub instance_id: ClusterInstanceId,
    /// Host that wrote this digest.
    pub host_id: HostId,
    /// Tables captured by the snapshot.
    pub tables: Vec<String>,
    /// Per-table, per-partition sequence numbers.
    #[serde(default)]
    pub sequences: BTreeMap<String, BTreeMap<PartitionId, SequencePair>>,
    /// Highest transaction id each partition had executed at snapshot time.
    /// Input to the persisted per-partition watermark update on restore.
    #[serde(default)]
    pub partition_txn_ids: BTreeMap<PartitionId, TxnId>,
    /// Version of the hashinator in effect at save time.
    pub hashinator_version: u64,
    /// Partition count of the producing cluster.
    pub partition_count: u32,
}

/// Builds the canonical file name for one host's digest.
pub fn digest_file_name(nonce: &str, host: HostId) -> String {
    format!("{nonce}-host_{host}.{DIGEST_EXT}")
}

/// Writes a digest sidecar: 4-byte big-endian CRC32, then the JSON bytes.
///
/// # Errors
///
/// Returns [`DigestError`] on serialization or write failure.
pub fn write_digest(dir: &Path, nonce: &str, doc: &DigestDocument) -> Result<()> {
    let json = serde_json::to_vec_pretty(doc).context(JsonSnafu)?;
    let crc = CRC32.checksum(&json);
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&crc.to_be_bytes());
    bytes.extend_from_slice(&json);
    fs::write(dir.join(digest_file_name(nonce, doc.host_id)), bytes).context(IoSnafu)
}

/// Reads and verifies a digest sidecar.
///
/// # Errors
///
/// Returns [`DigestError`] if the file is unreadable, its CRC prefix does
/// not match, or the JSON does not parse.
pub fn read_digest(path: &Path) -> Result<DigestDocument> {
    let bytes = fs::read(path).context(IoSnafu)?;
    if bytes.len() < 4 {
        return Err(DigestError::Truncated { len: bytes.len() });
    }
    let expected = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let actual = CRC32.checksum(&bytes[4..]);
    if expected != actual {
        return Err(DigestError::ChecksumMismatch { expected, actual });
    }
    serde_json::from_slice(&bytes[4..]).context(JsonSnafu)
}

/// The cluster-aggregated view of one snapshot's digests.
///
/// Owned collectively: the merged superset is authoritative, no single
/// host's copy is.
#[derive(Debug, Clone)]
pub struct DigestSet {
    /// The snapshot transaction id every digest agreed on.
    pub txn_id: TxnId,
    /// Identity of the producing cluster instance.
    pub instance_id: ClusterInstanceId,
    /// When the producing cluster was first created.
    pub cluster_create_time: DateTime<Utc>,
    /// Union of all tables named by any digest.
    pub tables: BTreeSet<String>,
    /// Merged sequence numbers: componentwise max per (table, partition).
    pub sequences: BTreeMap<String, BTreeMap<PartitionId, SequencePair>>,
    /// Merged per-partition transaction ids: max per partition.
    pub partition_txn_ids: BTreeMap<PartitionId, TxnId>,
    /// Highest hashinator version named by any digest.
    pub hashinator_version: u64,
    /// Partition count of the producing cluster.
    pub partition_count: u32,
}

impl DigestSet {
    /// Merges all readable digests of one snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`DigestError::NoDigests`] for an empty input and the
    /// respective mismatch error if any digest disagrees on transaction id
    /// or cluster instance identity — both are fatal consistency failures.
    pub fn merge(docs: &[DigestDocument]) -> Result<Self> {
        let first = docs.first().ok_or(DigestError::NoDigests)?;

        let mut tables = BTreeSet::new();
        let mut sequences: BTreeMap<String, BTreeMap<PartitionId, SequencePair>> =
            BTreeMap::new();
        let mut partition_txn_ids: BTreeMap<PartitionId, TxnId> = BTreeMap::new();
        let mut hashinator_version = 0;
        let mut partition_count = 0;

        for doc in docs {
            if doc.txn_id != first.txn_id {
                return Err(DigestError::TxnIdMismatch {
                    expected: first.txn_id,
                    got: doc.txn_id,
                    host: doc.host_id,
                });
            }
            if doc.instance_id != first.instance_id {
                return Err(DigestError::InstanceMismatch {
                    expected: first.instance_id,
                    got: doc.instance_id,
                    host: doc.host_id,
                });
            }
            tables.extend(doc.tables.iter().cloned());
            for (table, parts) in &doc.sequences {
                let merged = sequences.entry(table.clone()).or_default();
                for (partition, pair) in parts {
                    let slot = merged.entry(*partition).or_default();
                    *slot = slot.max(*pair);
                }
            }
            for (partition, txn) in &doc.partition_txn_ids {
                let slot = partition_txn_ids.entry(*partition).or_default();
                *slot = (*slot).max(*txn);
            }
            hashinator_version = hashinator_version.max(doc.hashinator_version);
            partition_count = partition_count.max(doc.partition_count);
        }

        Ok(Self {
            txn_id: first.txn_id,
            instance_id: first.instance_id,
            cluster_create_time: first.cluster_create_time,
            tables,
            sequences,
            partition_txn_ids,
            hashinator_version,
            partition_count,
        })
    }

    /// The full partition set the digest expects: `{0, .., partition_count-1}`.
    pub fn expected_partitions(&self) -> BTreeSet<PartitionId> {
        (0..self.partition_count).collect()
    }
}
