//! The hashinator: StrataDB's versioned partitioning function.
//!
//! The hashinator maps a partitioning-column value to a partition id. Every
//! snapshot captures the hashinator in effect when it was taken, one copy
//! per host, so that a restore onto a differently-sized cluster can decide
//! whether stored rows still land where they used to. Reconciliation keeps
//! only the highest-versioned copies and refuses to guess when copies
//! disagree.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use stratadb_types::{codec, ClusterInstanceId, HostId, PartitionId, Value};

/// File extension for hashinator snapshot files.
pub const HASHINATOR_EXT: &str = "hash";

/// Errors produced by hashinator snapshots and reconciliation.
#[derive(Debug, Snafu)]
pub enum HashinatorError {
    /// I/O error reading or writing a snapshot file.
    #[snafu(display("Hashinator I/O error: {source}"))]
    Io {
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// Encode/decode failure for a snapshot file.
    #[snafu(display("Hashinator codec error: {source}"))]
    Codec {
        /// The underlying codec error.
        source: stratadb_types::CodecError,
    },

    /// Reconciliation was attempted over zero copies.
    #[snafu(display("No hashinator copies available"))]
    NoCopies,

    /// A copy was captured under a different cluster instance.
    #[snafu(display(
        "Hashinator instance mismatch: copy from host {host} was captured under {found}, \
         current cluster is {expected}"
    ))]
    InstanceMismatch {
        /// The running cluster's instance id.
        expected: ClusterInstanceId,
        /// The instance id captured in the offending copy.
        found: ClusterInstanceId,
        /// Host the copy came from.
        host: HostId,
    },

    /// Copies at the surviving version carry different configurations.
    #[snafu(display("Hashinator copies at version {version} disagree on configuration"))]
    ConfigDisagreement {
        /// The version whose copies disagree.
        version: u64,
    },
}

/// Result type for hashinator operations.
pub type Result<T> = std::result::Result<T, HashinatorError>;

/// Serialized configuration of a partitioning function.
///
/// A versioned enum so future function families (range, consistent-token)
/// deserialize alongside the modulo family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashinatorConfig {
    /// Fold the value to a u64 and take it modulo the partition count.
    Modulo {
        /// Number of partitions the function maps onto.
        partition_count: u32,
    },
}

/// A versioned, instance-bound partitioning function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hashinator {
    /// Monotonically increasing version. Bumped on every elastic change.
    pub version: u64,
    /// Identity of the cluster instance this function was captured under.
    pub instance_id: ClusterInstanceId,
    /// The serialized function itself.
    pub config: HashinatorConfig,
    /// Host that wrote this copy. Zero for a freshly constructed function.
    #[serde(default)]
    pub source_host: HostId,
}

impl Hashinator {
    /// Creates a modulo hashinator for the given cluster.
    pub fn modulo(version: u64, instance_id: ClusterInstanceId, partition_count: u32) -> Self {
        Self {
            version,
            instance_id,
            config: HashinatorConfig::Modulo { partition_count },
            source_host: 0,
        }
    }

    /// Number of partitions this function maps onto.
    pub fn partition_count(&self) -> u32 {
        match self.config {
            HashinatorConfig::Modulo { partition_count } => partition_count,
        }
    }

    /// Maps a partitioning-column value to its destination partition.
    ///
    /// `Null` routes to partition 0, matching the storage engine's treatment
    /// of null partition keys.
    pub fn partition_for(&self, value: &Value) -> PartitionId {
        let HashinatorConfig::Modulo { partition_count } = self.config;
        let folded = match value {
            Value::Null => 0,
            Value::I64(v) => *v as u64,
            Value::Str(s) => fold_bytes(s.as_bytes()),
            Value::Bytes(b) => fold_bytes(b),
        };
        (folded % u64::from(partition_count.max(1))) as PartitionId
    }
}

/// Stable byte folding for string/byte partition keys. The exact constants
/// are part of the persisted format: changing them re-partitions every
/// existing string-keyed table.
fn fold_bytes(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |h, b| h.wrapping_mul(31).wrapping_add(u64::from(*b)))
}

/// Builds the canonical file name for one host's hashinator snapshot.
pub fn hashinator_file_name(nonce: &str, host: HostId) -> String {
    format!("{nonce}-host_{host}.{HASHINATOR_EXT}")
}

/// Writes one host's hashinator snapshot file.
///
/// # Errors
///
/// Returns [`HashinatorError`] on encode or write failure.
pub fn write_hashinator(dir: &Path, nonce: &str, hashinator: &Hashinator) -> Result<()> {
    let bytes = codec::encode(hashinator).context(CodecSnafu)?;
    fs::write(dir.join(hashinator_file_name(nonce, hashinator.source_host)), bytes)
        .context(IoSnafu)
}

/// Reads a hashinator snapshot file.
///
/// # Errors
///
/// Returns [`HashinatorError`] if the file is unreadable or undecodable.
pub fn read_hashinator(path: &Path) -> Result<Hashinator> {
    let bytes = fs::read(path).context(IoSnafu)?;
    codec::decode(&bytes).context(CodecSnafu)
}

/// Reconciles all gathered hashinator copies into the single authoritative
/// function.
///
/// Keeps only the copies at the highest version, requires them to agree on
/// configuration, and requires every copy — regardless of version — to have
/// been captured under the running cluster's instance identity. Any
/// disagreement aborts with a named error rather than guessing.
///
/// # Errors
///
/// [`HashinatorError::NoCopies`], [`HashinatorError::InstanceMismatch`], or
/// [`HashinatorError::ConfigDisagreement`].
pub fn reconcile(
    copies: &[Hashinator],
    current_instance: ClusterInstanceId,
) -> Result<Hashinator> {
    if copies.is_empty() {
        return Err(HashinatorError::NoCopies);
    }
    for copy in copies {
        if copy.instance_id != current_instance {
            return Err(HashinatorError::InstanceMismatch {
                expected: current_instance,
                found: copy.instance_id,
                host: copy.source_host,
            });
        }
    }

    let max_version = copies.iter().map(|c| c.version).max().unwrap_or(0);
    let mut survivors = copies.iter().filter(|c| c.version == max_version);
    // `copies` is non-empty, so at least one copy carries max_version.
    let chosen = survivors.next().ok_or(HashinatorError::NoCopies)?;
    if survivors.any(|c| c.config != chosen.config) {
        return Err(HashinatorError::ConfigDisagreement { version: max_version });
    }
    Ok(chosen.clone())
}
