//! Identifier aliases used across the restore engine.
//!
//! The mapping from human-readable node names to numeric host ids is owned
//! by the membership layer; everything in this workspace deals in the
//! numeric forms only.

use uuid::Uuid;

/// Host (node) identifier in the cluster.
///
/// We use u64 for efficient storage and comparison, matching the membership
/// layer's numbering.
pub type HostId = u64;

/// Execution site identifier. One host runs one or more sites; site ids are
/// unique cluster-wide.
pub type SiteId = u64;

/// Partition identifier. Partitions are numbered densely from zero, so a
/// cluster with N partitions owns exactly `{0, .., N-1}`.
pub type PartitionId = u32;

/// Transaction identifier. Monotonically increasing per partition.
pub type TxnId = u64;

/// Identity of one logical cluster instance.
///
/// Assigned when a cluster is first initialized and carried by every
/// snapshot artifact the cluster produces. A hashinator snapshot captured
/// under a different instance id can never be installed.
pub type ClusterInstanceId = Uuid;
