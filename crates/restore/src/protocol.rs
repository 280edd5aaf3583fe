//! Wire types for the restore work-channel protocol.
//!
//! A restore is a long sequence of many dependent distributed work units
//! addressed to dynamically-discovered endpoints. That shape does not fit
//! the cluster's single-shot transactional fragment router (one request →
//! one aggregated response), so restores run their own session protocol
//! over dedicated ephemeral channels:
//!
//! 1. The coordinator broadcasts [`Message::SessionAnnounce`] to every
//!    site's control channel.
//! 2. Each site creates an ephemeral session channel and reports it with
//!    [`Message::SessionJoin`].
//! 3. Once all sites have joined, the coordinator pushes the full
//!    site→channel map ([`Message::ChannelMap`]) to every session channel.
//!    A work unit arriving before the map is installed cannot be correctly
//!    attributed and is a protocol violation, not a data error.
//! 4. Each site acknowledges with [`Message::MapAck`]; only after all acks
//!    do work units flow.
//! 5. The session ends only on an explicit [`Message::Terminate`] — never
//!    on idle timeout, to avoid racing a slow but healthy work unit.
//!
//! All payloads are postcard-encoded through the shared codec.

use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize};
use snafu::Snafu;
use stratadb_savefile::{Hashinator, NodeScan, SequencePair};
use stratadb_types::{codec, HostId, PartitionId, RowBatch, SiteId};
use uuid::Uuid;

use crate::aggregate::RestoreResultRow;
use crate::traits::ChannelId;

/// Identifier correlating a work unit with its result.
pub type DependencyId = u64;

/// Per-table, per-partition export/replication sequence numbers, as merged
/// from the digest superset.
pub type TableSequences = BTreeMap<String, BTreeMap<PartitionId, SequencePair>>;

/// Identifier of one restore session.
pub type SessionId = Uuid;

/// Size of the dependency-id block reserved for each distribute unit's leaf
/// allocations. Blocks come off the same counter as single ids, so ids can
/// never collide across allocators.
pub const DEP_BLOCK: u64 = 1 << 20;

/// Whether the restore is a plain restore or a crash-recovery replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreMode {
    /// Plain restore: uniqueness violations degrade the load to failure.
    Restore,
    /// Command-log replay: duplicates are expected; violators are routed to
    /// the duplicate sink and the load still succeeds.
    Recover,
}

/// Errors fatal to a whole restore session.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProtocolError {
    /// A wire payload failed to encode or decode.
    #[snafu(display("Protocol codec error: {source}"))]
    Codec {
        /// The underlying codec error.
        source: stratadb_types::CodecError,
    },

    /// The substrate failed underneath the session.
    #[snafu(display("Protocol transport error: {source}"))]
    Link {
        /// The underlying link error.
        source: crate::traits::LinkError,
    },

    /// A result arrived for a dependency id that already sits in the
    /// side-buffer: a dependency id collision, unrecoverable.
    #[snafu(display("Dependency id collision: {dependency}"))]
    DependencyCollision {
        /// The colliding id.
        dependency: DependencyId,
    },

    /// A message arrived that the current protocol step cannot accept.
    #[snafu(display("Unexpected message during {step}"))]
    UnexpectedMessage {
        /// The protocol step that received it.
        step: String,
    },

    /// A work unit reached a site before the channel map was installed.
    #[snafu(display("Work unit {dependency} arrived at site {site} before the channel map"))]
    WorkBeforeMap {
        /// The offending unit's dependency id.
        dependency: DependencyId,
        /// The site that received it.
        site: SiteId,
    },

    /// A site reported a protocol violation; the operation must abort.
    #[snafu(display("Site {site} reported a protocol violation: {reason}"))]
    SiteViolation {
        /// The reporting site.
        site: SiteId,
        /// The site's description.
        reason: String,
    },
}

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// How a distribute unit routes the chunks it reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistributeStrategy {
    /// Send every batch to every site; the table is replicated now.
    ToReplicated,
    /// The stored layout matches the current one: route each chunk to the
    /// site owning its partition hint, no re-hashing.
    Direct,
    /// Re-hash every row with this function and route the buckets.
    Rehash {
        /// The current cluster's partitioning function.
        hashinator: Hashinator,
        /// Index of the table's partitioning column.
        partition_column: usize,
    },
}

/// One save file assigned to a distribute unit, with the partitions it was
/// claimed for. Claims are issued once, centrally, while the plan is built,
/// so no two units ever read the same partition's data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedFile {
    /// Path of the file on the executing site's host.
    pub path: PathBuf,
    /// Partitions this unit must take from the file. Empty means the whole
    /// file (replicated source).
    pub relevant: Vec<PartitionId>,
}

/// Parameters of a distribute unit: read assigned files on the executing
/// site, route batches per the strategy, collect the leaf results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributeSpec {
    /// Table being distributed.
    pub table: String,
    /// Files this unit owns, with per-file partition claims.
    pub assigned: Vec<AssignedFile>,
    /// Routing strategy.
    pub strategy: DistributeStrategy,
    /// First dependency id of the block reserved for this unit's leaves.
    pub dep_base: DependencyId,
    /// Site owning each partition, for routing leaf loads.
    pub partition_owners: BTreeMap<PartitionId, SiteId>,
    /// Every session site, for replicated fan-out.
    pub all_sites: Vec<SiteId>,
    /// Restore vs recover semantics for the leaf loads.
    pub mode: RestoreMode,
}

/// The operation a work unit performs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkPayload {
    /// Install export/replication sequence numbers for the partitions this
    /// site owns.
    SetSequences {
        /// Per-table, per-partition sequence numbers from the merged
        /// digest.
        sequences: TableSequences,
    },

    /// Install the reconciled hashinator.
    InstallHashinator {
        /// The function to install.
        hashinator: Hashinator,
    },

    /// Enable or disable maintenance of the named views.
    ViewMaintenance {
        /// Views to flip.
        views: Vec<String>,
        /// Target state.
        enabled: bool,
    },

    /// Load a replicated table from the save file on this site's host.
    LoadReplicatedFile {
        /// Table to load.
        table: String,
        /// Path of the local save file.
        path: PathBuf,
        /// Restore vs recover semantics.
        mode: RestoreMode,
    },

    /// Read assigned save files and fan their chunks out to loader sites.
    Distribute(DistributeSpec),

    /// Leaf: load one batch into a replicated table at this site.
    LoadReplicated {
        /// Table to load into.
        table: String,
        /// The rows.
        batch: RowBatch,
        /// Restore vs recover semantics.
        mode: RestoreMode,
    },

    /// Leaf: load one batch into one partition at this site.
    LoadPartitioned {
        /// Table to load into.
        table: String,
        /// Destination partition.
        partition: PartitionId,
        /// The rows.
        batch: RowBatch,
        /// Restore vs recover semantics.
        mode: RestoreMode,
    },
}

impl WorkPayload {
    /// Whether this payload is a leaf load, the only kind a site may
    /// execute while it is itself mid-distribution.
    pub fn is_leaf(&self) -> bool {
        matches!(
            self,
            WorkPayload::LoadReplicated { .. } | WorkPayload::LoadPartitioned { .. }
        )
    }
}

/// One addressed, parameterized unit of distributed work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Correlates the unit with its result.
    pub dependency_id: DependencyId,
    /// Channel the result must be sent to.
    pub reply_to: ChannelId,
    /// The operation.
    pub payload: WorkPayload,
}

/// The result of one work unit, keyed by its dependency id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkResult {
    /// Dependency id of the completed unit.
    pub dependency_id: DependencyId,
    /// Fragment-level result rows. Empty for observer-only units.
    pub rows: Vec<RestoreResultRow>,
}

/// Everything that travels over restore channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Coordinator → every control channel: a session is starting.
    SessionAnnounce {
        /// The new session's id.
        session: SessionId,
        /// Channel the coordinator listens on.
        coordinator: ChannelId,
    },

    /// Site → coordinator: here is my ephemeral session channel.
    SessionJoin {
        /// The joining site.
        site: SiteId,
        /// Its session channel.
        channel: ChannelId,
    },

    /// Coordinator → every session channel: the complete site→channel map.
    ChannelMap {
        /// Session this map belongs to.
        session: SessionId,
        /// Real-site-id → channel-id, complete for the session.
        map: BTreeMap<SiteId, ChannelId>,
    },

    /// Site → coordinator: map installed.
    MapAck {
        /// The acknowledging site.
        site: SiteId,
    },

    /// A work unit, coordinator → site or distributor → loader site.
    Work(WorkUnit),

    /// A work unit's result.
    Result(WorkResult),

    /// A site detected a protocol violation and is abandoning the session.
    Violation {
        /// The reporting site.
        site: SiteId,
        /// What it saw.
        reason: String,
    },

    /// Coordinator → every session channel: the session is over.
    Terminate,

    /// Coordinator → control channel: inventory the snapshot directory.
    ScanRequest {
        /// Snapshot directory to scan.
        dir: PathBuf,
        /// Snapshot nonce.
        nonce: String,
        /// Channel to send the [`Message::ScanResponse`] to.
        reply_to: ChannelId,
    },

    /// Site → coordinator: scan results (empty for all but the designated
    /// site per host).
    ScanResponse {
        /// The responding site.
        site: SiteId,
        /// Host the site runs on.
        host: HostId,
        /// What the scan found.
        scan: NodeScan,
    },

    /// Control-plane request to stop a site agent (shutdown path, not part
    /// of any session).
    AgentShutdown,
}

impl Message {
    /// Encodes this message for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Codec`] if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        codec::encode(self).map_err(|source| ProtocolError::Codec { source })
    }

    /// Decodes a wire payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Codec`] if the payload is not a valid
    /// message.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        codec::decode(bytes).map_err(|source| ProtocolError::Codec { source })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_round_trip() {
        let msg = Message::SessionJoin { site: 3, channel: 42 };
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_work_unit_round_trip() {
        let unit = WorkUnit {
            dependency_id: 17,
            reply_to: 5,
            payload: WorkPayload::ViewMaintenance {
                views: vec!["v_orders".into()],
                enabled: false,
            },
        };
        let msg = Message::Work(unit.clone());
        match Message::decode(&msg.encode().unwrap()).unwrap() {
            Message::Work(decoded) => assert_eq!(decoded, unit),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_leaf_classification() {
        let leaf = WorkPayload::LoadPartitioned {
            table: "t".into(),
            partition: 0,
            batch: RowBatch::new(vec![]),
            mode: RestoreMode::Restore,
        };
        assert!(leaf.is_leaf());
        let non_leaf = WorkPayload::ViewMaintenance { views: vec![], enabled: true };
        assert!(!non_leaf.is_leaf());
    }
}
