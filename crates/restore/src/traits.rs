//! Interfaces to the restore engine's external collaborators.
//!
//! The engine never talks to the catalog, the cluster substrate, or the
//! metadata directory directly; it consumes the three traits defined here.
//! Production wires them to the storage engine, the membership/RPC layer,
//! and the coordination directory respectively; tests wire them to the
//! in-memory implementations in [`crate::mock`].

use std::time::Duration;

use snafu::Snafu;
use stratadb_savefile::{Hashinator, SequencePair};
use stratadb_types::{ClusterInstanceId, HostId, PartitionId, RowBatch, SiteId, TableSchema};

/// Identifier of an addressable channel created through [`ClusterLink`].
pub type ChannelId = u64;

/// One execution site as reported by the membership layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteInfo {
    /// The site's cluster-wide id.
    pub site: SiteId,
    /// Host the site runs on.
    pub host: HostId,
    /// Partition the site owns, `None` for sites without partition
    /// ownership.
    pub partition: Option<PartitionId>,
}

/// Errors surfaced by the membership/RPC substrate.
#[derive(Debug, Snafu)]
pub enum LinkError {
    /// A payload was addressed to a channel that no longer exists.
    #[snafu(display("Channel {channel} is gone"))]
    ChannelGone {
        /// The missing channel.
        channel: ChannelId,
    },

    /// The substrate failed to move a payload.
    #[snafu(display("Transport failure: {message}"))]
    Transport {
        /// Substrate-specific description.
        message: String,
    },
}

/// Errors surfaced by the storage/catalog layer.
#[derive(Debug, Snafu)]
pub enum GateError {
    /// The named table does not exist in the current catalog.
    #[snafu(display("No such table: {table}"))]
    NoSuchTable {
        /// The missing table.
        table: String,
    },

    /// The storage engine rejected the operation.
    #[snafu(display("Storage failure on {table}: {message}"))]
    Storage {
        /// Table involved.
        table: String,
        /// Engine-specific description.
        message: String,
    },
}

/// Errors surfaced by the coordination/metadata directory.
#[derive(Debug, Snafu)]
pub enum StoreError {
    /// The document's version changed since it was read; re-read and retry.
    #[snafu(display("Version conflict on {key}: expected {expected}"))]
    VersionConflict {
        /// Document key.
        key: String,
        /// The version the writer expected.
        expected: u64,
    },

    /// The directory service failed.
    #[snafu(display("Directory failure: {message}"))]
    Directory {
        /// Service-specific description.
        message: String,
    },
}

/// A receive endpoint for one addressable channel.
///
/// Channels never expire on their own: the only ways out of a receive loop
/// are a message, the bounded poll interval elapsing (returning `None`), or
/// the channel's owner dropping it.
pub trait WorkChannel: Send {
    /// The channel's cluster-routable id.
    fn id(&self) -> ChannelId;

    /// Blocks up to `timeout` for the next inbound payload.
    ///
    /// Returns `Ok(None)` when the interval elapses with nothing inbound —
    /// callers treat that as "poll again", never as failure.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError`] only for substrate faults.
    fn receive_blocking(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, LinkError>;
}

/// The membership/RPC substrate, reduced to what the restore engine needs.
pub trait ClusterLink: Send + Sync {
    /// Host id of the node this handle belongs to.
    fn local_host(&self) -> HostId;

    /// Creates a fresh addressable channel owned by the caller.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError`] if the substrate cannot allocate a channel.
    fn create_channel(&self) -> Result<Box<dyn WorkChannel>, LinkError>;

    /// Sends a payload to a channel anywhere in the cluster.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError`] if the payload cannot be routed.
    fn send(&self, target: ChannelId, payload: Vec<u8>) -> Result<(), LinkError>;

    /// Sends one payload to many channels.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError`] on the first routing failure.
    fn broadcast(&self, targets: &[ChannelId], payload: Vec<u8>) -> Result<(), LinkError> {
        for target in targets {
            self.send(*target, payload.clone())?;
        }
        Ok(())
    }

    /// Registers a site's long-lived control channel with the membership
    /// directory so coordinators can discover it.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError`] if the directory rejects the advertisement.
    fn advertise_control(&self, site: SiteId, channel: ChannelId) -> Result<(), LinkError>;

    /// All advertised (site, control channel) pairs, in site order.
    fn control_channels(&self) -> Vec<(SiteId, ChannelId)>;

    /// The live site topology.
    fn topology(&self) -> Vec<SiteInfo>;
}

/// The storage/catalog layer, reduced to what the restore engine needs.
pub trait CatalogGate: Send + Sync {
    /// Looks up a table's current schema.
    fn table_by_name(&self, name: &str) -> Option<TableSchema>;

    /// Index of a table's partitioning column, `None` for replicated
    /// tables.
    fn partition_column_of(&self, table: &str) -> Option<usize>;

    /// Whether the named table is a materialized view (views are rebuilt,
    /// never loaded from a snapshot).
    fn is_materialized(&self, table: &str) -> bool;

    /// Names of materialized views maintained from the given table.
    fn dependent_views(&self, table: &str) -> Vec<String>;

    /// Partition count of the running cluster.
    fn current_partition_count(&self) -> u32;

    /// The partitioning function currently in effect.
    fn current_hashinator(&self) -> Hashinator;

    /// Identity of the running cluster instance.
    fn cluster_instance(&self) -> ClusterInstanceId;

    /// Bulk-inserts a batch.
    ///
    /// Uniqueness violations do not fail the call: the violating rows come
    /// back as `Ok(Some(batch))` and the caller decides what they mean.
    /// `Ok(None)` is a clean load.
    ///
    /// # Errors
    ///
    /// Returns [`GateError`] for structural failures only.
    fn load_rows(
        &self,
        table: &str,
        partition: Option<PartitionId>,
        batch: &RowBatch,
    ) -> Result<Option<RowBatch>, GateError>;

    /// Enables or disables maintenance of the named views, cluster-wide.
    ///
    /// # Errors
    ///
    /// Returns [`GateError`] if a named view does not exist.
    fn set_view_maintenance(&self, views: &[String], enabled: bool) -> Result<(), GateError>;

    /// Installs a reconciled hashinator as the current partitioning
    /// function.
    ///
    /// # Errors
    ///
    /// Returns [`GateError`] if the storage layer refuses it.
    fn install_hashinator(&self, hashinator: &Hashinator) -> Result<(), GateError>;

    /// Installs export/replication sequence numbers for one (table,
    /// partition).
    ///
    /// # Errors
    ///
    /// Returns [`GateError`] if the table is unknown.
    fn set_sequence_numbers(
        &self,
        table: &str,
        partition: PartitionId,
        sequences: SequencePair,
    ) -> Result<(), GateError>;
}

/// A versioned document read from the coordination directory.
#[derive(Debug, Clone)]
pub struct VersionedDocument {
    /// Raw document bytes.
    pub bytes: Vec<u8>,
    /// Version to pass back on rewrite.
    pub version: u64,
}

/// The coordination/metadata directory, reduced to a versioned document
/// store with optimistic concurrency.
pub trait CounterStore: Send + Sync {
    /// Reads a document and its version.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on directory faults; a missing document is
    /// `Ok(None)`.
    fn read(&self, key: &str) -> Result<Option<VersionedDocument>, StoreError>;

    /// Writes a document, requiring the stored version to still equal
    /// `expected_version` (`None` = create, key must not exist).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::VersionConflict`] when the document moved
    /// underneath the writer.
    fn write(
        &self,
        key: &str,
        bytes: Vec<u8>,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError>;
}
