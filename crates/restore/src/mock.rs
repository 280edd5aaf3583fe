//! In-memory implementations of the external-collaborator traits.
//!
//! These back the crate's unit and integration tests: a process-local
//! channel registry standing in for the membership/RPC substrate, a
//! per-site in-memory catalog/storage gate, and a versioned document store
//! standing in for the coordination directory. [`MockCluster`] wires a
//! whole multi-host cluster of site agents together in one process.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc, Arc,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use stratadb_savefile::{Hashinator, SequencePair};
use stratadb_types::{
    ClusterInstanceId, HostId, PartitionId, RestoreConfig, Row, RowBatch, SiteId, TableSchema,
    Value,
};
use uuid::Uuid;

use crate::agent::{AgentError, SiteAgent, SiteAgentHandle};
use crate::traits::{
    CatalogGate, ChannelId, ClusterLink, CounterStore, GateError, LinkError, SiteInfo,
    StoreError, VersionedDocument, WorkChannel,
};

// ============================================================================
// Channel registry / cluster link
// ============================================================================

/// Process-local channel registry shared by every mock link.
pub struct ChannelRegistry {
    channels: Mutex<HashMap<ChannelId, mpsc::Sender<Vec<u8>>>>,
    controls: Mutex<BTreeMap<SiteId, ChannelId>>,
    next_id: AtomicU64,
    topology: Vec<SiteInfo>,
}

impl ChannelRegistry {
    /// Creates a registry for the given topology.
    pub fn new(topology: Vec<SiteInfo>) -> Arc<Self> {
        Arc::new(Self {
            channels: Mutex::new(HashMap::new()),
            controls: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            topology,
        })
    }

    fn deregister(&self, id: ChannelId) {
        self.channels.lock().remove(&id);
    }
}

/// One node's handle to the mock substrate.
pub struct LocalClusterLink {
    host: HostId,
    registry: Arc<ChannelRegistry>,
}

impl LocalClusterLink {
    /// Creates a link for one host.
    pub fn new(host: HostId, registry: Arc<ChannelRegistry>) -> Self {
        Self { host, registry }
    }
}

/// Receive end of a mock channel; deregisters itself on drop.
struct MockChannel {
    id: ChannelId,
    rx: mpsc::Receiver<Vec<u8>>,
    registry: Arc<ChannelRegistry>,
}

impl WorkChannel for MockChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn receive_blocking(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, LinkError> {
        match self.rx.recv_timeout(timeout) {
            Ok(payload) => Ok(Some(payload)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            // All senders gone: treat like an empty poll; mock channels only
            // truly die when dropped.
            Err(mpsc::RecvTimeoutError::Disconnected) => Ok(None),
        }
    }
}

impl Drop for MockChannel {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

impl ClusterLink for LocalClusterLink {
    fn local_host(&self) -> HostId {
        self.host
    }

    fn create_channel(&self) -> Result<Box<dyn WorkChannel>, LinkError> {
        let id = self.registry.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel();
        self.registry.channels.lock().insert(id, tx);
        Ok(Box::new(MockChannel { id, rx, registry: self.registry.clone() }))
    }

    fn send(&self, target: ChannelId, payload: Vec<u8>) -> Result<(), LinkError> {
        let sender = self
            .registry
            .channels
            .lock()
            .get(&target)
            .cloned()
            .ok_or(LinkError::ChannelGone { channel: target })?;
        sender.send(payload).map_err(|_| LinkError::ChannelGone { channel: target })
    }

    fn advertise_control(&self, site: SiteId, channel: ChannelId) -> Result<(), LinkError> {
        self.registry.controls.lock().insert(site, channel);
        Ok(())
    }

    fn control_channels(&self) -> Vec<(SiteId, ChannelId)> {
        self.registry.controls.lock().iter().map(|(s, c)| (*s, *c)).collect()
    }

    fn topology(&self) -> Vec<SiteInfo> {
        self.registry.topology.clone()
    }
}

// ============================================================================
// In-memory catalog
// ============================================================================

struct TableDef {
    schema: TableSchema,
    unique_column: Option<usize>,
}

/// Catalog metadata shared by every site of a mock cluster: schemas, the
/// hashinator, view registrations, and cluster identity.
pub struct CatalogShared {
    instance: ClusterInstanceId,
    hashinator: RwLock<Hashinator>,
    tables: RwLock<BTreeMap<String, TableDef>>,
    /// view name → source table.
    views: RwLock<BTreeMap<String, String>>,
    view_enabled: RwLock<BTreeMap<String, bool>>,
}

impl CatalogShared {
    /// Creates shared metadata for a cluster of `partition_count`
    /// partitions.
    pub fn new(partition_count: u32) -> Arc<Self> {
        let instance = Uuid::new_v4();
        Arc::new(Self {
            instance,
            hashinator: RwLock::new(Hashinator::modulo(1, instance, partition_count)),
            tables: RwLock::new(BTreeMap::new()),
            views: RwLock::new(BTreeMap::new()),
            view_enabled: RwLock::new(BTreeMap::new()),
        })
    }

    /// The cluster instance identity.
    pub fn instance(&self) -> ClusterInstanceId {
        self.instance
    }
}

/// One site's storage gate over shared catalog metadata.
///
/// Row storage is per catalog instance, mirroring real sites: a replicated
/// table loaded on four sites holds one copy per site, not four copies in
/// one store.
pub struct MemoryCatalog {
    shared: Arc<CatalogShared>,
    rows: RwLock<BTreeMap<(String, Option<PartitionId>), Vec<Row>>>,
    sequences: Mutex<BTreeMap<(String, PartitionId), SequencePair>>,
}

impl MemoryCatalog {
    /// Creates a catalog with fresh shared metadata.
    pub fn new(partition_count: u32) -> Self {
        Self::with_shared(CatalogShared::new(partition_count))
    }

    /// Creates a sibling site's catalog over existing shared metadata.
    pub fn with_shared(shared: Arc<CatalogShared>) -> Self {
        Self {
            shared,
            rows: RwLock::new(BTreeMap::new()),
            sequences: Mutex::new(BTreeMap::new()),
        }
    }

    /// The shared metadata, for constructing sibling catalogs.
    pub fn shared(&self) -> Arc<CatalogShared> {
        self.shared.clone()
    }

    /// Registers a table. `unique_column` enables uniqueness checking on
    /// that column during loads.
    pub fn add_table(&self, schema: TableSchema, unique_column: Option<usize>) {
        self.shared
            .tables
            .write()
            .insert(schema.name.clone(), TableDef { schema, unique_column });
    }

    /// Registers a materialized view over a source table, with maintenance
    /// enabled.
    pub fn add_view(&self, view: impl Into<String>, source: impl Into<String>) {
        let view = view.into();
        self.shared.views.write().insert(view.clone(), source.into());
        self.shared.view_enabled.write().insert(view, true);
    }

    /// Rows loaded into one (table, partition) bucket of this site.
    pub fn rows_in(&self, table: &str, partition: Option<PartitionId>) -> Vec<Row> {
        self.rows
            .read()
            .get(&(table.to_string(), partition))
            .cloned()
            .unwrap_or_default()
    }

    /// Total rows of a table on this site, across partitions.
    pub fn total_rows(&self, table: &str) -> usize {
        self.rows
            .read()
            .iter()
            .filter(|((t, _), _)| t == table)
            .map(|(_, rows)| rows.len())
            .sum()
    }

    /// Current maintenance flag for a view.
    pub fn view_maintenance_enabled(&self, view: &str) -> Option<bool> {
        self.shared.view_enabled.read().get(view).copied()
    }

    /// Sequence numbers installed for one (table, partition) on this site.
    pub fn sequence_numbers(&self, table: &str, partition: PartitionId) -> Option<SequencePair> {
        self.sequences.lock().get(&(table.to_string(), partition)).copied()
    }
}

impl CatalogGate for MemoryCatalog {
    fn table_by_name(&self, name: &str) -> Option<TableSchema> {
        self.shared.tables.read().get(name).map(|def| def.schema.clone())
    }

    fn partition_column_of(&self, table: &str) -> Option<usize> {
        self.shared.tables.read().get(table).and_then(|def| def.schema.partition_column)
    }

    fn is_materialized(&self, table: &str) -> bool {
        self.shared.views.read().contains_key(table)
    }

    fn dependent_views(&self, table: &str) -> Vec<String> {
        self.shared
            .views
            .read()
            .iter()
            .filter(|(_, source)| source.as_str() == table)
            .map(|(view, _)| view.clone())
            .collect()
    }

    fn current_partition_count(&self) -> u32 {
        self.shared.hashinator.read().partition_count()
    }

    fn current_hashinator(&self) -> Hashinator {
        self.shared.hashinator.read().clone()
    }

    fn cluster_instance(&self) -> ClusterInstanceId {
        self.shared.instance
    }

    fn load_rows(
        &self,
        table: &str,
        partition: Option<PartitionId>,
        batch: &RowBatch,
    ) -> Result<Option<RowBatch>, GateError> {
        let unique_column = {
            let tables = self.shared.tables.read();
            let def = tables.get(table).ok_or_else(|| GateError::NoSuchTable {
                table: table.to_string(),
            })?;
            def.unique_column
        };

        let mut rows = self.rows.write();
        let bucket = rows.entry((table.to_string(), partition)).or_default();

        let mut violators: Vec<Row> = Vec::new();
        match unique_column {
            Some(col) => {
                let mut existing: Vec<Value> =
                    bucket.iter().map(|r| r[col].clone()).collect();
                for row in &batch.rows {
                    if existing.contains(&row[col]) {
                        violators.push(row.clone());
                    } else {
                        existing.push(row[col].clone());
                        bucket.push(row.clone());
                    }
                }
            }
            None => bucket.extend(batch.rows.iter().cloned()),
        }

        if violators.is_empty() {
            Ok(None)
        } else {
            Ok(Some(RowBatch { columns: batch.columns.clone(), rows: violators }))
        }
    }

    fn set_view_maintenance(&self, views: &[String], enabled: bool) -> Result<(), GateError> {
        let mut state = self.shared.view_enabled.write();
        for view in views {
            match state.get_mut(view) {
                Some(flag) => *flag = enabled,
                None => {
                    return Err(GateError::NoSuchTable { table: view.clone() });
                }
            }
        }
        Ok(())
    }

    fn install_hashinator(&self, hashinator: &Hashinator) -> Result<(), GateError> {
        *self.shared.hashinator.write() = hashinator.clone();
        Ok(())
    }

    fn set_sequence_numbers(
        &self,
        table: &str,
        partition: PartitionId,
        sequences: SequencePair,
    ) -> Result<(), GateError> {
        if !self.shared.tables.read().contains_key(table) {
            return Err(GateError::NoSuchTable { table: table.to_string() });
        }
        self.sequences.lock().insert((table.to_string(), partition), sequences);
        Ok(())
    }
}

// ============================================================================
// In-memory counter store
// ============================================================================

/// Versioned document store with optimistic concurrency.
#[derive(Default)]
pub struct MemoryCounterStore {
    docs: Mutex<HashMap<String, (Vec<u8>, u64)>>,
}

impl MemoryCounterStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CounterStore for MemoryCounterStore {
    fn read(&self, key: &str) -> Result<Option<VersionedDocument>, StoreError> {
        Ok(self
            .docs
            .lock()
            .get(key)
            .map(|(bytes, version)| VersionedDocument { bytes: bytes.clone(), version: *version }))
    }

    fn write(
        &self,
        key: &str,
        bytes: Vec<u8>,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut docs = self.docs.lock();
        match (docs.get(key).map(|(_, v)| *v), expected_version) {
            (None, None) => {
                docs.insert(key.to_string(), (bytes, 1));
                Ok(1)
            }
            (Some(current), Some(expected)) if current == expected => {
                docs.insert(key.to_string(), (bytes, current + 1));
                Ok(current + 1)
            }
            (_, expected) => Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected: expected.unwrap_or(0),
            }),
        }
    }
}

// ============================================================================
// MockCluster — a whole cluster in one process
// ============================================================================

/// A running in-process cluster: one site agent per site, per-site
/// catalogs over shared metadata, and a coordinator-side link.
pub struct MockCluster {
    /// The shared channel registry.
    pub registry: Arc<ChannelRegistry>,
    /// Shared catalog metadata.
    pub shared: Arc<CatalogShared>,
    /// Per-site catalogs, for registering tables and asserting loads.
    pub catalogs: BTreeMap<SiteId, Arc<MemoryCatalog>>,
    /// The coordination directory.
    pub counters: Arc<MemoryCounterStore>,
    /// Coordinator-side link (host 0).
    pub link: Arc<LocalClusterLink>,
    /// Coordinator-side catalog (shares metadata with every site).
    pub catalog: Arc<MemoryCatalog>,
    agents: Vec<SiteAgentHandle>,
    topology: Vec<SiteInfo>,
}

impl MockCluster {
    /// Builds the topology for `hosts` hosts with `sites_per_host` sites:
    /// site ids are `host * 100 + ordinal`, and the first `partition_count`
    /// sites in order own one partition each.
    pub fn topology(hosts: u64, sites_per_host: u64, partition_count: u32) -> Vec<SiteInfo> {
        let mut topology = Vec::new();
        let mut next_partition: PartitionId = 0;
        for host in 0..hosts {
            for ordinal in 0..sites_per_host {
                let partition = (next_partition < partition_count).then(|| {
                    let p = next_partition;
                    next_partition += 1;
                    p
                });
                topology.push(SiteInfo { site: host * 100 + ordinal, host, partition });
            }
        }
        topology
    }

    /// Registers catalogs, spawns one agent per site, and returns the
    /// running cluster.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError`] if an agent fails to start.
    pub fn start(
        hosts: u64,
        sites_per_host: u64,
        partition_count: u32,
        config: &RestoreConfig,
    ) -> Result<Self, AgentError> {
        let topology = Self::topology(hosts, sites_per_host, partition_count);
        let registry = ChannelRegistry::new(topology.clone());
        let shared = CatalogShared::new(partition_count);
        let counters = Arc::new(MemoryCounterStore::new());

        let mut catalogs = BTreeMap::new();
        let mut agents = Vec::new();
        for info in &topology {
            let catalog = Arc::new(MemoryCatalog::with_shared(shared.clone()));
            catalogs.insert(info.site, catalog.clone());

            let scans_host =
                topology.iter().filter(|i| i.host == info.host).map(|i| i.site).min()
                    == Some(info.site);
            let link: Arc<dyn ClusterLink> =
                Arc::new(LocalClusterLink::new(info.host, registry.clone()));
            agents.push(SiteAgent::spawn(link, catalog, *info, scans_host, config)?);
        }

        let link = Arc::new(LocalClusterLink::new(0, registry.clone()));
        let catalog = Arc::new(MemoryCatalog::with_shared(shared.clone()));
        Ok(Self { registry, shared, catalogs, counters, link, catalog, agents, topology })
    }

    /// The cluster topology.
    pub fn sites(&self) -> &[SiteInfo] {
        &self.topology
    }

    /// The site owning a partition.
    pub fn owner_of(&self, partition: PartitionId) -> Option<SiteId> {
        self.topology.iter().find(|i| i.partition == Some(partition)).map(|i| i.site)
    }

    /// Registers a table on every site (shared metadata, so once is
    /// enough; kept explicit for readability at call sites).
    pub fn add_table(&self, schema: TableSchema, unique_column: Option<usize>) {
        self.catalog.add_table(schema, unique_column);
    }

    /// Stops every agent and waits for their threads.
    pub fn shutdown(self) {
        for agent in self.agents {
            agent.shutdown();
        }
    }
}
