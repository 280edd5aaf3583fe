//! Per-table distribution planning and the runtime save-file pool.
//!
//! After validation, each table gets one immutable [`TablePlan`] describing
//! which of the four load modes applies and the work units it decomposes
//! into. Partition claims are issued here, once, by the coordinator: every
//! complete save file is assigned to exactly one distribute unit together
//! with the partition ids it must take from that file, so no partition's
//! data is ever read twice — even when the same partition's rows exist in
//! files on several nodes.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    path::PathBuf,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use stratadb_savefile::{Chunk, ChunkedTableFile, DigestSet, Hashinator, SaveFileError, ScanRow};
use stratadb_types::{HostId, PartitionId, SiteId, TableSchema};
use tracing::debug;

use crate::protocol::{AssignedFile, DistributeSpec, DistributeStrategy, RestoreMode, WorkPayload};
use crate::traits::SiteInfo;

/// Errors from plan construction.
#[derive(Debug, Snafu)]
pub enum PlanError {
    /// A host holding snapshot data runs no live site.
    #[snafu(display("No live site on host {host} to execute table {table}"))]
    NoSiteOnHost {
        /// The siteless host.
        host: HostId,
        /// The table being planned.
        table: String,
    },

    /// After draining every file, some partitions remained unclaimed.
    /// Validation should have caught this; reaching it here means the scan
    /// and the plan disagree, and shipping an empty partition is never
    /// acceptable.
    #[snafu(display("Partitions {missing:?} of table {table} have no assigned save file"))]
    UncoveredPartitions {
        /// The table being planned.
        table: String,
        /// Partitions with no file claim.
        missing: Vec<PartitionId>,
    },

    /// No complete save file exists for the table.
    #[snafu(display("No complete save file for table {table}"))]
    NoFiles {
        /// The table being planned.
        table: String,
    },
}

/// Result type for planning.
pub type Result<T> = std::result::Result<T, PlanError>;

/// The four save-layout → current-layout combinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadMode {
    /// Replicated when saved, replicated now.
    ReplicatedToReplicated,
    /// Replicated when saved, partitioned now: every row re-hashed.
    ReplicatedToPartitioned,
    /// Partitioned when saved, replicated now: every chunk fanned out to
    /// every site.
    PartitionedToReplicated,
    /// Partitioned when saved, partitioned now: direct routing when the
    /// layout is unchanged, re-hashing otherwise.
    PartitionedToPartitioned,
}

/// One planned work unit: the site it is addressed to and its payload.
/// Dependency ids are allocated when the unit is actually sent.
#[derive(Debug, Clone)]
pub struct PlannedUnit {
    /// Destination site.
    pub site: SiteId,
    /// The operation.
    pub payload: WorkPayload,
}

/// The immutable distribution plan for one table.
#[derive(Debug)]
pub struct TablePlan {
    /// The table.
    pub table: String,
    /// Which load mode applies.
    pub mode: LoadMode,
    /// The work units, in issue order.
    pub units: Vec<PlannedUnit>,
    /// Materialized views whose maintenance is suspended around the load.
    pub views: Vec<String>,
}

/// Lowest live site on each host, the designated worker for host-local
/// work.
fn designated_sites(topology: &[SiteInfo]) -> BTreeMap<HostId, SiteId> {
    let mut designated: BTreeMap<HostId, SiteId> = BTreeMap::new();
    for info in topology {
        designated
            .entry(info.host)
            .and_modify(|s| *s = (*s).min(info.site))
            .or_insert(info.site);
    }
    designated
}

/// Builds the distribution plan for one table.
///
/// `files` must be the table's complete scan rows; `current` is the table's
/// schema in the running catalog.
///
/// # Errors
///
/// Returns [`PlanError`] if topology and scan rows cannot be reconciled.
#[allow(clippy::too_many_arguments)]
pub fn plan_table(
    current: &TableSchema,
    saved_replicated: bool,
    files: &[ScanRow],
    digest: &DigestSet,
    current_hashinator: &Hashinator,
    topology: &[SiteInfo],
    views: Vec<String>,
    mode: RestoreMode,
) -> Result<TablePlan> {
    let table = current.name.clone();
    if files.is_empty() {
        return Err(PlanError::NoFiles { table });
    }

    let designated = designated_sites(topology);
    let site_on = |host: HostId| -> Result<SiteId> {
        designated
            .get(&host)
            .copied()
            .ok_or_else(|| PlanError::NoSiteOnHost { host, table: table.clone() })
    };

    let partition_owners: BTreeMap<PartitionId, SiteId> =
        topology.iter().filter_map(|i| i.partition.map(|p| (p, i.site))).collect();
    let all_sites: Vec<SiteId> = topology.iter().map(|i| i.site).collect();

    let load_mode = match (saved_replicated, current.is_replicated) {
        (true, true) => LoadMode::ReplicatedToReplicated,
        (true, false) => LoadMode::ReplicatedToPartitioned,
        (false, true) => LoadMode::PartitionedToReplicated,
        (false, false) => LoadMode::PartitionedToPartitioned,
    };

    let distribute = |strategy: DistributeStrategy,
                      assigned_by_host: BTreeMap<HostId, Vec<AssignedFile>>|
     -> Result<Vec<PlannedUnit>> {
        let mut units = Vec::new();
        for (host, assigned) in assigned_by_host {
            units.push(PlannedUnit {
                site: site_on(host)?,
                payload: WorkPayload::Distribute(DistributeSpec {
                    table: table.clone(),
                    assigned,
                    strategy: strategy.clone(),
                    dep_base: 0, // allocated at send time
                    partition_owners: partition_owners.clone(),
                    all_sites: all_sites.clone(),
                    mode,
                }),
            });
        }
        Ok(units)
    };

    let units = match load_mode {
        LoadMode::ReplicatedToReplicated => {
            let hosts_with_copy: BTreeSet<HostId> =
                files.iter().map(|r| r.scanning_host).collect();
            let all_hosts: BTreeSet<HostId> = topology.iter().map(|i| i.host).collect();

            if all_hosts.iter().all(|h| hosts_with_copy.contains(h)) {
                // Fast path: every host loads its local copy, every site in
                // parallel.
                let path_on: BTreeMap<HostId, PathBuf> =
                    files.iter().map(|r| (r.scanning_host, r.path.clone())).collect();
                topology
                    .iter()
                    .map(|info| {
                        Ok(PlannedUnit {
                            site: info.site,
                            payload: WorkPayload::LoadReplicatedFile {
                                table: table.clone(),
                                path: path_on[&info.host].clone(),
                                mode,
                            },
                        })
                    })
                    .collect::<Result<Vec<_>>>()?
            } else {
                // Some host lacks a copy: one site that has the file fans
                // it out to everyone.
                let source = &files[0];
                let assigned = BTreeMap::from([(
                    source.scanning_host,
                    vec![AssignedFile { path: source.path.clone(), relevant: Vec::new() }],
                )]);
                distribute(DistributeStrategy::ToReplicated, assigned)?
            }
        }

        LoadMode::ReplicatedToPartitioned => {
            let source = &files[0];
            let assigned = BTreeMap::from([(
                source.scanning_host,
                vec![AssignedFile { path: source.path.clone(), relevant: Vec::new() }],
            )]);
            distribute(
                DistributeStrategy::Rehash {
                    hashinator: current_hashinator.clone(),
                    partition_column: current.partition_column.unwrap_or(0),
                },
                assigned,
            )?
        }

        LoadMode::PartitionedToReplicated => {
            let assigned = claim_files(&table, files, digest)?;
            distribute(DistributeStrategy::ToReplicated, assigned)?
        }

        LoadMode::PartitionedToPartitioned => {
            let layout_unchanged = digest.partition_count == current_hashinator.partition_count()
                && digest.hashinator_version == current_hashinator.version;
            let strategy = if layout_unchanged {
                DistributeStrategy::Direct
            } else {
                DistributeStrategy::Rehash {
                    hashinator: current_hashinator.clone(),
                    partition_column: current.partition_column.unwrap_or(0),
                }
            };
            let assigned = claim_files(&table, files, digest)?;
            distribute(strategy, assigned)?
        }
    };

    debug!(table, ?load_mode, units = units.len(), "table plan built");
    Ok(TablePlan { table, mode: load_mode, units, views })
}

/// Issues partition claims over the pooled files, first-match, exactly
/// once, grouped by the host the file lives on.
fn claim_files(
    table: &str,
    files: &[ScanRow],
    digest: &DigestSet,
) -> Result<BTreeMap<HostId, Vec<AssignedFile>>> {
    let mut remaining = digest.expected_partitions();
    let mut assigned_by_host: BTreeMap<HostId, Vec<AssignedFile>> = BTreeMap::new();

    for row in files {
        let claimed: Vec<PartitionId> =
            row.partition_ids.iter().copied().filter(|p| remaining.contains(p)).collect();
        if claimed.is_empty() {
            continue;
        }
        for p in &claimed {
            remaining.remove(p);
        }
        assigned_by_host
            .entry(row.scanning_host)
            .or_default()
            .push(AssignedFile { path: row.path.clone(), relevant: claimed });
    }

    if !remaining.is_empty() {
        return Err(PlanError::UncoveredPartitions {
            table: table.to_string(),
            missing: remaining.into_iter().collect(),
        });
    }
    Ok(assigned_by_host)
}

// ============================================================================
// SaveFilePool — runtime draining of assigned files
// ============================================================================

/// Drains the save files assigned to one distribute unit.
///
/// The pending queue, the claimed-path set, and the currently open file
/// share one mutex, so only one path ever opens a given originating file
/// even if the executing site services the pool from more than one thread.
/// Chunks within a file come out strictly in on-disk order; across files
/// there is no ordering, only the exactly-once claim.
pub struct SaveFilePool {
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    pending: VecDeque<AssignedFile>,
    claimed_paths: BTreeSet<PathBuf>,
    open: Option<ChunkedTableFile>,
}

impl SaveFilePool {
    /// Creates a pool over the unit's assigned files.
    pub fn new(assigned: Vec<AssignedFile>) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                pending: assigned.into(),
                claimed_paths: BTreeSet::new(),
                open: None,
            }),
        }
    }

    /// Returns the next chunk across the pooled files, opening files lazily
    /// and discarding each one once drained.
    ///
    /// Per-chunk errors (checksum, decode) are returned without losing the
    /// pool's position; the caller records the failure and keeps going.
    ///
    /// # Errors
    ///
    /// Propagates [`SaveFileError`] from open and read.
    pub fn next_chunk(&self) -> std::result::Result<Option<Chunk>, SaveFileError> {
        let mut inner = self.inner.lock();
        loop {
            if inner.open.is_none() {
                let Some(next) = inner.pending.pop_front() else {
                    return Ok(None);
                };
                if !inner.claimed_paths.insert(next.path.clone()) {
                    // Already opened by an earlier claim; never read twice.
                    continue;
                }
                let relevant = (!next.relevant.is_empty())
                    .then(|| next.relevant.iter().copied().collect());
                inner.open = Some(ChunkedTableFile::open_relevant(&next.path, relevant)?);
            }

            // Borrow ends before we clear `open` below.
            match inner.open.as_mut().map(ChunkedTableFile::next_chunk) {
                Some(Ok(Some(chunk))) => return Ok(Some(chunk)),
                Some(Ok(None)) => {
                    inner.open = None; // file drained, descriptor released
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods, clippy::panic)]
mod tests {
    use std::collections::BTreeMap as Map;

    use chrono::Utc;
    use stratadb_savefile::{save_file_name, SaveFileHeader, SaveFileWriter};
    use stratadb_types::{Column, ColumnType, RowBatch, Value};
    use uuid::Uuid;

    use super::*;

    fn digest(partition_count: u32) -> DigestSet {
        DigestSet {
            txn_id: 1,
            instance_id: Uuid::new_v4(),
            cluster_create_time: Utc::now(),
            tables: BTreeSet::new(),
            sequences: Map::new(),
            partition_txn_ids: Map::new(),
            hashinator_version: 1,
            partition_count,
        }
    }

    fn row(table: &str, host: HostId, partitions: Vec<PartitionId>) -> ScanRow {
        ScanRow {
            scanning_host: host,
            source_host: host,
            table: table.to_string(),
            replicated: partitions.is_empty(),
            partition_ids: partitions,
            total_partitions: 4,
            complete: true,
            path: PathBuf::from(format!("/snap/{table}-host_{host}.sav")),
        }
    }

    fn topology_2x1() -> Vec<SiteInfo> {
        vec![
            SiteInfo { site: 10, host: 0, partition: Some(0) },
            SiteInfo { site: 11, host: 0, partition: Some(1) },
            SiteInfo { site: 20, host: 1, partition: Some(2) },
            SiteInfo { site: 21, host: 1, partition: Some(3) },
        ]
    }

    #[test]
    fn test_claims_cover_every_partition_exactly_once() {
        // Hosts 0 and 1 both carry partition 1's data (overlapping files);
        // the claim must hand it to exactly one of them.
        let files = vec![row("t", 0, vec![0, 1]), row("t", 1, vec![1, 2, 3])];
        let assigned = claim_files("t", &files, &digest(4)).unwrap();

        let mut seen: Vec<PartitionId> = assigned
            .values()
            .flatten()
            .flat_map(|a| a.relevant.iter().copied())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
        // First-match: host 0's file claimed partition 1.
        assert_eq!(assigned[&0][0].relevant, vec![0, 1]);
        assert_eq!(assigned[&1][0].relevant, vec![2, 3]);
    }

    #[test]
    fn test_uncovered_partition_is_a_hard_failure() {
        let files = vec![row("t", 0, vec![0, 1])];
        let err = claim_files("t", &files, &digest(4)).unwrap_err();
        assert!(
            matches!(err, PlanError::UncoveredPartitions { ref missing, .. } if missing == &[2, 3])
        );
    }

    #[test]
    fn test_partitioned_to_partitioned_direct_when_layout_unchanged() {
        let schema = TableSchema::partitioned(
            "t",
            vec![Column::new("k", ColumnType::I64)],
            0,
        )
        .unwrap();
        let d = digest(4);
        let h = Hashinator::modulo(1, d.instance_id, 4);
        let files = vec![row("t", 0, vec![0, 1]), row("t", 1, vec![2, 3])];
        let plan = plan_table(
            &schema,
            false,
            &files,
            &d,
            &h,
            &topology_2x1(),
            vec![],
            RestoreMode::Restore,
        )
        .unwrap();

        assert_eq!(plan.mode, LoadMode::PartitionedToPartitioned);
        assert_eq!(plan.units.len(), 2);
        for unit in &plan.units {
            match &unit.payload {
                WorkPayload::Distribute(spec) => {
                    assert_eq!(spec.strategy, DistributeStrategy::Direct)
                }
                other => panic!("unexpected payload {other:?}"),
            }
        }
    }

    #[test]
    fn test_partition_count_change_forces_rehash() {
        let schema = TableSchema::partitioned(
            "t",
            vec![Column::new("k", ColumnType::I64)],
            0,
        )
        .unwrap();
        let d = digest(4);
        // Current cluster runs 2 partitions, snapshot was taken at 4.
        let h = Hashinator::modulo(2, d.instance_id, 2);
        let topology = vec![
            SiteInfo { site: 10, host: 0, partition: Some(0) },
            SiteInfo { site: 20, host: 1, partition: Some(1) },
        ];
        let files = vec![row("t", 0, vec![0, 1]), row("t", 1, vec![2, 3])];
        let plan = plan_table(
            &schema,
            false,
            &files,
            &d,
            &h,
            &topology,
            vec![],
            RestoreMode::Restore,
        )
        .unwrap();

        for unit in &plan.units {
            match &unit.payload {
                WorkPayload::Distribute(spec) => {
                    assert!(matches!(spec.strategy, DistributeStrategy::Rehash { .. }))
                }
                other => panic!("unexpected payload {other:?}"),
            }
        }
    }

    #[test]
    fn test_replicated_fast_path_loads_locally_everywhere() {
        let schema = TableSchema::replicated("cfg", vec![Column::new("k", ColumnType::I64)]);
        let d = digest(4);
        let h = Hashinator::modulo(1, d.instance_id, 4);
        let files = vec![row("cfg", 0, vec![]), row("cfg", 1, vec![])];
        let plan = plan_table(
            &schema,
            true,
            &files,
            &d,
            &h,
            &topology_2x1(),
            vec![],
            RestoreMode::Restore,
        )
        .unwrap();

        assert_eq!(plan.mode, LoadMode::ReplicatedToReplicated);
        // One local load per site.
        assert_eq!(plan.units.len(), 4);
        assert!(plan
            .units
            .iter()
            .all(|u| matches!(u.payload, WorkPayload::LoadReplicatedFile { .. })));
    }

    #[test]
    fn test_replicated_with_missing_copy_distributes() {
        let schema = TableSchema::replicated("cfg", vec![Column::new("k", ColumnType::I64)]);
        let d = digest(4);
        let h = Hashinator::modulo(1, d.instance_id, 4);
        // Host 1 lost its copy.
        let files = vec![row("cfg", 0, vec![])];
        let plan = plan_table(
            &schema,
            true,
            &files,
            &d,
            &h,
            &topology_2x1(),
            vec![],
            RestoreMode::Restore,
        )
        .unwrap();

        assert_eq!(plan.units.len(), 1);
        match &plan.units[0].payload {
            WorkPayload::Distribute(spec) => {
                assert_eq!(spec.strategy, DistributeStrategy::ToReplicated);
                assert_eq!(plan.units[0].site, 10);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_pool_drains_files_with_exactly_once_claims() {
        let dir = tempfile::tempdir().unwrap();
        let instance = Uuid::new_v4();
        let mut paths = Vec::new();
        for (host, partitions) in [(0u64, vec![0u32, 1]), (1, vec![1, 2])] {
            let path = dir.path().join(save_file_name("snap", "t", Some(host)));
            let header = SaveFileHeader {
                table: "t".into(),
                is_replicated: false,
                partition_ids: partitions.clone(),
                total_partitions: 3,
                source_host: host,
                cluster_instance: instance,
                txn_id: 1,
            };
            let mut writer = SaveFileWriter::create(&path, &header).unwrap();
            for p in &partitions {
                let mut batch = RowBatch::new(vec![Column::new("k", ColumnType::I64)]);
                batch.push_row(vec![Value::I64(i64::from(*p))]).unwrap();
                writer.write_chunk(Some(*p), &batch).unwrap();
            }
            writer.finish().unwrap();
            paths.push(path);
        }

        // Partition 1 exists in both files; claimed from the first only.
        let pool = SaveFilePool::new(vec![
            AssignedFile { path: paths[0].clone(), relevant: vec![0, 1] },
            AssignedFile { path: paths[1].clone(), relevant: vec![2] },
        ]);

        let mut seen = Vec::new();
        while let Some(chunk) = pool.next_chunk().unwrap() {
            seen.push(chunk.partition.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
    }
}
