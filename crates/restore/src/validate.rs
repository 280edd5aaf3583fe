//! Cluster-wide consistency validation of a scanned snapshot.
//!
//! Scan rows from every node are unioned centrally and checked before any
//! data is loaded. Loading is all-or-nothing at this stage: a table whose
//! complete files do not cover every expected partition aborts the whole
//! restore, independent of later per-row load outcomes. Hashinator
//! reconciliation runs alongside as a narrower version of the same
//! gather-then-decide pattern.

use std::collections::{BTreeMap, BTreeSet};

use snafu::{ResultExt, Snafu};
use stratadb_savefile::{
    hashinator::reconcile, DigestDocument, DigestError, DigestSet, Hashinator, HashinatorError,
    NodeScan, ScanRow, ScanWarning,
};
use stratadb_types::{ClusterInstanceId, PartitionId};
use tracing::{debug, info};

/// Errors fatal to validation; every one aborts the restore before any load
/// begins.
#[derive(Debug, Snafu)]
pub enum ValidationError {
    /// Digest merge failed (missing digests, txn id or instance mismatch).
    #[snafu(display("Digest validation failed: {source}"))]
    Digest {
        /// The underlying digest error.
        source: DigestError,
    },

    /// Hashinator reconciliation failed.
    #[snafu(display("Hashinator reconciliation failed: {source}"))]
    Hashinator {
        /// The underlying hashinator error.
        source: HashinatorError,
    },

    /// A table named by the digest has no scanned data anywhere in the
    /// cluster.
    #[snafu(display("Save data contains no information for table {table}"))]
    MissingTable {
        /// The missing table.
        table: String,
    },

    /// A table's complete files do not cover every expected partition.
    #[snafu(display("Save data for table {table} is missing partitions {missing:?}"))]
    IncompletePartitions {
        /// The inconsistent table.
        table: String,
        /// Expected partitions with no complete data.
        missing: Vec<PartitionId>,
    },
}

/// Result type for validation.
pub type Result<T> = std::result::Result<T, ValidationError>;

/// The union of every node's scan results.
#[derive(Debug, Default)]
pub struct ClusterScanState {
    /// All save-file rows observed anywhere.
    pub rows: Vec<ScanRow>,
    /// All scan warnings observed anywhere.
    pub warnings: Vec<ScanWarning>,
    /// All digests observed anywhere.
    pub digests: Vec<DigestDocument>,
    /// All hashinator copies observed anywhere.
    pub hashinators: Vec<Hashinator>,
}

impl ClusterScanState {
    /// Unions per-node scans into one cluster-wide state.
    pub fn union(scans: impl IntoIterator<Item = NodeScan>) -> Self {
        let mut state = Self::default();
        for scan in scans {
            state.rows.extend(scan.rows);
            state.warnings.extend(scan.warnings);
            state.digests.extend(scan.digests);
            state.hashinators.extend(scan.hashinators);
        }
        state
    }

    /// Complete save-file rows for one table, in deterministic order.
    pub fn complete_rows_for(&self, table: &str) -> Vec<ScanRow> {
        let mut rows: Vec<ScanRow> =
            self.rows.iter().filter(|r| r.complete && r.table == table).cloned().collect();
        rows.sort_by(|a, b| {
            (a.source_host, a.scanning_host, &a.path).cmp(&(b.source_host, b.scanning_host, &b.path))
        });
        rows
    }
}

/// A snapshot that passed every validation rule and may be loaded.
#[derive(Debug)]
pub struct ValidatedSnapshot {
    /// The merged digest superset.
    pub digest: DigestSet,
    /// The reconciled partitioning function stored with the snapshot.
    pub saved_hashinator: Hashinator,
    /// Complete save-file rows per digest table.
    pub table_files: BTreeMap<String, Vec<ScanRow>>,
}

/// Validates a scanned snapshot against the rules in force before any load:
///
/// 1. Every digest's transaction id equals the first one observed, and all
///    digests carry the same cluster instance identity (checked during the
///    merge).
/// 2. Every table referenced by any digest has scanned data somewhere.
/// 3. For every partitioned table, the union of partition ids reported by
///    complete files equals the digest's full partition set. Replicated
///    tables need at least one complete copy.
///
/// Hashinator copies are reconciled against the running cluster's instance
/// identity regardless of whether the hashinator will be installed.
///
/// # Errors
///
/// Every [`ValidationError`] is fatal for the whole restore.
pub fn validate(
    scan: &ClusterScanState,
    current_instance: ClusterInstanceId,
) -> Result<ValidatedSnapshot> {
    let digest = DigestSet::merge(&scan.digests).context(DigestSnafu)?;
    let saved_hashinator =
        reconcile(&scan.hashinators, current_instance).context(HashinatorSnafu)?;

    let expected = digest.expected_partitions();
    let mut table_files = BTreeMap::new();

    for table in &digest.tables {
        let rows = scan.complete_rows_for(table);
        if rows.is_empty() {
            return Err(ValidationError::MissingTable { table: table.clone() });
        }

        let replicated = rows[0].replicated;
        if !replicated {
            let covered: BTreeSet<PartitionId> =
                rows.iter().flat_map(|r| r.partition_ids.iter().copied()).collect();
            let missing: Vec<PartitionId> =
                expected.difference(&covered).copied().collect();
            if !missing.is_empty() {
                return Err(ValidationError::IncompletePartitions {
                    table: table.clone(),
                    missing,
                });
            }
        }

        debug!(table, files = rows.len(), replicated, "table validated");
        table_files.insert(table.clone(), rows);
    }

    info!(
        txn_id = digest.txn_id,
        tables = table_files.len(),
        partitions = digest.partition_count,
        hashinator_version = saved_hashinator.version,
        "snapshot validated"
    );
    Ok(ValidatedSnapshot { digest, saved_hashinator, table_files })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use std::collections::BTreeMap as Map;
    use std::path::PathBuf;

    use chrono::Utc;
    use stratadb_types::HostId;
    use uuid::Uuid;

    use super::*;

    fn digest_doc(host: HostId, instance: ClusterInstanceId, tables: &[&str]) -> DigestDocument {
        DigestDocument {
            txn_id: 500,
            cluster_create_time: Utc::now(),
            instance_id: instance,
            host_id: host,
            tables: tables.iter().map(|t| t.to_string()).collect(),
            sequences: Map::new(),
            partition_txn_ids: Map::new(),
            hashinator_version: 1,
            partition_count: 2,
        }
    }

    fn scan_row(table: &str, host: HostId, partitions: Vec<PartitionId>, complete: bool) -> ScanRow {
        ScanRow {
            scanning_host: host,
            source_host: host,
            table: table.to_string(),
            replicated: partitions.is_empty(),
            partition_ids: partitions,
            total_partitions: 2,
            complete,
            path: PathBuf::from(format!("/snap/{table}-host_{host}.sav")),
        }
    }

    fn base_state(instance: ClusterInstanceId) -> ClusterScanState {
        ClusterScanState {
            rows: vec![scan_row("orders", 0, vec![0], true), scan_row("orders", 1, vec![1], true)],
            warnings: vec![],
            digests: vec![digest_doc(0, instance, &["orders"]), digest_doc(1, instance, &["orders"])],
            hashinators: vec![Hashinator::modulo(1, instance, 2)],
        }
    }

    #[test]
    fn test_consistent_snapshot_validates() {
        let instance = Uuid::new_v4();
        let validated = validate(&base_state(instance), instance).unwrap();
        assert_eq!(validated.digest.txn_id, 500);
        assert_eq!(validated.table_files["orders"].len(), 2);
    }

    #[test]
    fn test_digest_table_without_data_aborts() {
        let instance = Uuid::new_v4();
        let mut state = base_state(instance);
        state.digests[0].tables.push("ghost".to_string());
        let err = validate(&state, instance).unwrap_err();
        assert!(matches!(err, ValidationError::MissingTable { table } if table == "ghost"));
    }

    #[test]
    fn test_incomplete_partition_coverage_aborts() {
        let instance = Uuid::new_v4();
        let mut state = base_state(instance);
        // Partition 1's only file is incomplete.
        state.rows[1].complete = false;
        let err = validate(&state, instance).unwrap_err();
        assert!(
            matches!(err, ValidationError::IncompletePartitions { ref missing, .. } if missing == &[1])
        );
    }

    #[test]
    fn test_txn_id_mismatch_aborts() {
        let instance = Uuid::new_v4();
        let mut state = base_state(instance);
        state.digests[1].txn_id = 501;
        assert!(matches!(validate(&state, instance), Err(ValidationError::Digest { .. })));
    }

    #[test]
    fn test_foreign_hashinator_aborts() {
        let instance = Uuid::new_v4();
        let mut state = base_state(instance);
        state.hashinators = vec![Hashinator::modulo(1, Uuid::new_v4(), 2)];
        assert!(matches!(validate(&state, instance), Err(ValidationError::Hashinator { .. })));
    }

    #[test]
    fn test_replicated_table_needs_one_complete_copy() {
        let instance = Uuid::new_v4();
        let mut state = base_state(instance);
        state.digests[0].tables.push("settings".to_string());
        state.rows.push(scan_row("settings", 0, vec![], false));
        assert!(matches!(
            validate(&state, instance),
            Err(ValidationError::MissingTable { .. })
        ));

        state.rows.push(scan_row("settings", 1, vec![], true));
        validate(&state, instance).unwrap();
    }
}
