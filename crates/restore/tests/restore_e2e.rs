//! End-to-end restore scenarios over an in-process mock cluster.
//!
//! Each test builds a real snapshot on disk (save files, digests,
//! hashinator copies), spins up site agents for a multi-host topology, and
//! drives a full restore through the work-channel protocol, asserting on
//! the rows that actually landed in each site's storage.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use stratadb_restore::gate::DuplicateSink;
use stratadb_restore::mock::MockCluster;
use stratadb_restore::watermark;
use stratadb_restore::{
    CatalogGate, RestoreError, RestoreManager, RestoreMode, RestoreRequest, ResultStatus,
};
use stratadb_savefile::{
    digest::write_digest, hashinator::write_hashinator, save_file_name, DigestDocument,
    Hashinator, SaveFileHeader, SaveFileWriter, SequencePair,
};
use stratadb_types::{
    ClusterInstanceId, Column, ColumnType, HostId, PartitionId, RestoreConfig, RowBatch,
    TableSchema, TxnId, Value,
};

const NONCE: &str = "nightly";
const TXN_ID: TxnId = 7000;

// ============================================================================
// Snapshot fixtures
// ============================================================================

fn orders_columns() -> Vec<Column> {
    vec![Column::new("k", ColumnType::I64), Column::new("v", ColumnType::Str)]
}

fn orders_row(k: i64) -> Vec<Value> {
    vec![Value::I64(k), Value::Str(format!("order-{k}"))]
}

/// Writes one partitioned save file holding one chunk per partition, with
/// one row per partition whose key equals the partition id (so a modulo
/// hashinator at the saved partition count reproduces the layout).
fn write_partitioned_file(
    dir: &Path,
    instance: ClusterInstanceId,
    table: &str,
    source_host: HostId,
    partitions: &[PartitionId],
    total_partitions: u32,
) {
    let header = SaveFileHeader {
        table: table.to_string(),
        is_replicated: false,
        partition_ids: partitions.to_vec(),
        total_partitions,
        source_host,
        cluster_instance: instance,
        txn_id: TXN_ID,
    };
    let path = dir.join(save_file_name(NONCE, table, Some(source_host)));
    let mut writer = SaveFileWriter::create(&path, &header).unwrap();
    for partition in partitions {
        let mut batch = RowBatch::new(orders_columns());
        batch.push_row(orders_row(i64::from(*partition))).unwrap();
        writer.write_chunk(Some(*partition), &batch).unwrap();
    }
    writer.finish().unwrap();
}

/// Writes one replicated save file with the given keys.
fn write_replicated_file(
    dir: &Path,
    instance: ClusterInstanceId,
    table: &str,
    source_host: HostId,
    keys: &[i64],
) {
    let header = SaveFileHeader {
        table: table.to_string(),
        is_replicated: true,
        partition_ids: Vec::new(),
        total_partitions: 0,
        source_host,
        cluster_instance: instance,
        txn_id: TXN_ID,
    };
    let path = dir.join(save_file_name(NONCE, table, Some(source_host)));
    let mut writer = SaveFileWriter::create(&path, &header).unwrap();
    let mut batch = RowBatch::new(orders_columns());
    for k in keys {
        batch.push_row(orders_row(*k)).unwrap();
    }
    writer.write_chunk(None, &batch).unwrap();
    writer.finish().unwrap();
}

/// Writes per-host digests plus hashinator copies for a snapshot taken at
/// `saved_partitions`.
fn write_metadata(
    dir: &Path,
    instance: ClusterInstanceId,
    hosts: &[HostId],
    tables: &[&str],
    saved_partitions: u32,
) {
    for host in hosts {
        let mut sequences = BTreeMap::new();
        let mut partition_txn_ids = BTreeMap::new();
        for table in tables {
            let per_partition: BTreeMap<PartitionId, SequencePair> = (0..saved_partitions)
                .map(|p| {
                    (p, SequencePair { export_seq: 10 + u64::from(p), replication_seq: 1 })
                })
                .collect();
            sequences.insert(table.to_string(), per_partition);
        }
        for p in 0..saved_partitions {
            partition_txn_ids.insert(p, TXN_ID + u64::from(p));
        }

        write_digest(
            dir,
            NONCE,
            &DigestDocument {
                txn_id: TXN_ID,
                cluster_create_time: Utc::now(),
                instance_id: instance,
                host_id: *host,
                tables: tables.iter().map(|t| t.to_string()).collect(),
                sequences,
                partition_txn_ids,
                hashinator_version: 1,
                partition_count: saved_partitions,
            },
        )
        .unwrap();

        let mut hashinator = Hashinator::modulo(1, instance, saved_partitions);
        hashinator.source_host = *host;
        write_hashinator(dir, NONCE, &hashinator).unwrap();
    }
}

fn test_config(base: &Path) -> RestoreConfig {
    init_tracing();
    RestoreConfig {
        poll_interval_ms: 10,
        duplicate_sink_dir: base.join("duplicates"),
        ..RestoreConfig::default()
    }
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn manager(cluster: &MockCluster, config: RestoreConfig) -> RestoreManager {
    RestoreManager::new(
        cluster.link.clone(),
        cluster.catalog.clone(),
        cluster.counters.clone(),
        config,
    )
    .unwrap()
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_restore_same_layout_routes_chunks_directly() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let cluster = MockCluster::start(2, 2, 4, &config).unwrap();
    let instance = cluster.shared.instance();

    cluster.add_table(
        TableSchema::partitioned("orders", orders_columns(), 0).unwrap(),
        None,
    );
    write_partitioned_file(dir.path(), instance, "orders", 0, &[0, 1], 4);
    write_partitioned_file(dir.path(), instance, "orders", 1, &[2, 3], 4);
    write_metadata(dir.path(), instance, &[0, 1], &["orders"], 4);

    let report = manager(&cluster, config)
        .restore_blocking(RestoreRequest::new(dir.path(), NONCE))
        .unwrap();

    assert!(report.succeeded(), "rows: {:?}", report.rows);
    assert_eq!(report.txn_id, TXN_ID);
    assert!(report.warnings.is_empty());

    // Every partition's single row landed on the site that owns it.
    for partition in 0..4u32 {
        let owner = cluster.owner_of(partition).unwrap();
        let rows = cluster.catalogs[&owner].rows_in("orders", Some(partition));
        assert_eq!(rows.len(), 1, "partition {partition}");
        assert_eq!(rows[0][0], Value::I64(i64::from(partition)));
    }

    // Sequence numbers were installed on each owning site.
    for partition in 0..4u32 {
        let owner = cluster.owner_of(partition).unwrap();
        let pair = cluster.catalogs[&owner].sequence_numbers("orders", partition).unwrap();
        assert_eq!(pair.export_seq, 10 + u64::from(partition));
    }

    cluster.shutdown();
}

#[test]
fn test_restore_onto_smaller_cluster_rehashes_every_row() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    // Snapshot was taken at 4 partitions; this cluster runs 2.
    let cluster = MockCluster::start(2, 1, 2, &config).unwrap();
    let instance = cluster.shared.instance();

    cluster.add_table(
        TableSchema::partitioned("orders", orders_columns(), 0).unwrap(),
        None,
    );
    write_partitioned_file(dir.path(), instance, "orders", 0, &[0, 1], 4);
    write_partitioned_file(dir.path(), instance, "orders", 1, &[2, 3], 4);
    write_metadata(dir.path(), instance, &[0, 1], &["orders"], 4);

    let report = manager(&cluster, config)
        .restore_blocking(RestoreRequest::new(dir.path(), NONCE))
        .unwrap();
    assert!(report.succeeded(), "rows: {:?}", report.rows);

    // Four rows total, each on the partition the current hashinator maps
    // its key to: keys 0,2 → partition 0; keys 1,3 → partition 1.
    let total: usize = cluster
        .catalogs
        .values()
        .map(|c| c.total_rows("orders"))
        .sum();
    assert_eq!(total, 4);

    for (partition, expected_keys) in [(0u32, vec![0i64, 2]), (1, vec![1, 3])] {
        let owner = cluster.owner_of(partition).unwrap();
        let mut keys: Vec<i64> = cluster.catalogs[&owner]
            .rows_in("orders", Some(partition))
            .iter()
            .map(|r| match &r[0] {
                Value::I64(k) => *k,
                other => panic!("unexpected cell {other:?}"),
            })
            .collect();
        keys.sort_unstable();
        assert_eq!(keys, expected_keys, "partition {partition}");
    }

    // Watermarks cover the saved partitions and never regressed.
    let marks = watermark::read(cluster.counters.as_ref()).unwrap();
    assert_eq!(marks[&0], TXN_ID);
    assert_eq!(marks[&3], TXN_ID + 3);

    cluster.shutdown();
}

#[test]
fn test_replicated_table_loads_locally_on_every_site() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let cluster = MockCluster::start(2, 1, 2, &config).unwrap();
    let instance = cluster.shared.instance();

    cluster.add_table(TableSchema::replicated("settings", orders_columns()), None);
    // Every host carries a complete copy, as the save path produces.
    write_replicated_file(dir.path(), instance, "settings", 0, &[10, 11, 12]);
    write_replicated_file(dir.path(), instance, "settings", 1, &[10, 11, 12]);
    write_metadata(dir.path(), instance, &[0, 1], &["settings"], 2);

    let report = manager(&cluster, config)
        .restore_blocking(RestoreRequest::new(dir.path(), NONCE))
        .unwrap();
    assert!(report.succeeded(), "rows: {:?}", report.rows);

    // Each site holds its own full copy.
    for catalog in cluster.catalogs.values() {
        assert_eq!(catalog.rows_in("settings", None).len(), 3);
    }

    cluster.shutdown();
}

#[test]
fn test_recover_mode_routes_duplicates_to_sink() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let cluster = MockCluster::start(1, 1, 1, &config).unwrap();
    let instance = cluster.shared.instance();

    cluster.add_table(
        TableSchema::partitioned("orders", orders_columns(), 0).unwrap(),
        Some(0),
    );
    write_partitioned_file(dir.path(), instance, "orders", 0, &[0], 1);
    write_metadata(dir.path(), instance, &[0], &["orders"], 1);

    // Replay already applied this row once.
    let owner = cluster.owner_of(0).unwrap();
    let mut preloaded = RowBatch::new(orders_columns());
    preloaded.push_row(orders_row(0)).unwrap();
    cluster.catalogs[&owner].load_rows("orders", Some(0), &preloaded).unwrap();

    let mut request = RestoreRequest::new(dir.path(), NONCE);
    request.mode = RestoreMode::Recover;
    let report = manager(&cluster, config.clone()).restore_blocking(request).unwrap();

    // The duplicate does not fail the load, and exactly one record landed
    // in the sink for that table.
    assert!(report.succeeded(), "rows: {:?}", report.rows);
    let sink =
        DuplicateSink::new(config.duplicate_sink_dir.join(format!("site_{owner}"))).unwrap();
    let records = sink.read_all("orders").unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].len(), 1);
    assert_eq!(records[0].rows[0][0], Value::I64(0));

    cluster.shutdown();
}

#[test]
fn test_restore_mode_duplicate_degrades_partition_to_failure() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let cluster = MockCluster::start(1, 2, 2, &config).unwrap();
    let instance = cluster.shared.instance();

    cluster.add_table(
        TableSchema::partitioned("orders", orders_columns(), 0).unwrap(),
        Some(0),
    );
    write_partitioned_file(dir.path(), instance, "orders", 0, &[0, 1], 2);
    write_metadata(dir.path(), instance, &[0], &["orders"], 2);

    // Partition 0 already holds its row; partition 1 is clean.
    let owner = cluster.owner_of(0).unwrap();
    let mut preloaded = RowBatch::new(orders_columns());
    preloaded.push_row(orders_row(0)).unwrap();
    cluster.catalogs[&owner].load_rows("orders", Some(0), &preloaded).unwrap();

    let report = manager(&cluster, config)
        .restore_blocking(RestoreRequest::new(dir.path(), NONCE))
        .unwrap();

    // The violating partition failed, its sibling did not.
    assert!(!report.succeeded());
    let failed: Vec<_> = report
        .rows
        .iter()
        .filter(|r| r.status == ResultStatus::Failure)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].partition, Some(0));
    let clean_owner = cluster.owner_of(1).unwrap();
    assert_eq!(cluster.catalogs[&clean_owner].rows_in("orders", Some(1)).len(), 1);

    cluster.shutdown();
}

#[test]
fn test_missing_table_data_aborts_before_any_load() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let cluster = MockCluster::start(1, 1, 2, &config).unwrap();
    let instance = cluster.shared.instance();

    cluster.add_table(
        TableSchema::partitioned("orders", orders_columns(), 0).unwrap(),
        None,
    );
    // Digest names "orders" but no save file exists for it.
    write_metadata(dir.path(), instance, &[0], &["orders"], 2);

    let err = manager(&cluster, config)
        .restore_blocking(RestoreRequest::new(dir.path(), NONCE))
        .unwrap_err();
    assert!(matches!(err, RestoreError::Validation { .. }));
    assert_eq!(cluster.catalogs.values().map(|c| c.total_rows("orders")).sum::<usize>(), 0);

    cluster.shutdown();
}

#[test]
fn test_second_restore_requires_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let cluster = MockCluster::start(1, 1, 1, &config).unwrap();
    let instance = cluster.shared.instance();

    cluster.add_table(
        TableSchema::partitioned("orders", orders_columns(), 0).unwrap(),
        None,
    );
    write_partitioned_file(dir.path(), instance, "orders", 0, &[0], 1);
    write_metadata(dir.path(), instance, &[0], &["orders"], 1);

    let mgr = manager(&cluster, config);
    mgr.restore_blocking(RestoreRequest::new(dir.path(), NONCE)).unwrap();
    let err = mgr.restore_blocking(RestoreRequest::new(dir.path(), NONCE)).unwrap_err();
    assert!(matches!(err, RestoreError::AlreadyRestored));

    cluster.shutdown();
}

#[test]
fn test_view_maintenance_reenabled_even_after_load_failure() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let cluster = MockCluster::start(1, 1, 1, &config).unwrap();
    let instance = cluster.shared.instance();

    cluster.add_table(
        TableSchema::partitioned("orders", orders_columns(), 0).unwrap(),
        Some(0),
    );
    cluster.catalog.add_view("v_orders_by_day", "orders");
    write_partitioned_file(dir.path(), instance, "orders", 0, &[0], 1);
    write_metadata(dir.path(), instance, &[0], &["orders"], 1);

    // Force a load failure through a pre-existing duplicate.
    let owner = cluster.owner_of(0).unwrap();
    let mut preloaded = RowBatch::new(orders_columns());
    preloaded.push_row(orders_row(0)).unwrap();
    cluster.catalogs[&owner].load_rows("orders", Some(0), &preloaded).unwrap();

    let report = manager(&cluster, config)
        .restore_blocking(RestoreRequest::new(dir.path(), NONCE))
        .unwrap();
    assert!(!report.succeeded());
    assert_eq!(
        cluster.catalog.view_maintenance_enabled("v_orders_by_day"),
        Some(true),
        "view maintenance must never stay suspended"
    );

    cluster.shutdown();
}

#[test]
fn test_exclude_filter_skips_table() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let cluster = MockCluster::start(1, 1, 1, &config).unwrap();
    let instance = cluster.shared.instance();

    cluster.add_table(
        TableSchema::partitioned("orders", orders_columns(), 0).unwrap(),
        None,
    );
    cluster.add_table(
        TableSchema::partitioned("audit", orders_columns(), 0).unwrap(),
        None,
    );
    write_partitioned_file(dir.path(), instance, "orders", 0, &[0], 1);
    write_partitioned_file(dir.path(), instance, "audit", 0, &[0], 1);
    write_metadata(dir.path(), instance, &[0], &["orders", "audit"], 1);

    let mut request = RestoreRequest::new(dir.path(), NONCE);
    request.exclude_tables = vec!["audit".to_string()];
    let report = manager(&cluster, config).restore_blocking(request).unwrap();

    assert!(report.succeeded());
    let owner = cluster.owner_of(0).unwrap();
    assert_eq!(cluster.catalogs[&owner].total_rows("orders"), 1);
    assert_eq!(cluster.catalogs[&owner].total_rows("audit"), 0);

    cluster.shutdown();
}

#[tokio::test]
async fn test_async_entry_point_parks_caller_on_worker_thread() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let cluster = MockCluster::start(1, 1, 1, &config).unwrap();
    let instance = cluster.shared.instance();

    cluster.add_table(
        TableSchema::partitioned("orders", orders_columns(), 0).unwrap(),
        None,
    );
    write_partitioned_file(dir.path(), instance, "orders", 0, &[0], 1);
    write_metadata(dir.path(), instance, &[0], &["orders"], 1);

    let report = manager(&cluster, config)
        .restore(RestoreRequest::new(dir.path(), NONCE))
        .await
        .unwrap();
    assert!(report.succeeded());

    cluster.shutdown();
}
