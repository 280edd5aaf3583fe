//! The load gate: applying restored rows to local storage.
//!
//! Uniqueness violations are data, not exceptions: the storage layer hands
//! back the violating rows and the gate decides what they mean. In restore
//! mode a violation degrades that one load attempt to a failure row without
//! touching sibling partitions. In recover mode (command-log replay after a
//! crash) duplicates are *expected* — replay reproduces rows that were
//! already applied — so violators are appended to an on-disk duplicate sink
//! and the load still counts as a success.

use std::{
    collections::{hash_map::Entry, HashMap},
    fs::{File, OpenOptions},
    io::{Read, Write},
    path::PathBuf,
    sync::Arc,
};

use parking_lot::Mutex;
use snafu::{ResultExt, Snafu};
use stratadb_types::{codec, HostId, PartitionId, RowBatch, SiteId};
use tracing::{debug, warn};

use crate::aggregate::RestoreResultRow;
use crate::protocol::RestoreMode;
use crate::traits::CatalogGate;

/// Errors from the duplicate sink.
#[derive(Debug, Snafu)]
pub enum SinkError {
    /// I/O failure on a sink file.
    #[snafu(display("Duplicate sink I/O error: {source}"))]
    Io {
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// A sink record failed to encode or decode.
    #[snafu(display("Duplicate sink codec error: {source}"))]
    Codec {
        /// The underlying codec error.
        source: stratadb_types::CodecError,
    },

    /// A sink file ended mid-record.
    #[snafu(display("Duplicate sink file truncated for table {table}"))]
    Truncated {
        /// The affected table.
        table: String,
    },
}

/// On-disk sink for duplicate rows absorbed during recover-mode loads.
///
/// One file per table (`<table>.dup`), holding length-prefixed postcard
/// row-batch records in append order. Tables restore sequentially and all
/// appends go through one mutex, so each file is append-ordered per table.
pub struct DuplicateSink {
    dir: PathBuf,
    files: Mutex<HashMap<String, File>>,
}

impl DuplicateSink {
    /// Creates a sink rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Io`] if the directory cannot be created.
    pub fn new(dir: PathBuf) -> Result<Self, SinkError> {
        std::fs::create_dir_all(&dir).context(IoSnafu)?;
        Ok(Self { dir, files: Mutex::new(HashMap::new()) })
    }

    fn sink_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{table}.dup"))
    }

    /// Appends one batch of duplicate rows for a table.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] on encode or write failure.
    pub fn append(&self, table: &str, batch: &RowBatch) -> Result<usize, SinkError> {
        let bytes = codec::encode(batch).context(CodecSnafu)?;
        let path = self.sink_path(table);
        let mut files = self.files.lock();
        let file = match files.entry(table.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .context(IoSnafu)?;
                entry.insert(file)
            }
        };
        file.write_all(&(bytes.len() as u32).to_le_bytes()).context(IoSnafu)?;
        file.write_all(&bytes).context(IoSnafu)?;
        debug!(table, rows = batch.len(), "duplicate rows routed to sink");
        Ok(batch.len())
    }

    /// Reads every record appended for a table, in append order.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the file is unreadable or corrupt.
    pub fn read_all(&self, table: &str) -> Result<Vec<RowBatch>, SinkError> {
        let path = self.sink_path(table);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut bytes = Vec::new();
        File::open(&path).context(IoSnafu)?.read_to_end(&mut bytes).context(IoSnafu)?;

        let mut records = Vec::new();
        let mut cursor = 0usize;
        while cursor < bytes.len() {
            if cursor + 4 > bytes.len() {
                return Err(SinkError::Truncated { table: table.to_string() });
            }
            let len = u32::from_le_bytes([
                bytes[cursor],
                bytes[cursor + 1],
                bytes[cursor + 2],
                bytes[cursor + 3],
            ]) as usize;
            cursor += 4;
            if cursor + len > bytes.len() {
                return Err(SinkError::Truncated { table: table.to_string() });
            }
            records.push(codec::decode(&bytes[cursor..cursor + len]).context(CodecSnafu)?);
            cursor += len;
        }
        Ok(records)
    }
}

/// Applies row batches to local storage with mode-dependent violation
/// handling.
pub struct LoadGate {
    catalog: Arc<dyn CatalogGate>,
    sink: DuplicateSink,
}

impl LoadGate {
    /// Creates a gate over the local catalog with the given duplicate sink.
    pub fn new(catalog: Arc<dyn CatalogGate>, sink: DuplicateSink) -> Self {
        Self { catalog, sink }
    }

    /// Loads one batch, reporting the outcome as a result row.
    ///
    /// Never returns an error: every outcome, including storage failure, is
    /// a per-partition result row so sibling partitions keep loading.
    pub fn load(
        &self,
        host: HostId,
        site: SiteId,
        table: &str,
        partition: Option<PartitionId>,
        batch: &RowBatch,
        mode: RestoreMode,
    ) -> RestoreResultRow {
        match self.catalog.load_rows(table, partition, batch) {
            Ok(None) => RestoreResultRow::success(host, site, table, partition),
            Ok(Some(violators)) => match mode {
                RestoreMode::Restore => {
                    warn!(table, ?partition, violators = violators.len(), "uniqueness violation");
                    RestoreResultRow::failure(
                        host,
                        site,
                        table,
                        partition,
                        format!("{} rows violated uniqueness constraints", violators.len()),
                    )
                }
                RestoreMode::Recover => match self.sink.append(table, &violators) {
                    Ok(count) => {
                        let mut row = RestoreResultRow::success(host, site, table, partition);
                        row.message = format!("{count} duplicate rows routed to sink");
                        row
                    }
                    Err(e) => RestoreResultRow::failure(
                        host,
                        site,
                        table,
                        partition,
                        format!("duplicate sink failure: {e}"),
                    ),
                },
            },
            Err(e) => RestoreResultRow::failure(
                host,
                site,
                table,
                partition,
                format!("unable to load table: {e}"),
            ),
        }
    }

    /// The sink, for post-restore inspection.
    pub fn sink(&self) -> &DuplicateSink {
        &self.sink
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use stratadb_types::{Column, ColumnType, TableSchema, Value};

    use super::*;
    use crate::aggregate::ResultStatus;
    use crate::mock::MemoryCatalog;

    fn pk_batch(keys: &[i64]) -> RowBatch {
        let mut batch = RowBatch::new(vec![Column::new("id", ColumnType::I64)]);
        for k in keys {
            batch.push_row(vec![Value::I64(*k)]).unwrap();
        }
        batch
    }

    fn catalog_with_table() -> Arc<MemoryCatalog> {
        let catalog = MemoryCatalog::new(2);
        let schema =
            TableSchema::partitioned("t", vec![Column::new("id", ColumnType::I64)], 0).unwrap();
        catalog.add_table(schema, Some(0));
        Arc::new(catalog)
    }

    fn gate(catalog: Arc<MemoryCatalog>) -> (LoadGate, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let gate = LoadGate::new(catalog, DuplicateSink::new(dir.path().join("dups")).unwrap());
        (gate, dir)
    }

    #[test]
    fn test_clean_load_succeeds() {
        let (gate, _dir) = gate(catalog_with_table());
        let row = gate.load(0, 0, "t", Some(0), &pk_batch(&[1, 2]), RestoreMode::Restore);
        assert_eq!(row.status, ResultStatus::Success);
    }

    #[test]
    fn test_restore_mode_violation_degrades_to_failure() {
        let (gate, _dir) = gate(catalog_with_table());
        gate.load(0, 0, "t", Some(0), &pk_batch(&[1]), RestoreMode::Restore);
        let row = gate.load(0, 0, "t", Some(0), &pk_batch(&[1, 2]), RestoreMode::Restore);
        assert_eq!(row.status, ResultStatus::Failure);
        assert!(row.message.contains("1 rows violated"));
    }

    #[test]
    fn test_recover_mode_routes_duplicates_to_sink() {
        let (gate, _dir) = gate(catalog_with_table());
        gate.load(0, 0, "t", Some(0), &pk_batch(&[1]), RestoreMode::Recover);
        let row = gate.load(0, 0, "t", Some(0), &pk_batch(&[1, 2]), RestoreMode::Recover);
        // The load still counts as a success, and exactly one duplicate row
        // landed in the sink.
        assert_eq!(row.status, ResultStatus::Success);
        let records = gate.sink().read_all("t").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].len(), 1);
        assert_eq!(records[0].rows[0], vec![Value::I64(1)]);
    }

    #[test]
    fn test_sink_append_order_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DuplicateSink::new(dir.path().join("dups")).unwrap();
        sink.append("t", &pk_batch(&[1])).unwrap();
        sink.append("t", &pk_batch(&[2, 3])).unwrap();
        let records = sink.read_all("t").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].len(), 1);
        assert_eq!(records[1].len(), 2);
    }
}
