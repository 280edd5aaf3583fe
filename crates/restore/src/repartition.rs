//! Row re-partitioning for layout-changing restores.
//!
//! When the stored partition layout differs from the table's current load
//! target, every row must be re-hashed against the *current* cluster's
//! partitioning function and bucketed into per-destination payloads. This
//! is the restore engine's hot path — it touches every row of every chunk —
//! so output buffers are pooled and reused across chunks instead of being
//! reallocated per chunk.

use std::collections::BTreeMap;

use stratadb_savefile::Hashinator;
use stratadb_types::{PartitionId, Row, RowBatch};

/// A size-indexed pool of row buffers.
///
/// Finished buffers come back via [`recycle`](Self::recycle); [`take`]
/// (Self::take) prefers the largest available buffer so repeated small
/// requests gradually converge on the high-water-mark allocation instead
/// of churning.
#[derive(Debug, Default)]
pub struct BufferPool {
    /// capacity → buffers of that capacity.
    free: BTreeMap<usize, Vec<Vec<Row>>>,
}

impl BufferPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the largest pooled buffer, or allocates one with
    /// `min_capacity` if the pool is empty.
    pub fn take(&mut self, min_capacity: usize) -> Vec<Row> {
        let largest = self.free.keys().next_back().copied();
        if let Some(capacity) = largest {
            if let Some(bucket) = self.free.get_mut(&capacity) {
                if let Some(buffer) = bucket.pop() {
                    if bucket.is_empty() {
                        self.free.remove(&capacity);
                    }
                    return buffer;
                }
            }
        }
        Vec::with_capacity(min_capacity)
    }

    /// Returns a buffer to the pool, cleared.
    pub fn recycle(&mut self, mut rows: Vec<Row>) {
        rows.clear();
        if rows.capacity() > 0 {
            self.free.entry(rows.capacity()).or_default().push(rows);
        }
    }

    /// Number of pooled buffers.
    pub fn len(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }

    /// Whether the pool holds no buffers.
    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }
}

/// Re-hashes row batches into per-destination-partition payloads.
pub struct Repartitioner {
    hashinator: Hashinator,
    partition_column: usize,
    slack_pct: u32,
    pool: BufferPool,
}

impl Repartitioner {
    /// Creates a repartitioner for one table.
    ///
    /// `partition_column` indexes the table's partitioning column inside
    /// each row; `slack_pct` is extra buffer capacity beyond the
    /// `rows / partitions` estimate.
    pub fn new(hashinator: Hashinator, partition_column: usize, slack_pct: u32) -> Self {
        Self { hashinator, partition_column, slack_pct, pool: BufferPool::new() }
    }

    /// Buffer capacity estimate for one destination, derived from the
    /// observed batch size.
    fn estimate(&self, batch_rows: usize) -> usize {
        let per_partition = batch_rows / self.hashinator.partition_count().max(1) as usize;
        let with_slack = per_partition + per_partition * self.slack_pct as usize / 100;
        with_slack.max(1)
    }

    /// Splits one chunk's batch by destination partition.
    ///
    /// Only destinations that actually received rows appear in the output,
    /// so empty partitions never produce work units.
    pub fn split(&mut self, batch: &RowBatch) -> Vec<(PartitionId, RowBatch)> {
        let estimate = self.estimate(batch.len());
        let mut buckets: BTreeMap<PartitionId, Vec<Row>> = BTreeMap::new();

        for row in &batch.rows {
            let destination = self.hashinator.partition_for(&row[self.partition_column]);
            buckets
                .entry(destination)
                .or_insert_with(|| self.pool.take(estimate))
                .push(row.clone());
        }

        buckets
            .into_iter()
            .map(|(partition, rows)| {
                (partition, RowBatch { columns: batch.columns.clone(), rows })
            })
            .collect()
    }

    /// The degenerate bucketing for a replicated load target: one payload
    /// holding every row, built on a pooled buffer like any other bucket.
    pub fn merge_replicated(&mut self, batch: &RowBatch) -> RowBatch {
        let mut rows = self.pool.take(batch.len());
        rows.extend(batch.rows.iter().cloned());
        RowBatch { columns: batch.columns.clone(), rows }
    }

    /// Returns a finished payload's buffer to the pool for the next chunk.
    pub fn recycle(&mut self, batch: RowBatch) {
        self.pool.recycle(batch.rows);
    }

    /// Number of buffers currently pooled.
    pub fn pooled_buffers(&self) -> usize {
        self.pool.len()
    }
}
