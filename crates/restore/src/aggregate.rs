//! Restore result rows and their cluster-wide de-duplication.
//!
//! Every fragment of work in a restore reports zero or more
//! [`RestoreResultRow`]s. The same logical outcome is typically reported by
//! several fragments (one per site touching the partition), so the
//! aggregator collapses them to one row per (host, table, partition) with
//! sticky failure: once any instance of a key reports failure, no later
//! success un-flips it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use stratadb_types::{HostId, PartitionId, SiteId};

/// Outcome of one unit of restore work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultStatus {
    /// The work completed and loaded data.
    Success,
    /// The work failed; the message carries the reason.
    Failure,
    /// The work ran but had nothing to do (observer-only fragments).
    NoData,
}

/// One fragment-level restore result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreResultRow {
    /// Host the fragment ran on.
    pub host: HostId,
    /// Site the fragment ran on.
    pub site: SiteId,
    /// Table the fragment worked on.
    pub table: String,
    /// Partition the fragment worked on, `None` for replicated work.
    pub partition: Option<PartitionId>,
    /// Outcome.
    pub status: ResultStatus,
    /// Failure reason or informational note.
    pub message: String,
}

impl RestoreResultRow {
    /// Convenience constructor for a success row.
    pub fn success(
        host: HostId,
        site: SiteId,
        table: impl Into<String>,
        partition: Option<PartitionId>,
    ) -> Self {
        Self {
            host,
            site,
            table: table.into(),
            partition,
            status: ResultStatus::Success,
            message: String::new(),
        }
    }

    /// Convenience constructor for a failure row.
    pub fn failure(
        host: HostId,
        site: SiteId,
        table: impl Into<String>,
        partition: Option<PartitionId>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            host,
            site,
            table: table.into(),
            partition,
            status: ResultStatus::Failure,
            message: message.into(),
        }
    }
}

/// De-duplicates fragment-level result rows.
///
/// Rows are indexed by (host, table, partition). The first row for a key is
/// inserted as-is; a later failure overwrites whatever is there; later
/// non-failures for an existing key are discarded.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    merged: BTreeMap<(HostId, String, Option<PartitionId>), RestoreResultRow>,
}

impl ResultAggregator {
    /// Creates an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers one fragment-level row.
    pub fn offer(&mut self, row: RestoreResultRow) {
        let key = (row.host, row.table.clone(), row.partition);
        match self.merged.get_mut(&key) {
            None => {
                self.merged.insert(key, row);
            }
            Some(existing) => {
                if row.status == ResultStatus::Failure {
                    *existing = row;
                }
                // A success (or no-data) row for an already-seen key carries
                // no new information and is dropped.
            }
        }
    }

    /// Offers every row in a batch.
    pub fn offer_all(&mut self, rows: impl IntoIterator<Item = RestoreResultRow>) {
        for row in rows {
            self.offer(row);
        }
    }

    /// Whether any merged row is a failure.
    pub fn any_failure(&self) -> bool {
        self.merged.values().any(|r| r.status == ResultStatus::Failure)
    }

    /// Consumes the aggregator, returning merged rows in key order.
    pub fn into_rows(self) -> Vec<RestoreResultRow> {
        self.merged.into_values().collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn success(host: HostId, partition: PartitionId) -> RestoreResultRow {
        RestoreResultRow::success(host, host * 10, "orders", Some(partition))
    }

    fn failure(host: HostId, partition: PartitionId) -> RestoreResultRow {
        RestoreResultRow::failure(host, host * 10, "orders", Some(partition), "boom")
    }

    #[test]
    fn test_duplicate_success_is_idempotent() {
        let mut once = ResultAggregator::new();
        once.offer(success(1, 0));
        let mut twice = ResultAggregator::new();
        twice.offer(success(1, 0));
        twice.offer(success(1, 0));
        assert_eq!(once.into_rows(), twice.into_rows());
    }

    #[test]
    fn test_failure_flips_and_sticks() {
        let mut agg = ResultAggregator::new();
        agg.offer(success(1, 0));
        agg.offer(failure(1, 0));
        // A third, later success never un-flips the key.
        agg.offer(success(1, 0));

        let rows = agg.into_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, ResultStatus::Failure);
    }

    #[test]
    fn test_distinct_keys_do_not_collapse() {
        let mut agg = ResultAggregator::new();
        agg.offer(success(1, 0));
        agg.offer(success(1, 1));
        agg.offer(success(2, 0));
        assert_eq!(agg.into_rows().len(), 3);
    }

    #[test]
    fn test_observer_rows_do_not_mask_failures() {
        let mut agg = ResultAggregator::new();
        let mut observer = success(1, 0);
        observer.status = ResultStatus::NoData;
        agg.offer(observer);
        agg.offer(failure(1, 0));
        let rows = agg.into_rows();
        assert_eq!(rows[0].status, ResultStatus::Failure);
        assert!(agg_failed(&rows));
    }

    fn agg_failed(rows: &[RestoreResultRow]) -> bool {
        rows.iter().any(|r| r.status == ResultStatus::Failure)
    }
}
