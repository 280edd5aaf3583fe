//! Per-partition transaction watermarks.
//!
//! A partition that is removed and later re-added must never reissue a
//! transaction id that was already observed, so the highest txn id ever
//! seen per partition is persisted *outside* the snapshot, in the
//! coordination directory. Restores advance the persisted map by taking,
//! per partition, the max of the stored value and the value carried by the
//! snapshot — never decreasing anything, and leaving partitions the
//! snapshot does not mention untouched.

use std::collections::BTreeMap;

use snafu::{ResultExt, Snafu};
use stratadb_types::{codec, PartitionId, TxnId};
use tracing::debug;

use crate::traits::{CounterStore, StoreError};

/// Directory key the watermark document lives under.
pub const WATERMARK_KEY: &str = "restore/partition_txn_watermarks";

/// Bound on optimistic-concurrency retries before giving up.
const MAX_CAS_RETRIES: usize = 32;

/// Errors from watermark persistence.
#[derive(Debug, Snafu)]
pub enum WatermarkError {
    /// The coordination directory failed.
    #[snafu(display("Watermark store error: {source}"))]
    Store {
        /// The underlying store error.
        source: StoreError,
    },

    /// The persisted document failed to encode or decode.
    #[snafu(display("Watermark codec error: {source}"))]
    Codec {
        /// The underlying codec error.
        source: stratadb_types::CodecError,
    },

    /// The document kept moving underneath the writer.
    #[snafu(display("Watermark update contended {retries} times, giving up"))]
    Contention {
        /// Attempts made.
        retries: usize,
    },
}

/// Result type for watermark operations.
pub type Result<T> = std::result::Result<T, WatermarkError>;

/// Reads the persisted watermark map.
///
/// # Errors
///
/// Returns [`WatermarkError`] on store or codec failure.
pub fn read(store: &dyn CounterStore) -> Result<BTreeMap<PartitionId, TxnId>> {
    match store.read(WATERMARK_KEY).context(StoreSnafu)? {
        Some(doc) => codec::decode(&doc.bytes).context(CodecSnafu),
        None => Ok(BTreeMap::new()),
    }
}

/// Advances the persisted watermarks by per-partition max with `updates`.
///
/// Read-modify-write with the document version used for optimistic
/// concurrency: a write rejected because the version moved is retried from
/// a fresh read. Partitions absent from `updates` are left exactly as
/// persisted, so an intervening snapshot that dropped a partition can never
/// regress it.
///
/// Returns the merged map as persisted.
///
/// # Errors
///
/// Returns [`WatermarkError::Contention`] after [`MAX_CAS_RETRIES`] failed
/// compare-and-swap rounds, or the underlying store/codec error.
pub fn advance(
    store: &dyn CounterStore,
    updates: &BTreeMap<PartitionId, TxnId>,
) -> Result<BTreeMap<PartitionId, TxnId>> {
    for _ in 0..MAX_CAS_RETRIES {
        let existing = store.read(WATERMARK_KEY).context(StoreSnafu)?;
        let (mut merged, version) = match &existing {
            Some(doc) => (codec::decode(&doc.bytes).context(CodecSnafu)?, Some(doc.version)),
            None => (BTreeMap::<PartitionId, TxnId>::new(), None),
        };

        for (partition, txn) in updates {
            let slot = merged.entry(*partition).or_default();
            *slot = (*slot).max(*txn);
        }

        let bytes = codec::encode(&merged).context(CodecSnafu)?;
        match store.write(WATERMARK_KEY, bytes, version) {
            Ok(_) => {
                debug!(partitions = merged.len(), "partition watermarks advanced");
                return Ok(merged);
            }
            Err(StoreError::VersionConflict { .. }) => continue,
            Err(e) => return Err(WatermarkError::Store { source: e }),
        }
    }
    Err(WatermarkError::Contention { retries: MAX_CAS_RETRIES })
}
