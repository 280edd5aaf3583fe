//! On-disk snapshot artifacts for StrataDB.
//!
//! A cluster snapshot consists of three artifact kinds, all named under a
//! common nonce inside the snapshot directory:
//!
//! - **Chunked table save files** (`.sav`) — one binary container per table
//!   (replicated) or per table per originating host (partitioned), holding
//!   the table's rows as a sequence of CRC-framed row-batch chunks.
//! - **Digests** (`.digest`) — one JSON sidecar per host describing the
//!   snapshot: transaction id, table list, per-table/per-partition export
//!   and replication sequence numbers, hashinator version, cluster identity.
//! - **Hashinator snapshots** (`.hash`) — the versioned partitioning
//!   function in effect when the snapshot was taken.
//!
//! This crate owns reading and writing all three, plus the directory scan
//! that inventories a snapshot for the restore engine.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod chunked;
pub mod digest;
pub mod hashinator;
pub mod scan;

pub use chunked::{
    save_file_name, Chunk, ChunkedTableFile, SaveFileError, SaveFileHeader, SaveFileWriter,
};
pub use digest::{DigestDocument, DigestError, DigestSet, SequencePair};
pub use hashinator::{Hashinator, HashinatorConfig, HashinatorError};
pub use scan::{scan_snapshot_dir, NodeScan, ScanRow, ScanWarning};
