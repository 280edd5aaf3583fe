//! Core types for the StrataDB snapshot restore engine.
//!
//! This crate provides the foundational types shared by the save-file layer
//! and the restore engine:
//! - Type aliases for identifiers (HostId, SiteId, PartitionId, TxnId)
//! - The value/row/batch data model used by chunked save files
//! - Centralized postcard encode/decode
//! - Restore configuration with validation

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod config;
pub mod ids;
pub mod row;

// Re-export commonly used types at crate root
pub use codec::{decode, encode, CodecError};
pub use config::{ConfigError, RestoreConfig};
pub use ids::{ClusterInstanceId, HostId, PartitionId, SiteId, TxnId};
pub use row::{Column, ColumnType, Row, RowBatch, RowError, TableSchema, Value};
