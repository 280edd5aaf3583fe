//! Cluster-wide snapshot restore engine for StrataDB.
//!
//! Restoring a snapshot onto a (possibly differently-sized) running cluster
//! takes five cooperating pieces, and this crate is all of them:
//!
//! - [`validate`] — cross-node reconciliation of scan results: snapshot
//!   identity, table/partition coverage, hashinator reconciliation.
//! - [`repartition`] — re-hashing every row when the stored partition
//!   layout differs from the current one, with pooled output buffers.
//! - [`session`] / [`agent`] / [`protocol`] — the work-channel protocol: a
//!   dedicated ephemeral channel per site carrying an ordered sequence of
//!   distributed work units outside the normal single-shot request path.
//! - [`gate`] — applying rows to storage, with uniqueness violations
//!   surfaced (restore) or routed to the duplicate sink (recover).
//! - [`aggregate`] / [`coordinator`] — per-fragment result rows collapsed
//!   to one row per (host, table, partition), driven end to end by the
//!   [`coordinator::RestoreManager`].
//!
//! External collaborators — the catalog/storage layer, the membership/RPC
//! substrate, and the coordination directory — are consumed exclusively
//! through the traits in [`traits`]; [`mock`] provides the in-memory
//! versions the tests run on.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod agent;
pub mod aggregate;
pub mod coordinator;
pub mod gate;
pub mod mock;
pub mod plan;
pub mod protocol;
pub mod repartition;
pub mod session;
pub mod traits;
pub mod validate;
pub mod watermark;

pub use aggregate::{RestoreResultRow, ResultAggregator, ResultStatus};
pub use coordinator::{RestoreError, RestoreManager, RestoreReport, RestoreRequest};
pub use protocol::RestoreMode;
pub use traits::{CatalogGate, ClusterLink, CounterStore, SiteInfo, WorkChannel};
