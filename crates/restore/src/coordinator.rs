//! The restore coordinator: scan → validate → distribute → aggregate.
//!
//! One coordinator drives one restore operation end to end. The public
//! entry point is async, but the orchestration itself runs on a dedicated
//! worker thread via `spawn_blocking`: the calling task parks in the async
//! primitive while the worker drives the session, because the caller's
//! execution context is needed by the storage engine's periodic bookkeeping
//! and must never run the session logic itself.
//!
//! Phase order, with the only cancellation point before the session begins:
//!
//! 1. pre-session scan exchange (designated site per host walks the disk),
//! 2. consistency validation + hashinator reconciliation (fatal errors
//!    abort here, before any load),
//! 3. watermark advance through the coordination directory,
//! 4. session handshake, optional hashinator install, sequence-number
//!    distribution,
//! 5. per-table distribution plans, strictly sequential, each bracketed by
//!    view-maintenance suspension,
//! 6. result aggregation, explicit termination, channel garbage collection.

use std::{
    collections::BTreeSet,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use snafu::{ResultExt, Snafu};
use stratadb_savefile::{NodeScan, ScanWarning};
use stratadb_types::{ConfigError, RestoreConfig, SiteId, TxnId};
use tracing::{debug, info, warn};

use crate::aggregate::{RestoreResultRow, ResultAggregator};
use crate::plan::{plan_table, PlanError, TablePlan};
use crate::protocol::{Message, ProtocolError, RestoreMode, TableSequences, WorkPayload};
use crate::session::CoordinatorSession;
use crate::traits::{ClusterLink, CatalogGate, CounterStore, LinkError};
use crate::validate::{validate, ClusterScanState, ValidatedSnapshot, ValidationError};
use crate::watermark::{self, WatermarkError};

/// Errors fatal to a whole restore operation.
#[derive(Debug, Snafu)]
pub enum RestoreError {
    /// This process already ran (or failed) a restore; restart before
    /// retrying.
    #[snafu(display(
        "Cluster has already been restored or has failed a restore; \
         restart before doing another restore"
    ))]
    AlreadyRestored,

    /// Configuration rejected.
    #[snafu(display("Restore configuration invalid: {source}"))]
    Config {
        /// The underlying config error.
        source: ConfigError,
    },

    /// The substrate failed outside a session.
    #[snafu(display("Restore link failure: {source}"))]
    Link {
        /// The underlying link error.
        source: LinkError,
    },

    /// The work-channel protocol failed; the operation cannot continue.
    #[snafu(display("Restore protocol failure: {source}"))]
    Protocol {
        /// The underlying protocol error.
        source: ProtocolError,
    },

    /// The snapshot failed consistency validation.
    #[snafu(display("{source}"))]
    Validation {
        /// The underlying validation error.
        source: ValidationError,
    },

    /// A table's distribution plan could not be built.
    #[snafu(display("{source}"))]
    Plan {
        /// The underlying plan error.
        source: PlanError,
    },

    /// The watermark update failed.
    #[snafu(display("Watermark update failed: {source}"))]
    Watermark {
        /// The underlying watermark error.
        source: WatermarkError,
    },

    /// The worker thread died.
    #[snafu(display("Restore worker failed: {message}"))]
    Worker {
        /// Join-failure description.
        message: String,
    },
}

/// Result type for restore operations.
pub type Result<T> = std::result::Result<T, RestoreError>;

/// Parameters of one restore operation.
#[derive(Debug, Clone)]
pub struct RestoreRequest {
    /// Directory holding the snapshot artifacts.
    pub snapshot_dir: PathBuf,
    /// Snapshot nonce.
    pub nonce: String,
    /// If non-empty, restore only these tables.
    pub include_tables: Vec<String>,
    /// Tables to skip.
    pub exclude_tables: Vec<String>,
    /// Restore vs crash-recovery replay semantics.
    pub mode: RestoreMode,
    /// Whether the snapshot's hashinator should be installed.
    pub restore_hashinator: bool,
    /// Partition count the cluster is growing to, if different from the
    /// running count. Used to synthesize watermark entries for partitions
    /// that did not exist when the snapshot was taken.
    pub new_partition_count: Option<u32>,
}

impl RestoreRequest {
    /// A plain restore of every table in the snapshot.
    pub fn new(snapshot_dir: impl Into<PathBuf>, nonce: impl Into<String>) -> Self {
        Self {
            snapshot_dir: snapshot_dir.into(),
            nonce: nonce.into(),
            include_tables: Vec::new(),
            exclude_tables: Vec::new(),
            mode: RestoreMode::Restore,
            restore_hashinator: false,
            new_partition_count: None,
        }
    }
}

/// The tabular outcome of one restore.
#[derive(Debug)]
pub struct RestoreReport {
    /// Transaction id of the restored snapshot.
    pub txn_id: TxnId,
    /// One deduplicated row per (host, table, partition).
    pub rows: Vec<RestoreResultRow>,
    /// Snapshot files that could not be scanned.
    pub warnings: Vec<ScanWarning>,
    /// Wall-clock duration of the whole operation.
    pub duration: Duration,
}

impl RestoreReport {
    /// Whether every merged result row succeeded.
    pub fn succeeded(&self) -> bool {
        !self
            .rows
            .iter()
            .any(|r| r.status == crate::aggregate::ResultStatus::Failure)
    }
}

/// Drives restore operations for this node.
pub struct RestoreManager {
    link: Arc<dyn ClusterLink>,
    catalog: Arc<dyn CatalogGate>,
    counters: Arc<dyn CounterStore>,
    config: RestoreConfig,
    have_done_restore: AtomicBool,
}

impl RestoreManager {
    /// Creates a manager after validating its configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RestoreError::Config`] for out-of-range settings.
    pub fn new(
        link: Arc<dyn ClusterLink>,
        catalog: Arc<dyn CatalogGate>,
        counters: Arc<dyn CounterStore>,
        config: RestoreConfig,
    ) -> Result<Self> {
        config.validate().context(ConfigSnafu)?;
        Ok(Self { link, catalog, counters, config, have_done_restore: AtomicBool::new(false) })
    }

    /// Runs one restore, parking the calling task while a worker thread
    /// drives the orchestration.
    ///
    /// # Errors
    ///
    /// Validation, protocol, and directory failures are fatal and returned
    /// as [`RestoreError`]; per-partition load failures are reported inside
    /// the [`RestoreReport`] instead.
    pub async fn restore(&self, request: RestoreRequest) -> Result<RestoreReport> {
        let orchestrator = self.orchestrator(request)?;
        tokio::task::spawn_blocking(move || orchestrator.run())
            .await
            .map_err(|e| RestoreError::Worker { message: e.to_string() })?
    }

    /// Synchronous entry point for callers that already own a plain
    /// thread.
    ///
    /// # Errors
    ///
    /// Same as [`restore`](Self::restore).
    pub fn restore_blocking(&self, request: RestoreRequest) -> Result<RestoreReport> {
        self.orchestrator(request)?.run()
    }

    /// Claims the restore-once guard and assembles the worker state.
    fn orchestrator(&self, request: RestoreRequest) -> Result<Orchestrator> {
        // The guard trips on failed restores too: a half-restored cluster
        // must restart before another attempt.
        if self
            .have_done_restore
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RestoreError::AlreadyRestored);
        }
        Ok(Orchestrator {
            link: self.link.clone(),
            catalog: self.catalog.clone(),
            counters: self.counters.clone(),
            config: self.config.clone(),
            request,
        })
    }
}

/// The worker-thread side of one restore operation.
struct Orchestrator {
    link: Arc<dyn ClusterLink>,
    catalog: Arc<dyn CatalogGate>,
    counters: Arc<dyn CounterStore>,
    config: RestoreConfig,
    request: RestoreRequest,
}

impl Orchestrator {
    fn run(self) -> Result<RestoreReport> {
        let started = Instant::now();
        info!(
            dir = %self.request.snapshot_dir.display(),
            nonce = self.request.nonce,
            mode = ?self.request.mode,
            "restore starting"
        );

        // Phase 1: every node inventories its disk, once, via the
        // designated site per host.
        let scans = self.collect_scans()?;
        let state = ClusterScanState::union(scans);
        let warnings = state.warnings.clone();

        // Phase 2: all-or-nothing validation before any load.
        let validated =
            validate(&state, self.catalog.cluster_instance()).context(ValidationSnafu)?;

        // Phase 3: advance the persisted per-partition watermarks so a
        // retried restore can never reissue an observed txn id.
        self.advance_watermarks(&validated)?;

        let tables = self.select_tables(&validated);

        // Phase 4: establish the session; from here on there is no
        // cancellation point short of process failure.
        let mut session =
            CoordinatorSession::begin(self.link.clone(), self.config.poll_interval())
                .context(ProtocolSnafu)?;
        let sites: Vec<SiteId> = session.sites().collect();
        let mut aggregator = ResultAggregator::new();

        if self.request.restore_hashinator {
            self.broadcast_to_all(
                &mut session,
                &sites,
                WorkPayload::InstallHashinator {
                    hashinator: validated.saved_hashinator.clone(),
                },
                &mut aggregator,
            )?;
        }

        self.broadcast_to_all(
            &mut session,
            &sites,
            WorkPayload::SetSequences { sequences: self.sequences_with_placeholders(&validated) },
            &mut aggregator,
        )?;

        // Phase 5: one table at a time, each fully drained before the next,
        // to bound memory and keep the duplicate sink append-ordered.
        let topology = self.link.topology();
        let current_hashinator = self.catalog.current_hashinator();
        for table in &tables {
            let Some(schema) = self.catalog.table_by_name(table) else {
                continue; // filtered views/dropped tables handled in select_tables
            };
            let files = &validated.table_files[table];
            let plan = plan_table(
                &schema,
                files[0].replicated,
                files,
                &validated.digest,
                &current_hashinator,
                &topology,
                self.catalog.dependent_views(table),
                self.request.mode,
            )
            .context(PlanSnafu)?;

            self.execute_table(&mut session, &sites, plan, &mut aggregator)?;
        }

        // Phase 6: explicit termination; dropping the coordinator channel
        // garbage-collects it.
        session.terminate().context(ProtocolSnafu)?;

        let duration = started.elapsed();
        let report = RestoreReport {
            txn_id: validated.digest.txn_id,
            rows: aggregator.into_rows(),
            warnings,
            duration,
        };
        info!(
            nonce = self.request.nonce,
            txn_id = report.txn_id,
            rows = report.rows.len(),
            succeeded = report.succeeded(),
            duration_ms = duration.as_millis() as u64,
            "restore finished"
        );
        Ok(report)
    }

    /// Pre-session scan exchange over the control channels.
    fn collect_scans(&self) -> Result<Vec<NodeScan>> {
        let mut reply = self.link.create_channel().context(LinkSnafu)?;
        let controls = self.link.control_channels();
        let control_ids: Vec<_> = controls.iter().map(|(_, c)| *c).collect();

        let request = Message::ScanRequest {
            dir: self.request.snapshot_dir.clone(),
            nonce: self.request.nonce.clone(),
            reply_to: reply.id(),
        }
        .encode()
        .context(ProtocolSnafu)?;
        self.link.broadcast(&control_ids, request).context(LinkSnafu)?;

        let mut scans = Vec::with_capacity(controls.len());
        while scans.len() < controls.len() {
            let Some(bytes) = reply
                .receive_blocking(self.config.poll_interval())
                .context(LinkSnafu)?
            else {
                continue;
            };
            match Message::decode(&bytes).context(ProtocolSnafu)? {
                Message::ScanResponse { site, scan, .. } => {
                    debug!(site, rows = scan.rows.len(), "scan response collected");
                    scans.push(scan);
                }
                _ => {
                    return Err(RestoreError::Protocol {
                        source: ProtocolError::UnexpectedMessage {
                            step: "collecting scan responses".to_string(),
                        },
                    })
                }
            }
        }
        Ok(scans)
    }

    /// Merges the digest's per-partition txn ids, synthesizing placeholder
    /// entries for partitions newer than the snapshot, and persists the
    /// result.
    fn advance_watermarks(&self, validated: &ValidatedSnapshot) -> Result<()> {
        let mut updates = validated.digest.partition_txn_ids.clone();
        let new_count = self
            .request
            .new_partition_count
            .unwrap_or_else(|| self.catalog.current_partition_count());
        for partition in 0..new_count {
            updates.entry(partition).or_insert(validated.digest.txn_id);
        }
        watermark::advance(self.counters.as_ref(), &updates).context(WatermarkSnafu)?;
        Ok(())
    }

    /// The merged sequence numbers, with zero-valued placeholder entries
    /// synthesized for partitions that did not exist when the snapshot was
    /// taken (the cluster may be growing during this restore).
    fn sequences_with_placeholders(&self, validated: &ValidatedSnapshot) -> TableSequences {
        let mut sequences = validated.digest.sequences.clone();
        let new_count = self
            .request
            .new_partition_count
            .unwrap_or_else(|| self.catalog.current_partition_count());
        for per_partition in sequences.values_mut() {
            for partition in 0..new_count {
                per_partition.entry(partition).or_default();
            }
        }
        sequences
    }

    /// Digest tables minus request filters, dropped tables, and
    /// materialized views.
    fn select_tables(&self, validated: &ValidatedSnapshot) -> Vec<String> {
        validated
            .digest
            .tables
            .iter()
            .filter(|t| {
                if !self.request.include_tables.is_empty()
                    && !self.request.include_tables.contains(t)
                {
                    return false;
                }
                if self.request.exclude_tables.contains(t) {
                    return false;
                }
                if self.catalog.table_by_name(t).is_none() {
                    info!(table = %t, "saved table is not in the catalog, not loading");
                    return false;
                }
                if self.catalog.is_materialized(t) {
                    info!(table = %t, "saved table is now materialized, not loading");
                    return false;
                }
                true
            })
            .cloned()
            .collect()
    }

    /// Sends one payload to every site and aggregates the results.
    fn broadcast_to_all(
        &self,
        session: &mut CoordinatorSession,
        sites: &[SiteId],
        payload: WorkPayload,
        aggregator: &mut ResultAggregator,
    ) -> Result<()> {
        let mut deps = BTreeSet::new();
        for site in sites {
            deps.insert(session.send_unit(*site, payload.clone()).context(ProtocolSnafu)?);
        }
        for result in session.wait_for(&deps).context(ProtocolSnafu)? {
            aggregator.offer_all(result.rows);
        }
        Ok(())
    }

    /// Runs one table's plan inside its view-maintenance bracket.
    fn execute_table(
        &self,
        session: &mut CoordinatorSession,
        sites: &[SiteId],
        plan: TablePlan,
        aggregator: &mut ResultAggregator,
    ) -> Result<()> {
        debug!(table = plan.table, mode = ?plan.mode, units = plan.units.len(), "table starting");

        if !plan.views.is_empty() {
            self.broadcast_to_all(
                session,
                sites,
                WorkPayload::ViewMaintenance { views: plan.views.clone(), enabled: false },
                aggregator,
            )?;
        }

        let outcome = self.execute_units(session, &plan, aggregator);

        // Re-enable unconditionally, even when the load failed, so view
        // maintenance is never left suspended.
        if !plan.views.is_empty() {
            let reenable = self.broadcast_to_all(
                session,
                sites,
                WorkPayload::ViewMaintenance { views: plan.views.clone(), enabled: true },
                aggregator,
            );
            if let Err(e) = &reenable {
                warn!(table = plan.table, error = %e, "view maintenance re-enable failed");
            }
            outcome?;
            return reenable;
        }
        outcome
    }

    fn execute_units(
        &self,
        session: &mut CoordinatorSession,
        plan: &TablePlan,
        aggregator: &mut ResultAggregator,
    ) -> Result<()> {
        let mut deps = BTreeSet::new();
        for unit in &plan.units {
            deps.insert(
                session
                    .send_unit(unit.site, unit.payload.clone())
                    .context(ProtocolSnafu)?,
            );
        }
        for result in session.wait_for(&deps).context(ProtocolSnafu)? {
            aggregator.offer_all(result.rows);
        }
        Ok(())
    }
}
