//! The per-site restore agent.
//!
//! One agent runs per execution site for the lifetime of the process. Its
//! control channel services snapshot-scan requests and session
//! announcements; joining a session gives it an ephemeral session channel
//! that lives until the coordinator's explicit termination.
//!
//! The run loop services two kinds of traffic on the session channel:
//! requests to execute a local fragment (answered with a result keyed by
//! the unit's dependency id) and unsolicited leaf work units arriving from
//! peer distributors. While a distribute unit is mid-execution, results for
//! its pending leaves and new leaf work interleave freely: unexpected
//! results go to the side-buffer and are re-checked after every local
//! fragment completion.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    thread,
    time::Duration,
};

use snafu::{ResultExt, Snafu};
use stratadb_savefile::{scan_snapshot_dir, ChunkedTableFile, NodeScan, SaveFileError, ScanWarning};
use stratadb_types::{HostId, PartitionId, RestoreConfig, RowBatch, SiteId, TableSchema};
use tracing::{debug, error, info, warn};

use crate::aggregate::{RestoreResultRow, ResultStatus};
use crate::gate::{DuplicateSink, LoadGate, SinkError};
use crate::plan::SaveFilePool;
use crate::protocol::{
    DistributeSpec, DistributeStrategy, LinkSnafu, Message, ProtocolError, RestoreMode,
    TableSequences, WorkPayload, WorkResult, WorkUnit,
};
use crate::repartition::Repartitioner;
use crate::session::DependencyTracker;
use crate::traits::{CatalogGate, ChannelId, ClusterLink, LinkError, SiteInfo, WorkChannel};

/// Pseudo-table names used on result rows for observer-only work that has
/// no real table to attribute a failure to.
const HASHINATOR_RESULT_TABLE: &str = "$hashinator";
const VIEWS_RESULT_TABLE: &str = "$views";
const SEQUENCES_RESULT_TABLE: &str = "$sequences";

/// Errors from agent startup.
#[derive(Debug, Snafu)]
pub enum AgentError {
    /// The substrate refused a channel or advertisement.
    #[snafu(display("Agent channel setup failed: {source}"))]
    ChannelSetup {
        /// The underlying link error.
        source: LinkError,
    },

    /// The duplicate sink could not be created.
    #[snafu(display("Agent sink setup failed: {source}"))]
    SinkSetup {
        /// The underlying sink error.
        source: SinkError,
    },
}

/// Handle to a spawned site agent.
pub struct SiteAgentHandle {
    control: ChannelId,
    link: Arc<dyn ClusterLink>,
    join: thread::JoinHandle<()>,
}

impl SiteAgentHandle {
    /// Asks the agent to exit its run loop and waits for the thread.
    pub fn shutdown(self) {
        if let Ok(bytes) = Message::AgentShutdown.encode() {
            let _ = self.link.send(self.control, bytes);
        }
        let _ = self.join.join();
    }
}

/// One execution site's restore agent.
pub struct SiteAgent {
    site: SiteId,
    host: HostId,
    partition: Option<PartitionId>,
    /// Whether this site is its host's designated filesystem scanner
    /// (lowest-ranked local worker).
    scans_host: bool,
    link: Arc<dyn ClusterLink>,
    catalog: Arc<dyn CatalogGate>,
    gate: LoadGate,
    poll: Duration,
    slack_pct: u32,
}

impl SiteAgent {
    /// Creates the agent's control channel, advertises it, and starts the
    /// run loop on its own thread.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError`] if the channel, advertisement, or duplicate
    /// sink cannot be set up.
    pub fn spawn(
        link: Arc<dyn ClusterLink>,
        catalog: Arc<dyn CatalogGate>,
        info: SiteInfo,
        scans_host: bool,
        config: &RestoreConfig,
    ) -> Result<SiteAgentHandle, AgentError> {
        let control = link.create_channel().context(ChannelSetupSnafu)?;
        let control_id = control.id();
        link.advertise_control(info.site, control_id).context(ChannelSetupSnafu)?;

        let sink_dir = config.duplicate_sink_dir.join(format!("site_{}", info.site));
        let gate =
            LoadGate::new(catalog.clone(), DuplicateSink::new(sink_dir).context(SinkSetupSnafu)?);

        let agent = SiteAgent {
            site: info.site,
            host: info.host,
            partition: info.partition,
            scans_host,
            link: link.clone(),
            catalog,
            gate,
            poll: config.poll_interval(),
            slack_pct: config.repartition_slack_pct,
        };

        let join = thread::spawn(move || agent.run(control));
        Ok(SiteAgentHandle { control: control_id, link, join })
    }

    /// The control-channel run loop.
    fn run(self, mut control: Box<dyn WorkChannel>) {
        info!(site = self.site, host = self.host, "site agent started");
        loop {
            let bytes = match control.receive_blocking(self.poll) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    error!(site = self.site, error = %e, "control channel failed");
                    break;
                }
            };
            let message = match Message::decode(&bytes) {
                Ok(message) => message,
                Err(e) => {
                    warn!(site = self.site, error = %e, "undecodable control message");
                    continue;
                }
            };
            match message {
                Message::ScanRequest { dir, nonce, reply_to } => {
                    self.handle_scan(&dir, &nonce, reply_to);
                }
                Message::SessionAnnounce { session, coordinator } => {
                    debug!(site = self.site, %session, "joining restore session");
                    if let Err(e) = self.serve_session(coordinator) {
                        error!(site = self.site, error = %e, "session aborted");
                    }
                }
                Message::AgentShutdown => break,
                other => {
                    warn!(site = self.site, ?other, "unexpected control message");
                }
            }
        }
        info!(site = self.site, "site agent stopped");
    }

    /// Performs the host-local snapshot scan, or returns empty results if
    /// this site is not its host's designated scanner.
    fn handle_scan(&self, dir: &std::path::Path, nonce: &str, reply_to: ChannelId) {
        let scan = if self.scans_host {
            match scan_snapshot_dir(dir, nonce, self.host) {
                Ok(scan) => scan,
                Err(e) => NodeScan {
                    warnings: vec![ScanWarning {
                        path: dir.to_path_buf(),
                        message: e.to_string(),
                    }],
                    ..NodeScan::default()
                },
            }
        } else {
            NodeScan::default()
        };

        let response = Message::ScanResponse { site: self.site, host: self.host, scan };
        match response.encode() {
            Ok(bytes) => {
                if let Err(e) = self.link.send(reply_to, bytes) {
                    warn!(site = self.site, error = %e, "scan response undeliverable");
                }
            }
            Err(e) => warn!(site = self.site, error = %e, "scan response unencodable"),
        }
    }

    /// Joins one session and serves it until explicit termination.
    fn serve_session(&self, coordinator: ChannelId) -> Result<(), ProtocolError> {
        let mut channel = self.link.create_channel().context(LinkSnafu)?;
        self.link
            .send(
                coordinator,
                Message::SessionJoin { site: self.site, channel: channel.id() }.encode()?,
            )
            .context(LinkSnafu)?;

        let mut map: Option<BTreeMap<SiteId, ChannelId>> = None;
        let mut tracker = DependencyTracker::new();

        loop {
            let Some(bytes) = channel.receive_blocking(self.poll).context(LinkSnafu)? else {
                continue;
            };
            match Message::decode(&bytes)? {
                Message::ChannelMap { map: installed, .. } => {
                    debug!(site = self.site, sites = installed.len(), "channel map installed");
                    map = Some(installed);
                    self.link
                        .send(coordinator, Message::MapAck { site: self.site }.encode()?)
                        .context(LinkSnafu)?;
                }
                Message::Terminate => {
                    debug!(site = self.site, "session terminated");
                    return Ok(());
                }
                Message::Work(unit) => {
                    let Some(map) = map.as_ref() else {
                        // Cannot be attributed without the map: protocol
                        // violation, not a data error.
                        let violation = ProtocolError::WorkBeforeMap {
                            dependency: unit.dependency_id,
                            site: self.site,
                        };
                        let _ = self.link.send(
                            coordinator,
                            Message::Violation {
                                site: self.site,
                                reason: violation.to_string(),
                            }
                            .encode()?,
                        );
                        return Err(violation);
                    };
                    let rows =
                        self.execute(unit.payload, map, &mut channel, &mut tracker)?;
                    self.link
                        .send(
                            unit.reply_to,
                            Message::Result(WorkResult {
                                dependency_id: unit.dependency_id,
                                rows,
                            })
                            .encode()?,
                        )
                        .context(LinkSnafu)?;
                }
                Message::Result(result) => {
                    // A result while nothing is awaited: stash it; the next
                    // wait step will claim it or the collision aborts us.
                    let none_expected = BTreeSet::new();
                    let mut unused = BTreeMap::new();
                    tracker.offer(result, &none_expected, &mut unused)?;
                }
                Message::Violation { site, reason } => {
                    return Err(ProtocolError::SiteViolation { site, reason });
                }
                _ => {
                    return Err(ProtocolError::UnexpectedMessage {
                        step: "site session loop".to_string(),
                    })
                }
            }
        }
    }

    /// Executes one work unit's payload.
    fn execute(
        &self,
        payload: WorkPayload,
        map: &BTreeMap<SiteId, ChannelId>,
        channel: &mut Box<dyn WorkChannel>,
        tracker: &mut DependencyTracker,
    ) -> Result<Vec<RestoreResultRow>, ProtocolError> {
        match payload {
            WorkPayload::SetSequences { sequences } => Ok(self.install_sequences(&sequences)),
            WorkPayload::InstallHashinator { hashinator } => {
                Ok(match self.catalog.install_hashinator(&hashinator) {
                    Ok(()) => Vec::new(),
                    Err(e) => vec![RestoreResultRow::failure(
                        self.host,
                        self.site,
                        HASHINATOR_RESULT_TABLE,
                        None,
                        e.to_string(),
                    )],
                })
            }
            WorkPayload::ViewMaintenance { views, enabled } => {
                Ok(match self.catalog.set_view_maintenance(&views, enabled) {
                    Ok(()) => Vec::new(),
                    Err(e) => vec![RestoreResultRow::failure(
                        self.host,
                        self.site,
                        VIEWS_RESULT_TABLE,
                        None,
                        e.to_string(),
                    )],
                })
            }
            WorkPayload::LoadReplicatedFile { table, path, mode } => {
                Ok(vec![self.load_replicated_file(&table, &path, mode)])
            }
            WorkPayload::Distribute(spec) => self.run_distribute(spec, map, channel, tracker),
            leaf => Ok(vec![self.execute_leaf(leaf)]),
        }
    }

    /// Executes a leaf load. The only payloads a site may execute while it
    /// is itself mid-distribution.
    fn execute_leaf(&self, payload: WorkPayload) -> RestoreResultRow {
        match payload {
            WorkPayload::LoadReplicated { table, batch, mode } => {
                self.gate.load(self.host, self.site, &table, None, &batch, mode)
            }
            WorkPayload::LoadPartitioned { table, partition, batch, mode } => {
                self.gate.load(self.host, self.site, &table, Some(partition), &batch, mode)
            }
            other => RestoreResultRow::failure(
                self.host,
                self.site,
                SEQUENCES_RESULT_TABLE,
                None,
                format!("non-leaf payload routed as leaf: {other:?}"),
            ),
        }
    }

    /// Installs the merged sequence numbers for the partition this site
    /// owns. Observer-only: success contributes no result rows.
    fn install_sequences(&self, sequences: &TableSequences) -> Vec<RestoreResultRow> {
        let Some(partition) = self.partition else {
            return Vec::new();
        };
        let mut failures = Vec::new();
        for (table, partitions) in sequences {
            if let Some(pair) = partitions.get(&partition) {
                if let Err(e) = self.catalog.set_sequence_numbers(table, partition, *pair) {
                    failures.push(RestoreResultRow::failure(
                        self.host,
                        self.site,
                        table.clone(),
                        Some(partition),
                        e.to_string(),
                    ));
                }
            }
        }
        failures
    }

    /// Streams a local replicated-table save file into storage.
    fn load_replicated_file(
        &self,
        table: &str,
        path: &std::path::Path,
        mode: RestoreMode,
    ) -> RestoreResultRow {
        let Some(schema) = self.catalog.table_by_name(table) else {
            return RestoreResultRow::failure(
                self.host,
                self.site,
                table,
                None,
                "table is no longer in the catalog",
            );
        };
        let mut file = match ChunkedTableFile::open(path) {
            Ok(file) => file,
            Err(e) => {
                return RestoreResultRow::failure(
                    self.host,
                    self.site,
                    table,
                    None,
                    format!("unable to load table: {e}"),
                );
            }
        };

        let mut needs_conversion: Option<bool> = None;
        let mut result = RestoreResultRow::success(self.host, self.site, table, None);
        loop {
            match file.next_chunk() {
                Ok(None) => break,
                Ok(Some(chunk)) => {
                    let batch = match self.convert(&schema, chunk.batch, &mut needs_conversion) {
                        Ok(batch) => batch,
                        Err(message) => {
                            result = RestoreResultRow::failure(
                                self.host, self.site, table, None, message,
                            );
                            break;
                        }
                    };
                    let row = self.gate.load(self.host, self.site, table, None, &batch, mode);
                    if row.status == ResultStatus::Failure {
                        result = row;
                        break;
                    }
                    result = row;
                }
                Err(e) => {
                    result = RestoreResultRow::failure(
                        self.host,
                        self.site,
                        table,
                        None,
                        format!("unable to load table: {e}"),
                    );
                    break;
                }
            }
        }
        result
    }

    /// One-time schema-conversion probe plus the conversion itself. The
    /// answer is identical for every chunk of one table's files, so it is
    /// probed on the first batch only.
    fn convert(
        &self,
        schema: &TableSchema,
        batch: RowBatch,
        needs_conversion: &mut Option<bool>,
    ) -> Result<RowBatch, String> {
        let needs = *needs_conversion.get_or_insert_with(|| batch.needs_conversion(schema));
        if !needs {
            return Ok(batch);
        }
        batch.convert_to(schema).map_err(|e| format!("schema conversion failed: {e}"))
    }

    /// Executes a distribute unit: drain the assigned save files, route
    /// every chunk per the strategy, and collect all leaf results.
    fn run_distribute(
        &self,
        spec: DistributeSpec,
        map: &BTreeMap<SiteId, ChannelId>,
        channel: &mut Box<dyn WorkChannel>,
        tracker: &mut DependencyTracker,
    ) -> Result<Vec<RestoreResultRow>, ProtocolError> {
        let DistributeSpec {
            table,
            assigned,
            strategy,
            dep_base,
            partition_owners,
            all_sites,
            mode,
        } = spec;

        // Seeded so a distribution that streams zero chunks still reports.
        let mut rows = vec![RestoreResultRow {
            host: self.host,
            site: self.site,
            table: table.clone(),
            partition: None,
            status: ResultStatus::NoData,
            message: "no data to distribute".to_string(),
        }];

        let Some(schema) = self.catalog.table_by_name(&table) else {
            rows.push(RestoreResultRow::failure(
                self.host,
                self.site,
                &table,
                None,
                "table is no longer in the catalog",
            ));
            return Ok(rows);
        };

        let mut repartitioner = match &strategy {
            DistributeStrategy::Rehash { hashinator, partition_column } => {
                Repartitioner::new(hashinator.clone(), *partition_column, self.slack_pct)
            }
            _ => Repartitioner::new(self.catalog.current_hashinator(), 0, self.slack_pct),
        };

        let pool = SaveFilePool::new(assigned);
        let mut needs_conversion: Option<bool> = None;
        let mut next_leaf = dep_base;

        loop {
            let chunk = match pool.next_chunk() {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e @ (SaveFileError::ChunkChecksum { .. } | SaveFileError::ChunkCodec { .. })) =>
                {
                    // Per-chunk damage: the stream is still aligned, keep
                    // draining.
                    warn!(table, error = %e, "corrupt chunk skipped during distribution");
                    rows.push(RestoreResultRow::failure(
                        self.host, self.site, &table, None, e.to_string(),
                    ));
                    continue;
                }
                Err(e) => {
                    rows.push(RestoreResultRow::failure(
                        self.host, self.site, &table, None, e.to_string(),
                    ));
                    break;
                }
            };

            let chunk_partition = chunk.partition;
            let batch = match self.convert(&schema, chunk.batch, &mut needs_conversion) {
                Ok(batch) => batch,
                Err(message) => {
                    rows.push(RestoreResultRow::failure(
                        self.host, self.site, &table, None, message,
                    ));
                    break;
                }
            };

            // Route the chunk into leaf units.
            let mut leaves: Vec<(SiteId, WorkPayload)> = Vec::new();
            match &strategy {
                DistributeStrategy::ToReplicated => {
                    let merged = repartitioner.merge_replicated(&batch);
                    for site in &all_sites {
                        leaves.push((
                            *site,
                            WorkPayload::LoadReplicated {
                                table: table.clone(),
                                batch: merged.clone(),
                                mode,
                            },
                        ));
                    }
                    repartitioner.recycle(merged);
                }
                DistributeStrategy::Direct => {
                    let Some(partition) = chunk_partition else {
                        rows.push(RestoreResultRow::failure(
                            self.host,
                            self.site,
                            &table,
                            None,
                            "chunk carries no partition hint for direct routing",
                        ));
                        continue;
                    };
                    match partition_owners.get(&partition) {
                        Some(owner) => leaves.push((
                            *owner,
                            WorkPayload::LoadPartitioned {
                                table: table.clone(),
                                partition,
                                batch,
                                mode,
                            },
                        )),
                        None => rows.push(RestoreResultRow::failure(
                            self.host,
                            self.site,
                            &table,
                            Some(partition),
                            "no site owns this partition",
                        )),
                    }
                }
                DistributeStrategy::Rehash { .. } => {
                    for (partition, bucket) in repartitioner.split(&batch) {
                        match partition_owners.get(&partition) {
                            Some(owner) => leaves.push((
                                *owner,
                                WorkPayload::LoadPartitioned {
                                    table: table.clone(),
                                    partition,
                                    batch: bucket,
                                    mode,
                                },
                            )),
                            None => rows.push(RestoreResultRow::failure(
                                self.host,
                                self.site,
                                &table,
                                Some(partition),
                                "no site owns this partition",
                            )),
                        }
                    }
                }
            }

            // Send this chunk's leaves and wait for all of them before the
            // next chunk, to bound in-flight memory.
            let mut expected = BTreeSet::new();
            for (target_site, payload) in leaves {
                let dependency_id = next_leaf;
                next_leaf += 1;
                expected.insert(dependency_id);

                let Some(&target) = map.get(&target_site) else {
                    return Err(ProtocolError::UnexpectedMessage {
                        step: format!("leaf target site {target_site} missing from channel map"),
                    });
                };
                let message = Message::Work(WorkUnit {
                    dependency_id,
                    reply_to: channel.id(),
                    payload,
                });
                let bytes = message.encode()?;
                self.link.send(target, bytes).context(LinkSnafu)?;

                // The payload is on the wire; its buffer can go back to the
                // pool for the next chunk.
                if let Message::Work(WorkUnit {
                    payload: WorkPayload::LoadPartitioned { batch, .. },
                    ..
                }) = message
                {
                    if matches!(strategy, DistributeStrategy::Rehash { .. }) {
                        repartitioner.recycle(batch);
                    }
                }
            }

            for result in self.await_leaves(&expected, channel, tracker)? {
                rows.extend(result.rows);
            }
        }

        debug!(table, results = rows.len(), "distribution complete");
        Ok(rows)
    }

    /// Waits for a set of leaf results while continuing to service
    /// unsolicited leaf work from peer distributors.
    fn await_leaves(
        &self,
        expected: &BTreeSet<u64>,
        channel: &mut Box<dyn WorkChannel>,
        tracker: &mut DependencyTracker,
    ) -> Result<Vec<WorkResult>, ProtocolError> {
        let mut collected: BTreeMap<u64, WorkResult> = BTreeMap::new();
        loop {
            tracker.drain_into(expected, &mut collected);
            if collected.len() == expected.len() {
                return Ok(collected.into_values().collect());
            }
            let Some(bytes) = channel.receive_blocking(self.poll).context(LinkSnafu)? else {
                continue;
            };
            match Message::decode(&bytes)? {
                Message::Result(result) => {
                    tracker.offer(result, expected, &mut collected)?;
                }
                Message::Work(unit) if unit.payload.is_leaf() => {
                    let rows = vec![self.execute_leaf(unit.payload)];
                    self.link
                        .send(
                            unit.reply_to,
                            Message::Result(WorkResult {
                                dependency_id: unit.dependency_id,
                                rows,
                            })
                            .encode()?,
                        )
                        .context(LinkSnafu)?;
                    // Local fragment complete: loop re-checks the stash.
                }
                Message::Work(unit) => {
                    return Err(ProtocolError::UnexpectedMessage {
                        step: format!(
                            "non-leaf work unit {} while mid-distribution",
                            unit.dependency_id
                        ),
                    });
                }
                _ => {
                    return Err(ProtocolError::UnexpectedMessage {
                        step: "awaiting leaf results".to_string(),
                    })
                }
            }
        }
    }
}
