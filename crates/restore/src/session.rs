//! Coordinator-side session machinery for the work-channel protocol.
//!
//! One [`CoordinatorSession`] drives one restore. Its thread blocks only on
//! receiving the next inbound message, with a bounded poll interval used
//! purely to stay responsive and inspectable — never as a timeout. The
//! session ends only by explicit termination: sites never expire their
//! channels on their own.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use snafu::ResultExt;
use stratadb_types::SiteId;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::protocol::{
    DependencyId, LinkSnafu, Message, ProtocolError, Result, SessionId, WorkPayload, WorkResult,
    WorkUnit, DEP_BLOCK,
};
use crate::traits::{ChannelId, ClusterLink, WorkChannel};

/// The side-buffer of results that arrived before their dependency id was
/// awaited.
///
/// One endpoint may be mid-wait for one step while a result for a
/// *different* pending unit arrives; such results are stashed here and
/// re-checked at the top of every wait iteration. A result arriving for an
/// id that is already stashed is a dependency-id collision and fatal.
#[derive(Debug, Default)]
pub struct DependencyTracker {
    side: HashMap<DependencyId, WorkResult>,
}

impl DependencyTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves every stashed result whose id is in `expected` into
    /// `collected`.
    pub fn drain_into(
        &mut self,
        expected: &BTreeSet<DependencyId>,
        collected: &mut BTreeMap<DependencyId, WorkResult>,
    ) {
        for id in expected {
            if let Some(result) = self.side.remove(id) {
                collected.insert(*id, result);
            }
        }
    }

    /// Routes one inbound result: accepted into `collected` only if its id
    /// is registered as expected for the current wait step, stashed
    /// otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::DependencyCollision`] if the id is already
    /// stashed or already collected.
    pub fn offer(
        &mut self,
        result: WorkResult,
        expected: &BTreeSet<DependencyId>,
        collected: &mut BTreeMap<DependencyId, WorkResult>,
    ) -> Result<()> {
        let id = result.dependency_id;
        if expected.contains(&id) {
            if collected.insert(id, result).is_some() {
                return Err(ProtocolError::DependencyCollision { dependency: id });
            }
            return Ok(());
        }
        trace!(dependency = id, "result stashed in side-buffer");
        if self.side.insert(id, result).is_some() {
            return Err(ProtocolError::DependencyCollision { dependency: id });
        }
        Ok(())
    }

    /// Number of stashed results.
    pub fn stashed(&self) -> usize {
        self.side.len()
    }
}

/// The coordinator's end of one restore session.
pub struct CoordinatorSession {
    link: Arc<dyn ClusterLink>,
    channel: Box<dyn WorkChannel>,
    session: SessionId,
    site_channels: BTreeMap<SiteId, ChannelId>,
    tracker: DependencyTracker,
    next_dep: DependencyId,
    poll: Duration,
}

impl CoordinatorSession {
    /// Runs the session handshake to completion:
    ///
    /// 1. announce on every control channel,
    /// 2. collect every site's (site id, session channel id) report,
    /// 3. push the complete map to every session channel,
    /// 4. collect every ack.
    ///
    /// Only after this returns may work units be issued.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] on transport failure or out-of-protocol
    /// messages.
    pub fn begin(link: Arc<dyn ClusterLink>, poll: Duration) -> Result<Self> {
        let channel = link.create_channel().context(LinkSnafu)?;
        let session = Uuid::new_v4();

        let controls = link.control_channels();
        let expected_sites: BTreeSet<SiteId> = controls.iter().map(|(s, _)| *s).collect();
        let control_ids: Vec<ChannelId> = controls.iter().map(|(_, c)| *c).collect();

        info!(%session, sites = expected_sites.len(), "restore session starting");
        let announce =
            Message::SessionAnnounce { session, coordinator: channel.id() }.encode()?;
        link.broadcast(&control_ids, announce).context(LinkSnafu)?;

        let mut this = Self {
            link,
            channel,
            session,
            site_channels: BTreeMap::new(),
            tracker: DependencyTracker::new(),
            next_dep: 1,
            poll,
        };

        // Collect joins until every site has reported its channel.
        while this.site_channels.len() < expected_sites.len() {
            match this.receive()? {
                Message::SessionJoin { site, channel } => {
                    debug!(site, channel, "site joined session");
                    this.site_channels.insert(site, channel);
                }
                _ => {
                    return Err(ProtocolError::UnexpectedMessage {
                        step: "collecting session joins".to_string(),
                    })
                }
            }
        }

        // Every site must install the full map before any work unit flows.
        let map_msg =
            Message::ChannelMap { session, map: this.site_channels.clone() }.encode()?;
        let channels: Vec<ChannelId> = this.site_channels.values().copied().collect();
        this.link.broadcast(&channels, map_msg).context(LinkSnafu)?;

        let mut acked: BTreeSet<SiteId> = BTreeSet::new();
        while acked.len() < this.site_channels.len() {
            match this.receive()? {
                Message::MapAck { site } => {
                    acked.insert(site);
                }
                _ => {
                    return Err(ProtocolError::UnexpectedMessage {
                        step: "collecting map acks".to_string(),
                    })
                }
            }
        }

        info!(%session, "restore session established");
        Ok(this)
    }

    /// This session's id.
    pub fn id(&self) -> SessionId {
        self.session
    }

    /// Sites participating in the session.
    pub fn sites(&self) -> impl Iterator<Item = SiteId> + '_ {
        self.site_channels.keys().copied()
    }

    /// Blocks for the next message, looping over the bounded poll interval.
    fn receive(&mut self) -> Result<Message> {
        loop {
            if let Some(bytes) = self.channel.receive_blocking(self.poll).context(LinkSnafu)? {
                return Message::decode(&bytes);
            }
            // Poll interval elapsed: not a timeout, just stay inspectable.
        }
    }

    /// Allocates one dependency id.
    fn alloc_dep(&mut self) -> DependencyId {
        let id = self.next_dep;
        self.next_dep += 1;
        id
    }

    /// Reserves a block of [`DEP_BLOCK`] ids for a distribute unit's leaf
    /// allocations. Blocks and single ids come off the same counter, so
    /// they can never collide.
    fn alloc_block(&mut self) -> DependencyId {
        let base = self.next_dep;
        self.next_dep += DEP_BLOCK;
        base
    }

    /// Sends one work unit to a site, returning the dependency id to await.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] if the site is not in the session or the
    /// send fails.
    pub fn send_unit(&mut self, site: SiteId, mut payload: WorkPayload) -> Result<DependencyId> {
        if let WorkPayload::Distribute(spec) = &mut payload {
            spec.dep_base = self.alloc_block();
        }
        let dependency_id = self.alloc_dep();
        let Some(&target) = self.site_channels.get(&site) else {
            return Err(ProtocolError::UnexpectedMessage {
                step: format!("sending work to unknown site {site}"),
            });
        };
        let unit = WorkUnit { dependency_id, reply_to: self.channel.id(), payload };
        trace!(site, dependency_id, "work unit issued");
        self.link.send(target, Message::Work(unit).encode()?).context(LinkSnafu)?;
        Ok(dependency_id)
    }

    /// Waits until every expected dependency id has a result, pulling from
    /// the side-buffer first and the channel after.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] on collisions, site violations, transport
    /// failure, or out-of-protocol messages.
    pub fn wait_for(
        &mut self,
        expected: &BTreeSet<DependencyId>,
    ) -> Result<Vec<WorkResult>> {
        let mut collected: BTreeMap<DependencyId, WorkResult> = BTreeMap::new();
        loop {
            self.tracker.drain_into(expected, &mut collected);
            if collected.len() == expected.len() {
                return Ok(collected.into_values().collect());
            }
            match self.receive()? {
                Message::Result(result) => {
                    self.tracker.offer(result, expected, &mut collected)?;
                }
                Message::Violation { site, reason } => {
                    return Err(ProtocolError::SiteViolation { site, reason });
                }
                _ => {
                    return Err(ProtocolError::UnexpectedMessage {
                        step: "awaiting work results".to_string(),
                    })
                }
            }
        }
    }

    /// Ends the session: an explicit termination message on every channel.
    /// Site run loops exit only on this signal, never on idle timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] if the termination cannot be delivered.
    pub fn terminate(self) -> Result<()> {
        let channels: Vec<ChannelId> = self.site_channels.values().copied().collect();
        self.link.broadcast(&channels, Message::Terminate.encode()?).context(LinkSnafu)?;
        info!(session = %self.session, "restore session terminated");
        // Dropping the coordinator channel garbage-collects it.
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn result(id: DependencyId) -> WorkResult {
        WorkResult { dependency_id: id, rows: vec![] }
    }

    #[test]
    fn test_expected_results_are_accepted() {
        let mut tracker = DependencyTracker::new();
        let expected: BTreeSet<DependencyId> = [1, 2].into_iter().collect();
        let mut collected = BTreeMap::new();

        tracker.offer(result(1), &expected, &mut collected).unwrap();
        assert_eq!(collected.len(), 1);
        assert_eq!(tracker.stashed(), 0);
    }

    #[test]
    fn test_unexpected_result_is_stashed_not_accepted() {
        let mut tracker = DependencyTracker::new();
        let expected: BTreeSet<DependencyId> = [1].into_iter().collect();
        let mut collected = BTreeMap::new();

        // Result for a unit of a later step arrives early.
        tracker.offer(result(9), &expected, &mut collected).unwrap();
        assert!(collected.is_empty());
        assert_eq!(tracker.stashed(), 1);

        // Once the id becomes expected, the stash satisfies the wait.
        let later: BTreeSet<DependencyId> = [9].into_iter().collect();
        tracker.drain_into(&later, &mut collected);
        assert_eq!(collected.len(), 1);
        assert_eq!(tracker.stashed(), 0);
    }

    #[test]
    fn test_duplicate_stashed_id_is_fatal() {
        let mut tracker = DependencyTracker::new();
        let expected: BTreeSet<DependencyId> = [1].into_iter().collect();
        let mut collected = BTreeMap::new();

        tracker.offer(result(9), &expected, &mut collected).unwrap();
        let err = tracker.offer(result(9), &expected, &mut collected).unwrap_err();
        assert!(matches!(err, ProtocolError::DependencyCollision { dependency: 9 }));
    }

    #[test]
    fn test_duplicate_collected_id_is_fatal() {
        let mut tracker = DependencyTracker::new();
        let expected: BTreeSet<DependencyId> = [1].into_iter().collect();
        let mut collected = BTreeMap::new();

        tracker.offer(result(1), &expected, &mut collected).unwrap();
        let err = tracker.offer(result(1), &expected, &mut collected).unwrap_err();
        assert!(matches!(err, ProtocolError::DependencyCollision { dependency: 1 }));
    }
}
