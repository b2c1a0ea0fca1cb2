// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Replication of position and group state to the peer storage processor
//!
//! The active node replicates every position and group change to its peer so
//! that the peer can take over. Transitions that change where I/O goes are
//! additionally fenced by quiesce barriers: the active node waits until the
//! peer has applied and acknowledged the new configuration before it moves
//! on. A disconnected peer never holds up a barrier.

use crate::{
    CopyRecord, DriveLocation, EdgeRole, Envelope, GroupSnapshot, Lifecycle,
    Mode, NodeId, Output, PositionId, RaidGroupId,
};
use parse_display::Display;
use serde::{Deserialize, Serialize};
use slog::{Logger, debug, info, o, warn};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Points in a copy where both nodes must agree before I/O is redirected
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
)]
#[display(style = "kebab-case")]
pub enum QuiesceBoundary {
    EnterMirror,
    LeaveMirror,
    Complete,
    Abort,
}

/// The replicated state of a virtual position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub generation: u64,
    pub position: PositionId,
    pub source: DriveLocation,
    pub destination: Option<DriveLocation>,
    pub primary: EdgeRole,
    pub mode: Mode,
    pub copy: Option<CopyRecord>,
    pub lifecycle: Lifecycle,
}

impl PositionSnapshot {
    pub fn is_newer_than(&self, other: &PositionSnapshot) -> bool {
        self.generation > other.generation
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMsg {
    Replicate(PositionSnapshot),
    ReplicateGroup(GroupSnapshot),
    Quiesce {
        boundary: QuiesceBoundary,
        snapshot: PositionSnapshot,
    },
    QuiesceAck {
        position: PositionId,
        boundary: QuiesceBoundary,
        generation: u64,
    },
}

impl PeerMsg {
    pub fn name(&self) -> &'static str {
        match self {
            PeerMsg::Replicate(_) => "replicate",
            PeerMsg::ReplicateGroup(_) => "replicate_group",
            PeerMsg::Quiesce { .. } => "quiesce",
            PeerMsg::QuiesceAck { .. } => "quiesce_ack",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierStatus {
    /// Waiting for the peer to acknowledge
    Pending,
    Released,
}

#[derive(Debug, Clone)]
struct PendingBarrier {
    boundary: QuiesceBoundary,
    snapshot: PositionSnapshot,
    resend_at: Instant,
}

/// Mirrors local state to the peer and keeps the peer's replicas
#[derive(Debug)]
pub struct PeerSync {
    log: Logger,
    id: NodeId,
    peer: NodeId,
    connected: bool,
    retry_interval: Duration,

    /// Barriers waiting for the peer, at most one per position
    pending: BTreeMap<PositionId, PendingBarrier>,

    // The latest state sent, replayed when the peer connects
    sent_positions: BTreeMap<PositionId, PositionSnapshot>,
    sent_groups: BTreeMap<RaidGroupId, GroupSnapshot>,

    // The latest state received from the peer
    positions: BTreeMap<PositionId, PositionSnapshot>,
    groups: BTreeMap<RaidGroupId, GroupSnapshot>,
}

impl PeerSync {
    pub fn new(
        log: &Logger,
        id: NodeId,
        peer: NodeId,
        retry_interval: Duration,
    ) -> PeerSync {
        PeerSync {
            log: log.new(o!("component" => "PeerSync")),
            id,
            peer,
            connected: false,
            retry_interval,
            pending: BTreeMap::new(),
            sent_positions: BTreeMap::new(),
            sent_groups: BTreeMap::new(),
            positions: BTreeMap::new(),
            groups: BTreeMap::new(),
        }
    }

    pub fn peer(&self) -> NodeId {
        self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn pending_barriers(&self) -> usize {
        self.pending.len()
    }

    pub fn replica(&self, position: &PositionId) -> Option<&PositionSnapshot> {
        self.positions.get(position)
    }

    pub fn group_replica(&self, group: &RaidGroupId) -> Option<&GroupSnapshot> {
        self.groups.get(group)
    }

    pub fn replicas(&self) -> impl Iterator<Item = &PositionSnapshot> {
        self.positions.values()
    }

    pub(crate) fn replicate_position(
        &mut self,
        snapshot: PositionSnapshot,
        out: &mut Vec<Output>,
    ) {
        if self.connected {
            self.send(PeerMsg::Replicate(snapshot.clone()), out);
        }
        self.sent_positions.insert(snapshot.position, snapshot);
    }

    pub(crate) fn replicate_group(
        &mut self,
        snapshot: GroupSnapshot,
        out: &mut Vec<Output>,
    ) {
        if self.connected {
            self.send(PeerMsg::ReplicateGroup(snapshot.clone()), out);
        }
        self.sent_groups.insert(snapshot.group, snapshot);
    }

    /// Start a barrier for `snapshot.position`
    pub(crate) fn quiesce(
        &mut self,
        now: Instant,
        boundary: QuiesceBoundary,
        snapshot: PositionSnapshot,
        out: &mut Vec<Output>,
    ) -> BarrierStatus {
        let position = snapshot.position;
        self.sent_positions.insert(position, snapshot.clone());
        if !self.connected {
            debug!(
                self.log,
                "Peer not connected, releasing barrier";
                "position" => %position,
                "boundary" => %boundary,
            );
            return BarrierStatus::Released;
        }
        self.send(
            PeerMsg::Quiesce { boundary, snapshot: snapshot.clone() },
            out,
        );
        self.pending.insert(
            position,
            PendingBarrier {
                boundary,
                snapshot,
                resend_at: now + self.retry_interval,
            },
        );
        BarrierStatus::Pending
    }

    /// Handle a message from the peer
    ///
    /// Returns the barrier released by this message, if any.
    pub(crate) fn handle(
        &mut self,
        from: NodeId,
        msg: PeerMsg,
        out: &mut Vec<Output>,
    ) -> Option<(PositionId, QuiesceBoundary)> {
        if from != self.peer {
            warn!(
                self.log,
                "Message from unexpected node";
                "from" => %from,
                "msg" => msg.name(),
            );
            return None;
        }
        match msg {
            PeerMsg::Replicate(snapshot) => {
                self.apply(snapshot);
                None
            }
            PeerMsg::ReplicateGroup(snapshot) => {
                let newer = self
                    .groups
                    .get(&snapshot.group)
                    .map_or(true, |current| snapshot.is_newer_than(current));
                if newer {
                    self.groups.insert(snapshot.group, snapshot);
                }
                None
            }
            PeerMsg::Quiesce { boundary, snapshot } => {
                let position = snapshot.position;
                let generation = snapshot.generation;
                self.apply(snapshot);
                self.send(
                    PeerMsg::QuiesceAck { position, boundary, generation },
                    out,
                );
                None
            }
            PeerMsg::QuiesceAck { position, boundary, generation } => {
                let matches = self.pending.get(&position).is_some_and(|p| {
                    p.boundary == boundary && p.snapshot.generation == generation
                });
                if !matches {
                    debug!(
                        self.log,
                        "Ignoring stale quiesce ack";
                        "position" => %position,
                        "boundary" => %boundary,
                    );
                    return None;
                }
                self.pending.remove(&position);
                Some((position, boundary))
            }
        }
    }

    fn apply(&mut self, snapshot: PositionSnapshot) {
        let newer = self
            .positions
            .get(&snapshot.position)
            .map_or(true, |current| snapshot.is_newer_than(current));
        if newer {
            self.positions.insert(snapshot.position, snapshot);
        }
    }

    /// The peer connected. It gets everything it may have missed.
    pub(crate) fn on_connect(&mut self, now: Instant, out: &mut Vec<Output>) {
        info!(self.log, "Peer connected"; "peer" => %self.peer);
        self.connected = true;
        let groups: Vec<_> = self.sent_groups.values().cloned().collect();
        for snapshot in groups {
            self.send(PeerMsg::ReplicateGroup(snapshot), out);
        }
        let positions: Vec<_> = self.sent_positions.values().cloned().collect();
        for snapshot in positions {
            self.send(PeerMsg::Replicate(snapshot), out);
        }
        self.resend(now, true, out);
    }

    /// The peer went away. Every pending barrier is released.
    pub(crate) fn on_disconnect(&mut self) -> Vec<(PositionId, QuiesceBoundary)> {
        info!(
            self.log,
            "Peer disconnected";
            "peer" => %self.peer,
            "pending_barriers" => self.pending.len(),
        );
        self.connected = false;
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|(position, barrier)| (position, barrier.boundary))
            .collect()
    }

    pub(crate) fn tick(&mut self, now: Instant, out: &mut Vec<Output>) {
        if self.connected {
            self.resend(now, false, out);
        }
    }

    fn resend(&mut self, now: Instant, all: bool, out: &mut Vec<Output>) {
        let mut msgs = vec![];
        for barrier in self.pending.values_mut() {
            if all || now >= barrier.resend_at {
                barrier.resend_at = now + self.retry_interval;
                msgs.push(PeerMsg::Quiesce {
                    boundary: barrier.boundary,
                    snapshot: barrier.snapshot.clone(),
                });
            }
        }
        for msg in msgs {
            self.send(msg, out);
        }
    }

    fn send(&self, msg: PeerMsg, out: &mut Vec<Output>) {
        out.push(Output::Envelope(Envelope { to: self.peer, from: self.id, msg }));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{PositionIndex, RaidGroupId};

    fn log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn snapshot(generation: u64) -> PositionSnapshot {
        PositionSnapshot {
            generation,
            position: PositionId::new(RaidGroupId(0), PositionIndex(1)),
            source: DriveLocation::new(0, 0, 1),
            destination: Some(DriveLocation::new(0, 0, 9)),
            primary: EdgeRole::Source,
            mode: Mode::Mirror,
            copy: None,
            lifecycle: Lifecycle::Ready,
        }
    }

    fn envelopes(out: &[Output]) -> Vec<PeerMsg> {
        out.iter()
            .filter_map(|o| match o {
                Output::Envelope(envelope) => Some(envelope.msg.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn barrier_released_by_matching_ack() {
        let active = NodeId(0);
        let passive = NodeId(1);
        let now = Instant::now();
        let mut a = PeerSync::new(&log(), active, passive, Duration::from_secs(1));
        let mut p = PeerSync::new(&log(), passive, active, Duration::from_secs(1));
        let mut out = vec![];
        a.on_connect(now, &mut out);
        p.on_connect(now, &mut out);
        out.clear();

        let status =
            a.quiesce(now, QuiesceBoundary::EnterMirror, snapshot(4), &mut out);
        assert_eq!(status, BarrierStatus::Pending);
        let msgs = envelopes(&out);
        assert_eq!(msgs.len(), 1);

        // The passive side applies the snapshot and acknowledges
        let mut reply = vec![];
        assert_eq!(p.handle(active, msgs[0].clone(), &mut reply), None);
        assert_eq!(p.replica(&snapshot(4).position), Some(&snapshot(4)));
        let ack = envelopes(&reply).remove(0);

        // A stale ack is ignored
        let stale = PeerMsg::QuiesceAck {
            position: snapshot(4).position,
            boundary: QuiesceBoundary::EnterMirror,
            generation: 3,
        };
        assert_eq!(a.handle(passive, stale, &mut out), None);
        assert_eq!(
            a.handle(passive, ack, &mut out),
            Some((snapshot(4).position, QuiesceBoundary::EnterMirror))
        );
        assert_eq!(a.pending_barriers(), 0);
    }

    #[test]
    fn disconnected_peer_never_blocks() {
        let now = Instant::now();
        let mut a =
            PeerSync::new(&log(), NodeId(0), NodeId(1), Duration::from_secs(1));
        let mut out = vec![];
        assert_eq!(
            a.quiesce(now, QuiesceBoundary::Complete, snapshot(1), &mut out),
            BarrierStatus::Released
        );
        assert!(out.is_empty());

        a.on_connect(now, &mut out);
        out.clear();
        a.quiesce(now, QuiesceBoundary::Abort, snapshot(2), &mut out);
        assert_eq!(
            a.on_disconnect(),
            vec![(snapshot(2).position, QuiesceBoundary::Abort)]
        );
    }

    #[test]
    fn pending_barriers_are_resent() {
        let now = Instant::now();
        let mut a =
            PeerSync::new(&log(), NodeId(0), NodeId(1), Duration::from_secs(1));
        let mut out = vec![];
        a.on_connect(now, &mut out);
        a.quiesce(now, QuiesceBoundary::LeaveMirror, snapshot(5), &mut out);
        out.clear();
        a.tick(now + Duration::from_millis(500), &mut out);
        assert!(out.is_empty());
        a.tick(now + Duration::from_secs(1), &mut out);
        assert_eq!(envelopes(&out).len(), 1);
    }

    #[test]
    fn older_replicas_are_ignored() {
        let mut p =
            PeerSync::new(&log(), NodeId(1), NodeId(0), Duration::from_secs(1));
        let mut out = vec![];
        p.handle(NodeId(0), PeerMsg::Replicate(snapshot(7)), &mut out);
        p.handle(NodeId(0), PeerMsg::Replicate(snapshot(6)), &mut out);
        assert_eq!(p.replica(&snapshot(7).position), Some(&snapshot(7)));

        // Messages from anyone but the peer are dropped
        p.handle(NodeId(5), PeerMsg::Replicate(snapshot(9)), &mut out);
        assert_eq!(p.replica(&snapshot(7).position), Some(&snapshot(7)));
    }

    #[test]
    fn connect_replays_state() {
        let now = Instant::now();
        let mut a =
            PeerSync::new(&log(), NodeId(0), NodeId(1), Duration::from_secs(1));
        let mut out = vec![];
        a.replicate_position(snapshot(1), &mut out);
        assert!(out.is_empty());
        a.on_connect(now, &mut out);
        assert_eq!(envelopes(&out), vec![PeerMsg::Replicate(snapshot(1))]);
    }
}
