// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A simulated storage array
//!
//! [`SimArray`] plays the role of everything around a [`Node`]: the drives and
//! their contents, the checkpoint store, the block I/O layer and the link to
//! the peer storage processor. Data is tracked per chunk as a version number,
//! which is enough to tell whether a drive holds what the host last wrote.

use serde::Serialize;
use slog::{Logger, info};
use sparing_protocol::{
    AbortCopyError, CopyConfig, CopyHooks, CopyKind, CopyRecord, CopyRequest,
    CopyState, DEFAULT_CHUNK_SIZE, DriveEvent, DriveInfo, DriveLocation,
    DriveType, Envelope, EventCode, EventRecord, GroupSnapshot, GroupStatus,
    IoError, IoRequest, Job, Node, NodeId, NodeRole, Output, PersistedState,
    PositionId, PositionIndex, PositionStatus, RaidGroupConfig, RaidGroupId,
    RaidType, Region, Requester, StartCopyError, Topology, WriteError,
    WritePlan,
};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

pub const GROUP: RaidGroupId = RaidGroupId(0);
pub const ACTIVE: NodeId = NodeId(0);
pub const PASSIVE: NodeId = NodeId(1);

// Upper bound on the steps `settle` takes before declaring a livelock
const MAX_SETTLE_STEPS: usize = 100_000;

/// Everything done to a [`SimArray`], kept to make failures reproducible
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SimAction {
    Write { position: PositionId, chunk: u64 },
    Pull { drive: DriveLocation },
    Insert { drive: DriveLocation },
    EndOfLife { drive: DriveLocation },
    Advance { millis: u128 },
    StartCopy { request: CopyRequest },
    AbortCopy { position: PositionId },
    SetHooks {
        position: PositionId,
        desired_percentage: Option<u8>,
        pause_at: Vec<CopyState>,
    },
    CompleteIo,
    FailIo,
    Restart,
    Promote,
    Connect,
    Disconnect,
}

/// The physical state of a drive slot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimDrive {
    pub present: bool,
    pub end_of_life: bool,

    /// The version of each user chunk the drive holds
    pub data: BTreeMap<u64, u64>,
}

pub struct SimArrayBuilder {
    log: Logger,
    raid_type: RaidType,
    width: u8,
    spares: Vec<DriveInfo>,
    chunks: u64,
    config: CopyConfig,
    peer: bool,
}

impl SimArrayBuilder {
    pub fn new(log: &Logger, raid_type: RaidType, width: u8) -> Self {
        SimArrayBuilder {
            log: log.clone(),
            raid_type,
            width,
            spares: vec![],
            chunks: 8,
            config: CopyConfig::default(),
            peer: false,
        }
    }

    /// Add `count` plain spares to the free pool
    pub fn spares(mut self, count: u8) -> Self {
        let capacity = self.drive_capacity();
        let first = self.spares.len() as u8;
        for slot in first..first + count {
            self.spares.push(DriveInfo::new(
                SimArray::spare_location(slot),
                DriveType::Sas,
                capacity,
            ));
        }
        self
    }

    /// Add a specific drive to the inventory
    pub fn drive(mut self, drive: DriveInfo) -> Self {
        self.spares.push(drive);
        self
    }

    /// The number of user chunks of each position
    pub fn chunks(mut self, chunks: u64) -> Self {
        self.chunks = chunks;
        self
    }

    pub fn config(mut self, config: CopyConfig) -> Self {
        self.config = config;
        self
    }

    /// Run a passive storage processor next to the active one
    pub fn with_peer(mut self) -> Self {
        self.peer = true;
        self
    }

    /// Capacity of a drive that fits one position exactly
    pub fn drive_capacity(&self) -> u64 {
        (self.chunks + 1) * DEFAULT_CHUNK_SIZE
    }

    pub fn build(self) -> SimArray {
        let capacity = self.drive_capacity();
        let group = RaidGroupConfig {
            id: GROUP,
            raid_type: self.raid_type,
            drives: (0..self.width).map(SimArray::member_location).collect(),
            capacity: self.chunks * DEFAULT_CHUNK_SIZE,
            metadata_capacity: DEFAULT_CHUNK_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
        };
        let mut drives: Vec<_> = group
            .drives
            .iter()
            .map(|location| DriveInfo::new(*location, DriveType::Sas, capacity))
            .collect();
        drives.extend(self.spares);
        let topology = Topology { drives, groups: vec![group] };

        let mut sim_drives = BTreeMap::new();
        let mut expected = BTreeMap::new();
        for drive in &topology.drives {
            sim_drives.insert(
                drive.location,
                SimDrive { present: true, ..SimDrive::default() },
            );
        }
        for index in 0..self.width {
            let data: BTreeMap<_, _> = (0..self.chunks).map(|c| (c, 1)).collect();
            if let Some(drive) =
                sim_drives.get_mut(&SimArray::member_location(index))
            {
                drive.data = data.clone();
            }
            expected.insert(SimArray::position(index.into()), data);
        }

        let now = Instant::now();
        let active = Node::new(
            &self.log,
            ACTIVE,
            NodeRole::Active,
            PASSIVE,
            self.config.clone(),
            topology.clone(),
            PersistedState::default(),
            now,
        )
        .expect("valid topology");
        let passive = self.peer.then(|| {
            Node::new(
                &self.log,
                PASSIVE,
                NodeRole::Passive,
                ACTIVE,
                self.config.clone(),
                topology.clone(),
                PersistedState::default(),
                now,
            )
            .expect("valid topology")
        });

        let mut sim = SimArray {
            log: self.log,
            now,
            topology,
            config: self.config,
            active,
            passive,
            drives: sim_drives,
            expected,
            events: vec![],
            pending_io: VecDeque::new(),
            hold_io: false,
            history: vec![],
            envelopes: VecDeque::new(),
            connected: false,
            next_version: 2,
            copy_records: BTreeMap::new(),
            group_snapshots: BTreeMap::new(),
        };
        if sim.passive.is_some() {
            sim.connect();
        }
        sim.settle();
        sim
    }
}

pub struct SimArray {
    pub log: Logger,
    pub now: Instant,
    pub topology: Topology,
    pub config: CopyConfig,
    pub active: Node,
    pub passive: Option<Node>,
    pub drives: BTreeMap<DriveLocation, SimDrive>,

    /// What the host last wrote to each chunk of each position
    pub expected: BTreeMap<PositionId, BTreeMap<u64, u64>>,
    pub events: Vec<EventRecord>,
    pub pending_io: VecDeque<IoRequest>,

    /// Leave jobs in `pending_io` instead of running them while settling
    pub hold_io: bool,
    pub history: Vec<SimAction>,
    envelopes: VecDeque<Envelope>,
    connected: bool,
    next_version: u64,

    // The checkpoint store
    copy_records: BTreeMap<PositionId, CopyRecord>,
    group_snapshots: BTreeMap<RaidGroupId, GroupSnapshot>,
}

impl SimArray {
    pub fn position(index: u16) -> PositionId {
        PositionId::new(GROUP, PositionIndex(index))
    }

    pub fn member_location(index: u8) -> DriveLocation {
        DriveLocation::new(0, 0, index)
    }

    pub fn spare_location(index: u8) -> DriveLocation {
        DriveLocation::new(0, 1, index)
    }

    pub fn chunk_size(&self) -> u64 {
        self.topology.groups[0].chunk_size
    }

    pub fn chunks(&self) -> u64 {
        self.topology.groups[0].chunk_count()
    }

    pub fn width(&self) -> u16 {
        self.topology.groups[0].drives.len() as u16
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn copy_record(&self, position: PositionId) -> Option<&CopyRecord> {
        self.copy_records.get(&position)
    }

    pub fn group_snapshot(&self) -> Option<&GroupSnapshot> {
        self.group_snapshots.get(&GROUP)
    }

    /// What a node would load from the checkpoint store right now
    pub fn persisted(&self) -> PersistedState {
        PersistedState {
            copies: self.copy_records.values().cloned().collect(),
            groups: self.group_snapshots.values().cloned().collect(),
        }
    }

    pub fn position_status(&self, position: PositionId) -> PositionStatus {
        self.active.position_status(position).expect("known position")
    }

    pub fn group_status(&self) -> GroupStatus {
        self.active.group_status(GROUP).expect("known group")
    }

    /// Events logged for `code`, optionally only for one position
    pub fn count_events(&self, code: EventCode, index: Option<u16>) -> usize {
        self.events
            .iter()
            .filter(|e| e.code == code)
            .filter(|e| {
                index.map_or(true, |i| e.position == Some(PositionIndex(i)))
            })
            .count()
    }

    pub fn history_json(&self) -> String {
        serde_json::to_string_pretty(&self.history)
            .unwrap_or_else(|err| format!("unserializable history: {err}"))
    }

    /// Run until no node has anything left to do
    pub fn settle(&mut self) {
        for _ in 0..MAX_SETTLE_STEPS {
            let mut progressed = false;
            let outputs = self.active.drain_outputs();
            progressed |= !outputs.is_empty();
            self.route(outputs);
            if let Some(passive) = &mut self.passive {
                let outputs = passive.drain_outputs();
                progressed |= !outputs.is_empty();
                self.route(outputs);
            }

            if let Some(envelope) = self.envelopes.pop_front() {
                self.deliver(envelope);
                progressed = true;
            } else if !self.hold_io && !self.pending_io.is_empty() {
                self.run_io(Ok(()));
                progressed = true;
            }
            if !progressed {
                return;
            }
        }
        panic!("array did not settle:\n{}", self.history_json());
    }

    /// Move time forward and fire timers
    pub fn advance(&mut self, duration: Duration) {
        self.history.push(SimAction::Advance { millis: duration.as_millis() });
        self.now += duration;
        self.active.tick(self.now);
        if let Some(passive) = &mut self.passive {
            passive.tick(self.now);
        }
        self.settle();
    }

    /// Advance in `step`s until `total` time has passed
    pub fn advance_by_steps(&mut self, total: Duration, step: Duration) {
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            self.advance(step);
            elapsed += step;
        }
    }

    pub fn pull(&mut self, drive: DriveLocation) {
        self.history.push(SimAction::Pull { drive });
        if let Some(d) = self.drives.get_mut(&drive) {
            d.present = false;
        }
        self.drive_event(DriveEvent::Removed(drive));
    }

    pub fn insert(&mut self, drive: DriveLocation) {
        self.history.push(SimAction::Insert { drive });
        if let Some(d) = self.drives.get_mut(&drive) {
            d.present = true;
        }
        self.drive_event(DriveEvent::Inserted(drive));
    }

    pub fn mark_eol(&mut self, drive: DriveLocation) {
        self.history.push(SimAction::EndOfLife { drive });
        if let Some(d) = self.drives.get_mut(&drive) {
            d.end_of_life = true;
        }
        self.drive_event(DriveEvent::EndOfLife(drive));
    }

    fn drive_event(&mut self, event: DriveEvent) {
        self.active.drive_event(self.now, event);
        if let Some(passive) = &mut self.passive {
            passive.drive_event(self.now, event);
        }
        self.settle();
    }

    pub fn start_copy(
        &mut self,
        position: PositionId,
        kind: CopyKind,
    ) -> Result<(), StartCopyError> {
        let request =
            CopyRequest { position, kind, requester: Requester::Operator };
        self.history.push(SimAction::StartCopy { request });
        let result = self.active.start_copy(self.now, request);
        self.settle();
        result
    }

    pub fn abort_copy(
        &mut self,
        position: PositionId,
    ) -> Result<(), AbortCopyError> {
        self.history.push(SimAction::AbortCopy { position });
        let result = self.active.abort_copy(self.now, position);
        self.settle();
        result
    }

    pub fn set_hooks(&mut self, position: PositionId, hooks: CopyHooks) {
        self.history.push(SimAction::SetHooks {
            position,
            desired_percentage: hooks.desired_percentage,
            pause_at: hooks.pause_at.iter().copied().collect(),
        });
        self.active.set_hooks(self.now, position, hooks);
        self.settle();
    }

    /// Pause the copy at `position` once it enters any of `states`
    pub fn pause_at(&mut self, position: PositionId, states: &[CopyState]) {
        let hooks = CopyHooks {
            desired_percentage: None,
            pause_at: states.iter().copied().collect(),
        };
        self.set_hooks(position, hooks);
    }

    pub fn resume(&mut self, position: PositionId) {
        self.pause_at(position, &[]);
    }

    /// Write a new version of `chunk` the way a host would
    ///
    /// A write is acknowledged only if every target applied it. Writes that
    /// fail leave every drive untouched.
    pub fn write(
        &mut self,
        position: PositionId,
        chunk: u64,
    ) -> Result<WritePlan, WriteError> {
        self.history.push(SimAction::Write { position, chunk });
        let chunk_size = self.chunk_size();
        let plan = self.active.write(
            self.now,
            position,
            chunk * chunk_size,
            chunk_size,
        )?;
        let version = self.next_version;
        self.next_version += 1;

        if !plan.logged {
            let applied: Vec<_> = plan
                .targets
                .iter()
                .copied()
                .filter(|d| self.drives.get(d).is_some_and(|d| d.present))
                .collect();
            plan.resolve(&applied)?;
            for drive in &applied {
                if let Some(d) = self.drives.get_mut(drive) {
                    d.data.insert(chunk, version);
                }
            }
        }
        self.expected.entry(position).or_default().insert(chunk, version);
        self.settle();
        Ok(plan)
    }

    /// Run the oldest held job
    pub fn complete_io(&mut self) -> bool {
        self.history.push(SimAction::CompleteIo);
        let ran = self.run_io(Ok(()));
        self.settle();
        ran
    }

    /// Fail the oldest held job without running it
    pub fn fail_io(&mut self, err: IoError) -> bool {
        self.history.push(SimAction::FailIo);
        let ran = self.run_io(Err(err));
        self.settle();
        ran
    }

    fn run_io(&mut self, forced: Result<(), IoError>) -> bool {
        let Some(request) = self.pending_io.pop_front() else {
            return false;
        };
        let result = forced.and_then(|()| self.execute(&request.job));
        self.active.operation_complete(self.now, request.op, result);
        true
    }

    fn require(&self, drive: &DriveLocation) -> Result<(), IoError> {
        if self.drives.get(drive).is_some_and(|d| d.present) {
            Ok(())
        } else {
            Err(IoError::DriveNotPresent(*drive))
        }
    }

    fn execute(&mut self, job: &Job) -> Result<(), IoError> {
        let chunk_size = self.chunk_size();
        match job {
            Job::SwapIn { drive } => self.require(drive),
            Job::SwapOut { .. } => Ok(()),
            Job::CopyExtent { from, to, extent } => {
                self.require(from)?;
                self.require(to)?;
                if extent.region == Region::Metadata {
                    return Ok(());
                }
                for chunk in extent.chunks(chunk_size) {
                    let version = self
                        .drives
                        .get(from)
                        .and_then(|d| d.data.get(&chunk))
                        .copied();
                    if let Some(d) = self.drives.get_mut(to) {
                        match version {
                            Some(version) => d.data.insert(chunk, version),
                            None => d.data.remove(&chunk),
                        };
                    }
                }
                Ok(())
            }
            Job::RebuildChunk { position, extent, targets } => {
                for target in targets {
                    self.require(target)?;
                }
                let expected = self.expected.get(position).cloned();
                for chunk in extent.chunks(chunk_size) {
                    let version =
                        expected.as_ref().and_then(|e| e.get(&chunk)).copied();
                    for target in targets {
                        if let (Some(d), Some(version)) =
                            (self.drives.get_mut(target), version)
                        {
                            d.data.insert(chunk, version);
                        }
                    }
                }
                Ok(())
            }
        }
    }

    fn route(&mut self, outputs: Vec<Output>) {
        for output in outputs {
            match output {
                Output::Envelope(envelope) => {
                    if self.connected {
                        self.envelopes.push_back(envelope);
                    }
                }
                Output::PersistCopyRecord(record) => {
                    if let Some(current) = self.copy_records.get(&record.position)
                    {
                        assert!(
                            !current.is_newer_than(&record),
                            "copy record went backwards: {current:?} {record:?}"
                        );
                    }
                    self.copy_records.insert(record.position, record);
                }
                Output::ClearCopyRecord(position) => {
                    self.copy_records.remove(&position);
                }
                Output::PersistGroup(snapshot) => {
                    self.group_snapshots.insert(snapshot.group, snapshot);
                }
                Output::Io(request) => self.pending_io.push_back(request),
                Output::Event(event) => self.events.push(event),
            }
        }
    }

    fn deliver(&mut self, envelope: Envelope) {
        let Envelope { to, from, msg } = envelope;
        if to == self.active.id() {
            self.active.handle(self.now, from, msg);
        } else if let Some(passive) =
            self.passive.as_mut().filter(|p| p.id() == to)
        {
            passive.handle(self.now, from, msg);
        }
    }

    pub fn connect(&mut self) {
        self.history.push(SimAction::Connect);
        self.connected = true;
        self.active.on_connect(self.now);
        if let Some(passive) = &mut self.passive {
            passive.on_connect(self.now);
        }
        self.settle();
    }

    pub fn disconnect(&mut self) {
        self.history.push(SimAction::Disconnect);
        self.connected = false;
        self.envelopes.clear();
        self.active.on_disconnect(self.now);
        if let Some(passive) = &mut self.passive {
            passive.on_disconnect(self.now);
        }
        self.settle();
    }

    // The topology as the hardware reports it right now
    fn current_topology(&self) -> Topology {
        let mut topology = self.topology.clone();
        for drive in &mut topology.drives {
            if let Some(d) = self.drives.get(&drive.location) {
                drive.present = d.present;
                drive.end_of_life = d.end_of_life;
            }
        }
        topology
    }

    /// Crash and restart the active node from the checkpoint store
    ///
    /// In-flight jobs and messages are lost.
    pub fn restart(&mut self) {
        self.history.push(SimAction::Restart);
        info!(self.log, "Restarting active node");
        self.pending_io.clear();
        self.envelopes.clear();
        self.active = Node::new(
            &self.log,
            self.active.id(),
            NodeRole::Active,
            self.active.peer().peer(),
            self.config.clone(),
            self.current_topology(),
            self.persisted(),
            self.now,
        )
        .expect("valid topology");
        if self.connected {
            self.active.on_connect(self.now);
            if let Some(passive) = &mut self.passive {
                passive.on_connect(self.now);
            }
        }
        self.settle();
    }

    /// Fail the active node and promote the passive one
    pub fn promote(&mut self) {
        self.history.push(SimAction::Promote);
        let mut passive = self.passive.take().expect("a passive node");
        info!(self.log, "Promoting passive node");
        self.pending_io.clear();
        self.envelopes.clear();
        self.connected = false;
        passive.on_disconnect(self.now);
        passive.promote(self.now).expect("passive node promotes");
        self.active = passive;
        self.settle();
    }

    /// Check that reads of `position` return what was last written
    pub fn verify_position(&self, position: PositionId) -> Result<(), String> {
        let Some(target) = self.active.read_target(position) else {
            // Served by reconstruction from the rest of the group
            return Ok(());
        };
        let drive = self
            .drives
            .get(&target)
            .ok_or_else(|| format!("{position} reads from unknown {target}"))?;
        let empty = BTreeMap::new();
        let expected = self.expected.get(&position).unwrap_or(&empty);
        for (chunk, version) in expected {
            let actual = drive.data.get(chunk);
            if actual != Some(version) {
                return Err(format!(
                    "{position} chunk {chunk} on {target}: expected version \
                     {version}, found {actual:?}"
                ));
            }
        }
        Ok(())
    }

    pub fn verify_all(&self) -> Result<(), String> {
        for index in 0..self.width() {
            self.verify_position(SimArray::position(index))?;
        }
        Ok(())
    }
}
