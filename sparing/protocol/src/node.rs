// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A storage processor running copies for all of its redundancy groups

use crate::raid_group::GroupOutput;
use crate::virtual_position::{PositionInput, PositionOutput};
use crate::{
    AbortCopyError, Alarm, BarrierStatus, CopyConfig, CopyHooks, CopyKind,
    CopyRecord, CopyRequest, DriveEvent, DriveInfo, DriveInventory,
    DriveLocation, EdgeRole, EventRecord, GroupRequest, GroupSnapshot,
    GroupState, InventoryError, IoError, IoRequest, Job, Lba, Lifecycle, Mode,
    NodeId, OpId, OpOwner, Output, PeerMsg, PeerSync, PositionId, PositionIndex,
    RaidGroup, RaidGroupConfig, RaidGroupId, RaidType, RebuildStatus, Requester,
    SpareError, SpareRequirements, SpareSelector, VirtualPosition, WriteError,
    WritePlan, percent_rebuilt,
};
use parse_display::Display;
use serde::{Deserialize, Serialize};
use slog::{Logger, error, info, o, warn};
use slog_error_chain::{InlineErrorChain, SlogInlineError};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Instant;
use thiserror::Error;

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
#[display(style = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Owns all groups and drives every copy
    Active,

    /// Mirrors the active node and takes over when promoted
    Passive,
}

/// Drives and groups configured on a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub drives: Vec<DriveInfo>,
    pub groups: Vec<RaidGroupConfig>,
}

/// Everything a node loads from the checkpoint store at startup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub copies: Vec<CopyRecord>,
    pub groups: Vec<GroupSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, SlogInlineError)]
pub enum TopologyError {
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error("group {0} is configured more than once")]
    DuplicateGroup(RaidGroupId),
    #[error("group {0} has no positions")]
    EmptyGroup(RaidGroupId),
    #[error("group {0} has a zero chunk size")]
    InvalidChunkSize(RaidGroupId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error, SlogInlineError)]
pub enum StartCopyError {
    #[error("not the active node")]
    NotActive,
    #[error("unknown position {0}")]
    UnknownPosition(PositionId),
    #[error("a copy is already in progress at {0}")]
    CopyInProgress(PositionId),
    #[error("the source drive of {0} is not present")]
    SourceNotPresent(PositionId),
    #[error("group {0} is failed")]
    GroupFailed(RaidGroupId),
    #[error(transparent)]
    InvalidDestination(#[from] SpareError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error, SlogInlineError)]
pub enum PromoteError {
    #[error("node is already active")]
    AlreadyActive,
}

/// Externally visible state of a position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionStatus {
    pub position: PositionId,
    pub source: DriveLocation,
    pub destination: Option<DriveLocation>,
    pub primary: EdgeRole,
    pub mode: Mode,
    pub lifecycle: Lifecycle,
    pub copy: Option<CopyRecord>,
    pub percent_copied: Option<u8>,
    pub rebuild: Option<RebuildStatus>,
}

/// Externally visible state of a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStatus {
    pub group: RaidGroupId,
    pub raid_type: RaidType,
    pub state: GroupState,
    pub generation: u64,
    pub members: Vec<DriveLocation>,
    pub degraded: BTreeSet<PositionIndex>,
    pub fault_tolerance: usize,
}

impl GroupStatus {
    fn new(group: &RaidGroup) -> GroupStatus {
        GroupStatus {
            group: group.id(),
            raid_type: group.config().raid_type,
            state: group.state(),
            generation: group.generation(),
            members: group.config().drives.clone(),
            degraded: group.degraded_positions(),
            fault_tolerance: group.fault_tolerance(),
        }
    }
}

#[derive(Debug)]
struct Group {
    coordinator: RaidGroup,
    positions: BTreeMap<PositionIndex, VirtualPosition>,
}

/// Work queued between the positions and coordinators of a node
#[derive(Debug)]
enum Message {
    Position { position: PositionId, input: PositionInput },
    Group { group: RaidGroupId, from: PositionIndex, request: GroupRequest },
}

/// A storage processor
///
/// Every method that changes state runs all resulting work to completion
/// before returning. The resulting [`Output`]s are collected until the caller
/// drains them.
#[derive(Debug)]
pub struct Node {
    log: Logger,
    id: NodeId,
    role: NodeRole,
    config: CopyConfig,
    inventory: DriveInventory,
    groups: BTreeMap<RaidGroupId, Group>,
    peer: PeerSync,
    queue: VecDeque<Message>,
    outputs: Vec<Output>,
    alarms: BTreeSet<Alarm>,
}

impl Node {
    /// Create a node, restoring groups and copies from `persisted`
    ///
    /// Persisted group snapshots override the configured members, since
    /// copies and permanent spares replace drives after configuration.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        log: &Logger,
        id: NodeId,
        role: NodeRole,
        peer: NodeId,
        config: CopyConfig,
        topology: Topology,
        persisted: PersistedState,
        now: Instant,
    ) -> Result<Node, TopologyError> {
        let log = log.new(o!(
            "component" => "Node",
            "node_id" => id.to_string(),
            "role" => role.to_string(),
        ));

        let mut inventory = DriveInventory::new();
        for drive in topology.drives {
            inventory.insert(drive)?;
        }

        let snapshots: BTreeMap<_, _> =
            persisted.groups.into_iter().map(|s| (s.group, s)).collect();
        let mut groups = BTreeMap::new();
        for group_config in topology.groups {
            let group_id = group_config.id;
            if groups.contains_key(&group_id) {
                return Err(TopologyError::DuplicateGroup(group_id));
            }
            if group_config.drives.is_empty() {
                return Err(TopologyError::EmptyGroup(group_id));
            }
            if group_config.chunk_size == 0 {
                return Err(TopologyError::InvalidChunkSize(group_id));
            }
            let coordinator = match snapshots.get(&group_id) {
                Some(snapshot) => RaidGroup::restore(&log, group_config, snapshot),
                None => RaidGroup::new(&log, group_config),
            };

            let mut positions = BTreeMap::new();
            let group_config = coordinator.config();
            for (index, drive) in
                group_config.positions().zip(group_config.drives.iter())
            {
                let position = group_config.position(index);
                inventory.bind(*drive, position)?;
                positions.insert(
                    index,
                    VirtualPosition::new(
                        &log,
                        group_config,
                        position,
                        *drive,
                        config.clone(),
                    ),
                );
            }
            groups.insert(group_id, Group { coordinator, positions });
        }

        let peer = PeerSync::new(&log, id, peer, config.peer_retry_interval);
        let mut node = Node {
            log,
            id,
            role,
            config,
            inventory,
            groups,
            peer,
            queue: VecDeque::new(),
            outputs: vec![],
            alarms: BTreeSet::new(),
        };

        info!(
            node.log,
            "Node started";
            "groups" => node.groups.len(),
            "copies" => persisted.copies.len(),
        );
        if node.role == NodeRole::Active {
            node.apply_group_states();
            node.restore_copies(now, persisted.copies);
            node.apply_presence();
            node.process(now);
        }
        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn config(&self) -> &CopyConfig {
        &self.config
    }

    pub fn inventory(&self) -> &DriveInventory {
        &self.inventory
    }

    pub fn alarms(&self) -> &BTreeSet<Alarm> {
        &self.alarms
    }

    pub fn peer(&self) -> &PeerSync {
        &self.peer
    }

    pub fn positions(&self) -> impl Iterator<Item = PositionId> + '_ {
        self.groups.values().flat_map(|g| g.positions.values().map(|vp| vp.id()))
    }

    pub fn position(&self, position: PositionId) -> Option<&VirtualPosition> {
        self.groups.get(&position.group)?.positions.get(&position.index)
    }

    pub fn group(&self, group: RaidGroupId) -> Option<&RaidGroup> {
        self.groups.get(&group).map(|g| &g.coordinator)
    }

    /// Take every output produced since the last call
    pub fn drain_outputs(&mut self) -> Vec<Output> {
        std::mem::take(&mut self.outputs)
    }

    pub fn start_copy(
        &mut self,
        now: Instant,
        request: CopyRequest,
    ) -> Result<(), StartCopyError> {
        let position = request.position;
        if self.role != NodeRole::Active {
            return Err(StartCopyError::NotActive);
        }
        let group = self
            .groups
            .get(&position.group)
            .ok_or(StartCopyError::UnknownPosition(position))?;
        let vp = group
            .positions
            .get(&position.index)
            .ok_or(StartCopyError::UnknownPosition(position))?;
        if vp.is_copying() {
            return Err(StartCopyError::CopyInProgress(position));
        }
        if group.coordinator.state() == GroupState::Failed {
            warn!(
                self.log,
                "Rejecting copy on failed group";
                "position" => %position,
            );
            return Err(StartCopyError::GroupFailed(position.group));
        }
        if let CopyKind::UserInitiatedToExplicitDestination(destination) =
            request.kind
        {
            let original = self
                .inventory
                .get(&vp.source())
                .cloned()
                .ok_or(StartCopyError::SourceNotPresent(position))?;
            let config = group.coordinator.config();
            let requirements = SpareRequirements {
                position,
                capacity: config.capacity + config.metadata_capacity,
                original,
            };
            SpareSelector::new(&self.inventory)
                .validate(&requirements, destination)?;
        }

        info!(
            self.log,
            "Copy requested";
            "position" => %position,
            "kind" => %request.kind,
            "requester" => %request.requester,
        );
        let result = self
            .with_position(now, position, |vp, out| {
                vp.start_copy(now, request.kind, request.requester, out)
            })
            .unwrap_or(Err(StartCopyError::UnknownPosition(position)));
        self.process(now);
        result
    }

    pub fn abort_copy(
        &mut self,
        now: Instant,
        position: PositionId,
    ) -> Result<(), AbortCopyError> {
        if self.role != NodeRole::Active {
            return Err(AbortCopyError::NotActive);
        }
        info!(self.log, "Copy abort requested"; "position" => %position);
        let result = self
            .with_position(now, position, |vp, out| vp.abort_copy(out))
            .unwrap_or(Err(AbortCopyError::UnknownPosition(position)));
        self.process(now);
        result
    }

    /// Change the test hooks of a position
    pub fn set_hooks(
        &mut self,
        now: Instant,
        position: PositionId,
        hooks: CopyHooks,
    ) -> bool {
        let found = self
            .with_position(now, position, |vp, out| {
                vp.set_hooks(now, hooks, out)
            })
            .is_some();
        self.process(now);
        found
    }

    /// A drive was removed, inserted, or reported that it is failing
    pub fn drive_event(&mut self, now: Instant, event: DriveEvent) {
        let drive = event.location();
        if !self.inventory.apply(&event) {
            warn!(self.log, "Event for unknown drive"; "drive" => %drive);
            return;
        }
        info!(self.log, "Drive event"; "event" => ?event);
        if self.role != NodeRole::Active {
            return;
        }

        let owner = self
            .groups
            .values()
            .flat_map(|g| g.positions.values())
            .find(|vp| vp.owns(drive))
            .map(|vp| vp.id());
        let Some(position) = owner else {
            return;
        };
        self.queue.push_back(Message::Position {
            position,
            input: PositionInput::Drive(event),
        });
        self.process(now);

        if let DriveEvent::EndOfLife(drive) = event {
            let idle_source = self.position(position).is_some_and(|vp| {
                vp.source() == drive && !vp.is_copying()
            });
            if idle_source && self.inventory.is_present(&drive) {
                let request = CopyRequest {
                    position,
                    kind: CopyKind::Proactive,
                    requester: Requester::System,
                };
                if let Err(err) = self.start_copy(now, request) {
                    warn!(
                        self.log,
                        "Proactive copy not started";
                        "position" => %position,
                        "err" => InlineErrorChain::new(&err),
                    );
                }
            }
        }
    }

    /// A job issued as [`Output::Io`] finished
    pub fn operation_complete(
        &mut self,
        now: Instant,
        op: OpId,
        result: Result<(), IoError>,
    ) {
        if self.role != NodeRole::Active {
            return;
        }
        match op.owner {
            OpOwner::Position(position) => {
                let input = match result {
                    Ok(()) => PositionInput::OperationComplete(op),
                    Err(err) => PositionInput::OperationFailed(op, err),
                };
                self.queue.push_back(Message::Position { position, input });
            }
            OpOwner::Group(group_id) => {
                let mut out = vec![];
                if let Some(group) = self.groups.get_mut(&group_id) {
                    group.coordinator.rebuild_complete(op, result, &mut out);
                }
                self.route_group(now, group_id, out);
            }
        }
        self.process(now);
    }

    /// Handle a message from the peer
    pub fn handle(&mut self, now: Instant, from: NodeId, msg: PeerMsg) {
        if let Some((position, boundary)) =
            self.peer.handle(from, msg, &mut self.outputs)
        {
            self.queue.push_back(Message::Position {
                position,
                input: PositionInput::PeerAck(boundary),
            });
        }
        self.process(now);
    }

    pub fn on_connect(&mut self, now: Instant) {
        self.peer.on_connect(now, &mut self.outputs);
    }

    pub fn on_disconnect(&mut self, now: Instant) {
        for (position, boundary) in self.peer.on_disconnect() {
            self.queue.push_back(Message::Position {
                position,
                input: PositionInput::PeerAck(boundary),
            });
        }
        self.process(now);
    }

    /// Fire any timers that have expired
    pub fn tick(&mut self, now: Instant) {
        self.peer.tick(now, &mut self.outputs);
        if self.role != NodeRole::Active {
            return;
        }
        let positions: Vec<_> = self.positions().collect();
        for position in positions {
            self.with_position(now, position, |vp, out| vp.tick(now, out));
        }
        let group_ids: Vec<_> = self.groups.keys().copied().collect();
        for group_id in group_ids {
            let mut out = vec![];
            if let Some(group) = self.groups.get_mut(&group_id) {
                group.coordinator.tick(&mut out);
            }
            self.route_group(now, group_id, out);
        }
        self.process(now);
    }

    /// Plan a host write
    ///
    /// Writes to a position that is rebuild-logging are recorded by its
    /// group and not sent to any drive. Any outputs produced while planning
    /// must be acted upon before the write is acknowledged.
    pub fn write(
        &mut self,
        now: Instant,
        position: PositionId,
        lba: Lba,
        blocks: Lba,
    ) -> Result<WritePlan, WriteError> {
        if self.role != NodeRole::Active {
            return Err(WriteError::NotActive);
        }
        let group = self
            .groups
            .get_mut(&position.group)
            .ok_or(WriteError::UnknownPosition(position))?;
        let capacity = group.coordinator.config().capacity;
        if lba.checked_add(blocks).map_or(true, |end| end > capacity) {
            return Err(WriteError::OutOfRange { position });
        }
        if group.coordinator.state() == GroupState::Failed {
            return Err(WriteError::GroupFailed(position.group));
        }
        if group.coordinator.is_rebuild_logging(position.index) {
            let mut out = vec![];
            group.coordinator.log_write(position.index, lba, blocks, &mut out);
            self.route_group(now, position.group, out);
            return Ok(WritePlan::logged(position));
        }
        let mut out = vec![];
        let plan = group
            .positions
            .get_mut(&position.index)
            .ok_or(WriteError::UnknownPosition(position))?
            .plan_write(lba, blocks, &mut out);
        self.route_position(now, position, out);
        plan
    }

    /// The drive reads of `position` should be served from
    pub fn read_target(&self, position: PositionId) -> Option<DriveLocation> {
        let group = self.groups.get(&position.group)?;
        if group.coordinator.state() == GroupState::Failed
            || group.coordinator.is_degraded(position.index)
        {
            return None;
        }
        group.positions.get(&position.index)?.read_target()
    }

    /// Take over from the peer using the state it replicated
    pub fn promote(&mut self, now: Instant) -> Result<(), PromoteError> {
        if self.role == NodeRole::Active {
            return Err(PromoteError::AlreadyActive);
        }
        info!(self.log, "Promoting to active");
        self.role = NodeRole::Active;

        let mut records = vec![];
        for group in self.groups.values_mut() {
            let group_id = group.coordinator.id();
            if let Some(snapshot) = self.peer.group_replica(&group_id) {
                group.coordinator = RaidGroup::restore(
                    &self.log,
                    group.coordinator.config().clone(),
                    snapshot,
                );
            }
            let group_config = group.coordinator.config();
            for ((index, vp), drive) in
                group.positions.iter_mut().zip(group_config.drives.iter())
            {
                let position = group_config.position(*index);
                *vp = match self.peer.replica(&position) {
                    Some(snapshot) => {
                        if let Some(record) = &snapshot.copy {
                            records.push(record.clone());
                        }
                        VirtualPosition::from_snapshot(
                            &self.log,
                            group_config,
                            snapshot,
                            self.config.clone(),
                        )
                    }
                    None => VirtualPosition::new(
                        &self.log,
                        group_config,
                        position,
                        *drive,
                        self.config.clone(),
                    ),
                };

                // A swap the group had not yet recorded when the peer failed
                if vp.source() != *drive {
                    self.queue.push_back(Message::Group {
                        group: group_id,
                        from: *index,
                        request: GroupRequest::MemberReplaced {
                            drive: vp.source(),
                        },
                    });
                }
            }
        }

        // Bindings follow the replicated membership
        let members: Vec<(PositionId, DriveLocation)> = self
            .groups
            .values()
            .flat_map(|g| g.positions.values().map(|vp| (vp.id(), vp.source())))
            .collect();
        for (position, drive) in members {
            let stale: Vec<_> = self
                .inventory
                .bound_to(position)
                .map(|d| d.location)
                .filter(|location| *location != drive)
                .collect();
            for location in stale {
                self.inventory.release(&location);
            }
            if let Err(err) = self.inventory.bind(drive, position) {
                error!(
                    self.log,
                    "Failed to bind member";
                    "err" => InlineErrorChain::new(&err),
                );
            }
        }

        self.apply_group_states();
        self.restore_copies(now, records);
        self.apply_presence();
        self.process(now);
        Ok(())
    }

    pub fn position_status(&self, position: PositionId) -> Option<PositionStatus> {
        let group = self.groups.get(&position.group)?;
        let vp = group.positions.get(&position.index)?;
        let snapshot = match self.role {
            NodeRole::Active => vp.snapshot(),
            NodeRole::Passive => self
                .peer
                .replica(&position)
                .cloned()
                .unwrap_or_else(|| vp.snapshot()),
        };
        let rebuild = match self.role {
            NodeRole::Active => {
                Some(group.coordinator.rebuild_status(position.index))
            }
            NodeRole::Passive => self
                .peer
                .group_replica(&position.group)
                .and_then(|s| s.rebuild_status(position.index)),
        };
        let capacity = group.coordinator.config().capacity;
        Some(PositionStatus {
            position,
            source: snapshot.source,
            destination: snapshot.destination,
            primary: snapshot.primary,
            mode: snapshot.mode,
            lifecycle: snapshot.lifecycle,
            percent_copied: snapshot
                .copy
                .as_ref()
                .map(|record| percent_rebuilt(record.checkpoint, capacity)),
            copy: snapshot.copy,
            rebuild,
        })
    }

    pub fn group_status(&self, group: RaidGroupId) -> Option<GroupStatus> {
        let coordinator = &self.groups.get(&group)?.coordinator;
        match (self.role, self.peer.group_replica(&group)) {
            (NodeRole::Passive, Some(snapshot)) => {
                let replica = RaidGroup::restore(
                    &self.log,
                    coordinator.config().clone(),
                    snapshot,
                );
                Some(GroupStatus::new(&replica))
            }
            _ => Some(GroupStatus::new(coordinator)),
        }
    }

    fn restore_copies(&mut self, now: Instant, records: Vec<CopyRecord>) {
        for record in records {
            let position = record.position;
            if self.position(position).is_none() {
                warn!(
                    self.log,
                    "Dropping copy record for unknown position";
                    "position" => %position,
                );
                self.outputs.push(Output::ClearCopyRecord(position));
                continue;
            }
            if let Some(destination) = record.destination {
                if let Err(err) = self.inventory.bind(destination, position) {
                    // Another destination is selected when the copy resumes
                    warn!(
                        self.log,
                        "Recorded destination unavailable";
                        "position" => %position,
                        "err" => InlineErrorChain::new(&err),
                    );
                }
            }
            self.with_position(now, position, |vp, out| {
                vp.resume(now, record, out)
            });
        }
    }

    // Hold copies in groups that are failed right now
    fn apply_group_states(&mut self) {
        for group in self.groups.values_mut() {
            let failed = group.coordinator.state() == GroupState::Failed;
            for vp in group.positions.values_mut() {
                vp.set_group_failed(failed);
            }
        }
    }

    // Tell positions about drives that are missing right now
    fn apply_presence(&mut self) {
        let mut missing = vec![];
        for vp in self.groups.values().flat_map(|g| g.positions.values()) {
            let edges = std::iter::once(vp.source()).chain(vp.destination());
            for drive in edges {
                if !self.inventory.is_present(&drive) {
                    missing.push((vp.id(), drive));
                }
            }
        }
        for (position, drive) in missing {
            self.queue.push_back(Message::Position {
                position,
                input: PositionInput::Drive(DriveEvent::Removed(drive)),
            });
        }
    }

    fn with_position<F, R>(
        &mut self,
        now: Instant,
        position: PositionId,
        f: F,
    ) -> Option<R>
    where
        F: FnOnce(&mut VirtualPosition, &mut Vec<PositionOutput>) -> R,
    {
        let mut out = vec![];
        let vp = self
            .groups
            .get_mut(&position.group)?
            .positions
            .get_mut(&position.index)?;
        let result = f(vp, &mut out);
        self.route_position(now, position, out);
        Some(result)
    }

    // Run queued work until there is none left
    fn process(&mut self, now: Instant) {
        while let Some(msg) = self.queue.pop_front() {
            match msg {
                Message::Position { position, input } => {
                    self.with_position(now, position, |vp, out| {
                        vp.handle(now, input, out)
                    });
                }
                Message::Group { group: group_id, from, request } => {
                    let mut out = vec![];
                    if let Some(group) = self.groups.get_mut(&group_id) {
                        group.coordinator.handle(from, request, &mut out);
                    }
                    self.route_group(now, group_id, out);
                }
            }
        }
    }

    fn route_position(
        &mut self,
        now: Instant,
        position: PositionId,
        outputs: Vec<PositionOutput>,
    ) {
        for output in outputs {
            match output {
                PositionOutput::Group(request) => {
                    self.queue.push_back(Message::Group {
                        group: position.group,
                        from: position.index,
                        request,
                    });
                }
                PositionOutput::Spare(request) => {
                    let selected =
                        SpareSelector::new(&self.inventory).select(&request);
                    let result = match selected {
                        Ok(drive) => {
                            match self.inventory.bind(drive, request.position) {
                                Ok(()) => Ok(drive),
                                Err(err) => {
                                    warn!(
                                        self.log,
                                        "Spare bind failed";
                                        "err" => InlineErrorChain::new(&err),
                                    );
                                    Err(SpareError::NoSuitableSpare(
                                        request.position,
                                    ))
                                }
                            }
                        }
                        Err(err) => Err(err),
                    };
                    info!(
                        self.log,
                        "Spare selection";
                        "position" => %position,
                        "result" => ?result,
                    );
                    self.queue.push_back(Message::Position {
                        position,
                        input: PositionInput::Spare(result),
                    });
                }
                PositionOutput::Job(op, job) => {
                    self.outputs.push(Output::Io(IoRequest { op, job }));
                }
                PositionOutput::Persist(record) => {
                    self.outputs.push(Output::PersistCopyRecord(record));
                }
                PositionOutput::ClearRecord => {
                    self.outputs.push(Output::ClearCopyRecord(position));
                }
                PositionOutput::Barrier(boundary, snapshot) => {
                    let status =
                        self.peer.quiesce(now, boundary, snapshot, &mut self.outputs);
                    if status == BarrierStatus::Released {
                        self.queue.push_back(Message::Position {
                            position,
                            input: PositionInput::PeerAck(boundary),
                        });
                    }
                }
                PositionOutput::Replicate(snapshot) => {
                    self.peer.replicate_position(snapshot, &mut self.outputs);
                }
                PositionOutput::Event(code, severity, copy_state) => {
                    self.outputs.push(Output::Event(EventRecord {
                        group: position.group,
                        position: Some(position.index),
                        code,
                        severity,
                        copy_state,
                    }));
                }
                PositionOutput::MarkSourceEol(drive) => {
                    self.inventory.mark_end_of_life(&drive);
                }
                PositionOutput::ReleaseDrive(drive) => {
                    let bound_here = self
                        .inventory
                        .get(&drive)
                        .is_some_and(|d| d.bound_to == Some(position));
                    if bound_here {
                        self.inventory.release(&drive);
                    }
                }
                PositionOutput::Alarm(alarm) => {
                    error!(self.log, "Alarm"; "alarm" => ?alarm);
                    self.alarms.insert(alarm);
                }
            }
        }
    }

    fn route_group(
        &mut self,
        now: Instant,
        group_id: RaidGroupId,
        outputs: Vec<GroupOutput>,
    ) {
        for output in outputs {
            match output {
                GroupOutput::Reply { to, reply } => {
                    self.queue.push_back(Message::Position {
                        position: PositionId::new(group_id, to),
                        input: PositionInput::Group(reply),
                    });
                }
                GroupOutput::Rebuild { op, index, extent } => {
                    let position = PositionId::new(group_id, index);
                    let mut position_out = vec![];
                    let plan = self
                        .groups
                        .get_mut(&group_id)
                        .and_then(|g| g.positions.get_mut(&index))
                        .map(|vp| {
                            vp.plan_write(
                                extent.start,
                                extent.blocks,
                                &mut position_out,
                            )
                        });
                    self.route_position(now, position, position_out);
                    match plan {
                        Some(Ok(plan)) if !plan.targets.is_empty() => {
                            self.outputs.push(Output::Io(IoRequest {
                                op,
                                job: Job::RebuildChunk {
                                    position,
                                    extent,
                                    targets: plan.targets,
                                },
                            }));
                        }
                        _ => {
                            // Retried from a later tick
                            let mut out = vec![];
                            if let Some(group) = self.groups.get_mut(&group_id) {
                                group.coordinator.rebuild_complete(
                                    op,
                                    Err(IoError::PositionUnavailable(position)),
                                    &mut out,
                                );
                            }
                            self.route_group(now, group_id, out);
                        }
                    }
                }
                GroupOutput::Event { code, severity, position } => {
                    self.outputs.push(Output::Event(EventRecord {
                        group: group_id,
                        position,
                        code,
                        severity,
                        copy_state: None,
                    }));
                }
                GroupOutput::Persist(snapshot) => {
                    self.outputs.push(Output::PersistGroup(snapshot.clone()));
                    self.peer.replicate_group(snapshot, &mut self.outputs);
                }
                GroupOutput::StateChanged(state) => {
                    let Some(group) = self.groups.get(&group_id) else {
                        continue;
                    };
                    for index in group.positions.keys() {
                        self.queue.push_back(Message::Position {
                            position: PositionId::new(group_id, *index),
                            input: PositionInput::GroupState(state),
                        });
                    }
                }
            }
        }
    }
}
