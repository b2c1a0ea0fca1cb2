// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-position copy state machine
//!
//! A [`VirtualPosition`] presents one position of a redundancy group. In
//! steady state it passes I/O through to a single source drive. During a copy
//! it gains a destination edge, mirrors writes to both edges while the
//! destination is filled in, and finally hands the position over to the
//! destination.
//!
//! Virtual positions never perform I/O or touch group state themselves. All
//! of their side effects are pushed as [`PositionOutput`]s, and everything
//! they react to arrives as a [`PositionInput`]. The owning node routes both.

use crate::{
    Alarm, Checkpoint, CopyConfig, CopyRecord, DriveEvent, DriveLocation,
    EventCode, Extent, GroupReply, GroupRequest, GroupState, IoError, Job, Lba,
    OpId, OpOwner, PermissionKind, PositionId, PositionSnapshot,
    QuiesceBoundary, RaidGroupConfig, Region, Severity, SpareError,
    SparePurpose, SpareRequest, StartCopyError, WriteError, WritePlan,
};
use parse_display::Display;
use serde::{Deserialize, Serialize};
use slog::{Logger, debug, error, info, o, warn};
use slog_error_chain::{InlineErrorChain, SlogInlineError};
use std::collections::BTreeSet;
use std::time::Instant;
use thiserror::Error;

/// How a copy was requested
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
pub enum CopyKind {
    /// The source drive reported that it is about to fail
    #[display("proactive")]
    Proactive,
    #[display("user-initiated")]
    UserInitiated,
    #[display("user-initiated-to-{0}")]
    UserInitiatedToExplicitDestination(DriveLocation),
}

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
pub enum Requester {
    System,
    Operator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyRequest {
    pub position: PositionId,
    pub kind: CopyKind,
    pub requester: Requester,
}

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
pub enum Mode {
    /// I/O goes to the primary edge only
    PassThru,

    /// Writes go to both edges and reads to the primary
    Mirror,
}

/// Which edge of a position serves reads
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
pub enum EdgeRole {
    Source,
    Destination,
}

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
pub enum Lifecycle {
    Ready,

    /// The drive serving the position is gone
    Failed,
}

/// The states of a copy, in the only order they may be entered
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
pub enum CopyState {
    Requested,
    Started,
    SourceMarkedEol,
    DestinationSwapInStart,
    DestinationSwapInComplete,
    ModeSetToMirror,
    MetadataRebuildStart,
    MetadataRebuildComplete,
    UserRebuildStart,
    DesiredPercentageRebuilt,
    UserRebuildComplete,
    InitiateCompletionJob,
    ModeSetToPassThru,
    SourceSwapOutStart,
    SourceSwapOutComplete,
    Complete,
}

/// Test hooks that pause a copy at chosen points
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyHooks {
    /// Enter `DesiredPercentageRebuilt` once this much user data is copied
    pub desired_percentage: Option<u8>,

    /// Stop advancing after entering any of these states
    pub pause_at: BTreeSet<CopyState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, SlogInlineError)]
pub enum AbortCopyError {
    #[error("not the active node")]
    NotActive,
    #[error("unknown position {0}")]
    UnknownPosition(PositionId),
    #[error("no copy in progress at {0}")]
    NoCopyInProgress(PositionId),
    #[error("the copy at {0} is already completing")]
    CompletionInProgress(PositionId),
    #[error("the copy at {0} is already aborting")]
    AbortInProgress(PositionId),
    #[error("the source of {0} is missing")]
    SourceUnavailable(PositionId),
}

/// Everything a virtual position reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PositionInput {
    Drive(DriveEvent),
    Spare(Result<DriveLocation, SpareError>),
    OperationComplete(OpId),
    OperationFailed(OpId, IoError),
    Group(GroupReply),
    PeerAck(QuiesceBoundary),

    /// The state of the owning group changed
    GroupState(GroupState),
}

/// Side effects of a virtual position, routed by the node in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PositionOutput {
    Group(GroupRequest),
    Spare(SpareRequest),
    Job(OpId, Job),
    Persist(CopyRecord),
    ClearRecord,
    Barrier(QuiesceBoundary, PositionSnapshot),
    Replicate(PositionSnapshot),
    Event(EventCode, Severity, Option<CopyState>),
    MarkSourceEol(DriveLocation),
    ReleaseDrive(DriveLocation),
    Alarm(Alarm),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Edge {
    drive: DriveLocation,
    present: bool,
}

impl Edge {
    fn new(drive: DriveLocation) -> Edge {
        Edge { drive, present: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobKind {
    SwapIn,
    SwapOut,
    Metadata(Extent),
    User(Extent),

    /// Re-copy a chunk written while the destination was missing
    Repair(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wait {
    Idle,
    Backoff(Instant),
    Spare,
    Job(OpId, JobKind),
    Barrier(QuiesceBoundary),
    Permission { kind: PermissionKind, retry_at: Option<Instant> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AbortReason {
    Operator,
    DestinationLost,
}

#[derive(Debug, Clone)]
struct CopyOperation {
    kind: CopyKind,
    requester: Requester,
    state: CopyState,
    checkpoint: Checkpoint,

    /// Blocks of the metadata region copied so far
    metadata_checkpoint: Lba,
    wait: Wait,
    repair: BTreeSet<u64>,
    abort: Option<AbortReason>,

    /// The source timed out and the destination takes over
    handoff: bool,
    paused: bool,
    previously_bound: Option<DriveLocation>,
}

impl CopyOperation {
    fn new(kind: CopyKind, requester: Requester, capacity: Lba) -> Self {
        CopyOperation {
            kind,
            requester,
            state: CopyState::Requested,
            checkpoint: Checkpoint::new(capacity),
            metadata_checkpoint: 0,
            wait: Wait::Idle,
            repair: BTreeSet::new(),
            abort: None,
            handoff: false,
            paused: false,
            previously_bound: None,
        }
    }
}

/// The primary edge is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Missing {
    edge: EdgeRole,
    deadline: Instant,
    expired: bool,
}

/// Progress towards replacing a drive that has been missing too long
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replacement {
    Permission { retry_at: Option<Instant> },
    Spare,
    Backoff { drive: Option<DriveLocation>, until: Instant },
    SwapIn { op: OpId, drive: DriveLocation },
}

impl Replacement {
    fn drive(&self) -> Option<DriveLocation> {
        match self {
            Replacement::Backoff { drive, .. } => *drive,
            Replacement::SwapIn { drive, .. } => Some(*drive),
            Replacement::Permission { .. } | Replacement::Spare => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VirtualPosition {
    log: Logger,
    id: PositionId,
    capacity: Lba,
    metadata_capacity: Lba,
    chunk_size: Lba,
    config: CopyConfig,

    source: Edge,
    source_eol: bool,
    destination: Option<Edge>,
    primary: EdgeRole,
    mode: Mode,
    lifecycle: Lifecycle,

    copy: Option<CopyOperation>,
    missing: Option<Missing>,
    replacement: Option<Replacement>,
    spare_warned: bool,
    hooks: CopyHooks,

    /// Copies hold where they are while the group is failed
    group_failed: bool,

    generation: u64,
    next_seq: u64,
}

impl VirtualPosition {
    pub fn new(
        log: &Logger,
        group: &RaidGroupConfig,
        id: PositionId,
        drive: DriveLocation,
        config: CopyConfig,
    ) -> VirtualPosition {
        let log = log.new(o!(
            "component" => "VirtualPosition",
            "position" => id.to_string()
        ));
        VirtualPosition {
            log,
            id,
            capacity: group.capacity,
            metadata_capacity: group.metadata_capacity,
            chunk_size: group.chunk_size,
            config,
            source: Edge::new(drive),
            source_eol: false,
            destination: None,
            primary: EdgeRole::Source,
            mode: Mode::PassThru,
            lifecycle: Lifecycle::Ready,
            copy: None,
            missing: None,
            replacement: None,
            spare_warned: false,
            hooks: CopyHooks::default(),
            group_failed: false,
            generation: 0,
            next_seq: 0,
        }
    }

    /// Recreate a position from a replicated snapshot
    ///
    /// Any copy in the snapshot still has to be resumed.
    pub(crate) fn from_snapshot(
        log: &Logger,
        group: &RaidGroupConfig,
        snapshot: &PositionSnapshot,
        config: CopyConfig,
    ) -> VirtualPosition {
        let mut vp = VirtualPosition::new(
            log,
            group,
            snapshot.position,
            snapshot.source,
            config,
        );
        vp.generation = snapshot.generation;
        vp.lifecycle = snapshot.lifecycle;
        vp
    }

    pub fn id(&self) -> PositionId {
        self.id
    }

    pub fn source(&self) -> DriveLocation {
        self.source.drive
    }

    pub fn destination(&self) -> Option<DriveLocation> {
        self.destination.map(|d| d.drive)
    }

    pub fn primary(&self) -> EdgeRole {
        self.primary
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_copying(&self) -> bool {
        self.copy.is_some()
    }

    pub fn copy_state(&self) -> Option<CopyState> {
        self.copy.as_ref().map(|c| c.state)
    }

    pub fn checkpoint(&self) -> Option<Lba> {
        self.copy.as_ref().map(|c| c.checkpoint.lba())
    }

    pub fn hooks(&self) -> &CopyHooks {
        &self.hooks
    }

    /// Is `drive` one of this position's edges or its pending replacement?
    pub fn owns(&self, drive: DriveLocation) -> bool {
        self.source.drive == drive
            || self.destination.is_some_and(|d| d.drive == drive)
            || self.replacement.and_then(|r| r.drive()) == Some(drive)
    }

    /// The drive reads should be served from, if any
    pub fn read_target(&self) -> Option<DriveLocation> {
        let primary = match self.primary {
            EdgeRole::Source => Some(self.source),
            EdgeRole::Destination => self.destination,
        };
        match primary {
            Some(edge) if edge.present => Some(edge.drive),
            _ if self.fully_mirrored() => self.destination.map(|d| d.drive),
            _ => None,
        }
    }

    pub fn record(&self) -> Option<CopyRecord> {
        let copy = self.copy.as_ref()?;
        Some(CopyRecord {
            generation: self.generation,
            position: self.id,
            kind: copy.kind,
            requester: copy.requester,
            source: self.source.drive,
            destination: self.destination().or(copy.previously_bound),
            state: copy.state,
            mode: self.mode,
            checkpoint: copy.checkpoint.lba(),
            metadata_checkpoint: copy.metadata_checkpoint,
            repair: copy.repair.clone(),
        })
    }

    pub fn snapshot(&self) -> PositionSnapshot {
        PositionSnapshot {
            generation: self.generation,
            position: self.id,
            source: self.source.drive,
            destination: self.destination(),
            primary: self.primary,
            mode: self.mode,
            copy: self.record(),
            lifecycle: self.lifecycle,
        }
    }

    /// Every block of the position is on the destination as well
    fn fully_mirrored(&self) -> bool {
        let Some(copy) = &self.copy else {
            return false;
        };
        self.mode == Mode::Mirror
            && self.destination.is_some_and(|d| d.present)
            && copy.checkpoint.is_complete()
            && copy.metadata_checkpoint == self.metadata_capacity
            && copy.repair.is_empty()
    }

    pub(crate) fn set_hooks(
        &mut self,
        now: Instant,
        hooks: CopyHooks,
        out: &mut Vec<PositionOutput>,
    ) {
        self.hooks = hooks;
        if let Some(copy) = &mut self.copy {
            if copy.paused && !self.hooks.pause_at.contains(&copy.state) {
                info!(self.log, "Resuming paused copy"; "state" => %copy.state);
                copy.paused = false;
            }
        }
        self.advance(now, out);
    }

    pub(crate) fn start_copy(
        &mut self,
        now: Instant,
        kind: CopyKind,
        requester: Requester,
        out: &mut Vec<PositionOutput>,
    ) -> Result<(), StartCopyError> {
        if self.copy.is_some() {
            return Err(StartCopyError::CopyInProgress(self.id));
        }
        if !self.source.present || self.missing.is_some() {
            return Err(StartCopyError::SourceNotPresent(self.id));
        }
        info!(
            self.log,
            "Starting copy";
            "kind" => %kind,
            "requester" => %requester,
            "source" => %self.source.drive,
        );
        self.copy = Some(CopyOperation::new(kind, requester, self.capacity));
        out.push(PositionOutput::Event(
            EventCode::CopyStarted,
            Severity::Info,
            None,
        ));
        self.enter(CopyState::Requested, out);
        self.advance(now, out);
        Ok(())
    }

    pub(crate) fn abort_copy(
        &mut self,
        out: &mut Vec<PositionOutput>,
    ) -> Result<(), AbortCopyError> {
        let id = self.id;
        let Some(copy) = &self.copy else {
            return Err(AbortCopyError::NoCopyInProgress(id));
        };
        if copy.state >= CopyState::ModeSetToPassThru
            || self.primary == EdgeRole::Destination
            || copy.wait == Wait::Barrier(QuiesceBoundary::LeaveMirror)
        {
            return Err(AbortCopyError::CompletionInProgress(id));
        }
        if copy.abort.is_some() {
            return Err(AbortCopyError::AbortInProgress(id));
        }
        if self.missing.is_some() {
            return Err(AbortCopyError::SourceUnavailable(id));
        }

        if self.mode == Mode::PassThru {
            self.cancel(out);
        } else {
            self.request_abort(AbortReason::Operator, out);
        }
        Ok(())
    }

    pub(crate) fn handle(
        &mut self,
        now: Instant,
        input: PositionInput,
        out: &mut Vec<PositionOutput>,
    ) {
        match input {
            PositionInput::Drive(event) => self.drive_event(now, event, out),
            PositionInput::Spare(result) => self.spare_reply(now, result, out),
            PositionInput::OperationComplete(op) => {
                self.operation_complete(now, op, out)
            }
            PositionInput::OperationFailed(op, err) => {
                self.operation_failed(now, op, err)
            }
            PositionInput::Group(reply) => self.group_reply(now, reply, out),
            PositionInput::PeerAck(boundary) => {
                self.peer_ack(now, boundary, out)
            }
            PositionInput::GroupState(state) => {
                self.set_group_failed(state == GroupState::Failed);
                self.advance(now, out);
            }
        }
    }

    /// Hold or release copy progress for the owning group's state
    pub(crate) fn set_group_failed(&mut self, failed: bool) {
        if self.group_failed == failed {
            return;
        }
        self.group_failed = failed;
        if let Some(copy) = &self.copy {
            if failed {
                warn!(
                    self.log,
                    "Group failed, holding copy";
                    "state" => %copy.state,
                );
            } else {
                info!(
                    self.log,
                    "Group recovered, resuming copy";
                    "state" => %copy.state,
                );
            }
        }
    }

    pub(crate) fn tick(&mut self, now: Instant, out: &mut Vec<PositionOutput>) {
        if let Some(copy) = &mut self.copy {
            if let Wait::Permission { kind, retry_at: Some(at) } = copy.wait {
                if now >= at {
                    copy.wait = Wait::Permission { kind, retry_at: None };
                    out.push(PositionOutput::Group(GroupRequest::Permission(
                        kind,
                    )));
                }
            }
        }

        let replacement = self.replacement;
        match replacement {
            Some(Replacement::Permission { retry_at: Some(at) })
                if now >= at =>
            {
                self.replacement =
                    Some(Replacement::Permission { retry_at: None });
                out.push(PositionOutput::Group(GroupRequest::Permission(
                    PermissionKind::PermanentSpare,
                )));
            }
            Some(Replacement::Backoff { drive, until }) if now >= until => {
                match drive {
                    Some(drive) => self.swap_in_replacement(drive, out),
                    None => self.request_replacement_spare(out),
                }
            }
            _ => {}
        }

        let expired = self
            .missing
            .is_some_and(|m| !m.expired && now >= m.deadline);
        if expired {
            if let Some(missing) = &mut self.missing {
                missing.expired = true;
            }
            self.missing_expired(now, out);
        }

        self.advance(now, out);
    }

    /// Plan a write of `blocks` blocks at `lba`
    ///
    /// A write the destination misses below the checkpoint is recorded for
    /// repair, and the updated copy record is persisted before the write is
    /// acknowledged.
    pub(crate) fn plan_write(
        &mut self,
        lba: Lba,
        blocks: Lba,
        out: &mut Vec<PositionOutput>,
    ) -> Result<WritePlan, WriteError> {
        let position = self.id;
        let plan = move |targets| WritePlan { position, targets, logged: false };
        if self.primary == EdgeRole::Destination {
            return match self.destination {
                Some(dest) if dest.present => Ok(plan(vec![dest.drive])),
                _ => Err(WriteError::Retryable(self.id)),
            };
        }
        match (self.mode, self.destination) {
            (Mode::Mirror, Some(dest)) => {
                match (self.source.present, dest.present) {
                    (true, true) => {
                        Ok(plan(vec![self.source.drive, dest.drive]))
                    }
                    (true, false) => {
                        if self.mark_repair(lba, blocks) {
                            self.persist(out);
                        }
                        Ok(plan(vec![self.source.drive]))
                    }
                    (false, true) if self.fully_mirrored() => {
                        Ok(plan(vec![dest.drive]))
                    }
                    _ => Err(WriteError::Retryable(self.id)),
                }
            }
            _ if self.source.present => Ok(plan(vec![self.source.drive])),
            _ => Err(WriteError::Retryable(self.id)),
        }
    }

    // Chunks below the checkpoint that the missing destination did not see.
    // Returns true if any were new.
    fn mark_repair(&mut self, lba: Lba, blocks: Lba) -> bool {
        let chunk_size = self.chunk_size;
        let Some(copy) = &mut self.copy else {
            return false;
        };
        let checkpoint = copy.checkpoint.lba();
        let extent = Extent { region: Region::User, start: lba, blocks };
        let mut added = false;
        for chunk in extent.chunks(chunk_size) {
            if chunk * chunk_size < checkpoint {
                added |= copy.repair.insert(chunk);
            }
        }
        added
    }

    /// Pick up a copy from a persisted or replicated record
    pub(crate) fn resume(
        &mut self,
        now: Instant,
        record: CopyRecord,
        out: &mut Vec<PositionOutput>,
    ) {
        self.generation = self.generation.max(record.generation);
        let actual = self.source.drive;
        if record.source != actual {
            if record.state >= CopyState::SourceSwapOutComplete
                && record.destination == Some(actual)
            {
                // The swap was recorded by the group before the record was
                // cleared
                info!(self.log, "Copy already completed"; "old_source" => %record.source);
                out.push(PositionOutput::MarkSourceEol(record.source));
                out.push(PositionOutput::ReleaseDrive(record.source));
                out.push(PositionOutput::ClearRecord);
                out.push(PositionOutput::Event(
                    EventCode::CopyCompleted,
                    Severity::Info,
                    None,
                ));
                return;
            }
            error!(
                self.log,
                "Copy record does not match position";
                "recorded" => %record.source,
                "actual" => %actual,
            );
            out.push(PositionOutput::Alarm(Alarm::CopyRecordMismatch {
                position: self.id,
                recorded: record.source,
                actual,
            }));
            out.push(PositionOutput::ClearRecord);
            return;
        }

        let checkpoint = match Checkpoint::restore(record.checkpoint, self.capacity)
        {
            Ok(checkpoint) if record.metadata_checkpoint <= self.metadata_capacity => {
                checkpoint
            }
            _ => {
                error!(
                    self.log,
                    "Invalid checkpoint in copy record";
                    "checkpoint" => record.checkpoint,
                    "metadata_checkpoint" => record.metadata_checkpoint,
                );
                out.push(PositionOutput::Alarm(Alarm::InvalidCheckpoint {
                    position: self.id,
                    checkpoint: record.checkpoint,
                    capacity: self.capacity,
                }));
                out.push(PositionOutput::ClearRecord);
                return;
            }
        };

        let mut copy =
            CopyOperation::new(record.kind, record.requester, self.capacity);
        copy.checkpoint = checkpoint;
        copy.metadata_checkpoint = record.metadata_checkpoint;
        copy.previously_bound = record.destination;
        copy.repair = record
            .repair
            .iter()
            .copied()
            .filter(|chunk| chunk * self.chunk_size < record.checkpoint)
            .collect();
        if record.state >= CopyState::SourceMarkedEol {
            self.source_eol = true;
        }

        // Until mirror mode was entered the destination holds nothing worth
        // keeping, so it is selected and swapped in again
        copy.state = match record.destination {
            Some(dest) if record.state >= CopyState::ModeSetToMirror => {
                self.destination = Some(Edge::new(dest));
                if record.state >= CopyState::ModeSetToPassThru {
                    self.primary = EdgeRole::Destination;
                    self.mode = Mode::PassThru;
                    match record.state {
                        // The swap-out is reissued
                        CopyState::SourceSwapOutStart => {
                            CopyState::ModeSetToPassThru
                        }
                        state => state.min(CopyState::SourceSwapOutComplete),
                    }
                } else {
                    self.mode = Mode::Mirror;
                    record.state
                }
            }
            _ if record.state < CopyState::SourceMarkedEol => record.state,
            _ => CopyState::SourceMarkedEol,
        };
        info!(
            self.log,
            "Resuming copy";
            "recorded_state" => %record.state,
            "state" => %copy.state,
            "checkpoint" => copy.checkpoint.lba(),
        );
        self.copy = Some(copy);
        self.persist(out);
        self.advance(now, out);
    }

    fn drive_event(
        &mut self,
        now: Instant,
        event: DriveEvent,
        out: &mut Vec<PositionOutput>,
    ) {
        let destination = self.destination();
        let replacement = self.replacement.and_then(|r| r.drive());
        match event {
            DriveEvent::Removed(drive) if drive == self.source.drive => {
                self.source_removed(now, out)
            }
            DriveEvent::Inserted(drive) if drive == self.source.drive => {
                self.source_inserted(now, out)
            }
            DriveEvent::Removed(drive) if destination == Some(drive) => {
                self.destination_removed(now, out)
            }
            DriveEvent::Inserted(drive) if destination == Some(drive) => {
                self.destination_inserted(now, out)
            }
            DriveEvent::EndOfLife(drive) if drive == self.source.drive => {
                self.source_eol = true;
            }
            DriveEvent::Removed(drive) if replacement == Some(drive) => {
                warn!(self.log, "Replacement drive removed"; "drive" => %drive);
                out.push(PositionOutput::ReleaseDrive(drive));
                self.replacement = Some(Replacement::Backoff {
                    drive: None,
                    until: now + self.config.spare_retry_interval,
                });
            }
            _ => {}
        }
    }

    fn source_removed(&mut self, now: Instant, out: &mut Vec<PositionOutput>) {
        if !self.source.present {
            return;
        }
        self.source.present = false;

        if self.copy.is_none() {
            self.degrade(
                now,
                EdgeRole::Source,
                self.config.permanent_spare_trigger,
                EventCode::PositionDriveLost,
                out,
            );
            return;
        }
        if self.primary == EdgeRole::Destination || self.fully_mirrored() {
            // The destination already holds everything
            warn!(self.log, "Source removed after it was fully copied");
            out.push(PositionOutput::Event(
                EventCode::SourceLost,
                Severity::Warning,
                self.copy_state(),
            ));
            self.replicate(out);
            return;
        }

        if let Some(copy) = &mut self.copy {
            if matches!(copy.wait, Wait::Job(..) | Wait::Backoff(_)) {
                copy.wait = Wait::Idle;
            }
        }
        self.degrade(
            now,
            EdgeRole::Source,
            self.config.source_return_timeout,
            EventCode::SourceLost,
            out,
        );
    }

    fn source_inserted(&mut self, now: Instant, out: &mut Vec<PositionOutput>) {
        if self.source.present {
            return;
        }
        self.source.present = true;
        if self.missing.is_some_and(|m| m.edge == EdgeRole::Source) {
            let code = if self.copy.is_some() {
                EventCode::SourceReturned
            } else {
                EventCode::PositionDriveReturned
            };
            self.recover(code, out);
        } else if self.copy.is_some() {
            out.push(PositionOutput::Event(
                EventCode::SourceReturned,
                Severity::Info,
                self.copy_state(),
            ));
        }
        self.advance(now, out);
    }

    fn destination_removed(
        &mut self,
        now: Instant,
        out: &mut Vec<PositionOutput>,
    ) {
        let Some(dest) = &mut self.destination else {
            return;
        };
        if !dest.present {
            return;
        }
        dest.present = false;

        if self.primary == EdgeRole::Destination {
            self.degrade(
                now,
                EdgeRole::Destination,
                self.config.permanent_spare_trigger,
                EventCode::PositionDriveLost,
                out,
            );
            return;
        }

        let Some(copy) = &mut self.copy else {
            return;
        };
        warn!(self.log, "Destination removed"; "state" => %copy.state);
        match copy.wait {
            Wait::Job(..) | Wait::Backoff(_) => copy.wait = Wait::Idle,
            Wait::Permission { kind, .. }
                if kind != PermissionKind::AbortCopy =>
            {
                copy.wait = Wait::Idle;
                out.push(PositionOutput::Group(GroupRequest::Withdraw(kind)));
            }
            _ => {}
        }
        out.push(PositionOutput::Event(
            EventCode::DestinationLost,
            Severity::Warning,
            Some(copy.state),
        ));
        self.replicate(out);
        self.advance(now, out);
    }

    fn destination_inserted(
        &mut self,
        now: Instant,
        out: &mut Vec<PositionOutput>,
    ) {
        let Some(dest) = &mut self.destination else {
            return;
        };
        if dest.present {
            return;
        }
        dest.present = true;

        if self.missing.is_some_and(|m| m.edge == EdgeRole::Destination) {
            self.recover(EventCode::PositionDriveReturned, out);
            self.advance(now, out);
            return;
        }

        if let Some(copy) = &mut self.copy {
            let awaiting_abort = matches!(
                copy.wait,
                Wait::Permission { kind: PermissionKind::AbortCopy, .. }
            );
            if copy.abort == Some(AbortReason::DestinationLost) && awaiting_abort
            {
                info!(
                    self.log,
                    "Destination returned, withdrawing abort";
                    "repair_chunks" => copy.repair.len(),
                );
                copy.abort = None;
                copy.wait = Wait::Idle;
                out.push(PositionOutput::Group(GroupRequest::Withdraw(
                    PermissionKind::AbortCopy,
                )));
            }
            out.push(PositionOutput::Event(
                EventCode::DestinationReturned,
                Severity::Info,
                Some(copy.state),
            ));
        }
        self.advance(now, out);
    }

    // The primary edge is gone. The group logs writes for this position
    // until it returns or is replaced.
    fn degrade(
        &mut self,
        now: Instant,
        edge: EdgeRole,
        timeout: std::time::Duration,
        code: EventCode,
        out: &mut Vec<PositionOutput>,
    ) {
        warn!(
            self.log,
            "Position degraded";
            "edge" => %edge,
            "timeout" => ?timeout,
        );
        self.missing =
            Some(Missing { edge, deadline: now + timeout, expired: false });
        self.lifecycle = Lifecycle::Failed;
        out.push(PositionOutput::Group(GroupRequest::MarkRebuildLogging));
        out.push(PositionOutput::Event(code, Severity::Error, self.copy_state()));
        self.replicate(out);
    }

    // The missing primary edge came back
    fn recover(&mut self, code: EventCode, out: &mut Vec<PositionOutput>) {
        info!(self.log, "Position recovered");
        self.missing = None;
        self.lifecycle = Lifecycle::Ready;
        self.withdraw_replacement(out);
        if let Some(copy) = &mut self.copy {
            if let Wait::Permission {
                kind: PermissionKind::SwapOutFailedSource,
                ..
            } = copy.wait
            {
                copy.wait = Wait::Idle;
                out.push(PositionOutput::Group(GroupRequest::Withdraw(
                    PermissionKind::SwapOutFailedSource,
                )));
            }
        }
        out.push(PositionOutput::Group(GroupRequest::ClearRebuildLogging));
        out.push(PositionOutput::Event(code, Severity::Info, self.copy_state()));
        self.replicate(out);
    }

    fn withdraw_replacement(&mut self, out: &mut Vec<PositionOutput>) {
        let Some(replacement) = self.replacement.take() else {
            return;
        };
        if let Replacement::Permission { .. } = replacement {
            out.push(PositionOutput::Group(GroupRequest::Withdraw(
                PermissionKind::PermanentSpare,
            )));
        }
        if let Some(drive) = replacement.drive() {
            out.push(PositionOutput::ReleaseDrive(drive));
        }
    }

    fn missing_expired(&mut self, now: Instant, out: &mut Vec<PositionOutput>) {
        let Some(missing) = self.missing else {
            return;
        };
        match &mut self.copy {
            Some(copy) if missing.edge == EdgeRole::Source => {
                warn!(self.log, "Source did not return in time"; "state" => %copy.state);
                out.push(PositionOutput::Event(
                    EventCode::SourceTimeoutExpired,
                    Severity::Warning,
                    Some(copy.state),
                ));
                if let Wait::Permission { kind, .. } = copy.wait {
                    out.push(PositionOutput::Group(GroupRequest::Withdraw(kind)));
                }
                copy.abort = None;
                let destination_ready = self.mode == Mode::Mirror
                    && self.destination.is_some_and(|d| d.present)
                    && copy.state >= CopyState::MetadataRebuildComplete;
                if destination_ready {
                    copy.wait = Wait::Permission {
                        kind: PermissionKind::SwapOutFailedSource,
                        retry_at: None,
                    };
                    out.push(PositionOutput::Group(GroupRequest::Permission(
                        PermissionKind::SwapOutFailedSource,
                    )));
                } else {
                    self.abort_unrecoverable(now, out);
                }
            }
            Some(_) => {
                // Replacement waits until the copy has finished
                self.missing = Some(Missing {
                    deadline: now + self.config.permanent_spare_trigger,
                    ..missing
                });
            }
            None => {
                info!(self.log, "Requesting permanent spare");
                self.replacement =
                    Some(Replacement::Permission { retry_at: None });
                out.push(PositionOutput::Group(GroupRequest::Permission(
                    PermissionKind::PermanentSpare,
                )));
            }
        }
    }

    fn spare_reply(
        &mut self,
        now: Instant,
        result: Result<DriveLocation, SpareError>,
        out: &mut Vec<PositionOutput>,
    ) {
        if self.replacement == Some(Replacement::Spare) {
            self.replacement_spare_reply(now, result, out);
            return;
        }
        let Some(copy) = &mut self.copy else {
            if let Ok(drive) = result {
                out.push(PositionOutput::ReleaseDrive(drive));
            }
            return;
        };
        if copy.wait != Wait::Spare {
            if let Ok(drive) = result {
                out.push(PositionOutput::ReleaseDrive(drive));
            }
            return;
        }
        copy.wait = Wait::Idle;
        match result {
            Ok(drive) => {
                info!(self.log, "Destination selected"; "drive" => %drive);
                if let Some(previous) = copy.previously_bound {
                    if previous != drive {
                        out.push(PositionOutput::ReleaseDrive(previous));
                    }
                }
                copy.previously_bound = None;
                self.spare_warned = false;
                self.destination = Some(Edge::new(drive));
                self.enter(CopyState::DestinationSwapInStart, out);
                self.advance(now, out);
            }
            Err(SpareError::NoSuitableSpare(_)) => {
                if !self.spare_warned {
                    warn!(self.log, "No suitable spare");
                    self.spare_warned = true;
                    out.push(PositionOutput::Event(
                        EventCode::NoSuitableSpare,
                        Severity::Warning,
                        Some(copy.state),
                    ));
                }
                copy.wait =
                    Wait::Backoff(now + self.config.spare_retry_interval);
            }
            Err(err) => {
                warn!(
                    self.log,
                    "Copy request rejected";
                    "err" => InlineErrorChain::new(&err),
                );
                if let Some(previous) = copy.previously_bound {
                    out.push(PositionOutput::ReleaseDrive(previous));
                }
                self.copy = None;
                self.spare_warned = false;
                out.push(PositionOutput::ClearRecord);
                out.push(PositionOutput::Event(
                    EventCode::CopyRequestRejected,
                    Severity::Error,
                    None,
                ));
                self.replicate(out);
            }
        }
    }

    fn replacement_spare_reply(
        &mut self,
        now: Instant,
        result: Result<DriveLocation, SpareError>,
        out: &mut Vec<PositionOutput>,
    ) {
        match result {
            Ok(drive) => {
                self.spare_warned = false;
                self.swap_in_replacement(drive, out);
            }
            Err(err) => {
                if !self.spare_warned {
                    warn!(
                        self.log,
                        "No permanent spare";
                        "err" => InlineErrorChain::new(&err),
                    );
                    self.spare_warned = true;
                    out.push(PositionOutput::Event(
                        EventCode::NoSuitableSpare,
                        Severity::Warning,
                        None,
                    ));
                }
                self.replacement = Some(Replacement::Backoff {
                    drive: None,
                    until: now + self.config.spare_retry_interval,
                });
            }
        }
    }

    fn request_replacement_spare(&mut self, out: &mut Vec<PositionOutput>) {
        self.replacement = Some(Replacement::Spare);
        out.push(PositionOutput::Spare(SpareRequest {
            position: self.id,
            purpose: SparePurpose::Permanent,
            replacing: self.primary_edge().drive,
            capacity: self.required_capacity(),
            previously_bound: None,
        }));
    }

    fn swap_in_replacement(
        &mut self,
        drive: DriveLocation,
        out: &mut Vec<PositionOutput>,
    ) {
        let op = self.next_op();
        self.replacement = Some(Replacement::SwapIn { op, drive });
        out.push(PositionOutput::Job(op, Job::SwapIn { drive }));
    }

    fn replacement_swapped_in(
        &mut self,
        drive: DriveLocation,
        out: &mut Vec<PositionOutput>,
    ) {
        let old = self.primary_edge().drive;
        info!(
            self.log,
            "Permanent spare swapped in";
            "old" => %old,
            "new" => %drive,
        );
        self.source = Edge::new(drive);
        self.destination = None;
        self.primary = EdgeRole::Source;
        self.mode = Mode::PassThru;
        self.source_eol = false;
        self.replacement = None;
        self.missing = None;
        self.lifecycle = Lifecycle::Ready;
        out.push(PositionOutput::ReleaseDrive(old));
        out.push(PositionOutput::Group(GroupRequest::MemberReplaced { drive }));
        out.push(PositionOutput::Group(GroupRequest::PermanentSpareSwappedIn));
        out.push(PositionOutput::Event(
            EventCode::PermanentSpareSwappedIn,
            Severity::Info,
            None,
        ));
        self.replicate(out);
    }

    fn operation_complete(
        &mut self,
        now: Instant,
        op: OpId,
        out: &mut Vec<PositionOutput>,
    ) {
        if let Some(Replacement::SwapIn { op: pending, drive }) =
            self.replacement
        {
            if pending == op {
                self.replacement_swapped_in(drive, out);
                return;
            }
        }
        let Some(copy) = &mut self.copy else {
            return;
        };
        let Wait::Job(pending, kind) = copy.wait else {
            debug!(self.log, "Ignoring stale completion"; "op" => ?op);
            return;
        };
        if pending != op {
            debug!(self.log, "Ignoring stale completion"; "op" => ?op);
            return;
        }
        copy.wait = Wait::Idle;

        match kind {
            JobKind::SwapIn => {
                self.enter(CopyState::DestinationSwapInComplete, out)
            }
            JobKind::SwapOut => {
                self.enter(CopyState::SourceSwapOutComplete, out)
            }
            JobKind::Metadata(extent) => {
                copy.metadata_checkpoint = extent.end() - self.capacity;
                self.persist(out);
            }
            JobKind::User(extent) => {
                if let Err(err) = copy.checkpoint.advance_to(extent.end()) {
                    error!(
                        self.log,
                        "Rejected checkpoint";
                        "err" => InlineErrorChain::new(&err),
                    );
                    out.push(PositionOutput::Alarm(Alarm::CheckpointRejected {
                        position: self.id,
                        current: copy.checkpoint.lba(),
                        requested: extent.end(),
                    }));
                }
                let reached = self.hooks.desired_percentage.is_some_and(|p| {
                    copy.state == CopyState::UserRebuildStart
                        && copy.checkpoint.percent_rebuilt() >= p
                });
                if reached {
                    self.enter(CopyState::DesiredPercentageRebuilt, out);
                } else {
                    self.persist(out);
                }
            }
            JobKind::Repair(chunk) => {
                copy.repair.remove(&chunk);
            }
        }
        self.advance(now, out);
    }

    fn operation_failed(&mut self, now: Instant, op: OpId, err: IoError) {
        let until = now + self.config.operation_retry_interval;
        if let Some(Replacement::SwapIn { op: pending, drive }) =
            self.replacement
        {
            if pending == op {
                warn!(
                    self.log,
                    "Replacement swap-in failed";
                    "err" => InlineErrorChain::new(&err),
                );
                self.replacement =
                    Some(Replacement::Backoff { drive: Some(drive), until });
                return;
            }
        }
        let Some(copy) = &mut self.copy else {
            return;
        };
        if let Wait::Job(pending, kind) = copy.wait {
            if pending == op {
                warn!(
                    self.log,
                    "Copy job failed";
                    "job" => ?kind,
                    "err" => InlineErrorChain::new(&err),
                );
                copy.wait = Wait::Backoff(until);
            }
        }
    }

    fn group_reply(
        &mut self,
        now: Instant,
        reply: GroupReply,
        out: &mut Vec<PositionOutput>,
    ) {
        match reply {
            GroupReply::Granted(PermissionKind::PermanentSpare) => {
                if let Some(Replacement::Permission { .. }) = self.replacement {
                    info!(self.log, "Permanent spare granted");
                    self.request_replacement_spare(out);
                }
            }
            GroupReply::Denied { kind: PermissionKind::PermanentSpare, reason } => {
                if let Some(Replacement::Permission { .. }) = self.replacement {
                    info!(self.log, "Permanent spare denied"; "reason" => ?reason);
                    self.replacement = None;
                    if let Some(missing) = &mut self.missing {
                        missing.deadline =
                            now + self.config.permanent_spare_trigger;
                        missing.expired = false;
                    }
                }
            }
            GroupReply::Granted(kind) => {
                let Some(copy) = &mut self.copy else {
                    return;
                };
                if !matches!(copy.wait, Wait::Permission { kind: k, .. } if k == kind)
                {
                    debug!(self.log, "Ignoring stale grant"; "kind" => %kind);
                    return;
                }
                info!(self.log, "Permission granted"; "kind" => %kind);
                match kind {
                    PermissionKind::CompleteCopy => {
                        self.barrier(QuiesceBoundary::LeaveMirror, out)
                    }
                    PermissionKind::SwapOutFailedSource => {
                        copy.handoff = true;
                        self.barrier(QuiesceBoundary::LeaveMirror, out)
                    }
                    PermissionKind::AbortCopy => {
                        self.barrier(QuiesceBoundary::Abort, out)
                    }
                    PermissionKind::PermanentSpare => {}
                }
            }
            GroupReply::Denied { kind, reason } => {
                let Some(copy) = &mut self.copy else {
                    return;
                };
                if let Wait::Permission { kind: k, retry_at: None } = copy.wait {
                    if k == kind {
                        info!(
                            self.log,
                            "Permission denied, will retry";
                            "kind" => %kind,
                            "reason" => ?reason,
                        );
                        copy.wait = Wait::Permission {
                            kind,
                            retry_at: Some(
                                now + self.config.permission_retry_interval,
                            ),
                        };
                    }
                }
            }
        }
    }

    fn peer_ack(
        &mut self,
        now: Instant,
        boundary: QuiesceBoundary,
        out: &mut Vec<PositionOutput>,
    ) {
        let Some(copy) = &mut self.copy else {
            return;
        };
        if copy.wait != Wait::Barrier(boundary) {
            return;
        }
        copy.wait = Wait::Idle;
        debug!(self.log, "Quiesce boundary passed"; "boundary" => %boundary);

        match boundary {
            QuiesceBoundary::EnterMirror => {
                self.mode = Mode::Mirror;
                self.enter(CopyState::ModeSetToMirror, out);
            }
            QuiesceBoundary::LeaveMirror => {
                if !self.destination.is_some_and(|d| d.present) {
                    if copy.handoff {
                        // Neither edge is left
                        self.abort_unrecoverable(now, out);
                        return;
                    }
                    // Falls through to an abort
                    self.advance(now, out);
                    return;
                }
                let handoff = std::mem::take(&mut copy.handoff);
                let checkpoint = copy.checkpoint.lba();
                let repair = std::mem::take(&mut copy.repair);
                self.primary = EdgeRole::Destination;
                self.mode = Mode::PassThru;
                if handoff {
                    info!(
                        self.log,
                        "Handing off uncopied tail";
                        "checkpoint" => checkpoint,
                        "repair_chunks" => repair.len(),
                    );
                    self.missing = None;
                    self.lifecycle = Lifecycle::Ready;
                    out.push(PositionOutput::Group(
                        GroupRequest::HandOffCheckpoint { checkpoint, repair },
                    ));
                }
                self.enter(CopyState::ModeSetToPassThru, out);
            }
            QuiesceBoundary::Complete => {
                out.push(PositionOutput::ClearRecord);
                self.enter(CopyState::Complete, out);
                self.copy = None;
                info!(self.log, "Copy complete"; "source" => %self.source.drive);
                out.push(PositionOutput::Event(
                    EventCode::CopyCompleted,
                    Severity::Info,
                    None,
                ));
                self.replicate(out);
                return;
            }
            QuiesceBoundary::Abort => {
                self.finish_abort(out);
                return;
            }
        }
        self.advance(now, out);
    }

    // Run the copy forward until it has to wait for something
    fn advance(&mut self, now: Instant, out: &mut Vec<PositionOutput>) {
        if let Some(copy) = &mut self.copy {
            if matches!(copy.wait, Wait::Backoff(until) if now >= until) {
                copy.wait = Wait::Idle;
            }
        }
        loop {
            let Some(copy) = &self.copy else {
                return;
            };
            if copy.wait != Wait::Idle {
                return;
            }
            if self.missing.is_some() && self.primary == EdgeRole::Source {
                return;
            }
            // Failure handling is never held back by hooks
            if self.primary == EdgeRole::Source
                && self.destination.is_some_and(|d| !d.present)
            {
                self.request_abort(AbortReason::DestinationLost, out);
                return;
            }
            if copy.paused || self.group_failed {
                return;
            }

            let repair = copy.repair.first().copied();
            match copy.state {
                CopyState::Requested => self.enter(CopyState::Started, out),
                CopyState::Started => {
                    if !self.source_eol {
                        self.source_eol = true;
                        out.push(PositionOutput::MarkSourceEol(
                            self.source.drive,
                        ));
                    }
                    self.enter(CopyState::SourceMarkedEol, out);
                }
                CopyState::SourceMarkedEol => {
                    self.request_spare(out);
                    return;
                }
                CopyState::DestinationSwapInStart => {
                    let Some(dest) = self.destination else {
                        self.set_state(CopyState::SourceMarkedEol);
                        continue;
                    };
                    self.issue(
                        JobKind::SwapIn,
                        Job::SwapIn { drive: dest.drive },
                        out,
                    );
                    return;
                }
                CopyState::DestinationSwapInComplete => {
                    self.barrier(QuiesceBoundary::EnterMirror, out);
                    return;
                }
                CopyState::ModeSetToMirror => {
                    self.enter(CopyState::MetadataRebuildStart, out)
                }
                CopyState::MetadataRebuildStart => {
                    let cursor = self.capacity + copy.metadata_checkpoint;
                    let end = self.capacity + self.metadata_capacity;
                    match self.next_extent(Region::Metadata, cursor, end) {
                        Some(extent) => {
                            self.copy_extent(JobKind::Metadata(extent), extent, out);
                            return;
                        }
                        None => {
                            self.enter(CopyState::MetadataRebuildComplete, out)
                        }
                    }
                }
                CopyState::MetadataRebuildComplete => {
                    self.enter(CopyState::UserRebuildStart, out)
                }
                CopyState::UserRebuildStart
                | CopyState::DesiredPercentageRebuilt => {
                    if let Some(chunk) = repair {
                        self.repair_chunk(chunk, out);
                        return;
                    }
                    let cursor = copy.checkpoint.lba();
                    match self.next_extent(Region::User, cursor, self.capacity) {
                        Some(extent) => {
                            self.copy_extent(JobKind::User(extent), extent, out);
                            return;
                        }
                        None => self.enter(CopyState::UserRebuildComplete, out),
                    }
                }
                CopyState::UserRebuildComplete => {
                    if let Some(chunk) = repair {
                        self.repair_chunk(chunk, out);
                        return;
                    }
                    self.enter(CopyState::InitiateCompletionJob, out)
                }
                CopyState::InitiateCompletionJob => {
                    if let Some(chunk) = repair {
                        self.repair_chunk(chunk, out);
                        return;
                    }
                    self.request_permission(PermissionKind::CompleteCopy, out);
                    return;
                }
                CopyState::ModeSetToPassThru => {
                    self.enter(CopyState::SourceSwapOutStart, out)
                }
                CopyState::SourceSwapOutStart => {
                    let drive = self.source.drive;
                    self.issue(JobKind::SwapOut, Job::SwapOut { drive }, out);
                    return;
                }
                CopyState::SourceSwapOutComplete => {
                    self.finalize(out);
                    return;
                }
                CopyState::Complete => return,
            }
        }
    }

    // Enter a copy state, persist it and report it
    fn enter(&mut self, state: CopyState, out: &mut Vec<PositionOutput>) {
        let pause = self.hooks.pause_at.contains(&state);
        let Some(copy) = &mut self.copy else {
            return;
        };
        copy.state = state;
        copy.paused = pause;
        info!(self.log, "Copy state"; "state" => %state, "paused" => pause);
        out.push(PositionOutput::Event(
            EventCode::CopyState,
            Severity::Info,
            Some(state),
        ));
        if state == CopyState::Complete {
            self.replicate(out);
        } else {
            self.persist(out);
        }
    }

    fn set_state(&mut self, state: CopyState) {
        if let Some(copy) = &mut self.copy {
            copy.state = state;
        }
    }

    fn persist(&mut self, out: &mut Vec<PositionOutput>) {
        self.generation += 1;
        if let Some(record) = self.record() {
            out.push(PositionOutput::Persist(record));
        }
        out.push(PositionOutput::Replicate(self.snapshot()));
    }

    fn replicate(&mut self, out: &mut Vec<PositionOutput>) {
        self.generation += 1;
        out.push(PositionOutput::Replicate(self.snapshot()));
    }

    fn next_op(&mut self) -> OpId {
        let op = OpId { owner: OpOwner::Position(self.id), seq: self.next_seq };
        self.next_seq += 1;
        op
    }

    fn issue(&mut self, kind: JobKind, job: Job, out: &mut Vec<PositionOutput>) {
        let op = self.next_op();
        if let Some(copy) = &mut self.copy {
            copy.wait = Wait::Job(op, kind);
        }
        out.push(PositionOutput::Job(op, job));
    }

    fn next_extent(&self, region: Region, cursor: Lba, end: Lba) -> Option<Extent> {
        Extent::next(
            region,
            cursor,
            end,
            self.chunk_size,
            self.config.copy_extent_chunks,
        )
    }

    fn copy_extent(
        &mut self,
        kind: JobKind,
        extent: Extent,
        out: &mut Vec<PositionOutput>,
    ) {
        let Some(dest) = self.destination else {
            return;
        };
        let job =
            Job::CopyExtent { from: self.source.drive, to: dest.drive, extent };
        self.issue(kind, job, out);
    }

    fn repair_chunk(&mut self, chunk: u64, out: &mut Vec<PositionOutput>) {
        let start = chunk * self.chunk_size;
        let end = (start + self.chunk_size).min(self.capacity);
        let extent = Extent { region: Region::User, start, blocks: end - start };
        self.copy_extent(JobKind::Repair(chunk), extent, out);
    }

    fn barrier(
        &mut self,
        boundary: QuiesceBoundary,
        out: &mut Vec<PositionOutput>,
    ) {
        if let Some(copy) = &mut self.copy {
            copy.wait = Wait::Barrier(boundary);
        }
        self.generation += 1;
        out.push(PositionOutput::Barrier(boundary, self.snapshot()));
    }

    fn request_spare(&mut self, out: &mut Vec<PositionOutput>) {
        let request = SpareRequest {
            position: self.id,
            purpose: SparePurpose::Copy(CopyKind::Proactive),
            replacing: self.source.drive,
            capacity: self.required_capacity(),
            previously_bound: None,
        };
        let Some(copy) = &mut self.copy else {
            return;
        };
        copy.wait = Wait::Spare;
        out.push(PositionOutput::Spare(SpareRequest {
            purpose: SparePurpose::Copy(copy.kind),
            previously_bound: copy.previously_bound,
            ..request
        }));
    }

    fn request_permission(
        &mut self,
        kind: PermissionKind,
        out: &mut Vec<PositionOutput>,
    ) {
        if let Some(copy) = &mut self.copy {
            copy.wait = Wait::Permission { kind, retry_at: None };
            out.push(PositionOutput::Group(GroupRequest::Permission(kind)));
        }
    }

    fn request_abort(
        &mut self,
        reason: AbortReason,
        out: &mut Vec<PositionOutput>,
    ) {
        let Some(copy) = &mut self.copy else {
            return;
        };
        info!(self.log, "Requesting abort"; "reason" => ?reason, "state" => %copy.state);
        if let Wait::Permission { kind, .. } = copy.wait {
            if kind != PermissionKind::AbortCopy {
                out.push(PositionOutput::Group(GroupRequest::Withdraw(kind)));
            }
        }
        copy.abort = Some(reason);
        // Outstanding jobs are dropped
        copy.wait = Wait::Idle;
        self.request_permission(PermissionKind::AbortCopy, out);
    }

    // Abort before the destination holds any data the group relies on
    fn cancel(&mut self, out: &mut Vec<PositionOutput>) {
        info!(self.log, "Cancelling copy");
        if let Some(dest) = self.destination.take() {
            out.push(PositionOutput::ReleaseDrive(dest.drive));
        } else if let Some(previous) =
            self.copy.as_ref().and_then(|c| c.previously_bound)
        {
            out.push(PositionOutput::ReleaseDrive(previous));
        }
        self.copy = None;
        self.mode = Mode::PassThru;
        self.primary = EdgeRole::Source;
        out.push(PositionOutput::ClearRecord);
        out.push(PositionOutput::Event(
            EventCode::CopyCancelled,
            Severity::Info,
            None,
        ));
        self.replicate(out);
    }

    fn finish_abort(&mut self, out: &mut Vec<PositionOutput>) {
        info!(self.log, "Copy aborted");
        if let Some(dest) = self.destination.take() {
            out.push(PositionOutput::ReleaseDrive(dest.drive));
        }
        self.copy = None;
        self.mode = Mode::PassThru;
        self.primary = EdgeRole::Source;
        out.push(PositionOutput::ClearRecord);
        out.push(PositionOutput::Event(
            EventCode::CopyAborted,
            Severity::Warning,
            None,
        ));
        self.replicate(out);
    }

    // The source is gone for good and the destination cannot take over
    fn abort_unrecoverable(&mut self, now: Instant, out: &mut Vec<PositionOutput>) {
        error!(self.log, "Aborting copy, source lost");
        if let Some(dest) = self.destination.take() {
            out.push(PositionOutput::ReleaseDrive(dest.drive));
        }
        self.copy = None;
        self.mode = Mode::PassThru;
        self.primary = EdgeRole::Source;
        self.missing = Some(Missing {
            edge: EdgeRole::Source,
            deadline: now + self.config.permanent_spare_trigger,
            expired: false,
        });
        out.push(PositionOutput::ClearRecord);
        out.push(PositionOutput::Event(
            EventCode::CopyAborted,
            Severity::Error,
            None,
        ));
        self.replicate(out);
    }

    // The source has been swapped out. The destination becomes the source.
    fn finalize(&mut self, out: &mut Vec<PositionOutput>) {
        let Some(dest) = self.destination.take() else {
            return;
        };
        let old = self.source.drive;
        info!(
            self.log,
            "Destination replaces source";
            "old" => %old,
            "new" => %dest.drive,
        );
        self.source = dest;
        self.source_eol = false;
        self.primary = EdgeRole::Source;
        self.mode = Mode::PassThru;
        if let Some(missing) = &mut self.missing {
            missing.edge = EdgeRole::Source;
        }
        out.push(PositionOutput::ReleaseDrive(old));
        out.push(PositionOutput::Group(GroupRequest::MemberReplaced {
            drive: dest.drive,
        }));
        self.barrier(QuiesceBoundary::Complete, out);
    }

    fn primary_edge(&self) -> Edge {
        match (self.primary, self.destination) {
            (EdgeRole::Destination, Some(dest)) => dest,
            _ => self.source,
        }
    }

    fn required_capacity(&self) -> Lba {
        self.capacity + self.metadata_capacity
    }
}
