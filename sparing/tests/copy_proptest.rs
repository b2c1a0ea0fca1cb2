// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property based test driving copies and rebuilds through random drive churn

use proptest::collection::size_range;
use proptest::prelude::*;
use proptest::sample::Index;
use slog::info;
use sparing_protocol::{
    CopyKind, DriveLocation, GroupState, IoError, PositionId, RaidType,
};
use sparing_test_utils::{SimArray, SimArrayBuilder, test_setup_log};
use std::collections::BTreeMap;
use std::time::Duration;
use test_strategy::{Arbitrary, proptest};

const WIDTH: u8 = 5;
const SPARES: u8 = 2;
const CHUNKS: u64 = 6;
const MIN_ACTIONS: usize = 5;
const MAX_ACTIONS: usize = 150;

#[derive(Debug, Clone, Copy, Arbitrary)]
pub enum GeneratedRaidType {
    Mirror,
    SingleParity,
    DualParity,
}

impl From<GeneratedRaidType> for RaidType {
    fn from(value: GeneratedRaidType) -> Self {
        match value {
            GeneratedRaidType::Mirror => RaidType::Mirror,
            GeneratedRaidType::SingleParity => RaidType::SingleParity,
            GeneratedRaidType::DualParity => RaidType::DualParity,
        }
    }
}

#[derive(Debug, Clone, Copy, Arbitrary)]
pub enum GeneratedCopyKind {
    Proactive,
    User,
    /// Explicit copy to some drive in the array
    Explicit(Index),
}

/// Operations run against the array
#[derive(Debug, Arbitrary)]
pub enum Action {
    #[weight(6)]
    Write { position: Index, chunk: Index },

    #[weight(2)]
    Pull(Index),

    #[weight(3)]
    Insert(Index),

    #[weight(1)]
    EndOfLife(Index),

    #[weight(2)]
    StartCopy { position: Index, kind: GeneratedCopyKind },

    #[weight(1)]
    AbortCopy(Index),

    #[weight(4)]
    Advance(#[strategy(1..400u64)] u64),

    /// Start or stop holding jobs issued to drives
    #[weight(1)]
    HoldIo(bool),

    #[weight(2)]
    CompleteIo,

    #[weight(1)]
    FailIo,

    #[weight(1)]
    Restart,

    /// Pull a copy's destination, write below its checkpoint, put the
    /// destination back and then lose the source for good
    #[weight(1)]
    LoseDestinationThenSource { position: Index, chunk: Index },
}

/// The edges of a copy and how far it got
type CopyProgress = (DriveLocation, Option<DriveLocation>, u64);

/// The state of the test, apart from the simulated array
pub struct TestState {
    sim: SimArray,

    /// The last checkpoint seen for each copy, keyed by the position and the
    /// edges the copy runs between
    checkpoints: BTreeMap<PositionId, CopyProgress>,

    /// Actions the array rejected, as in a write to a failed group
    rejected_actions: usize,
}

impl TestState {
    pub fn new(sim: SimArray) -> TestState {
        TestState { sim, checkpoints: BTreeMap::new(), rejected_actions: 0 }
    }

    fn drives(&self) -> Vec<DriveLocation> {
        self.sim.drives.keys().copied().collect()
    }

    fn pick_drive(&self, index: Index) -> DriveLocation {
        let drives = self.drives();
        drives[index.index(drives.len())]
    }

    fn pick_position(&self, index: Index) -> PositionId {
        let width = usize::from(self.sim.width());
        SimArray::position(index.index(width) as u16)
    }

    pub fn run_actions(
        &mut self,
        actions: Vec<Action>,
    ) -> Result<(), TestCaseError> {
        for action in actions {
            self.run_action(action);
            self.check_invariants()?;
        }

        // Let everything still held run to completion
        self.sim.hold_io = false;
        self.sim.settle();
        self.check_invariants()
    }

    fn run_action(&mut self, action: Action) {
        match action {
            Action::Write { position, chunk } => {
                let position = self.pick_position(position);
                let chunk = chunk.index(self.sim.chunks() as usize) as u64;
                if self.sim.write(position, chunk).is_err() {
                    self.rejected_actions += 1;
                }
            }
            Action::Pull(index) => {
                let drive = self.pick_drive(index);
                self.sim.pull(drive);
            }
            Action::Insert(index) => {
                let drive = self.pick_drive(index);
                self.sim.insert(drive);
            }
            Action::EndOfLife(index) => {
                let drive = self.pick_drive(index);
                self.sim.mark_eol(drive);
            }
            Action::StartCopy { position, kind } => {
                let position = self.pick_position(position);
                let kind = match kind {
                    GeneratedCopyKind::Proactive => CopyKind::Proactive,
                    GeneratedCopyKind::User => CopyKind::UserInitiated,
                    GeneratedCopyKind::Explicit(index) => {
                        CopyKind::UserInitiatedToExplicitDestination(
                            self.pick_drive(index),
                        )
                    }
                };
                if self.sim.start_copy(position, kind).is_err() {
                    self.rejected_actions += 1;
                }
            }
            Action::AbortCopy(index) => {
                let position = self.pick_position(index);
                if self.sim.abort_copy(position).is_err() {
                    self.rejected_actions += 1;
                }
            }
            Action::Advance(secs) => {
                self.sim.advance(Duration::from_secs(secs));
            }
            Action::HoldIo(hold) => {
                self.sim.hold_io = hold;
                self.sim.settle();
            }
            Action::CompleteIo => {
                if !self.sim.complete_io() {
                    self.rejected_actions += 1;
                }
            }
            Action::FailIo => {
                let err = IoError::Transient("injected".to_string());
                if !self.sim.fail_io(err) {
                    self.rejected_actions += 1;
                }
            }
            Action::Restart => {
                self.sim.restart();
            }
            Action::LoseDestinationThenSource { position, chunk } => {
                let position = self.pick_position(position);
                if !self.lose_destination_then_source(position, chunk) {
                    self.rejected_actions += 1;
                }
            }
        }
    }

    // Returns false if `position` has no copy with a destination to lose
    fn lose_destination_then_source(
        &mut self,
        position: PositionId,
        chunk: Index,
    ) -> bool {
        let status = self.sim.position_status(position);
        let (Some(copy), Some(destination)) = (status.copy, status.destination)
        else {
            return false;
        };
        let copied = copy.checkpoint / self.sim.chunk_size();
        self.sim.pull(destination);
        if copied > 0 {
            let chunk = chunk.index(copied as usize) as u64;
            if self.sim.write(position, chunk).is_err() {
                self.rejected_actions += 1;
            }
        }
        self.sim.insert(destination);
        self.sim.pull(status.source);
        let timeout = self.sim.config.source_return_timeout;
        self.sim.advance(timeout + Duration::from_secs(1));
        true
    }

    fn check_invariants(&mut self) -> Result<(), TestCaseError> {
        self.invariant_checkpoints_never_move_backwards()?;
        self.invariant_group_fails_only_beyond_tolerance()?;
        self.invariant_reads_return_latest_writes()?;
        self.invariant_no_alarms()?;
        Ok(())
    }

    /// A copy between the same pair of drives only moves forward, across
    /// restarts included
    fn invariant_checkpoints_never_move_backwards(
        &mut self,
    ) -> Result<(), TestCaseError> {
        let persisted = self.sim.persisted();
        self.checkpoints.retain(|position, _| {
            persisted.copies.iter().any(|r| r.position == *position)
        });
        for record in &persisted.copies {
            let edges = (record.source, record.destination);
            if let Some((source, destination, checkpoint)) =
                self.checkpoints.get(&record.position)
            {
                if (*source, *destination) == edges {
                    prop_assert!(
                        record.checkpoint >= *checkpoint,
                        "checkpoint for {} moved from {} to {}:\n{}",
                        record.position,
                        checkpoint,
                        record.checkpoint,
                        self.sim.history_json()
                    );
                }
            }
            self.checkpoints.insert(
                record.position,
                (record.source, record.destination, record.checkpoint),
            );
        }
        Ok(())
    }

    fn invariant_group_fails_only_beyond_tolerance(
        &self,
    ) -> Result<(), TestCaseError> {
        let status = self.sim.group_status();
        let beyond = status.degraded.len() > status.fault_tolerance;
        prop_assert_eq!(
            status.state == GroupState::Failed,
            beyond,
            "group is {:?} with degraded positions {:?}",
            status.state,
            status.degraded
        );
        Ok(())
    }

    fn invariant_reads_return_latest_writes(
        &self,
    ) -> Result<(), TestCaseError> {
        if let Err(err) = self.sim.verify_all() {
            return Err(TestCaseError::fail(format!(
                "{err}\n{}",
                self.sim.history_json()
            )));
        }
        Ok(())
    }

    fn invariant_no_alarms(&self) -> Result<(), TestCaseError> {
        let alarms = self.sim.active.alarms();
        prop_assert!(
            alarms.is_empty(),
            "alarms raised: {:?}\n{}",
            alarms,
            self.sim.history_json()
        );
        Ok(())
    }
}

#[derive(Debug, Arbitrary)]
pub struct TestInput {
    raid_type: GeneratedRaidType,
    #[any(size_range(MIN_ACTIONS..MAX_ACTIONS).lift())]
    actions: Vec<Action>,
}

#[proptest]
fn test_copy_protocol(input: TestInput) {
    let log = test_setup_log("copy_protocol");
    let sim = SimArrayBuilder::new(&log, input.raid_type.into(), WIDTH)
        .spares(SPARES)
        .chunks(CHUNKS)
        .build();
    let mut state = TestState::new(sim);
    state.run_actions(input.actions)?;
    info!(
        log,
        "Test complete";
        "rejected_actions" => state.rejected_actions,
        "events" => state.sim.events.len(),
    );
}
