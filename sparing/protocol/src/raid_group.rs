// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The redundancy group coordinator
//!
//! A [`RaidGroup`] exclusively owns the rebuild-logging and needs-rebuild
//! state of its positions. Virtual positions never touch that state directly.
//! They send [`GroupRequest`]s and receive [`GroupReply`]s, and all
//! permission decisions are made here from the group's degraded and fault
//! tolerance accounting.

use crate::{
    DenialReason, DriveLocation, EventCode, Extent, GroupReply, GroupRequest,
    IoError, Lba, OpId, OpOwner, PermissionKind, PositionId, PositionIndex,
    RaidGroupId, Region, Severity,
};
use parse_display::Display;
use serde::{Deserialize, Serialize};
use slog::{Logger, debug, info, o, warn};
use slog_error_chain::InlineErrorChain;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

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
pub enum RaidType {
    /// Every position holds a full copy of the data
    Mirror,
    SingleParity,
    DualParity,
    Striped,
}

impl RaidType {
    /// The number of positions that can be lost without losing data
    pub fn fault_tolerance(&self, width: usize) -> usize {
        match self {
            RaidType::Mirror => width.saturating_sub(1),
            RaidType::SingleParity => 1,
            RaidType::DualParity => 2,
            RaidType::Striped => 0,
        }
    }
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
#[display(style = "snake_case")]
pub enum GroupState {
    Ready,
    Degraded,

    /// More positions are degraded than the group can tolerate
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaidGroupConfig {
    pub id: RaidGroupId,
    pub raid_type: RaidType,

    /// The drive at each position, in position order
    pub drives: Vec<DriveLocation>,

    /// User data capacity of each position in blocks
    pub capacity: Lba,

    /// Size of the paged metadata region that follows the user data
    pub metadata_capacity: Lba,
    pub chunk_size: Lba,
}

impl RaidGroupConfig {
    pub fn width(&self) -> usize {
        self.drives.len()
    }

    pub fn chunk_count(&self) -> u64 {
        self.capacity.div_ceil(self.chunk_size)
    }

    pub fn position(&self, index: PositionIndex) -> PositionId {
        PositionId::new(self.id, index)
    }

    pub fn positions(&self) -> impl Iterator<Item = PositionIndex> + '_ {
        (0..self.drives.len()).map(|i| PositionIndex(i as u16))
    }

    fn chunk_extent(&self, chunk: u64) -> Extent {
        let start = chunk * self.chunk_size;
        let end = (start + self.chunk_size).min(self.capacity);
        Extent { region: Region::User, start, blocks: end - start }
    }
}

/// One bit per chunk of a position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkBitmap {
    len: u64,
    words: Vec<u64>,
}

impl ChunkBitmap {
    pub fn new(len: u64) -> ChunkBitmap {
        ChunkBitmap { len, words: vec![0; len.div_ceil(64) as usize] }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true if the bit was not already set
    pub fn set(&mut self, chunk: u64) -> bool {
        if chunk >= self.len {
            return false;
        }
        let word = &mut self.words[(chunk / 64) as usize];
        let mask = 1 << (chunk % 64);
        let newly_set = *word & mask == 0;
        *word |= mask;
        newly_set
    }

    /// Returns true if the bit was set
    pub fn clear(&mut self, chunk: u64) -> bool {
        if chunk >= self.len {
            return false;
        }
        let word = &mut self.words[(chunk / 64) as usize];
        let mask = 1 << (chunk % 64);
        let was_set = *word & mask != 0;
        *word &= !mask;
        was_set
    }

    pub fn contains(&self, chunk: u64) -> bool {
        chunk < self.len
            && self.words[(chunk / 64) as usize] & (1 << (chunk % 64)) != 0
    }

    /// Returns true if any bit was newly set
    pub fn set_range(&mut self, range: Range<u64>) -> bool {
        let mut changed = false;
        for chunk in range {
            changed |= self.set(chunk);
        }
        changed
    }

    pub fn count(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn first(&self) -> Option<u64> {
        self.words.iter().enumerate().find(|(_, w)| **w != 0).map(|(i, w)| {
            (i as u64) * 64 + u64::from(w.trailing_zeros())
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len).filter(|chunk| self.contains(*chunk))
    }
}

/// Persisted and replicated rebuild state of one position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionBitmaps {
    pub index: PositionIndex,
    pub rebuild_logging: bool,
    pub needs_rebuild: ChunkBitmap,
}

/// Persisted and replicated state of a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub generation: u64,
    pub group: RaidGroupId,

    /// The drive serving each position
    pub members: Vec<DriveLocation>,
    pub positions: Vec<PositionBitmaps>,
}

impl GroupSnapshot {
    pub fn is_newer_than(&self, other: &GroupSnapshot) -> bool {
        self.generation > other.generation
    }

    pub fn rebuild_status(&self, index: PositionIndex) -> Option<RebuildStatus> {
        let bitmaps = self.positions.iter().find(|p| p.index == index)?;
        Some(RebuildStatus::new(
            bitmaps.rebuild_logging,
            bitmaps.needs_rebuild.count(),
            bitmaps.needs_rebuild.len(),
        ))
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct RebuildStatus {
    pub rebuild_logging: bool,
    pub chunks_needing_rebuild: u64,
    pub percent_rebuilt: u8,
}

impl RebuildStatus {
    fn new(rebuild_logging: bool, remaining: u64, total: u64) -> RebuildStatus {
        let percent_rebuilt = if rebuild_logging {
            0
        } else {
            crate::percent_rebuilt(total - remaining.min(total), total)
        };
        RebuildStatus {
            rebuild_logging,
            chunks_needing_rebuild: remaining,
            percent_rebuilt,
        }
    }
}

/// Side effects of calling into a [`RaidGroup`], routed by the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupOutput {
    Reply { to: PositionIndex, reply: GroupReply },
    Rebuild { op: OpId, index: PositionIndex, extent: Extent },
    Event { code: EventCode, severity: Severity, position: Option<PositionIndex> },
    Persist(GroupSnapshot),

    /// The group state changed and every position must hear about it
    StateChanged(GroupState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RebuildOp {
    op: OpId,
    index: PositionIndex,
    chunk: u64,
}

/// The coordinator of a single redundancy group
#[derive(Debug, Clone)]
pub struct RaidGroup {
    log: Logger,
    config: RaidGroupConfig,
    rebuild_logging: BTreeSet<PositionIndex>,
    needs_rebuild: BTreeMap<PositionIndex, ChunkBitmap>,
    state: GroupState,
    generation: u64,

    /// The single rebuild job in flight
    rebuild: Option<RebuildOp>,
    next_seq: u64,

    /// Requests that were denied and reported, and have not been granted or
    /// withdrawn since
    denied: BTreeSet<(PositionIndex, PermissionKind)>,
}

impl RaidGroup {
    pub fn new(log: &Logger, config: RaidGroupConfig) -> RaidGroup {
        let log = log.new(o!(
            "component" => "RaidGroup",
            "group" => config.id.to_string()
        ));
        let needs_rebuild = config
            .positions()
            .map(|index| (index, ChunkBitmap::new(config.chunk_count())))
            .collect();
        RaidGroup {
            log,
            config,
            rebuild_logging: BTreeSet::new(),
            needs_rebuild,
            state: GroupState::Ready,
            generation: 0,
            rebuild: None,
            next_seq: 0,
            denied: BTreeSet::new(),
        }
    }

    /// Recreate a group from a persisted or replicated snapshot
    ///
    /// Entries that don't fit the configured geometry are ignored.
    pub fn restore(
        log: &Logger,
        mut config: RaidGroupConfig,
        snapshot: &GroupSnapshot,
    ) -> RaidGroup {
        if snapshot.members.len() == config.width() {
            config.drives = snapshot.members.clone();
        }
        let mut group = RaidGroup::new(log, config);
        group.generation = snapshot.generation;
        for bitmaps in &snapshot.positions {
            if usize::from(bitmaps.index.0) >= group.config.width() {
                continue;
            }
            if bitmaps.rebuild_logging {
                group.rebuild_logging.insert(bitmaps.index);
            }
            if bitmaps.needs_rebuild.len() == group.config.chunk_count() {
                group
                    .needs_rebuild
                    .insert(bitmaps.index, bitmaps.needs_rebuild.clone());
            }
        }
        group.state = group.computed_state();
        info!(
            group.log,
            "Restored group";
            "generation" => group.generation,
            "state" => %group.state,
            "degraded" => group.degraded_count(),
        );
        group
    }

    pub fn id(&self) -> RaidGroupId {
        self.config.id
    }

    pub fn config(&self) -> &RaidGroupConfig {
        &self.config
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn fault_tolerance(&self) -> usize {
        self.config.raid_type.fault_tolerance(self.config.width())
    }

    pub fn is_rebuild_logging(&self, index: PositionIndex) -> bool {
        self.rebuild_logging.contains(&index)
    }

    pub fn needs_rebuild(&self, index: PositionIndex) -> Option<&ChunkBitmap> {
        self.needs_rebuild.get(&index)
    }

    /// A position is degraded while it is rebuild-logging or has chunks to
    /// rebuild
    pub fn is_degraded(&self, index: PositionIndex) -> bool {
        self.is_rebuild_logging(index)
            || self.needs_rebuild.get(&index).is_some_and(|b| !b.is_empty())
    }

    pub fn degraded_positions(&self) -> BTreeSet<PositionIndex> {
        self.config.positions().filter(|i| self.is_degraded(*i)).collect()
    }

    pub fn degraded_count(&self) -> usize {
        self.config.positions().filter(|i| self.is_degraded(*i)).count()
    }

    /// Would losing one more position fail the group?
    pub fn would_exceed_fault_tolerance(&self) -> bool {
        self.degraded_count() + 1 > self.fault_tolerance()
    }

    pub fn rebuild_status(&self, index: PositionIndex) -> RebuildStatus {
        let remaining =
            self.needs_rebuild.get(&index).map(|b| b.count()).unwrap_or(0);
        RebuildStatus::new(
            self.is_rebuild_logging(index),
            remaining,
            self.config.chunk_count(),
        )
    }

    pub fn snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            generation: self.generation,
            group: self.config.id,
            members: self.config.drives.clone(),
            positions: self
                .config
                .positions()
                .map(|index| PositionBitmaps {
                    index,
                    rebuild_logging: self.is_rebuild_logging(index),
                    needs_rebuild: self
                        .needs_rebuild
                        .get(&index)
                        .cloned()
                        .unwrap_or_else(|| {
                            ChunkBitmap::new(self.config.chunk_count())
                        }),
                })
                .collect(),
        }
    }

    /// Handle a request from the virtual position at `from`
    pub(crate) fn handle(
        &mut self,
        from: PositionIndex,
        request: GroupRequest,
        out: &mut Vec<GroupOutput>,
    ) {
        debug!(self.log, "Received request"; "from" => %from, "request" => ?request);
        match request {
            GroupRequest::MarkRebuildLogging => {
                if self.rebuild_logging.insert(from) {
                    if self.rebuild.is_some_and(|r| r.index == from) {
                        self.rebuild = None;
                    }
                    self.changed(out);
                }
            }
            GroupRequest::ClearRebuildLogging => {
                if self.rebuild_logging.remove(&from) {
                    self.changed(out);
                }
            }
            GroupRequest::HandOffCheckpoint { checkpoint, repair } => {
                let tail =
                    checkpoint / self.config.chunk_size..self.config.chunk_count();
                info!(
                    self.log,
                    "Taking over uncopied tail";
                    "position" => %from,
                    "checkpoint" => checkpoint,
                    "chunks" => tail.end - tail.start,
                    "repair_chunks" => repair.len(),
                );
                self.rebuild_logging.remove(&from);
                let bitmap = self.bitmap_mut(from);
                bitmap.set_range(tail);
                for chunk in repair {
                    bitmap.set(chunk);
                }
                self.changed(out);
            }
            GroupRequest::PermanentSpareSwappedIn => {
                let all = 0..self.config.chunk_count();
                self.rebuild_logging.remove(&from);
                self.bitmap_mut(from).set_range(all);
                self.changed(out);
            }
            GroupRequest::MemberReplaced { drive } => {
                let slot = usize::from(from.0);
                if slot < self.config.drives.len()
                    && self.config.drives[slot] != drive
                {
                    self.config.drives[slot] = drive;
                    self.changed(out);
                }
            }
            GroupRequest::Permission(kind) => {
                let reply = match self.evaluate(from, kind) {
                    Ok(()) => {
                        self.denied.remove(&(from, kind));
                        GroupReply::Granted(kind)
                    }
                    Err(reason) => {
                        if self.denied.insert((from, kind)) {
                            warn!(
                                self.log,
                                "Permission denied";
                                "position" => %from,
                                "kind" => %kind,
                                "reason" => ?reason,
                            );
                            out.push(GroupOutput::Event {
                                code: denial_code(kind),
                                severity: Severity::Warning,
                                position: Some(from),
                            });
                        }
                        GroupReply::Denied { kind, reason }
                    }
                };
                out.push(GroupOutput::Reply { to: from, reply });
            }
            GroupRequest::Withdraw(kind) => {
                self.denied.remove(&(from, kind));
            }
        }
        self.schedule_rebuild(out);
    }

    /// Record a write to a position that is rebuild-logging
    pub(crate) fn log_write(
        &mut self,
        index: PositionIndex,
        lba: Lba,
        blocks: Lba,
        out: &mut Vec<GroupOutput>,
    ) {
        let extent = Extent { region: Region::User, start: lba, blocks };
        let chunks = extent.chunks(self.config.chunk_size);
        if self.bitmap_mut(index).set_range(chunks) {
            self.changed(out);
        }
    }

    pub(crate) fn tick(&mut self, out: &mut Vec<GroupOutput>) {
        self.schedule_rebuild(out);
    }

    pub(crate) fn rebuild_complete(
        &mut self,
        op: OpId,
        result: Result<(), IoError>,
        out: &mut Vec<GroupOutput>,
    ) {
        let Some(rebuild) = self.rebuild else {
            return;
        };
        if rebuild.op != op {
            return;
        }
        self.rebuild = None;
        if let Err(err) = result {
            // Retried from the next tick
            debug!(
                self.log,
                "Rebuild failed";
                "position" => %rebuild.index,
                "chunk" => rebuild.chunk,
                "err" => InlineErrorChain::new(&err),
            );
            return;
        }
        let bitmap = self.bitmap_mut(rebuild.index);
        if bitmap.clear(rebuild.chunk) {
            if bitmap.is_empty() {
                info!(self.log, "Position rebuilt"; "position" => %rebuild.index);
                out.push(GroupOutput::Event {
                    code: EventCode::PositionRebuilt,
                    severity: Severity::Info,
                    position: Some(rebuild.index),
                });
            }
            self.changed(out);
        }
        self.schedule_rebuild(out);
    }

    fn evaluate(
        &self,
        from: PositionIndex,
        kind: PermissionKind,
    ) -> Result<(), DenialReason> {
        if self.state == GroupState::Failed {
            return Err(DenialReason::GroupFailed);
        }
        let others =
            self.degraded_positions().into_iter().filter(|i| *i != from).count();
        match kind {
            PermissionKind::AbortCopy if others > 0 => {
                Err(DenialReason::GroupDegraded { degraded: others })
            }
            PermissionKind::CompleteCopy
            | PermissionKind::SwapOutFailedSource
                if others > 0 && self.is_degraded(from) =>
            {
                Err(DenialReason::DoubleDegraded {
                    degraded: self.degraded_count(),
                })
            }
            _ => Ok(()),
        }
    }

    fn bitmap_mut(&mut self, index: PositionIndex) -> &mut ChunkBitmap {
        let chunks = self.config.chunk_count();
        self.needs_rebuild
            .entry(index)
            .or_insert_with(|| ChunkBitmap::new(chunks))
    }

    fn computed_state(&self) -> GroupState {
        let degraded = self.degraded_count();
        if degraded > self.fault_tolerance() {
            GroupState::Failed
        } else if degraded > 0 {
            GroupState::Degraded
        } else {
            GroupState::Ready
        }
    }

    // Bump the generation, re-evaluate the group state and persist
    fn changed(&mut self, out: &mut Vec<GroupOutput>) {
        self.generation += 1;
        let next = self.computed_state();
        if next != self.state {
            let (code, severity) = match (self.state, next) {
                (_, GroupState::Failed) => {
                    (EventCode::GroupFailed, Severity::Error)
                }
                (GroupState::Ready, GroupState::Degraded) => {
                    (EventCode::GroupDegraded, Severity::Warning)
                }
                _ => (EventCode::GroupRecovered, Severity::Info),
            };
            info!(
                self.log,
                "Group state changed";
                "from" => %self.state,
                "to" => %next,
                "degraded" => self.degraded_count(),
            );
            if next == GroupState::Failed {
                self.rebuild = None;
            }
            self.state = next;
            out.push(GroupOutput::Event { code, severity, position: None });
            out.push(GroupOutput::StateChanged(next));
        }
        out.push(GroupOutput::Persist(self.snapshot()));
    }

    fn schedule_rebuild(&mut self, out: &mut Vec<GroupOutput>) {
        if self.state == GroupState::Failed || self.rebuild.is_some() {
            return;
        }
        let next = self.needs_rebuild.iter().find_map(|(index, bitmap)| {
            if self.rebuild_logging.contains(index) {
                return None;
            }
            bitmap.first().map(|chunk| (*index, chunk))
        });
        let Some((index, chunk)) = next else {
            return;
        };
        let op = OpId { owner: OpOwner::Group(self.config.id), seq: self.next_seq };
        self.next_seq += 1;
        self.rebuild = Some(RebuildOp { op, index, chunk });
        out.push(GroupOutput::Rebuild {
            op,
            index,
            extent: self.config.chunk_extent(chunk),
        });
    }
}

fn denial_code(kind: PermissionKind) -> EventCode {
    match kind {
        PermissionKind::AbortCopy => EventCode::AbortCopyRequestDenied,
        PermissionKind::CompleteCopy => EventCode::CompleteCopyRequestDenied,
        PermissionKind::SwapOutFailedSource => EventCode::SwapOutRequestDenied,
        PermissionKind::PermanentSpare => {
            EventCode::PermanentSpareRequestDenied
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;
    use test_strategy::{Arbitrary, proptest};

    fn log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn config(raid_type: RaidType, width: usize) -> RaidGroupConfig {
        RaidGroupConfig {
            id: RaidGroupId(1),
            raid_type,
            drives: (0..width).map(|i| DriveLocation::new(0, 0, i as u8)).collect(),
            capacity: 16 * 2048,
            metadata_capacity: 2048,
            chunk_size: 2048,
        }
    }

    fn replies(out: &[GroupOutput]) -> Vec<GroupReply> {
        out.iter()
            .filter_map(|o| match o {
                GroupOutput::Reply { reply, .. } => Some(*reply),
                _ => None,
            })
            .collect()
    }

    fn events(out: &[GroupOutput]) -> Vec<EventCode> {
        out.iter()
            .filter_map(|o| match o {
                GroupOutput::Event { code, .. } => Some(*code),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn fault_tolerance_by_type() {
        assert_eq!(RaidType::Mirror.fault_tolerance(3), 2);
        assert_eq!(RaidType::SingleParity.fault_tolerance(5), 1);
        assert_eq!(RaidType::DualParity.fault_tolerance(6), 2);
        assert_eq!(RaidType::Striped.fault_tolerance(4), 0);
    }

    #[derive(Debug, Arbitrary)]
    enum GeneratedRaidType {
        Mirror,
        SingleParity,
        DualParity,
        Striped,
    }

    impl From<GeneratedRaidType> for RaidType {
        fn from(value: GeneratedRaidType) -> Self {
            match value {
                GeneratedRaidType::Mirror => RaidType::Mirror,
                GeneratedRaidType::SingleParity => RaidType::SingleParity,
                GeneratedRaidType::DualParity => RaidType::DualParity,
                GeneratedRaidType::Striped => RaidType::Striped,
            }
        }
    }

    #[proptest]
    fn failed_iff_degraded_exceeds_tolerance(
        raid_type: GeneratedRaidType,
        #[strategy(3..8usize)] width: usize,
        #[strategy(0..8usize)] lost: usize,
    ) {
        let raid_type = RaidType::from(raid_type);
        let lost = lost.min(width);
        let mut group = RaidGroup::new(&log(), config(raid_type, width));
        let mut out = vec![];
        for i in 0..lost {
            group.handle(
                PositionIndex(i as u16),
                GroupRequest::MarkRebuildLogging,
                &mut out,
            );
            let failed = group.degraded_count() > group.fault_tolerance();
            prop_assert_eq!(group.state() == GroupState::Failed, failed);
        }

        // Positions come back in reverse order and nothing was written while
        // they were gone, so the group ends up ready
        for i in (0..lost).rev() {
            group.handle(
                PositionIndex(i as u16),
                GroupRequest::ClearRebuildLogging,
                &mut out,
            );
            let failed = group.degraded_count() > group.fault_tolerance();
            prop_assert_eq!(group.state() == GroupState::Failed, failed);
        }
        prop_assert_eq!(group.state(), GroupState::Ready);
    }

    #[test]
    fn abort_denied_while_other_positions_degraded() {
        let mut group = RaidGroup::new(&log(), config(RaidType::SingleParity, 5));
        let copying = PositionIndex(0);
        let other = PositionIndex(3);
        let mut out = vec![];

        group.handle(other, GroupRequest::MarkRebuildLogging, &mut out);
        out.clear();
        let abort = GroupRequest::Permission(PermissionKind::AbortCopy);
        group.handle(copying, abort.clone(), &mut out);
        assert_eq!(
            replies(&out),
            vec![GroupReply::Denied {
                kind: PermissionKind::AbortCopy,
                reason: DenialReason::GroupDegraded { degraded: 1 },
            }]
        );
        assert_eq!(events(&out), vec![EventCode::AbortCopyRequestDenied]);

        // Denials are reported once per streak
        out.clear();
        group.handle(copying, abort.clone(), &mut out);
        assert!(events(&out).is_empty());

        out.clear();
        group.handle(other, GroupRequest::ClearRebuildLogging, &mut out);
        assert_eq!(group.degraded_count(), 0);
        out.clear();
        group.handle(copying, abort, &mut out);
        assert_eq!(
            replies(&out),
            vec![GroupReply::Granted(PermissionKind::AbortCopy)]
        );
    }

    #[test]
    fn swap_out_denied_while_double_degraded() {
        let mut group = RaidGroup::new(&log(), config(RaidType::DualParity, 6));
        let copying = PositionIndex(1);
        let other = PositionIndex(4);
        let mut out = vec![];
        group.handle(copying, GroupRequest::MarkRebuildLogging, &mut out);
        group.handle(other, GroupRequest::MarkRebuildLogging, &mut out);
        assert_eq!(group.state(), GroupState::Degraded);
        assert!(group.would_exceed_fault_tolerance());

        out.clear();
        let swap_out =
            GroupRequest::Permission(PermissionKind::SwapOutFailedSource);
        group.handle(copying, swap_out.clone(), &mut out);
        assert_eq!(
            replies(&out),
            vec![GroupReply::Denied {
                kind: PermissionKind::SwapOutFailedSource,
                reason: DenialReason::DoubleDegraded { degraded: 2 },
            }]
        );

        group.handle(other, GroupRequest::ClearRebuildLogging, &mut out);
        out.clear();
        group.handle(copying, swap_out, &mut out);
        assert_eq!(
            replies(&out),
            vec![GroupReply::Granted(PermissionKind::SwapOutFailedSource)]
        );
    }

    #[test]
    fn failed_group_denies_everything() {
        let mut group = RaidGroup::new(&log(), config(RaidType::SingleParity, 5));
        let mut out = vec![];
        group.handle(PositionIndex(0), GroupRequest::MarkRebuildLogging, &mut out);
        group.handle(PositionIndex(1), GroupRequest::MarkRebuildLogging, &mut out);
        assert_eq!(group.state(), GroupState::Failed);
        assert!(events(&out).contains(&EventCode::GroupFailed));
        assert!(out.contains(&GroupOutput::StateChanged(GroupState::Failed)));

        for kind in [
            PermissionKind::CompleteCopy,
            PermissionKind::AbortCopy,
            PermissionKind::SwapOutFailedSource,
            PermissionKind::PermanentSpare,
        ] {
            out.clear();
            group.handle(PositionIndex(2), GroupRequest::Permission(kind), &mut out);
            assert_eq!(
                replies(&out),
                vec![GroupReply::Denied {
                    kind,
                    reason: DenialReason::GroupFailed
                }]
            );
        }

        // Positions hear about the recovery as well
        out.clear();
        group.handle(PositionIndex(1), GroupRequest::ClearRebuildLogging, &mut out);
        assert_eq!(group.state(), GroupState::Degraded);
        assert!(out.contains(&GroupOutput::StateChanged(GroupState::Degraded)));
    }

    #[test]
    fn handoff_turns_rebuild_logging_into_tail_rebuild() {
        let mut group = RaidGroup::new(&log(), config(RaidType::SingleParity, 5));
        let index = PositionIndex(2);
        let mut out = vec![];
        group.handle(index, GroupRequest::MarkRebuildLogging, &mut out);

        // A write while rebuild-logging is remembered at chunk granularity
        group.log_write(index, 2048 + 10, 20, &mut out);
        assert!(group.needs_rebuild(index).unwrap().contains(1));

        out.clear();
        group.handle(
            index,
            GroupRequest::HandOffCheckpoint {
                checkpoint: 4 * 2048,
                repair: [2].into_iter().collect(),
            },
            &mut out,
        );
        assert!(!group.is_rebuild_logging(index));
        let bitmap = group.needs_rebuild(index).unwrap();
        let expected: Vec<u64> = [1, 2].into_iter().chain(4..16).collect();
        assert_eq!(bitmap.iter().collect::<Vec<_>>(), expected);
        assert!(group.is_degraded(index));
        assert_eq!(group.state(), GroupState::Degraded);

        // Rebuild starts with the lowest chunk
        let rebuild = out
            .iter()
            .find_map(|o| match o {
                GroupOutput::Rebuild { op, index, extent } => {
                    Some((*op, *index, *extent))
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(rebuild.1, index);
        assert_eq!(rebuild.2.start, 2048);
    }

    #[test]
    fn rebuild_clears_chunks_until_ready() {
        let mut group = RaidGroup::new(&log(), config(RaidType::Mirror, 2));
        let index = PositionIndex(1);
        let mut out = vec![];
        group.handle(index, GroupRequest::MarkRebuildLogging, &mut out);
        group.handle(index, GroupRequest::PermanentSpareSwappedIn, &mut out);
        assert_eq!(group.rebuild_status(index).chunks_needing_rebuild, 16);

        let mut completed = 0;
        loop {
            let Some(op) = out.iter().rev().find_map(|o| match o {
                GroupOutput::Rebuild { op, .. } => Some(*op),
                _ => None,
            }) else {
                break;
            };
            out.clear();
            group.rebuild_complete(op, Ok(()), &mut out);
            completed += 1;
        }
        assert_eq!(completed, 16);
        assert_eq!(group.state(), GroupState::Ready);
        assert_eq!(group.rebuild_status(index).percent_rebuilt, 100);
        assert!(events(&out).contains(&EventCode::PositionRebuilt));
    }

    #[test]
    fn snapshot_restores_state() {
        let mut group = RaidGroup::new(&log(), config(RaidType::DualParity, 6));
        let mut out = vec![];
        group.handle(PositionIndex(3), GroupRequest::MarkRebuildLogging, &mut out);
        group.handle(
            PositionIndex(5),
            GroupRequest::MemberReplaced { drive: DriveLocation::new(1, 0, 0) },
            &mut out,
        );
        let snapshot = group.snapshot();
        let restored = RaidGroup::restore(
            &log(),
            config(RaidType::DualParity, 6),
            &snapshot,
        );
        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(restored.state(), GroupState::Degraded);
        assert_eq!(restored.config().drives[5], DriveLocation::new(1, 0, 0));
    }

    #[test]
    fn bitmap_operations() {
        let mut bitmap = ChunkBitmap::new(130);
        assert!(bitmap.is_empty());
        assert!(bitmap.set(129));
        assert!(!bitmap.set(129));
        assert!(!bitmap.set(130));
        assert!(bitmap.set_range(64..66));
        assert_eq!(bitmap.count(), 3);
        assert_eq!(bitmap.first(), Some(64));
        assert!(bitmap.clear(64));
        assert!(!bitmap.clear(64));
        assert_eq!(bitmap.iter().collect::<Vec<_>>(), vec![65, 129]);
    }
}
