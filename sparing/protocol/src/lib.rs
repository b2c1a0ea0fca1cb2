// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sans-IO implementation of per-position drive copy and rebuild
//!
//! A [`Node`] owns the drive inventory of a storage processor, every
//! redundancy group configured on it and the [`VirtualPosition`] at each
//! position of those groups. Virtual positions drive the copy protocol and
//! negotiate with the [`RaidGroup`] coordinator that owns rebuild-logging and
//! needs-rebuild state. The [`PeerSync`] mirrors all of this to the paired
//! storage processor.
//!
//! Nothing in this crate performs I/O. Every method takes the current time as
//! an argument, and any side effects are left as [`Output`]s for the caller to
//! act upon in order.

use derive_more::From;
use parse_display::Display;
use serde::{Deserialize, Serialize};

mod alarm;
mod checkpoint;
mod config;
mod drive;
mod event;
mod messages;
mod node;
mod peer_sync;
mod raid_group;
mod spare;
mod virtual_position;

pub use alarm::Alarm;
pub use checkpoint::{
    Checkpoint, CheckpointError, CopyRecord, Extent, Region, percent_rebuilt,
};
pub use config::CopyConfig;
pub use drive::{
    BlockSize, DriveEvent, DriveInfo, DriveInventory, DriveLocation, DriveType,
    InventoryError, PerformanceTier, SparePool,
};
pub use event::{EventCode, EventRecord, Severity};
pub use messages::{
    DenialReason, GroupReply, GroupRequest, IoError, IoRequest, Job,
    PermissionKind, WriteError, WritePlan,
};
pub use node::{
    GroupStatus, Node, NodeRole, PersistedState, PositionStatus, PromoteError,
    StartCopyError, Topology, TopologyError,
};
pub use peer_sync::{
    BarrierStatus, PeerMsg, PeerSync, PositionSnapshot, QuiesceBoundary,
};
pub use raid_group::{
    ChunkBitmap, GroupSnapshot, GroupState, PositionBitmaps, RaidGroup,
    RaidGroupConfig, RaidType, RebuildStatus,
};
pub use spare::{
    InvalidDestinationReason, SpareError, SparePurpose, SpareRequest,
    SpareRequirements, SpareSelector,
};
pub use virtual_position::{
    AbortCopyError, CopyHooks, CopyKind, CopyRequest, CopyState, EdgeRole,
    Lifecycle, Mode, Requester, VirtualPosition,
};

/// A logical block address, or a count of blocks
pub type Lba = u64;

/// The default number of blocks tracked by one needs-rebuild bit
pub const DEFAULT_CHUNK_SIZE: u64 = 2048;

/// Unique identifier of a redundancy group
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
)]
#[display("rg{0}")]
pub struct RaidGroupId(pub u32);

/// Index of a position within its redundancy group
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
)]
#[display("{0}")]
pub struct PositionIndex(pub u16);

/// A position in a specific redundancy group
///
/// This is the key used for checkpoints in the checkpoint store.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
)]
#[display("{group}/{index}")]
pub struct PositionId {
    pub group: RaidGroupId,
    pub index: PositionIndex,
}

impl PositionId {
    pub const fn new(group: RaidGroupId, index: PositionIndex) -> PositionId {
        PositionId { group, index }
    }
}

/// Unique identifier of a storage processor
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
)]
#[display("sp{0}")]
pub struct NodeId(pub u32);

/// The actor that issued a job
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum OpOwner {
    Position(PositionId),
    Group(RaidGroupId),
}

/// Identifier of an outstanding job
///
/// Sequence numbers are only unique per owner. Completions for an `OpId` the
/// owner is no longer waiting on are dropped, which is how in-flight I/O is
/// quiesced.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct OpId {
    pub owner: OpOwner,
    pub seq: u64,
}

/// A message between two storage processors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub to: NodeId,
    pub from: NodeId,
    pub msg: PeerMsg,
}

/// The side effects of calling into a [`Node`]
///
/// Outputs must be acted upon in the order they are returned. In particular
/// a persisted record must be durable before any later `Envelope` is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Envelope(Envelope),
    PersistCopyRecord(CopyRecord),
    ClearCopyRecord(PositionId),
    PersistGroup(GroupSnapshot),
    Io(IoRequest),
    Event(EventRecord),
}
