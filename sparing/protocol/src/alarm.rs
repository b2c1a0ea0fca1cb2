// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mechanism for reporting protocol invariant violations

use serde::{Deserialize, Serialize};

use crate::{DriveLocation, Lba, PositionId};

#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Alarm {
    /// A completed copy extent would have moved the checkpoint backwards or
    /// past the end of the position.
    ///
    /// Reason: extents are issued one at a time starting at the checkpoint,
    /// and completions for extents that are no longer outstanding are
    /// discarded. This should be impossible.
    CheckpointRejected { position: PositionId, current: Lba, requested: Lba },

    /// A persisted copy record names a source drive other than the drive the
    /// position currently uses.
    ///
    /// Reason: the record is written before the source changes and cleared
    /// afterwards. The record is ignored and the copy is not resumed.
    CopyRecordMismatch {
        position: PositionId,
        recorded: DriveLocation,
        actual: DriveLocation,
    },

    /// A persisted or replicated checkpoint was outside of the position.
    InvalidCheckpoint { position: PositionId, checkpoint: Lba, capacity: Lba },
}
