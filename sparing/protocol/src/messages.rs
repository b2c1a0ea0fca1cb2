// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Messages exchanged between virtual positions, the group coordinator and the
//! I/O executor

use crate::{DriveLocation, Extent, Lba, OpId, PositionId, RaidGroupId};
use parse_display::Display;
use serde::{Deserialize, Serialize};
use slog_error_chain::SlogInlineError;
use std::collections::BTreeSet;
use thiserror::Error;

/// Transitions a virtual position may only make with the group's consent
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
pub enum PermissionKind {
    CompleteCopy,
    AbortCopy,
    SwapOutFailedSource,
    PermanentSpare,
}

/// Requests sent from a virtual position to its group coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupRequest {
    /// The drive holding this position's data is gone
    MarkRebuildLogging,

    /// The drive holding this position's data returned
    ClearRebuildLogging,

    /// The source was swapped out after a copy to `checkpoint`. Everything
    /// above the checkpoint must be rebuilt onto the destination, and so must
    /// the `repair` chunks below it that the destination missed.
    HandOffCheckpoint { checkpoint: Lba, repair: BTreeSet<u64> },

    /// A blank drive replaced a missing one and must be fully rebuilt
    PermanentSpareSwappedIn,

    /// The drive serving this position changed
    MemberReplaced { drive: DriveLocation },

    Permission(PermissionKind),

    /// A permission request is no longer wanted
    Withdraw(PermissionKind),
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum DenialReason {
    /// The group has lost more positions than it can tolerate
    GroupFailed,

    /// Other positions are degraded
    GroupDegraded { degraded: usize },

    /// The requesting position and at least one other are degraded
    DoubleDegraded { degraded: usize },
}

/// Replies sent from the group coordinator to a virtual position
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum GroupReply {
    Granted(PermissionKind),
    Denied { kind: PermissionKind, reason: DenialReason },
}

/// Work handed to the block I/O and configuration layers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Job {
    /// Attach `drive` as an edge of a position
    SwapIn { drive: DriveLocation },

    /// Detach `drive` from a position
    SwapOut { drive: DriveLocation },

    /// Copy `extent` from one drive to the other
    CopyExtent { from: DriveLocation, to: DriveLocation, extent: Extent },

    /// Reconstruct `extent` of `position` from its peers and write it to
    /// `targets`
    RebuildChunk {
        position: PositionId,
        extent: Extent,
        targets: Vec<DriveLocation>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoRequest {
    pub op: OpId,
    pub job: Job,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, SlogInlineError, Serialize, Deserialize)]
pub enum IoError {
    #[error("drive {0} is not present")]
    DriveNotPresent(DriveLocation),
    #[error("position {0} cannot accept writes")]
    PositionUnavailable(PositionId),
    #[error("transient I/O failure: {0}")]
    Transient(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error, SlogInlineError)]
pub enum WriteError {
    #[error("not the active node")]
    NotActive,
    #[error("unknown position {0}")]
    UnknownPosition(PositionId),
    #[error("write to {position} spans beyond its capacity")]
    OutOfRange { position: PositionId },
    #[error("group {0} is failed")]
    GroupFailed(RaidGroupId),
    #[error("write to {0} failed and must be retried")]
    Retryable(PositionId),
}

/// Where a single write to a position must land
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WritePlan {
    pub position: PositionId,

    /// Drives that must all apply the write
    pub targets: Vec<DriveLocation>,

    /// The position is missing and the group logged the write for rebuild
    /// instead
    pub logged: bool,
}

impl WritePlan {
    pub(crate) fn logged(position: PositionId) -> WritePlan {
        WritePlan { position, targets: vec![], logged: true }
    }

    /// Is this a mirrored write?
    pub fn is_atomic(&self) -> bool {
        self.targets.len() > 1
    }

    /// Acknowledge the write only if every target applied it
    pub fn resolve(&self, applied: &[DriveLocation]) -> Result<(), WriteError> {
        if self.logged || self.targets.iter().all(|t| applied.contains(t)) {
            Ok(())
        } else {
            Err(WriteError::Retryable(self.position))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{PositionIndex, RaidGroupId};

    #[test]
    fn mirrored_writes_need_both_edges() {
        let position = PositionId::new(RaidGroupId(1), PositionIndex(0));
        let source = DriveLocation::new(0, 0, 0);
        let destination = DriveLocation::new(0, 0, 9);
        let plan = WritePlan {
            position,
            targets: vec![source, destination],
            logged: false,
        };
        assert!(plan.is_atomic());
        assert_eq!(
            plan.resolve(&[source]),
            Err(WriteError::Retryable(position))
        );
        assert_eq!(plan.resolve(&[destination, source]), Ok(()));
        assert_eq!(WritePlan::logged(position).resolve(&[]), Ok(()));
    }
}
