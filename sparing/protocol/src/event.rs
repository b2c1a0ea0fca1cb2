// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event log records exposed to monitoring

use crate::{CopyState, PositionIndex, RaidGroupId};
use parse_display::Display;
use serde::{Deserialize, Serialize};

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
pub enum Severity {
    Info,
    Warning,
    Error,
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
pub enum EventCode {
    /// A copy entered a new state. The state is in the record.
    CopyState,
    CopyStarted,
    CopyCompleted,
    CopyAborted,
    CopyCancelled,
    CopyRequestRejected,
    NoSuitableSpare,
    SourceLost,
    SourceReturned,
    SourceTimeoutExpired,
    DestinationLost,
    DestinationReturned,
    PositionDriveLost,
    PositionDriveReturned,
    AbortCopyRequestDenied,
    CompleteCopyRequestDenied,
    SwapOutRequestDenied,
    PermanentSpareRequestDenied,
    PermanentSpareSwappedIn,
    PositionRebuilt,
    GroupDegraded,
    GroupFailed,
    GroupRecovered,
}

/// A single event log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub group: RaidGroupId,
    pub position: Option<PositionIndex>,
    pub code: EventCode,
    pub severity: Severity,
    pub copy_state: Option<CopyState>,
}
