// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Selection of destination drives for copies and permanent spares
//!
//! Candidates are first filtered by hard rules that every replacement must
//! satisfy, in this order:
//!
//!   1. The drive is present and not end-of-life
//!   2. Its exported offset is no larger than the replaced drive's
//!   3. It is not bound to another position
//!   4. It is in the same performance tier
//!   5. It has the same block size
//!   6. It exports enough capacity for the position
//!
//! The survivors are then ranked. Reserve pool drives come first, followed by
//! matching drive type, closest offset, same bus, smallest adequate capacity
//! and same enclosure. The lowest slot breaks any remaining tie so that
//! selection is deterministic.

use crate::{
    CopyKind, DriveInfo, DriveInventory, DriveLocation, Lba, PositionId,
    SparePool,
};
use parse_display::Display;
use serde::{Deserialize, Serialize};
use slog_error_chain::SlogInlineError;
use thiserror::Error;

/// Why a spare is wanted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SparePurpose {
    Copy(CopyKind),

    /// Replace a drive that has been missing for too long
    Permanent,
}

/// A request to find a replacement for `replacing`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpareRequest {
    pub position: PositionId,
    pub purpose: SparePurpose,
    pub replacing: DriveLocation,

    /// Blocks the replacement must export
    pub capacity: Lba,

    /// A destination chosen before a restart. It is returned again if it is
    /// still usable.
    pub previously_bound: Option<DriveLocation>,
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
pub enum InvalidDestinationReason {
    NotFound,
    NotPresent,
    EndOfLife,
    UnacceptableOffset,
    AlreadyBound,
    PerformanceTierMismatch,
    BlockSizeMismatch,
    InsufficientCapacity,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, SlogInlineError)]
pub enum SpareError {
    #[error("no suitable destination for position {0}")]
    NoSuitableSpare(PositionId),
    #[error("destination {location} is invalid: {reason}")]
    InvalidDestination {
        location: DriveLocation,
        reason: InvalidDestinationReason,
    },
    #[error("drive {0} being replaced is not in the inventory")]
    UnknownDrive(DriveLocation),
}

/// What a replacement must look like, derived from the drive it replaces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpareRequirements {
    pub position: PositionId,
    pub capacity: Lba,
    pub original: DriveInfo,
}

impl SpareRequirements {
    fn check(&self, drive: &DriveInfo) -> Result<(), InvalidDestinationReason> {
        if !drive.present {
            return Err(InvalidDestinationReason::NotPresent);
        }
        if drive.end_of_life {
            return Err(InvalidDestinationReason::EndOfLife);
        }
        if drive.offset > self.original.offset {
            return Err(InvalidDestinationReason::UnacceptableOffset);
        }
        if drive.location == self.original.location
            || drive.bound_to.is_some_and(|p| p != self.position)
        {
            return Err(InvalidDestinationReason::AlreadyBound);
        }
        if drive.drive_type.performance_tier()
            != self.original.drive_type.performance_tier()
        {
            return Err(InvalidDestinationReason::PerformanceTierMismatch);
        }
        if drive.block_size != self.original.block_size {
            return Err(InvalidDestinationReason::BlockSizeMismatch);
        }
        if drive.capacity < self.capacity {
            return Err(InvalidDestinationReason::InsufficientCapacity);
        }
        Ok(())
    }

    // Lower sorts first
    fn rank(
        &self,
        drive: &DriveInfo,
    ) -> (SparePool, bool, Lba, bool, Lba, bool, DriveLocation) {
        let original = &self.original;
        (
            drive.pool,
            drive.drive_type != original.drive_type,
            drive.offset.abs_diff(original.offset),
            drive.location.bus != original.location.bus,
            drive.capacity,
            drive.location.enclosure != original.location.enclosure,
            drive.location,
        )
    }
}

/// Chooses destinations from a drive inventory
pub struct SpareSelector<'a> {
    inventory: &'a DriveInventory,
}

impl<'a> SpareSelector<'a> {
    pub fn new(inventory: &'a DriveInventory) -> SpareSelector<'a> {
        SpareSelector { inventory }
    }

    pub fn select(
        &self,
        request: &SpareRequest,
    ) -> Result<DriveLocation, SpareError> {
        let original = self
            .inventory
            .get(&request.replacing)
            .ok_or(SpareError::UnknownDrive(request.replacing))?;
        let requirements = SpareRequirements {
            position: request.position,
            capacity: request.capacity,
            original: original.clone(),
        };

        // A destination picked before a restart is kept if it still passes
        // the hard rules
        let reusable = request
            .previously_bound
            .and_then(|previous| self.inventory.get(&previous))
            .filter(|drive| requirements.check(drive).is_ok());
        if let Some(drive) = reusable {
            return Ok(drive.location);
        }

        match request.purpose {
            SparePurpose::Copy(
                CopyKind::UserInitiatedToExplicitDestination(location),
            ) => self.validate(&requirements, location).map(|()| location),
            SparePurpose::Copy(CopyKind::Proactive)
            | SparePurpose::Copy(CopyKind::UserInitiated)
            | SparePurpose::Permanent => self.choose(&requirements),
        }
    }

    /// Check an operator supplied destination against the hard rules
    pub fn validate(
        &self,
        requirements: &SpareRequirements,
        location: DriveLocation,
    ) -> Result<(), SpareError> {
        let drive = self.inventory.get(&location).ok_or(
            SpareError::InvalidDestination {
                location,
                reason: InvalidDestinationReason::NotFound,
            },
        )?;
        requirements
            .check(drive)
            .map_err(|reason| SpareError::InvalidDestination { location, reason })
    }

    fn choose(
        &self,
        requirements: &SpareRequirements,
    ) -> Result<DriveLocation, SpareError> {
        self.inventory
            .iter()
            .filter(|d| requirements.check(d).is_ok())
            .min_by_key(|d| requirements.rank(d))
            .map(|d| d.location)
            .ok_or(SpareError::NoSuitableSpare(requirements.position))
    }
}
