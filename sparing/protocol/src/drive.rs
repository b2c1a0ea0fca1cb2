// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drives, their slots and the inventory of drives known to a node

use crate::{Lba, PositionId};
use parse_display::Display;
use serde::{Deserialize, Serialize};
use slog_error_chain::SlogInlineError;
use std::collections::BTreeMap;
use thiserror::Error;

/// The default exported offset of a drive, in blocks
pub const DEFAULT_DRIVE_OFFSET: Lba = 0x10000;

/// The physical slot a drive is inserted into
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
#[display("{bus}_{enclosure}_{slot}")]
pub struct DriveLocation {
    pub bus: u8,
    pub enclosure: u8,
    pub slot: u8,
}

impl DriveLocation {
    pub const fn new(bus: u8, enclosure: u8, slot: u8) -> DriveLocation {
        DriveLocation { bus, enclosure, slot }
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
pub enum DriveType {
    SasFlashHe,
    SasFlashMe,
    SasFlashLe,
    SasFlashRi,
    Sas,
    NlSas,
    Sata,
}

/// Drives can only be replaced by drives in the same tier
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
pub enum PerformanceTier {
    Flash,
    Performance,
    Capacity,
}

impl DriveType {
    pub fn performance_tier(&self) -> PerformanceTier {
        match self {
            DriveType::SasFlashHe
            | DriveType::SasFlashMe
            | DriveType::SasFlashLe
            | DriveType::SasFlashRi => PerformanceTier::Flash,
            DriveType::Sas => PerformanceTier::Performance,
            DriveType::NlSas | DriveType::Sata => PerformanceTier::Capacity,
        }
    }
}

/// Size of a block in bytes
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
#[display("{0}")]
pub struct BlockSize(pub u32);

impl BlockSize {
    pub const B520: BlockSize = BlockSize(520);
    pub const B4160: BlockSize = BlockSize(4160);
}

/// Which pool an unbound drive is taken from when sparing
///
/// The reserve pool is always consumed before the free pool.
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
pub enum SparePool {
    Reserve,
    Free,
}

/// Everything a node knows about a single drive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveInfo {
    pub location: DriveLocation,
    pub drive_type: DriveType,
    pub block_size: BlockSize,

    /// Exported capacity in blocks, after the offset
    pub capacity: Lba,

    /// Exported offset in blocks
    pub offset: Lba,
    pub pool: SparePool,
    pub present: bool,

    /// Predictive failure was reported for this drive
    pub end_of_life: bool,

    /// The position this drive is bound to, if any
    pub bound_to: Option<PositionId>,
}

impl DriveInfo {
    pub fn new(
        location: DriveLocation,
        drive_type: DriveType,
        capacity: Lba,
    ) -> DriveInfo {
        DriveInfo {
            location,
            drive_type,
            block_size: BlockSize::B520,
            capacity,
            offset: DEFAULT_DRIVE_OFFSET,
            pool: SparePool::Free,
            present: true,
            end_of_life: false,
            bound_to: None,
        }
    }

    pub fn with_pool(mut self, pool: SparePool) -> DriveInfo {
        self.pool = pool;
        self
    }

    pub fn with_block_size(mut self, block_size: BlockSize) -> DriveInfo {
        self.block_size = block_size;
        self
    }

    pub fn with_offset(mut self, offset: Lba) -> DriveInfo {
        self.offset = offset;
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.present && !self.end_of_life
    }

    /// Can this drive be chosen as a spare?
    pub fn is_available(&self) -> bool {
        self.is_healthy() && self.bound_to.is_none()
    }
}

/// Notifications pushed by drive slots
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum DriveEvent {
    Removed(DriveLocation),
    Inserted(DriveLocation),
    EndOfLife(DriveLocation),
}

impl DriveEvent {
    pub fn location(&self) -> DriveLocation {
        match self {
            DriveEvent::Removed(location)
            | DriveEvent::Inserted(location)
            | DriveEvent::EndOfLife(location) => *location,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, SlogInlineError)]
pub enum InventoryError {
    #[error("drive {0} is not in the inventory")]
    NotFound(DriveLocation),
    #[error("drive {0} is already in the inventory")]
    Duplicate(DriveLocation),
    #[error("drive {location} is already bound to position {position}")]
    AlreadyBound { location: DriveLocation, position: PositionId },
}

/// All drives known to a node, keyed by slot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriveInventory {
    drives: BTreeMap<DriveLocation, DriveInfo>,
}

impl DriveInventory {
    pub fn new() -> DriveInventory {
        DriveInventory::default()
    }

    pub fn insert(&mut self, info: DriveInfo) -> Result<(), InventoryError> {
        if self.drives.contains_key(&info.location) {
            return Err(InventoryError::Duplicate(info.location));
        }
        self.drives.insert(info.location, info);
        Ok(())
    }

    pub fn get(&self, location: &DriveLocation) -> Option<&DriveInfo> {
        self.drives.get(location)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DriveInfo> {
        self.drives.values()
    }

    /// Drives bound to `position`
    pub fn bound_to(
        &self,
        position: PositionId,
    ) -> impl Iterator<Item = &DriveInfo> + '_ {
        self.drives.values().filter(move |d| d.bound_to == Some(position))
    }

    pub fn is_present(&self, location: &DriveLocation) -> bool {
        self.drives.get(location).is_some_and(|d| d.present)
    }

    /// Update presence and health from a drive notification
    ///
    /// Returns `false` if the drive is unknown.
    pub fn apply(&mut self, event: &DriveEvent) -> bool {
        let Some(drive) = self.drives.get_mut(&event.location()) else {
            return false;
        };
        match event {
            DriveEvent::Removed(_) => drive.present = false,
            DriveEvent::Inserted(_) => drive.present = true,
            DriveEvent::EndOfLife(_) => drive.end_of_life = true,
        }
        true
    }

    /// Bind a drive to `position`
    ///
    /// Binding a drive to the position it is already bound to succeeds.
    pub fn bind(
        &mut self,
        location: DriveLocation,
        position: PositionId,
    ) -> Result<(), InventoryError> {
        let drive = self
            .drives
            .get_mut(&location)
            .ok_or(InventoryError::NotFound(location))?;
        match drive.bound_to {
            Some(bound) if bound != position => {
                Err(InventoryError::AlreadyBound { location, position: bound })
            }
            _ => {
                drive.bound_to = Some(position);
                Ok(())
            }
        }
    }

    pub fn release(&mut self, location: &DriveLocation) {
        if let Some(drive) = self.drives.get_mut(location) {
            drive.bound_to = None;
        }
    }

    pub fn mark_end_of_life(&mut self, location: &DriveLocation) {
        if let Some(drive) = self.drives.get_mut(location) {
            drive.end_of_life = true;
        }
    }
}
