// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Copy progress tracking
//!
//! Each in-progress copy has exactly one [`Checkpoint`]: the LBA below which
//! user data has been copied to the destination. It is persisted as part of a
//! [`CopyRecord`] after every extent, so that a restarted node resumes the
//! scan where it left off rather than starting over.

use crate::{
    CopyKind, CopyState, DriveLocation, Lba, Mode, PositionId, Requester,
};
use serde::{Deserialize, Serialize};
use slog_error_chain::SlogInlineError;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, SlogInlineError)]
pub enum CheckpointError {
    #[error("checkpoint cannot move backwards from {current:#x} to {requested:#x}")]
    Regression { current: Lba, requested: Lba },
    #[error("checkpoint {requested:#x} is beyond capacity {capacity:#x}")]
    BeyondCapacity { requested: Lba, capacity: Lba },
}

/// A monotonic LBA progress marker bounded by the capacity of a position
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Checkpoint {
    lba: Lba,
    capacity: Lba,
}

impl Checkpoint {
    pub fn new(capacity: Lba) -> Checkpoint {
        Checkpoint { lba: 0, capacity }
    }

    /// Recreate a checkpoint read back from storage
    pub fn restore(lba: Lba, capacity: Lba) -> Result<Checkpoint, CheckpointError> {
        if lba > capacity {
            return Err(CheckpointError::BeyondCapacity {
                requested: lba,
                capacity,
            });
        }
        Ok(Checkpoint { lba, capacity })
    }

    pub fn lba(&self) -> Lba {
        self.lba
    }

    pub fn capacity(&self) -> Lba {
        self.capacity
    }

    pub fn is_complete(&self) -> bool {
        self.lba == self.capacity
    }

    pub fn percent_rebuilt(&self) -> u8 {
        percent_rebuilt(self.lba, self.capacity)
    }

    pub fn advance_to(&mut self, lba: Lba) -> Result<(), CheckpointError> {
        if lba < self.lba {
            return Err(CheckpointError::Regression {
                current: self.lba,
                requested: lba,
            });
        }
        if lba > self.capacity {
            return Err(CheckpointError::BeyondCapacity {
                requested: lba,
                capacity: self.capacity,
            });
        }
        self.lba = lba;
        Ok(())
    }
}

/// The whole percentage of `capacity` that lies below `checkpoint`
///
/// An empty position is always fully rebuilt.
pub fn percent_rebuilt(checkpoint: Lba, capacity: Lba) -> u8 {
    if capacity == 0 {
        return 100;
    }
    let checkpoint = u128::from(checkpoint.min(capacity));
    // The quotient is at most 100
    ((checkpoint * 100) / u128::from(capacity)) as u8
}

/// The part of a position an extent lies in
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Region {
    /// The group's paged metadata, stored after the user data
    Metadata,
    User,
}

/// A contiguous range of blocks on a position
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Extent {
    pub region: Region,
    pub start: Lba,
    pub blocks: Lba,
}

impl Extent {
    pub fn end(&self) -> Lba {
        self.start + self.blocks
    }

    /// The chunk indexes covered by this extent
    pub fn chunks(&self, chunk_size: Lba) -> std::ops::Range<u64> {
        if self.blocks == 0 {
            return 0..0;
        }
        (self.start / chunk_size)..(self.end() - 1) / chunk_size + 1
    }

    /// Plan the next extent to copy in `region`
    ///
    /// Extents start at `cursor`, end on a chunk boundary `extent_chunks`
    /// chunks later and never cross `region_end`. There is nothing left to
    /// copy once `cursor` reaches `region_end`.
    pub fn next(
        region: Region,
        cursor: Lba,
        region_end: Lba,
        chunk_size: Lba,
        extent_chunks: u64,
    ) -> Option<Extent> {
        if cursor >= region_end {
            return None;
        }
        let extent_chunks = extent_chunks.max(1);
        let aligned_end = (cursor / chunk_size + extent_chunks) * chunk_size;
        let end = aligned_end.min(region_end);
        Some(Extent { region, start: cursor, blocks: end - cursor })
    }
}

/// The persisted state of an in-progress copy
///
/// Stored in the checkpoint store keyed by `position`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyRecord {
    pub generation: u64,
    pub position: PositionId,
    pub kind: CopyKind,
    pub requester: Requester,
    pub source: DriveLocation,

    /// The destination bound to this copy. Once set, restarts re-select this
    /// drive rather than picking a new one.
    pub destination: Option<DriveLocation>,
    pub state: CopyState,
    pub mode: Mode,
    pub checkpoint: Lba,
    pub metadata_checkpoint: Lba,

    /// User chunks below `checkpoint` that the destination missed while it
    /// was gone and must be copied again
    #[serde(default)]
    pub repair: BTreeSet<u64>,
}

impl CopyRecord {
    pub fn is_newer_than(&self, other: &CopyRecord) -> bool {
        self.generation > other.generation
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;
    use test_strategy::proptest;

    #[test]
    fn advance_rejects_regression_and_overshoot() {
        let mut checkpoint = Checkpoint::new(100);
        checkpoint.advance_to(40).unwrap();
        assert_eq!(
            checkpoint.advance_to(39),
            Err(CheckpointError::Regression { current: 40, requested: 39 })
        );
        assert_eq!(
            checkpoint.advance_to(101),
            Err(CheckpointError::BeyondCapacity {
                requested: 101,
                capacity: 100
            })
        );
        assert_eq!(checkpoint.lba(), 40);
        checkpoint.advance_to(100).unwrap();
        assert!(checkpoint.is_complete());
        assert!(Checkpoint::restore(101, 100).is_err());
    }

    #[test]
    fn percent_rebuilt_bounds() {
        assert_eq!(percent_rebuilt(0, 0), 100);
        assert_eq!(percent_rebuilt(0, 2048), 0);
        assert_eq!(percent_rebuilt(1024, 2048), 50);
        assert_eq!(percent_rebuilt(2047, 2048), 99);
        assert_eq!(percent_rebuilt(2048, 2048), 100);
        assert_eq!(percent_rebuilt(u64::MAX, u64::MAX), 100);
    }

    #[test]
    fn extents_are_chunk_aligned_and_bounded() {
        let chunk = 2048;
        let e = Extent::next(Region::User, 0, 10_000, chunk, 2).unwrap();
        assert_eq!((e.start, e.blocks), (0, 4096));
        let e = Extent::next(Region::User, e.end(), 10_000, chunk, 2).unwrap();
        assert_eq!((e.start, e.blocks), (4096, 4096));
        let e = Extent::next(Region::User, e.end(), 10_000, chunk, 2).unwrap();
        assert_eq!((e.start, e.end()), (8192, 10_000));
        assert_eq!(e.chunks(chunk), 4..5);
        assert!(Extent::next(Region::User, 10_000, 10_000, chunk, 2).is_none());

        // A metadata extent ends at the end of the metadata region even if
        // that is not a chunk boundary
        let e =
            Extent::next(Region::Metadata, 10_000, 10_100, chunk, 4).unwrap();
        assert_eq!(e.end(), 10_100);
    }

    #[proptest]
    fn checkpoint_is_monotonic_and_bounded(
        #[strategy(1..1_000_000u64)] capacity: u64,
        #[strategy(proptest::collection::vec(any::<u64>(), 1..50))]
        requests: Vec<u64>,
    ) {
        let mut checkpoint = Checkpoint::new(capacity);
        for request in requests {
            let before = checkpoint.lba();
            let _ = checkpoint.advance_to(request % (capacity * 2));
            prop_assert!(checkpoint.lba() >= before);
            prop_assert!(checkpoint.lba() <= capacity);
            prop_assert!(checkpoint.percent_rebuilt() <= 100);
        }
    }
}
