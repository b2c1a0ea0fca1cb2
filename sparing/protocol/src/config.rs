// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tunables for copy and sparing behavior

use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use std::time::Duration;

/// Timeouts and pacing used by virtual positions and the peer synchronizer
///
/// All durations are expressed in milliseconds when serialized.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyConfig {
    /// How long a copy waits for a removed source drive to return before the
    /// source is swapped out and the destination takes over
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub source_return_timeout: Duration,

    /// How long a position without a copy waits for its removed drive before
    /// asking for a permanent spare
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub permanent_spare_trigger: Duration,

    /// How often to retry spare selection when nothing suitable was found
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub spare_retry_interval: Duration,

    /// How often to retry a permission request the coordinator denied
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub permission_retry_interval: Duration,

    /// How often to resend a quiesce request the peer has not acknowledged
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub peer_retry_interval: Duration,

    /// How long to wait before reissuing a failed swap or copy job
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub operation_retry_interval: Duration,

    /// Number of chunks copied per extent
    pub copy_extent_chunks: u64,
}

impl Default for CopyConfig {
    fn default() -> Self {
        CopyConfig {
            source_return_timeout: Duration::from_secs(5 * 60),
            permanent_spare_trigger: Duration::from_secs(5 * 60),
            spare_retry_interval: Duration::from_secs(5),
            permission_retry_interval: Duration::from_secs(3),
            peer_retry_interval: Duration::from_secs(1),
            operation_retry_interval: Duration::from_secs(1),
            copy_extent_chunks: 1,
        }
    }
}
