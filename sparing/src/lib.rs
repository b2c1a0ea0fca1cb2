// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A runnable async storage processor that wraps the sans-io
//! [`sparing_protocol::Node`]

mod config;
mod io;
mod ledgers;
mod log;
mod peer;
mod task;

pub use config::{Config, LoadError};
pub use io::{BlockIo, IoCompletion};
pub use ledgers::{
    CheckpointLedger, CheckpointStore, LedgerCheckpointStore, LedgerError,
    MemoryCheckpointStore,
};
pub use log::{LogConfig, LogLevel};
pub use peer::PeerLink;
pub use task::{
    NodeApiError, NodeApiRequest, NodeStatus, NodeTask, NodeTaskHandle,
    StartError,
};
