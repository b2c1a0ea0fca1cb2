// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running swap and copy jobs against the block I/O layer

use async_trait::async_trait;
use slog::{Logger, debug};
use sparing_protocol::{IoError, IoRequest, Job, OpId};
use std::sync::Arc;
use tokio::sync::mpsc;

/// The block I/O and configuration layer underneath the copy protocol
#[async_trait]
pub trait BlockIo: Send + Sync + 'static {
    async fn execute(&self, job: Job) -> Result<(), IoError>;
}

/// The result of a job, sent back to the node task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoCompletion {
    pub op: OpId,
    pub result: Result<(), IoError>,
}

/// Spawns each job into its own task
pub(crate) struct IoRunner {
    log: Logger,
    io: Arc<dyn BlockIo>,
    tx: mpsc::Sender<IoCompletion>,
}

impl IoRunner {
    pub(crate) fn new(
        log: &Logger,
        io: Arc<dyn BlockIo>,
        tx: mpsc::Sender<IoCompletion>,
    ) -> IoRunner {
        IoRunner { log: log.clone(), io, tx }
    }

    pub(crate) fn spawn(&self, request: IoRequest) {
        let io = Arc::clone(&self.io);
        let tx = self.tx.clone();
        let log = self.log.clone();
        tokio::spawn(async move {
            let IoRequest { op, job } = request;
            let result = io.execute(job).await;
            if tx.send(IoCompletion { op, result }).await.is_err() {
                debug!(log, "Node task exited before job completed"; "op" => ?op);
            }
        });
    }
}
