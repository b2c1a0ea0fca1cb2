// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A runnable async storage processor that wraps the sans-io
//! [`sparing_protocol::Node`]

use crate::Config;
use crate::io::{BlockIo, IoCompletion, IoRunner};
use crate::ledgers::{CheckpointStore, LedgerError};
use crate::peer::PeerLink;
use serde::{Deserialize, Serialize};
use slog::{Logger, debug, error, info, o, warn};
use slog_error_chain::{InlineErrorChain, SlogInlineError};
use sparing_protocol::{
    AbortCopyError, Alarm, CopyHooks, CopyRequest, DriveEvent, Envelope,
    EventRecord, GroupStatus, Node, NodeId, NodeRole, Output, PositionId,
    PositionStatus, PromoteError, RaidGroupId, StartCopyError, Topology,
    TopologyError,
};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::oneshot::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

/// We only expect a handful of messages at a time.
const API_CHANNEL_BOUND: usize = 32;

/// Jobs are spawned without bound, so completions must never block them.
const IO_CHANNEL_BOUND: usize = 1024;

/// Number of events kept for [`NodeStatus`]
const RECENT_EVENTS: usize = 64;

// Details about a given node's status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub role: NodeRole,
    pub peer_connected: bool,
    pub alarms: BTreeSet<Alarm>,
    pub events_logged: usize,
    pub recent_events: Vec<EventRecord>,
    pub jobs_in_flight: usize,
}

/// A request sent to the `NodeTask` from the `NodeTaskHandle`
pub enum NodeApiRequest {
    /// Start a copy at a position
    StartCopy {
        request: CopyRequest,
        tx: oneshot::Sender<Result<(), StartCopyError>>,
    },

    /// Ask for a running copy to be aborted
    AbortCopy {
        position: PositionId,
        tx: oneshot::Sender<Result<(), AbortCopyError>>,
    },

    /// A drive was removed, inserted, or predicted to fail
    DriveEvent(DriveEvent),

    /// Change the test hooks of a position
    SetHooks { position: PositionId, hooks: CopyHooks, tx: oneshot::Sender<bool> },

    PositionStatus {
        position: PositionId,
        tx: oneshot::Sender<Option<PositionStatus>>,
    },

    GroupStatus { group: RaidGroupId, tx: oneshot::Sender<Option<GroupStatus>> },

    /// Get the overall status of the node
    NodeStatus { tx: oneshot::Sender<NodeStatus> },

    /// Take over from the peer
    Promote { tx: oneshot::Sender<Result<(), PromoteError>> },

    /// Shutdown the node's tokio tasks
    Shutdown,
}

/// An error response from a `NodeApiRequest`
#[derive(Error, Debug, PartialEq, SlogInlineError)]
pub enum NodeApiError {
    #[error("failed to send request to node task")]
    Send,
    #[error("failed to receive response from node task")]
    Recv,
    #[error("failed to start copy")]
    StartCopy(#[from] StartCopyError),
    #[error("failed to abort copy")]
    AbortCopy(#[from] AbortCopyError),
    #[error("failed to promote node")]
    Promote(#[from] PromoteError),
}

impl<T> From<SendError<T>> for NodeApiError {
    fn from(_: SendError<T>) -> Self {
        NodeApiError::Send
    }
}

impl From<RecvError> for NodeApiError {
    fn from(_: RecvError) -> Self {
        NodeApiError::Recv
    }
}

/// Failure to bring up a `NodeTask`
#[derive(Error, Debug, SlogInlineError)]
pub enum StartError {
    #[error("failed to load checkpoints")]
    Load(#[from] LedgerError),
    #[error("invalid topology")]
    Topology(#[from] TopologyError),
}

#[derive(Debug, Clone)]
pub struct NodeTaskHandle {
    node_id: NodeId,
    tx: mpsc::Sender<NodeApiRequest>,
}

impl NodeTaskHandle {
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Start a copy at `request.position`
    ///
    /// Returns once the copy is accepted, not once it completes.
    pub async fn start_copy(
        &self,
        request: CopyRequest,
    ) -> Result<(), NodeApiError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(NodeApiRequest::StartCopy { request, tx }).await?;
        rx.await??;
        Ok(())
    }

    /// Ask for the copy at `position` to be aborted
    ///
    /// The abort itself waits for the group to allow it.
    pub async fn abort_copy(
        &self,
        position: PositionId,
    ) -> Result<(), NodeApiError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(NodeApiRequest::AbortCopy { position, tx }).await?;
        rx.await??;
        Ok(())
    }

    pub async fn drive_event(
        &self,
        event: DriveEvent,
    ) -> Result<(), NodeApiError> {
        self.tx.send(NodeApiRequest::DriveEvent(event)).await?;
        Ok(())
    }

    /// Returns `false` if the position is unknown
    pub async fn set_hooks(
        &self,
        position: PositionId,
        hooks: CopyHooks,
    ) -> Result<bool, NodeApiError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(NodeApiRequest::SetHooks { position, hooks, tx }).await?;
        let res = rx.await?;
        Ok(res)
    }

    pub async fn position_status(
        &self,
        position: PositionId,
    ) -> Result<Option<PositionStatus>, NodeApiError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(NodeApiRequest::PositionStatus { position, tx }).await?;
        let res = rx.await?;
        Ok(res)
    }

    pub async fn group_status(
        &self,
        group: RaidGroupId,
    ) -> Result<Option<GroupStatus>, NodeApiError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(NodeApiRequest::GroupStatus { group, tx }).await?;
        let res = rx.await?;
        Ok(res)
    }

    /// Return internal information for the [`Node`]
    pub async fn status(&self) -> Result<NodeStatus, NodeApiError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(NodeApiRequest::NodeStatus { tx }).await?;
        let res = rx.await?;
        Ok(res)
    }

    /// Make this node active, continuing whatever the peer replicated
    pub async fn promote(&self) -> Result<(), NodeApiError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(NodeApiRequest::Promote { tx }).await?;
        rx.await??;
        Ok(())
    }

    /// Shutdown this [`NodeTask`]
    pub async fn shutdown(&self) -> Result<(), NodeApiError> {
        self.tx.send(NodeApiRequest::Shutdown).await?;
        Ok(())
    }
}

pub struct NodeTask {
    shutdown: bool,
    log: Logger,
    config: Config,
    node: Node,
    store: Box<dyn CheckpointStore>,
    io: IoRunner,
    io_rx: mpsc::Receiver<IoCompletion>,
    jobs_in_flight: usize,
    peer: Option<PeerLink>,
    events_logged: usize,
    recent_events: VecDeque<EventRecord>,

    // Handle requests received from `NodeTaskHandle`
    rx: mpsc::Receiver<NodeApiRequest>,
}

// The protocol is driven by the tokio clock so tests can pause time
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

impl NodeTask {
    pub async fn new(
        config: Config,
        topology: Topology,
        mut store: Box<dyn CheckpointStore>,
        io: Arc<dyn BlockIo>,
        peer: Option<PeerLink>,
        log: &Logger,
    ) -> Result<(NodeTask, NodeTaskHandle), StartError> {
        let log = log.new(o!(
            "component" => "sparing",
            "node_id" => config.node_id.to_string()
        ));

        let (tx, rx) = mpsc::channel(API_CHANNEL_BOUND);
        let (io_tx, io_rx) = mpsc::channel(IO_CHANNEL_BOUND);

        let persisted = store.load().await?;
        let node = Node::new(
            &log,
            config.node_id,
            config.role,
            config.peer_id,
            config.copy.clone(),
            topology,
            persisted,
            now(),
        )?;
        let node_id = config.node_id;
        let io = IoRunner::new(&log, io, io_tx);
        Ok((
            NodeTask {
                shutdown: false,
                log,
                config,
                node,
                store,
                io,
                io_rx,
                jobs_in_flight: 0,
                peer,
                events_logged: 0,
                recent_events: VecDeque::new(),
                rx,
            },
            NodeTaskHandle { node_id, tx },
        ))
    }

    /// Run the main loop of the node
    ///
    /// This should be spawned into its own tokio task
    pub async fn run(&mut self) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if self.peer.is_some() {
            self.node.on_connect(now());
        }
        self.process_outputs().await;

        while !self.shutdown {
            tokio::select! {
                Some(request) = self.rx.recv() => {
                    self.on_api_request(request);
                }
                Some(completion) = self.io_rx.recv() => {
                    self.jobs_in_flight = self.jobs_in_flight.saturating_sub(1);
                    self.node.operation_complete(
                        now(),
                        completion.op,
                        completion.result,
                    );
                }
                msg = recv_from_peer(&mut self.peer) => match msg {
                    Some(Envelope { from, msg, .. }) => {
                        self.node.handle(now(), from, msg);
                    }
                    None => self.on_peer_disconnected(),
                },
                _ = ticker.tick() => {
                    self.node.tick(now());
                }
            }
            self.process_outputs().await;
        }
    }

    fn on_peer_disconnected(&mut self) {
        warn!(self.log, "Peer link closed");
        self.peer = None;
        self.node.on_disconnect(now());
    }

    // Act on outputs in order. Persistence finishes before any later
    // envelope is sent.
    async fn process_outputs(&mut self) {
        loop {
            let outputs = self.node.drain_outputs();
            if outputs.is_empty() {
                return;
            }
            for output in outputs {
                self.on_output(output).await;
            }
        }
    }

    async fn on_output(&mut self, output: Output) {
        match output {
            Output::Envelope(envelope) => {
                let Some(peer) = &self.peer else {
                    return;
                };
                debug!(self.log, "Sending"; "msg" => envelope.msg.name());
                if !peer.send(envelope).await {
                    self.on_peer_disconnected();
                }
            }
            Output::PersistCopyRecord(record) => {
                let position = record.position;
                if let Err(err) = self.store.put_copy(record).await {
                    error!(
                        self.log,
                        "Failed to persist copy record";
                        "position" => %position,
                        "err" => InlineErrorChain::new(&err),
                    );
                }
            }
            Output::ClearCopyRecord(position) => {
                if let Err(err) = self.store.clear_copy(position).await {
                    error!(
                        self.log,
                        "Failed to clear copy record";
                        "position" => %position,
                        "err" => InlineErrorChain::new(&err),
                    );
                }
            }
            Output::PersistGroup(snapshot) => {
                let group = snapshot.group;
                if let Err(err) = self.store.put_group(snapshot).await {
                    error!(
                        self.log,
                        "Failed to persist group";
                        "group" => %group,
                        "err" => InlineErrorChain::new(&err),
                    );
                }
            }
            Output::Io(request) => {
                self.jobs_in_flight += 1;
                self.io.spawn(request);
            }
            Output::Event(event) => {
                info!(
                    self.log,
                    "Event";
                    "group" => %event.group,
                    "position" => ?event.position,
                    "code" => %event.code,
                    "severity" => %event.severity,
                    "copy_state" => ?event.copy_state,
                );
                self.events_logged += 1;
                if self.recent_events.len() == RECENT_EVENTS {
                    self.recent_events.pop_front();
                }
                self.recent_events.push_back(event);
            }
        }
    }

    fn on_api_request(&mut self, request: NodeApiRequest) {
        match request {
            NodeApiRequest::StartCopy { request, tx } => {
                let res = self.node.start_copy(now(), request);
                let _ = tx.send(res);
            }
            NodeApiRequest::AbortCopy { position, tx } => {
                let res = self.node.abort_copy(now(), position);
                let _ = tx.send(res);
            }
            NodeApiRequest::DriveEvent(event) => {
                self.node.drive_event(now(), event);
            }
            NodeApiRequest::SetHooks { position, hooks, tx } => {
                let res = self.node.set_hooks(now(), position, hooks);
                let _ = tx.send(res);
            }
            NodeApiRequest::PositionStatus { position, tx } => {
                let _ = tx.send(self.node.position_status(position));
            }
            NodeApiRequest::GroupStatus { group, tx } => {
                let _ = tx.send(self.node.group_status(group));
            }
            NodeApiRequest::NodeStatus { tx } => {
                let _ = tx.send(NodeStatus {
                    role: self.node.role(),
                    peer_connected: self.node.peer().is_connected(),
                    alarms: self.node.alarms().clone(),
                    events_logged: self.events_logged,
                    recent_events: self.recent_events.iter().cloned().collect(),
                    jobs_in_flight: self.jobs_in_flight,
                });
            }
            NodeApiRequest::Promote { tx } => {
                let res = self.node.promote(now());
                let _ = tx.send(res);
            }
            NodeApiRequest::Shutdown => {
                info!(self.log, "Shutting down node task");
                self.shutdown = true;
            }
        }
    }
}

async fn recv_from_peer(peer: &mut Option<PeerLink>) -> Option<Envelope> {
    match peer {
        Some(peer) => peer.recv().await,
        None => std::future::pending().await,
    }
}
