// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tests of `NodeTask` running on the tokio clock

use assert_matches::assert_matches;
use async_trait::async_trait;
use camino_tempfile::Utf8TempDir;
use sparing::{
    BlockIo, CheckpointStore, Config, LedgerCheckpointStore, LogConfig,
    LogLevel, MemoryCheckpointStore, NodeApiError, NodeTask, NodeTaskHandle,
    PeerLink,
};
use sparing_protocol::{
    AbortCopyError, CopyConfig, CopyHooks, CopyKind, CopyRequest, CopyState,
    DEFAULT_CHUNK_SIZE, DriveInfo, DriveLocation, DriveType, IoError, Job,
    NodeId, NodeRole, PositionId, PositionIndex, PositionStatus,
    RaidGroupConfig, RaidGroupId, RaidType, Requester, StartCopyError, Topology,
};
use sparing_test_utils::test_setup_log;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const GROUP: RaidGroupId = RaidGroupId(0);
const WIDTH: u8 = 4;
const CHUNKS: u64 = 8;
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_POLLS: usize = 600;

/// Block I/O that succeeds and counts the jobs it ran
#[derive(Debug, Default)]
struct CountingIo {
    copies: AtomicUsize,
    swaps: AtomicUsize,
}

#[async_trait]
impl BlockIo for CountingIo {
    async fn execute(&self, job: Job) -> Result<(), IoError> {
        match job {
            Job::CopyExtent { .. } => {
                self.copies.fetch_add(1, Ordering::SeqCst);
            }
            Job::SwapIn { .. } | Job::SwapOut { .. } => {
                self.swaps.fetch_add(1, Ordering::SeqCst);
            }
            Job::RebuildChunk { .. } => {}
        }
        Ok(())
    }
}

fn member(index: u8) -> DriveLocation {
    DriveLocation::new(0, 0, index)
}

fn spare() -> DriveLocation {
    DriveLocation::new(0, 1, 0)
}

fn position(index: u16) -> PositionId {
    PositionId::new(GROUP, PositionIndex(index))
}

fn topology() -> Topology {
    let capacity = (CHUNKS + 1) * DEFAULT_CHUNK_SIZE;
    let group = RaidGroupConfig {
        id: GROUP,
        raid_type: RaidType::SingleParity,
        drives: (0..WIDTH).map(member).collect(),
        capacity: CHUNKS * DEFAULT_CHUNK_SIZE,
        metadata_capacity: DEFAULT_CHUNK_SIZE,
        chunk_size: DEFAULT_CHUNK_SIZE,
    };
    let drives = group
        .drives
        .iter()
        .copied()
        .chain(std::iter::once(spare()))
        .map(|location| DriveInfo::new(location, DriveType::Sas, capacity))
        .collect();
    Topology { drives, groups: vec![group] }
}

fn config(node_id: u32, peer_id: u32, role: NodeRole) -> Config {
    Config {
        node_id: NodeId(node_id),
        peer_id: NodeId(peer_id),
        role,
        tick_interval: Duration::from_millis(500),
        log: LogConfig::Terminal { level: LogLevel::Info },
        checkpoint_ledger_paths: vec![],
        copy: CopyConfig::default(),
    }
}

async fn spawn_node(
    config: Config,
    store: Box<dyn CheckpointStore>,
    io: Arc<CountingIo>,
    peer: Option<PeerLink>,
    log: &slog::Logger,
) -> NodeTaskHandle {
    let (mut task, handle) =
        NodeTask::new(config, topology(), store, io, peer, log).await.unwrap();
    tokio::spawn(async move { task.run().await });
    handle
}

fn user_copy(index: u16) -> CopyRequest {
    CopyRequest {
        position: position(index),
        kind: CopyKind::UserInitiated,
        requester: Requester::Operator,
    }
}

fn pause_at(states: &[CopyState]) -> CopyHooks {
    CopyHooks {
        desired_percentage: None,
        pause_at: states.iter().copied().collect(),
    }
}

/// Poll the status of `position` until `done` holds
async fn wait_for_position<F>(
    handle: &NodeTaskHandle,
    position: PositionId,
    mut done: F,
) -> PositionStatus
where
    F: FnMut(&PositionStatus) -> bool,
{
    for _ in 0..MAX_POLLS {
        let status =
            handle.position_status(position).await.unwrap().expect("position");
        if done(&status) {
            return status;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    panic!("{position} never reached the expected state");
}

fn copy_finished_onto_spare(status: &PositionStatus) -> bool {
    status.copy.is_none() && status.source == spare()
}

fn paused_at(state: CopyState) -> impl FnMut(&PositionStatus) -> bool {
    move |status| status.copy.as_ref().is_some_and(|c| c.state == state)
}

#[tokio::test(start_paused = true)]
async fn copy_completes_without_peer() {
    let log = test_setup_log("copy_completes_without_peer");
    let io = Arc::new(CountingIo::default());
    let store = MemoryCheckpointStore::default();
    let handle = spawn_node(
        config(0, 1, NodeRole::Active),
        Box::new(store.clone()),
        io.clone(),
        None,
        &log,
    )
    .await;

    handle.start_copy(user_copy(2)).await.unwrap();
    wait_for_position(&handle, position(2), copy_finished_onto_spare).await;

    let group = handle.group_status(GROUP).await.unwrap().expect("group");
    assert_eq!(group.members[2], spare());
    assert!(group.degraded.is_empty());
    assert!(io.copies.load(Ordering::SeqCst) >= CHUNKS as usize);
    assert!(io.swaps.load(Ordering::SeqCst) > 0);

    // The copy record is gone and the new member was persisted
    let persisted = store.state();
    assert!(persisted.copies.is_empty());
    assert_eq!(persisted.groups[0].members[2], spare());

    let status = handle.status().await.unwrap();
    assert!(status.alarms.is_empty());
    assert!(!status.peer_connected);
    assert!(status.events_logged > 0);

    // Nothing left to abort
    assert_matches!(
        handle.abort_copy(position(2)).await,
        Err(NodeApiError::AbortCopy(AbortCopyError::NoCopyInProgress(_)))
    );
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn passive_node_follows_copy() {
    let log = test_setup_log("passive_node_follows_copy");
    let (active_link, passive_link) = PeerLink::pair();
    let active = spawn_node(
        config(0, 1, NodeRole::Active),
        Box::new(MemoryCheckpointStore::default()),
        Arc::new(CountingIo::default()),
        Some(active_link),
        &log,
    )
    .await;
    let passive = spawn_node(
        config(1, 0, NodeRole::Passive),
        Box::new(MemoryCheckpointStore::default()),
        Arc::new(CountingIo::default()),
        Some(passive_link),
        &log,
    )
    .await;

    active.start_copy(user_copy(0)).await.unwrap();
    wait_for_position(&active, position(0), copy_finished_onto_spare).await;

    let mut replicated = false;
    for _ in 0..MAX_POLLS {
        let group = passive.group_status(GROUP).await.unwrap().expect("group");
        if group.members[0] == spare() {
            replicated = true;
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    assert!(replicated, "passive node never saw the new member");

    let status = passive.status().await.unwrap();
    assert_eq!(status.role, NodeRole::Passive);
    assert!(status.peer_connected);

    // Only the active node accepts requests
    assert_matches!(
        passive.start_copy(user_copy(1)).await,
        Err(NodeApiError::StartCopy(StartCopyError::NotActive))
    );
}

#[tokio::test(start_paused = true)]
async fn promoted_node_finishes_copy() {
    let log = test_setup_log("promoted_node_finishes_copy");
    let (active_link, passive_link) = PeerLink::pair();
    let active = spawn_node(
        config(0, 1, NodeRole::Active),
        Box::new(MemoryCheckpointStore::default()),
        Arc::new(CountingIo::default()),
        Some(active_link),
        &log,
    )
    .await;
    let passive_io = Arc::new(CountingIo::default());
    let passive = spawn_node(
        config(1, 0, NodeRole::Passive),
        Box::new(MemoryCheckpointStore::default()),
        passive_io.clone(),
        Some(passive_link),
        &log,
    )
    .await;

    let paused = CopyState::UserRebuildStart;
    assert!(active.set_hooks(position(3), pause_at(&[paused])).await.unwrap());
    active.start_copy(user_copy(3)).await.unwrap();
    wait_for_position(&active, position(3), paused_at(paused)).await;

    // Losing the active node closes the link
    active.shutdown().await.unwrap();
    let mut disconnected = false;
    for _ in 0..MAX_POLLS {
        if !passive.status().await.unwrap().peer_connected {
            disconnected = true;
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    assert!(disconnected, "passive node never noticed the active one left");

    passive.promote().await.unwrap();
    assert_eq!(passive.status().await.unwrap().role, NodeRole::Active);
    wait_for_position(&passive, position(3), copy_finished_onto_spare).await;
    assert!(passive_io.copies.load(Ordering::SeqCst) > 0);
}

#[tokio::test(start_paused = true)]
async fn copy_resumes_from_ledger_after_restart() {
    let log = test_setup_log("copy_resumes_from_ledger_after_restart");
    let dir = Utf8TempDir::new().unwrap();
    let paths = vec![dir.path().join("ledger.json")];

    let handle = spawn_node(
        config(0, 1, NodeRole::Active),
        Box::new(LedgerCheckpointStore::new(&log, paths.clone())),
        Arc::new(CountingIo::default()),
        None,
        &log,
    )
    .await;
    let paused = CopyState::DesiredPercentageRebuilt;
    let hooks = CopyHooks {
        desired_percentage: Some(50),
        pause_at: [paused].into_iter().collect(),
    };
    assert!(handle.set_hooks(position(1), hooks).await.unwrap());
    handle.start_copy(user_copy(1)).await.unwrap();
    let status =
        wait_for_position(&handle, position(1), paused_at(paused)).await;
    let checkpoint = status.copy.expect("copy").checkpoint;
    assert!(checkpoint >= CHUNKS / 2 * DEFAULT_CHUNK_SIZE);
    handle.shutdown().await.unwrap();

    // Hooks are not persisted, so the restarted node runs straight through
    let io = Arc::new(CountingIo::default());
    let handle = spawn_node(
        config(0, 1, NodeRole::Active),
        Box::new(LedgerCheckpointStore::new(&log, paths)),
        io.clone(),
        None,
        &log,
    )
    .await;
    let resumed = handle.position_status(position(1)).await.unwrap().unwrap();
    assert!(resumed.copy.is_some_and(|c| c.checkpoint >= checkpoint));
    wait_for_position(&handle, position(1), copy_finished_onto_spare).await;

    // Only the rest of the position was copied again
    let remaining =
        (CHUNKS * DEFAULT_CHUNK_SIZE - checkpoint) / DEFAULT_CHUNK_SIZE;
    assert!(io.copies.load(Ordering::SeqCst) <= remaining as usize + 1);
}
