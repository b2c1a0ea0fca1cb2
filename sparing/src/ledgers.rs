// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Durable storage for copy records and group snapshots
//!
//! Everything a node needs to resume after a restart is kept in a single
//! [`CheckpointLedger`], written as JSON to every configured path. The copy
//! with the highest generation wins on load.

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use slog::{Logger, info, o, warn};
use slog_error_chain::{InlineErrorChain, SlogInlineError};
use sparing_protocol::{CopyRecord, GroupSnapshot, PersistedState, PositionId};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error, SlogInlineError)]
pub enum LedgerError {
    #[error("no ledger paths are configured")]
    NoPaths,
    #[error("failed to serialize ledger")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write ledger to \"{path}\"")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointLedger {
    pub generation: u64,
    pub state: PersistedState,
}

impl CheckpointLedger {
    pub fn is_newer_than(&self, other: &Self) -> bool {
        self.generation > other.generation
    }

    pub fn generation_bump(&mut self) {
        self.generation += 1;
    }

    /// Return the newest ledger that can be read from any of `paths`
    pub async fn load(
        log: &Logger,
        paths: &[Utf8PathBuf],
    ) -> Option<CheckpointLedger> {
        let mut newest: Option<CheckpointLedger> = None;
        for path in paths {
            let contents = match tokio::fs::read(path).await {
                Ok(contents) => contents,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    continue;
                }
                Err(err) => {
                    warn!(
                        log,
                        "Failed to read ledger";
                        "path" => %path,
                        "err" => InlineErrorChain::new(&err),
                    );
                    continue;
                }
            };
            let ledger: CheckpointLedger = match serde_json::from_slice(&contents)
            {
                Ok(ledger) => ledger,
                Err(err) => {
                    warn!(
                        log,
                        "Failed to parse ledger";
                        "path" => %path,
                        "err" => InlineErrorChain::new(&err),
                    );
                    continue;
                }
            };
            if newest.as_ref().map_or(true, |n| ledger.is_newer_than(n)) {
                newest = Some(ledger);
            }
        }
        if let Some(ledger) = &newest {
            info!(
                log,
                "Loaded checkpoint ledger with generation {}", ledger.generation;
                "copies" => ledger.state.copies.len(),
                "groups" => ledger.state.groups.len(),
            );
        }
        newest
    }

    /// Bump the generation and write the ledger to every path
    ///
    /// Succeeds if at least one path was written.
    pub async fn commit(
        &mut self,
        log: &Logger,
        paths: &[Utf8PathBuf],
    ) -> Result<(), LedgerError> {
        self.generation_bump();
        let contents = serde_json::to_vec_pretty(self)?;
        let mut first_err = None;
        let mut written = 0;
        for path in paths {
            match write_atomic(path, &contents).await {
                Ok(()) => written += 1,
                Err(err) => {
                    warn!(
                        log,
                        "Failed to write ledger";
                        "path" => %path,
                        "err" => InlineErrorChain::new(&err),
                    );
                    first_err
                        .get_or_insert(LedgerError::Io { path: path.clone(), err });
                }
            }
        }
        if written > 0 {
            return Ok(());
        }
        Err(first_err.unwrap_or(LedgerError::NoPaths))
    }
}

// Replace `path` without ever leaving a partially written file behind
async fn write_atomic(path: &Utf8Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}

fn put_copy(state: &mut PersistedState, record: CopyRecord) {
    state.copies.retain(|r| r.position != record.position);
    state.copies.push(record);
}

fn clear_copy(state: &mut PersistedState, position: PositionId) {
    state.copies.retain(|r| r.position != position);
}

fn put_group(state: &mut PersistedState, snapshot: GroupSnapshot) {
    state.groups.retain(|g| g.group != snapshot.group);
    state.groups.push(snapshot);
}

/// Get and put checkpoints by position
#[async_trait]
pub trait CheckpointStore: Send + 'static {
    async fn load(&mut self) -> Result<PersistedState, LedgerError>;
    async fn put_copy(&mut self, record: CopyRecord) -> Result<(), LedgerError>;
    async fn clear_copy(&mut self, position: PositionId)
        -> Result<(), LedgerError>;
    async fn put_group(
        &mut self,
        snapshot: GroupSnapshot,
    ) -> Result<(), LedgerError>;
}

/// A [`CheckpointStore`] that commits a [`CheckpointLedger`] on every change
pub struct LedgerCheckpointStore {
    log: Logger,
    paths: Vec<Utf8PathBuf>,
    ledger: CheckpointLedger,
}

impl LedgerCheckpointStore {
    pub fn new(log: &Logger, paths: Vec<Utf8PathBuf>) -> LedgerCheckpointStore {
        LedgerCheckpointStore {
            log: log.new(o!("component" => "LedgerCheckpointStore")),
            paths,
            ledger: CheckpointLedger::default(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.ledger.generation
    }
}

#[async_trait]
impl CheckpointStore for LedgerCheckpointStore {
    async fn load(&mut self) -> Result<PersistedState, LedgerError> {
        if self.paths.is_empty() {
            return Err(LedgerError::NoPaths);
        }
        if let Some(ledger) = CheckpointLedger::load(&self.log, &self.paths).await
        {
            self.ledger = ledger;
        }
        Ok(self.ledger.state.clone())
    }

    async fn put_copy(&mut self, record: CopyRecord) -> Result<(), LedgerError> {
        put_copy(&mut self.ledger.state, record);
        self.ledger.commit(&self.log, &self.paths).await
    }

    async fn clear_copy(
        &mut self,
        position: PositionId,
    ) -> Result<(), LedgerError> {
        clear_copy(&mut self.ledger.state, position);
        self.ledger.commit(&self.log, &self.paths).await
    }

    async fn put_group(
        &mut self,
        snapshot: GroupSnapshot,
    ) -> Result<(), LedgerError> {
        put_group(&mut self.ledger.state, snapshot);
        self.ledger.commit(&self.log, &self.paths).await
    }
}

/// A [`CheckpointStore`] kept in memory
///
/// Clones share the same state, so a test can keep one to inspect what a
/// running node persisted.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    state: Arc<Mutex<PersistedState>>,
}

impl MemoryCheckpointStore {
    pub fn new(state: PersistedState) -> MemoryCheckpointStore {
        MemoryCheckpointStore { state: Arc::new(Mutex::new(state)) }
    }

    pub fn state(&self) -> PersistedState {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PersistedState> {
        // The state is always consistent, even if a holder panicked
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&mut self) -> Result<PersistedState, LedgerError> {
        Ok(self.state())
    }

    async fn put_copy(&mut self, record: CopyRecord) -> Result<(), LedgerError> {
        put_copy(&mut self.lock(), record);
        Ok(())
    }

    async fn clear_copy(
        &mut self,
        position: PositionId,
    ) -> Result<(), LedgerError> {
        clear_copy(&mut self.lock(), position);
        Ok(())
    }

    async fn put_group(
        &mut self,
        snapshot: GroupSnapshot,
    ) -> Result<(), LedgerError> {
        put_group(&mut self.lock(), snapshot);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use camino_tempfile::Utf8TempDir;
    use sparing_protocol::{
        CopyKind, CopyState, DriveLocation, Mode, PositionIndex, RaidGroupId,
        Requester,
    };
    use sparing_test_utils::test_setup_log;
    use std::collections::BTreeSet;

    fn record(generation: u64, checkpoint: u64) -> CopyRecord {
        CopyRecord {
            generation,
            position: PositionId::new(RaidGroupId(3), PositionIndex(1)),
            kind: CopyKind::Proactive,
            requester: Requester::System,
            source: DriveLocation::new(0, 0, 1),
            destination: Some(DriveLocation::new(0, 1, 0)),
            state: CopyState::UserRebuildStart,
            mode: Mode::Mirror,
            checkpoint,
            metadata_checkpoint: 2048,
            repair: BTreeSet::from([0]),
        }
    }

    #[tokio::test]
    async fn ledger_survives_reload() {
        let log = test_setup_log("ledger_survives_reload");
        let dir = Utf8TempDir::new().unwrap();
        let paths =
            vec![dir.path().join("a/ledger.json"), dir.path().join("b/ledger.json")];

        let mut store = LedgerCheckpointStore::new(&log, paths.clone());
        assert_eq!(store.load().await.unwrap(), PersistedState::default());
        store.put_copy(record(1, 4096)).await.unwrap();
        store.put_copy(record(2, 8192)).await.unwrap();
        assert_eq!(store.generation(), 2);

        let mut reloaded = LedgerCheckpointStore::new(&log, paths);
        let state = reloaded.load().await.unwrap();
        assert_eq!(state.copies, vec![record(2, 8192)]);
        assert_eq!(reloaded.generation(), 2);

        reloaded.clear_copy(record(2, 0).position).await.unwrap();
        assert!(reloaded.load().await.unwrap().copies.is_empty());
    }

    #[tokio::test]
    async fn newest_copy_wins() {
        let log = test_setup_log("newest_copy_wins");
        let dir = Utf8TempDir::new().unwrap();
        let old = dir.path().join("old.json");
        let new = dir.path().join("new.json");

        let mut ledger = CheckpointLedger::default();
        put_copy(&mut ledger.state, record(1, 2048));
        ledger.commit(&log, &[old.clone(), new.clone()]).await.unwrap();
        put_copy(&mut ledger.state, record(2, 6144));
        ledger.commit(&log, &[new.clone()]).await.unwrap();

        // A corrupt copy is skipped
        let corrupt = dir.path().join("corrupt.json");
        tokio::fs::write(&corrupt, b"{ not json").await.unwrap();

        let loaded =
            CheckpointLedger::load(&log, &[old, corrupt, new]).await.unwrap();
        assert_eq!(loaded.generation, 2);
        assert_eq!(loaded.state.copies, vec![record(2, 6144)]);
    }

    #[tokio::test]
    async fn store_without_paths_fails() {
        let log = test_setup_log("store_without_paths_fails");
        let mut store = LedgerCheckpointStore::new(&log, vec![]);
        assert_matches!(store.load().await, Err(LedgerError::NoPaths));
    }
}
