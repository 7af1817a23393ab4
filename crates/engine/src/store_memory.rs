//! In-memory state store for tests.

use std::{
    collections::BTreeMap,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    tgrelay_common::{ChatId, MessageId, PairKey},
};

use crate::{
    Result,
    state::{IdMap, RelayState},
    store::StateStore,
};

/// In-memory store. No persistence; shared between engine instances in
/// tests to simulate a restart with intact state.
#[derive(Default)]
pub struct MemoryStateStore {
    state: Mutex<RelayState>,
    saves: AtomicUsize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: RelayState) -> Self {
        Self {
            state: Mutex::new(state),
            saves: AtomicUsize::new(0),
        }
    }

    /// Last persisted state.
    pub fn snapshot(&self) -> RelayState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of save calls so far.
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn update(&self, f: impl FnOnce(&mut RelayState)) {
        f(&mut self.state.lock().unwrap_or_else(|e| e.into_inner()));
        self.saves.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<RelayState> {
        Ok(self.snapshot())
    }

    async fn save_cursors(&self, cursors: &BTreeMap<ChatId, MessageId>) -> Result<()> {
        self.update(|s| s.cursors = cursors.clone());
        Ok(())
    }

    async fn save_backfill(&self, backfill: &BTreeMap<PairKey, DateTime<Utc>>) -> Result<()> {
        self.update(|s| s.backfill = backfill.clone());
        Ok(())
    }

    async fn save_id_map(&self, id_map: &IdMap) -> Result<()> {
        self.update(|s| s.id_map = id_map.clone());
        Ok(())
    }
}
