//! Persistence trait for relay state.

use std::collections::BTreeMap;

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    tgrelay_common::{ChatId, MessageId, PairKey},
};

use crate::{
    Result,
    state::{IdMap, RelayState},
};

/// Persistence backend for one worker's relay state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load everything; missing pieces start empty.
    async fn load(&self) -> Result<RelayState>;
    async fn save_cursors(&self, cursors: &BTreeMap<ChatId, MessageId>) -> Result<()>;
    async fn save_backfill(&self, backfill: &BTreeMap<PairKey, DateTime<Utc>>) -> Result<()>;
    async fn save_id_map(&self, id_map: &IdMap) -> Result<()>;

    /// Persist every part of `state`.
    async fn save_all(&self, state: &RelayState) -> Result<()> {
        self.save_cursors(&state.cursors).await?;
        self.save_backfill(&state.backfill).await?;
        self.save_id_map(&state.id_map).await
    }
}
