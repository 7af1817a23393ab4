//! One-time history replay for newly added channel pairs.

use {
    tgrelay_common::PairKey,
    tgrelay_config::ChannelPair,
    tgrelay_platform::HistoryQuery,
    tracing::{info, warn},
};

use crate::{
    Result,
    engine::{MessageOutcome, RelayEngine},
    state::GroupMemory,
    store::StateStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillOutcome {
    /// Already tracked, or the pair asks for no history.
    AlreadyDone,
    /// Chats or cursor not available yet; retried on the next reload.
    NotReady,
    /// Delivery was deferred or interrupted; nothing was marked.
    Incomplete,
    /// History replayed and the pair marked.
    Completed { relayed: usize },
}

impl RelayEngine {
    /// Replay up to `backfill_count` messages preceding the cursor of the
    /// pair's source into its target. Runs at most once per pair until the
    /// mark is reset.
    pub async fn backfill_pair(&mut self, pair: &ChannelPair) -> Result<BackfillOutcome> {
        let key = pair.key();
        if pair.backfill_count == 0 || self.state.is_backfilled(&key) {
            return Ok(BackfillOutcome::AlreadyDone);
        }

        for chat in [pair.source, pair.target] {
            if let Err(e) = self.client.get_chat(chat).await {
                warn!(pair = %key, chat, error = %e, "backfill postponed, chat not reachable");
                return Ok(BackfillOutcome::NotReady);
            }
        }
        let upto = match self.state.cursor(pair.source) {
            Some(cursor) => cursor,
            None if self.init_cursor(pair.source).await => {
                self.store.save_cursors(&self.state.cursors).await?;
                self.state.cursor(pair.source).unwrap_or_default()
            },
            None => {
                warn!(pair = %key, "backfill postponed, source cursor not initialized");
                return Ok(BackfillOutcome::NotReady);
            },
        };

        let query = HistoryQuery::latest_upto(upto, pair.backfill_count as usize);
        let mut history = match self.client.fetch_messages(pair.source, query).await {
            Ok(history) => history,
            Err(e) => {
                warn!(pair = %key, error = %e, "backfill history fetch failed");
                return Ok(BackfillOutcome::NotReady);
            },
        };
        history.sort_by_key(|m| m.id);
        info!(pair = %key, count = history.len(), "backfilling history");

        let mut groups = GroupMemory::new(history.len().max(1));
        let mut relayed = 0;
        for message in &history {
            if self.cancel.is_cancelled() {
                self.store.save_id_map(&self.state.id_map).await?;
                return Ok(BackfillOutcome::Incomplete);
            }
            if let Some(group_id) = message.group_id
                && groups.contains(group_id)
            {
                continue;
            }
            match self.relay_message(pair.source, message, &[pair.target]).await {
                MessageOutcome::Deferred => {
                    warn!(pair = %key, message_id = message.id, "backfill interrupted by delivery failure");
                    self.store.save_id_map(&self.state.id_map).await?;
                    return Ok(BackfillOutcome::Incomplete);
                },
                MessageOutcome::Delivered => relayed += 1,
                _ => {},
            }
            if let Some(group_id) = message.group_id {
                groups.remember(group_id);
            }
        }

        self.state.mark_backfilled(key);
        self.store.save_backfill(&self.state.backfill).await?;
        self.store.save_id_map(&self.state.id_map).await?;
        info!(pair = %key, relayed, "backfill complete");
        Ok(BackfillOutcome::Completed { relayed })
    }

    /// Backfill every enabled pair that has not been backfilled yet.
    pub(crate) async fn run_backfills(&mut self) {
        let pairs: Vec<ChannelPair> = self.descriptor.enabled_pairs().cloned().collect();
        for pair in pairs {
            if self.cancel.is_cancelled() {
                break;
            }
            if let Err(e) = self.backfill_pair(&pair).await {
                warn!(pair = %pair.key(), error = %e, "backfill failed");
            }
        }
    }
}

/// Clear the backfill mark of `key` in persisted state so the next start
/// replays its history again. Returns whether a mark existed.
pub async fn reset_backfill(store: &dyn StateStore, key: &PairKey) -> Result<bool> {
    let mut state = store.load().await?;
    let existed = state.reset_backfill(key);
    if existed {
        store.save_backfill(&state.backfill).await?;
        info!(pair = %key, "backfill mark reset");
    }
    Ok(existed)
}
