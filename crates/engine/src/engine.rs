//! The per-worker relay engine.

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use {
    tgrelay_common::{ChatId, MessageId, PairKey},
    tgrelay_config::{ChangeWatcher, WorkerDescriptor, load_config},
    tgrelay_platform::{
        ChatClient, DeletionEvent, ErrorClass, HistoryQuery, SourceMessage,
    },
    tgrelay_transform::{RulePipeline, should_forward},
    tokio::{
        sync::mpsc,
        time::{Instant, MissedTickBehavior, interval, interval_at},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    Result,
    classify::{Classified, classify, classify_content},
    deliver::Deliverer,
    error::Error,
    retry::{Attempt, RetryPolicy},
    state::{GroupMemory, RelayState},
    store::StateStore,
};

/// Album group ids remembered across ticks.
const RECENT_GROUPS: usize = 100;

/// What happened to one source message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Sent to at least one target (or every target already had it).
    Delivered,
    /// Rejected by the keyword filter.
    Filtered,
    /// Later member of an album already relayed.
    Duplicate,
    /// Every target failed terminally.
    Failed,
    /// Retries exhausted; the cursor stays before this message.
    Deferred,
    /// Deferred too many times and given up on.
    Skipped,
}

/// Counters for one poll tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fetched: usize,
    pub delivered: usize,
    pub filtered: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub deferred: usize,
    pub skipped: usize,
}

impl TickReport {
    fn count(&mut self, outcome: MessageOutcome) {
        let slot = match outcome {
            MessageOutcome::Delivered => &mut self.delivered,
            MessageOutcome::Filtered => &mut self.filtered,
            MessageOutcome::Duplicate => &mut self.duplicates,
            MessageOutcome::Failed => &mut self.failed,
            MessageOutcome::Deferred => &mut self.deferred,
            MessageOutcome::Skipped => &mut self.skipped,
        };
        *slot += 1;
    }
}

/// Config file (and reload marker) the engine re-reads its descriptor from.
struct ReloadSource {
    config_path: PathBuf,
    watcher: ChangeWatcher,
}

pub struct RelayEngine {
    pub(crate) descriptor: WorkerDescriptor,
    pub(crate) client: Arc<dyn ChatClient>,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) state: RelayState,
    pub(crate) pipeline: RulePipeline,
    pub(crate) policy: RetryPolicy,
    pub(crate) scratch_dir: PathBuf,
    /// Access check result per pair; absent means not checked yet.
    access: HashMap<PairKey, bool>,
    recent_groups: GroupMemory,
    deferrals: HashMap<(ChatId, MessageId), u32>,
    reload: Option<ReloadSource>,
    pub(crate) cancel: CancellationToken,
}

impl RelayEngine {
    pub fn new(
        descriptor: WorkerDescriptor,
        client: Arc<dyn ChatClient>,
        store: Arc<dyn StateStore>,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pipeline: RulePipeline::new(&descriptor.replacement_rules),
            policy: RetryPolicy::from_settings(&descriptor.settings),
            descriptor,
            client,
            store,
            state: RelayState::default(),
            scratch_dir: scratch_dir.into(),
            access: HashMap::new(),
            recent_groups: GroupMemory::new(RECENT_GROUPS),
            deferrals: HashMap::new(),
            reload: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Re-read the descriptor from `config_path` periodically and whenever
    /// the config file or `marker` changes.
    #[must_use]
    pub fn with_reload(mut self, config_path: PathBuf, marker: PathBuf) -> Self {
        let watcher = ChangeWatcher::new([&config_path, &marker]);
        self.reload = Some(ReloadSource {
            config_path,
            watcher,
        });
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn state(&self) -> &RelayState {
        &self.state
    }

    #[must_use]
    pub fn descriptor(&self) -> &WorkerDescriptor {
        &self.descriptor
    }

    fn worker_id(&self) -> &str {
        &self.descriptor.worker_id
    }

    /// Load state, check pair access, initialize cursors, run pending
    /// backfills.
    pub async fn start(&mut self) -> Result<()> {
        self.state = self.store.load().await?;
        info!(
            worker_id = %self.worker_id(),
            pairs = self.descriptor.channel_pairs.len(),
            cursors = self.state.cursors.len(),
            id_map = self.state.id_map.len(),
            "relay engine starting"
        );
        self.check_access().await;
        self.init_missing_cursors().await?;
        self.run_backfills().await;
        Ok(())
    }

    /// Resolve source and target of every unchecked enabled pair.
    /// Terminal failures disable the pair for this run; transient ones are
    /// retried later.
    pub(crate) async fn check_access(&mut self) {
        let unchecked: Vec<PairKey> = self
            .descriptor
            .enabled_pairs()
            .map(|p| p.key())
            .filter(|k| !self.access.contains_key(k))
            .collect();

        for key in unchecked {
            let mut verdict = Some(true);
            for chat in [key.source, key.target] {
                if let Err(e) = self.client.get_chat(chat).await {
                    if e.class() == ErrorClass::Terminal {
                        warn!(
                            worker_id = %self.worker_id(),
                            pair = %key,
                            chat,
                            error = %e,
                            "pair inaccessible, skipping it for this run"
                        );
                        verdict = Some(false);
                    } else {
                        warn!(pair = %key, chat, error = %e, "access check failed, will retry");
                        verdict = None;
                    }
                    break;
                }
            }
            if let Some(ok) = verdict {
                self.access.insert(key, ok);
            }
        }
    }

    /// Enabled, accessible targets grouped by source.
    pub(crate) fn targets_by_source(&self) -> BTreeMap<ChatId, Vec<ChatId>> {
        let mut map: BTreeMap<ChatId, Vec<ChatId>> = BTreeMap::new();
        for pair in self.descriptor.enabled_pairs() {
            if self.access.get(&pair.key()) == Some(&true) {
                let targets = map.entry(pair.source).or_default();
                if !targets.contains(&pair.target) {
                    targets.push(pair.target);
                }
            }
        }
        map
    }

    /// Start a source without a cursor at its newest message. On failure the
    /// source stays uninitialized and is retried on the next tick.
    pub(crate) async fn init_cursor(&mut self, source: ChatId) -> bool {
        match self
            .client
            .fetch_messages(source, HistoryQuery::newest())
            .await
        {
            Ok(latest) => {
                let id = latest.first().map_or(0, |m| m.id);
                self.state.advance_cursor(source, id);
                info!(worker_id = %self.worker_id(), source, cursor = id, "initialized source cursor");
                true
            },
            Err(e) => {
                warn!(worker_id = %self.worker_id(), source, error = %e, "cursor initialization failed");
                false
            },
        }
    }

    pub(crate) async fn init_missing_cursors(&mut self) -> Result<()> {
        let mut changed = false;
        for source in self.targets_by_source().into_keys() {
            if self.state.cursor(source).is_none() {
                changed |= self.init_cursor(source).await;
            }
        }
        if changed {
            self.store.save_cursors(&self.state.cursors).await?;
        }
        Ok(())
    }

    /// One poll pass over every source.
    pub async fn tick(&mut self) -> Result<TickReport> {
        let mut report = TickReport::default();
        self.check_access().await;

        for (source, targets) in self.targets_by_source() {
            if self.cancel.is_cancelled() {
                break;
            }
            let Some(cursor) = self.state.cursor(source) else {
                if self.init_cursor(source).await {
                    self.store.save_cursors(&self.state.cursors).await?;
                }
                continue;
            };

            let query = HistoryQuery::after(cursor, self.descriptor.settings.poll_batch_size);
            let mut batch = match self.client.fetch_messages(source, query).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(worker_id = %self.worker_id(), source, error = %e, "fetch failed");
                    continue;
                },
            };
            batch.retain(|m| m.id > cursor);
            batch.sort_by_key(|m| m.id);
            if batch.is_empty() {
                continue;
            }
            report.fetched += batch.len();
            debug!(worker_id = %self.worker_id(), source, count = batch.len(), "processing batch");

            for message in &batch {
                if self.cancel.is_cancelled() {
                    break;
                }
                let outcome = self.process_live(source, message, &targets).await;
                report.count(outcome);
                if outcome == MessageOutcome::Deferred {
                    break;
                }
                self.state.advance_cursor(source, message.id);
            }
            self.flush_source().await?;
        }
        Ok(report)
    }

    /// Persist cursors and the (evicted) id-map.
    async fn flush_source(&mut self) -> Result<()> {
        let settings = &self.descriptor.settings;
        let evicted = self
            .state
            .id_map
            .evict(settings.id_map_max_entries, settings.id_map_retain_entries);
        if evicted > 0 {
            debug!(worker_id = %self.worker_id(), evicted, "evicted old id-map entries");
        }
        self.store.save_cursors(&self.state.cursors).await?;
        self.store.save_id_map(&self.state.id_map).await
    }

    async fn process_live(
        &mut self,
        source: ChatId,
        message: &SourceMessage,
        targets: &[ChatId],
    ) -> MessageOutcome {
        if let Some(group_id) = message.group_id
            && self.recent_groups.contains(group_id)
        {
            return MessageOutcome::Duplicate;
        }

        let outcome = self.relay_message(source, message, targets).await;
        let outcome = self.apply_deferral(source, message.id, outcome);
        if outcome != MessageOutcome::Deferred
            && let Some(group_id) = message.group_id
        {
            self.recent_groups.remember(group_id);
        }
        outcome
    }

    /// Count consecutive deferrals; give up after `max_deferrals`.
    fn apply_deferral(
        &mut self,
        source: ChatId,
        message_id: MessageId,
        outcome: MessageOutcome,
    ) -> MessageOutcome {
        let key = (source, message_id);
        if outcome != MessageOutcome::Deferred {
            self.deferrals.remove(&key);
            return outcome;
        }
        let count = {
            let count = self.deferrals.entry(key).or_insert(0);
            *count += 1;
            *count
        };
        if count >= self.descriptor.settings.max_deferrals {
            self.deferrals.remove(&key);
            warn!(
                worker_id = %self.worker_id(),
                source,
                message_id,
                "message deferred too many times, skipping"
            );
            return MessageOutcome::Skipped;
        }
        info!(worker_id = %self.worker_id(), source, message_id, deferrals = count, "message deferred to next tick");
        MessageOutcome::Deferred
    }

    /// Classify, filter, transform and deliver `message` to every target
    /// that does not have it yet.
    pub(crate) async fn relay_message(
        &mut self,
        source: ChatId,
        message: &SourceMessage,
        targets: &[ChatId],
    ) -> MessageOutcome {
        let class = classify(message);
        if class == Classified::Empty {
            debug!(worker_id = %self.worker_id(), source, message_id = message.id, "nothing to relay");
            return MessageOutcome::Filtered;
        }
        let deliverer = Deliverer {
            client: self.client.as_ref(),
            policy: self.policy,
            pipeline: &self.pipeline,
            settings: &self.descriptor.settings,
            scratch_dir: &self.scratch_dir,
        };
        let worker_id = self.descriptor.worker_id.as_str();

        let members = match &class {
            Classified::Album(group_id) => {
                match deliverer.fetch_album(source, message, *group_id).await {
                    Ok(members) => members,
                    Err(e) => {
                        warn!(worker_id, source, message_id = message.id, error = %e, "album fetch failed");
                        return MessageOutcome::Deferred;
                    },
                }
            },
            _ => Vec::new(),
        };

        let filter_text = match &class {
            Classified::Album(_) => {
                Deliverer::album_caption(&members).and_then(SourceMessage::text)
            },
            _ => message.text(),
        };
        if !should_forward(filter_text, &self.descriptor.filters) {
            debug!(worker_id, source, message_id = message.id, "filtered out");
            return MessageOutcome::Filtered;
        }

        let pending: Vec<ChatId> = targets
            .iter()
            .copied()
            .filter(|t| !self.state.id_map.contains(source, message.id, *t))
            .collect();
        if pending.is_empty() {
            return MessageOutcome::Delivered;
        }

        let mut payload = match &class {
            Classified::Forwarded(_) => None,
            _ => Some(deliverer.prepare(source, message, &class, &members).await),
        };

        let (mut delivered, mut exhausted) = (0usize, 0usize);
        for target in pending {
            let reply_to = message
                .reply_to
                .and_then(|r| self.state.id_map.lookup(source, r, target));

            let mut native = None;
            if let Classified::Forwarded(origin) = &class {
                native = deliverer.forward(source, message, *origin, target).await;
                if native.is_none() && payload.is_none() {
                    let content = classify_content(message);
                    let copy_members = match &content {
                        Classified::Album(group_id) => deliverer
                            .fetch_album(source, message, *group_id)
                            .await
                            .unwrap_or_else(|_| vec![message.clone()]),
                        _ => Vec::new(),
                    };
                    payload = Some(
                        deliverer
                            .prepare(source, message, &content, &copy_members)
                            .await,
                    );
                }
            }

            let (attempt, mapping) = match (native, &payload) {
                (Some(attempt), _) => {
                    let mapping = match &attempt {
                        Attempt::Done(ids) => ids.first().map(|id| vec![(message.id, *id)]),
                        _ => None,
                    };
                    (attempt, mapping.unwrap_or_default())
                },
                (None, Some(payload)) => {
                    let attempt = deliverer.send(payload, target, reply_to).await;
                    let mapping = match &attempt {
                        Attempt::Done(ids) => payload.map_ids(message.id, ids),
                        _ => Vec::new(),
                    };
                    (attempt, mapping)
                },
                (None, None) => (Attempt::Done(Vec::new()), Vec::new()),
            };

            match attempt {
                Attempt::Done(_) => {
                    delivered += 1;
                    for (source_msg, target_msg) in mapping {
                        self.state
                            .id_map
                            .record(source, source_msg, target, target_msg);
                    }
                    info!(worker_id, source, target, message_id = message.id, "relayed message");
                },
                Attempt::Terminal(e) => {
                    warn!(worker_id, source, target, message_id = message.id, error = %e, "delivery failed permanently, skipping");
                },
                Attempt::Exhausted(e) => {
                    exhausted += 1;
                    warn!(worker_id, source, target, message_id = message.id, error = %e, "delivery retries exhausted");
                },
            }
        }

        if let Some(payload) = &payload {
            payload.cleanup().await;
        }

        if exhausted > 0 {
            MessageOutcome::Deferred
        } else if delivered > 0 {
            MessageOutcome::Delivered
        } else {
            MessageOutcome::Failed
        }
    }

    /// Delete the mapped copies of deleted source messages. Returns how many
    /// target messages were deleted.
    pub async fn handle_deletion(&mut self, event: DeletionEvent) -> Result<usize> {
        let mut by_target: BTreeMap<ChatId, Vec<MessageId>> = BTreeMap::new();
        for id in &event.message_ids {
            for entry in self.state.id_map.take(event.chat_id, *id) {
                by_target
                    .entry(entry.target)
                    .or_default()
                    .push(entry.target_msg);
            }
        }
        if by_target.is_empty() {
            return Ok(0);
        }

        let mut deleted = 0;
        for (target, ids) in by_target {
            match self.client.delete_messages(target, &ids).await {
                Ok(()) => {
                    deleted += ids.len();
                    info!(worker_id = %self.worker_id(), target, count = ids.len(), "synced deletion");
                },
                Err(e) => {
                    warn!(worker_id = %self.worker_id(), target, error = %e, "failed to delete mirrored messages");
                },
            }
        }
        self.store.save_id_map(&self.state.id_map).await?;
        Ok(deleted)
    }

    /// Re-read this worker's descriptor and retry postponed backfills.
    /// Returns whether the descriptor changed.
    pub async fn reload(&mut self) -> Result<bool> {
        let Some(source) = &self.reload else {
            return Ok(false);
        };
        let config = load_config(&source.config_path)
            .map_err(|e| Error::message(format!("config reload failed: {e:#}")))?;
        let Some(next) = config.materialize(self.worker_id()) else {
            warn!(worker_id = %self.worker_id(), "worker no longer configured, keeping current settings");
            return Ok(false);
        };
        if next.fingerprint() == self.descriptor.fingerprint() {
            self.run_backfills().await;
            return Ok(false);
        }
        self.apply_descriptor(next);
        self.check_access().await;
        self.init_missing_cursors().await?;
        self.run_backfills().await;
        Ok(true)
    }

    /// Swap in a new descriptor. Pairs that disappeared lose their access
    /// verdict so re-adding them triggers a fresh check.
    pub(crate) fn apply_descriptor(&mut self, next: WorkerDescriptor) {
        let keys: Vec<PairKey> = next.channel_pairs.iter().map(|p| p.key()).collect();
        self.access.retain(|k, _| keys.contains(k));
        self.pipeline = RulePipeline::new(&next.replacement_rules);
        self.policy = RetryPolicy::from_settings(&next.settings);
        info!(
            worker_id = %next.worker_id,
            pairs = next.channel_pairs.len(),
            rules = self.pipeline.len(),
            "applied reloaded configuration"
        );
        self.descriptor = next;
    }

    fn reload_requested(&mut self) -> bool {
        self.reload
            .as_mut()
            .is_some_and(|r| r.watcher.poll_changed())
    }

    /// Start, then poll, reload and sync deletions until cancelled.
    pub async fn run(mut self) -> Result<()> {
        self.start().await?;

        let mut deletions = Some(self.client.subscribe_deletions());
        let mut poll = self.poll_interval();
        let mut reload_timer = self.reload_interval();
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = poll.tick() => {
                    match self.tick().await {
                        Ok(report) if report.fetched > 0 => {
                            debug!(worker_id = %self.worker_id(), ?report, "tick complete");
                        },
                        Ok(_) => {},
                        Err(e) => warn!(worker_id = %self.worker_id(), error = %e, "tick failed"),
                    }
                    if self.reload_requested() && self.reload_logged().await {
                        poll = self.poll_interval();
                        reload_timer = self.reload_interval();
                    }
                },
                _ = reload_timer.tick() => {
                    if self.reload_logged().await {
                        poll = self.poll_interval();
                        reload_timer = self.reload_interval();
                    }
                },
                event = next_deletion(&mut deletions) => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_deletion(event).await {
                            warn!(worker_id = %self.worker_id(), error = %e, "deletion sync failed");
                        }
                    },
                    None => {
                        warn!(worker_id = %self.worker_id(), "deletion stream closed");
                        deletions = None;
                    },
                },
            }
        }

        self.shutdown().await
    }

    async fn reload_logged(&mut self) -> bool {
        match self.reload().await {
            Ok(changed) => changed,
            Err(e) => {
                warn!(worker_id = %self.worker_id(), error = %e, "reload failed");
                false
            },
        }
    }

    fn poll_interval(&self) -> tokio::time::Interval {
        let period = Duration::from_secs(self.descriptor.settings.poll_interval_secs.max(1));
        let mut poll = interval(period);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll
    }

    fn reload_interval(&self) -> tokio::time::Interval {
        let period = Duration::from_secs(self.descriptor.settings.reload_interval_secs.max(1));
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer
    }

    /// Flush state and remove scratch storage.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.store.save_all(&self.state).await?;
        if let Err(e) = tokio::fs::remove_dir_all(&self.scratch_dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.scratch_dir.display(), error = %e, "failed to remove scratch dir");
        }
        info!(worker_id = %self.worker_id(), "relay engine stopped");
        Ok(())
    }
}

async fn next_deletion(rx: &mut Option<mpsc::Receiver<DeletionEvent>>) -> Option<DeletionEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod tests {
    use {
        super::*,
        crate::store_memory::MemoryStateStore,
        tempfile::TempDir,
        tgrelay_config::{
            ChannelPair, Credentials, FilterConfig, FilterMode, RelaySettings, ReplacementRule,
        },
        tgrelay_platform::{
            Error as PlatformError, ForwardOrigin, Media, MediaKind, MemoryClient, MessageEntity,
        },
    };

    pub(crate) const SRC: ChatId = -1001;
    pub(crate) const DST: ChatId = -1002;
    pub(crate) const DST2: ChatId = -1003;

    pub(crate) fn pair(source: ChatId, target: ChatId, backfill_count: u32) -> ChannelPair {
        ChannelPair {
            source,
            target,
            enabled: true,
            backfill_count,
        }
    }

    pub(crate) fn descriptor(pairs: Vec<ChannelPair>) -> WorkerDescriptor {
        WorkerDescriptor {
            worker_id: "alpha".into(),
            credentials: Credentials::default(),
            channel_pairs: pairs,
            replacement_rules: Vec::new(),
            filters: FilterConfig::default(),
            settings: RelaySettings {
                retry_attempts: 2,
                retry_delay_secs: 1,
                flood_wait_extra_delay_secs: 1,
                ..Default::default()
            },
        }
    }

    pub(crate) struct Harness {
        pub client: Arc<MemoryClient>,
        pub store: Arc<MemoryStateStore>,
        pub scratch: TempDir,
    }

    impl Harness {
        pub(crate) fn new() -> Self {
            let client = Arc::new(MemoryClient::new());
            for chat in [SRC, DST, DST2] {
                client.add_chat(chat);
            }
            Self {
                client,
                store: Arc::new(MemoryStateStore::new()),
                scratch: TempDir::new().unwrap(),
            }
        }

        pub(crate) fn engine(&self, descriptor: WorkerDescriptor) -> RelayEngine {
            RelayEngine::new(
                descriptor,
                self.client.clone(),
                self.store.clone(),
                self.scratch.path().join("alpha"),
            )
        }

        pub(crate) fn texts(&self, chat: ChatId) -> Vec<String> {
            self.client
                .sent_to(chat)
                .into_iter()
                .filter_map(|m| m.text)
                .collect()
        }
    }

    pub(crate) fn media_message(id: MessageId, kind: MediaKind, file_ref: &str) -> SourceMessage {
        SourceMessage {
            id,
            chat_id: SRC,
            text: None,
            entities: Vec::new(),
            group_id: None,
            reply_to: None,
            forward: None,
            media: Some(Media {
                kind,
                file_ref: file_ref.into(),
                file_name: None,
                mime_type: None,
                attributes: serde_json::Value::Null,
            }),
        }
    }

    fn text_message(text: &str) -> SourceMessage {
        SourceMessage {
            id: 0,
            chat_id: SRC,
            text: Some(text.into()),
            entities: Vec::new(),
            group_id: None,
            reply_to: None,
            forward: None,
            media: None,
        }
    }

    fn transient() -> PlatformError {
        PlatformError::api("INTERNAL", "bridge hiccup")
    }

    #[tokio::test]
    async fn new_messages_relayed_in_order() {
        let h = Harness::new();
        h.client.post(SRC, "before start");
        let mut engine = h.engine(descriptor(vec![pair(SRC, DST, 0)]));
        engine.start().await.unwrap();

        h.client.post(SRC, "first");
        let last = h.client.post(SRC, "second");
        let report = engine.tick().await.unwrap();

        assert_eq!(report.delivered, 2);
        assert_eq!(h.texts(DST), vec!["first", "second"]);
        assert_eq!(h.store.snapshot().cursor(SRC), Some(last));

        let again = engine.tick().await.unwrap();
        assert_eq!(again, TickReport::default());
    }

    #[tokio::test]
    async fn rules_rewrite_text_and_drop_formatting() {
        let h = Harness::new();
        let mut desc = descriptor(vec![pair(SRC, DST, 0)]);
        desc.replacement_rules = vec![ReplacementRule {
            find: "Elite".into(),
            replace: "Premium".into(),
            case_sensitive: true,
            is_regex: false,
        }];
        let mut engine = h.engine(desc);
        engine.start().await.unwrap();

        let bold = MessageEntity {
            kind: "bold".into(),
            offset: 0,
            length: 5,
            extra: serde_json::Map::new(),
        };
        let mut changed = text_message("Elite signal");
        changed.entities = vec![bold.clone()];
        let mut untouched = text_message("Plain signal");
        untouched.entities = vec![bold];
        h.client.push(changed);
        h.client.push(untouched);
        engine.tick().await.unwrap();

        let sent = h.client.sent_to(DST);
        assert_eq!(sent[0].text.as_deref(), Some("Premium signal"));
        assert_eq!(sent[0].entities, 0);
        assert_eq!(sent[1].text.as_deref(), Some("Plain signal"));
        assert_eq!(sent[1].entities, 1);
    }

    #[tokio::test]
    async fn filtered_messages_still_advance_cursor() {
        let h = Harness::new();
        let mut desc = descriptor(vec![pair(SRC, DST, 0)]);
        desc.filters = FilterConfig {
            enabled: true,
            mode: FilterMode::Whitelist,
            keywords: vec!["gold".into()],
        };
        let mut engine = h.engine(desc);
        engine.start().await.unwrap();

        h.client.post(SRC, "BUY GOLD now");
        let last = h.client.post(SRC, "silver is flat");
        let report = engine.tick().await.unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(report.filtered, 1);
        assert_eq!(h.texts(DST), vec!["BUY GOLD now"]);
        assert_eq!(engine.state().cursor(SRC), Some(last));
    }

    #[tokio::test]
    async fn album_is_sent_once_with_first_caption() {
        let h = Harness::new();
        let mut engine = h.engine(descriptor(vec![pair(SRC, DST, 0)]));
        engine.start().await.unwrap();

        let mut ids = Vec::new();
        for (i, caption) in [None, Some("album caption"), Some("ignored")].into_iter().enumerate() {
            let mut msg = media_message(0, MediaKind::Photo, &format!("photo-{i}"));
            msg.group_id = Some(77);
            msg.text = caption.map(str::to_string);
            ids.push(h.client.push(msg));
        }
        let report = engine.tick().await.unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(report.duplicates, 2);
        let sent = h.client.sent_to(DST);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, "album");
        assert_eq!(sent[0].media_refs, vec!["photo-0", "photo-1", "photo-2"]);
        assert_eq!(sent[0].text.as_deref(), Some("album caption"));
        assert!(sent[0].uploaded);
        for (src_id, dst_id) in ids.iter().zip(&sent[0].message_ids) {
            assert_eq!(engine.state().id_map.lookup(SRC, *src_id, DST), Some(*dst_id));
        }
    }

    #[tokio::test]
    async fn stickers_pass_through_by_reference() {
        let h = Harness::new();
        let mut engine = h.engine(descriptor(vec![pair(SRC, DST, 0)]));
        engine.start().await.unwrap();

        h.client.push(media_message(0, MediaKind::Sticker, "sticker-1"));
        engine.tick().await.unwrap();

        let sent = h.client.sent_to(DST);
        assert_eq!(sent[0].media_refs, vec!["sticker-1"]);
        assert!(!sent[0].uploaded);
        assert!(h.client.downloads().is_empty());
    }

    #[tokio::test]
    async fn failed_download_falls_back_to_reference() {
        let h = Harness::new();
        let mut engine = h.engine(descriptor(vec![pair(SRC, DST, 0)]));
        engine.start().await.unwrap();

        h.client.fail_next("download_media", transient);
        h.client.push(media_message(0, MediaKind::Document, "doc-1"));
        h.client.push(media_message(0, MediaKind::Photo, "photo-1"));
        engine.tick().await.unwrap();

        let sent = h.client.sent_to(DST);
        assert_eq!(sent.len(), 2);
        assert!(!sent[0].uploaded);
        assert!(sent[1].uploaded);
        // Scratch copies are gone once delivered.
        for file in h.client.downloads() {
            assert!(!file.exists(), "{}", file.display());
        }
    }

    #[tokio::test]
    async fn reply_points_at_mirrored_message() {
        let h = Harness::new();
        let mut engine = h.engine(descriptor(vec![pair(SRC, DST, 0)]));
        engine.start().await.unwrap();

        let parent = h.client.post(SRC, "question");
        engine.tick().await.unwrap();
        let mirrored = engine.state().id_map.lookup(SRC, parent, DST).unwrap();

        let mut reply = text_message("answer");
        reply.reply_to = Some(parent);
        h.client.push(reply);
        engine.tick().await.unwrap();

        let sent = h.client.sent_to(DST);
        assert_eq!(sent[1].reply_to, Some(mirrored));
    }

    #[tokio::test]
    async fn forwards_natively_when_allowed() {
        let h = Harness::new();
        let mut engine = h.engine(descriptor(vec![pair(SRC, DST, 0)]));
        engine.start().await.unwrap();

        let mut fwd = text_message("news");
        fwd.forward = Some(ForwardOrigin {
            chat_id: -5000,
            message_id: 3,
        });
        let id = h.client.push(fwd);
        engine.tick().await.unwrap();

        let sent = h.client.sent_to(DST);
        assert_eq!(sent[0].kind, "forward");
        assert_eq!(sent[0].forwarded_from, Some((SRC, id)));
    }

    #[tokio::test]
    async fn restricted_forward_becomes_copy() {
        let h = Harness::new();
        h.client.restrict_forwards(SRC);
        let mut engine = h.engine(descriptor(vec![pair(SRC, DST, 0)]));
        engine.start().await.unwrap();

        let mut fwd = text_message("news");
        fwd.forward = Some(ForwardOrigin {
            chat_id: -5000,
            message_id: 3,
        });
        h.client.push(fwd);
        let report = engine.tick().await.unwrap();

        assert_eq!(report.delivered, 1);
        let sent = h.client.sent_to(DST);
        assert_eq!(sent[0].kind, "text");
        assert_eq!(sent[0].text.as_deref(), Some("news"));
    }

    #[tokio::test]
    async fn deletion_removes_mirrored_copies() {
        let h = Harness::new();
        let mut engine = h.engine(descriptor(vec![pair(SRC, DST, 0), pair(SRC, DST2, 0)]));
        engine.start().await.unwrap();

        let id = h.client.post(SRC, "to be deleted");
        engine.tick().await.unwrap();
        let copies = [
            engine.state().id_map.lookup(SRC, id, DST).unwrap(),
            engine.state().id_map.lookup(SRC, id, DST2).unwrap(),
        ];

        let event = DeletionEvent {
            chat_id: Some(SRC),
            message_ids: vec![id],
        };
        assert_eq!(engine.handle_deletion(event.clone()).await.unwrap(), 2);
        let mut deleted = h.client.deleted();
        deleted.sort();
        assert_eq!(deleted, vec![(DST2, vec![copies[1]]), (DST, vec![copies[0]])]);
        assert!(h.store.snapshot().id_map.is_empty());

        assert_eq!(engine.handle_deletion(event).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn deletion_without_chat_matches_any_source() {
        let h = Harness::new();
        let mut engine = h.engine(descriptor(vec![pair(SRC, DST, 0)]));
        engine.start().await.unwrap();
        let id = h.client.post(SRC, "gone");
        engine.tick().await.unwrap();

        let deleted = engine
            .handle_deletion(DeletionEvent {
                chat_id: None,
                message_ids: vec![id],
            })
            .await
            .unwrap();
        assert_eq!(deleted, 1);
    }

    #[tokio::test]
    async fn inaccessible_pair_is_skipped() {
        let h = Harness::new();
        h.client.set_inaccessible(DST2, true);
        let mut engine = h.engine(descriptor(vec![pair(SRC, DST, 0), pair(SRC, DST2, 0)]));
        engine.start().await.unwrap();

        h.client.post(SRC, "hello");
        let report = engine.tick().await.unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(h.texts(DST), vec!["hello"]);
        assert!(h.client.sent_to(DST2).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_message_is_deferred_then_skipped() {
        let h = Harness::new();
        let mut engine = h.engine(descriptor(vec![pair(SRC, DST, 0)]));
        engine.start().await.unwrap();

        let stuck = h.client.post(SRC, "stuck");
        let before = engine.state().cursor(SRC);
        for _ in 0..4 {
            h.client.fail_next("send_text", transient);
        }
        // Two attempts per tick.
        let first = engine.tick().await.unwrap();
        assert_eq!(first.deferred, 1);
        assert_eq!(engine.state().cursor(SRC), before);

        let second = engine.tick().await.unwrap();
        assert_eq!(second.deferred, 1);

        h.client.fail_next("send_text", transient);
        h.client.fail_next("send_text", transient);
        let third = engine.tick().await.unwrap();
        assert_eq!(third.skipped, 1);
        assert_eq!(engine.state().cursor(SRC), Some(stuck));
        assert!(h.client.sent_to(DST).is_empty());

        h.client.post(SRC, "next");
        engine.tick().await.unwrap();
        assert_eq!(h.texts(DST), vec!["next"]);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_skips_targets_already_delivered() {
        let h = Harness::new();
        let mut desc = descriptor(vec![pair(SRC, DST, 0), pair(SRC, DST2, 0)]);
        desc.settings.retry_attempts = 1;
        let mut engine = h.engine(desc);
        engine.start().await.unwrap();

        h.client.post(SRC, "fan out");
        h.client.fail_next("send_text", transient);
        let first = engine.tick().await.unwrap();
        assert_eq!(first.deferred, 1);
        assert!(h.client.sent_to(DST).is_empty());
        assert_eq!(h.client.sent_to(DST2).len(), 1);

        let second = engine.tick().await.unwrap();
        assert_eq!(second.delivered, 1);
        assert_eq!(h.client.sent_to(DST).len(), 1);
        assert_eq!(h.client.sent_to(DST2).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_waits_then_delivers() {
        let h = Harness::new();
        let mut engine = h.engine(descriptor(vec![pair(SRC, DST, 0)]));
        engine.start().await.unwrap();

        h.client.post(SRC, "slow");
        h.client
            .fail_next("send_text", || PlatformError::RateLimited { seconds: 30 });
        let report = engine.tick().await.unwrap();

        assert_eq!(report.delivered, 1);
        let attempts = h.client.attempts("send_text");
        assert_eq!(attempts.len(), 2);
        assert!(attempts[1] - attempts[0] >= Duration::from_secs(31));
    }

    #[tokio::test]
    async fn cursor_survives_restart() {
        let h = Harness::new();
        let desc = descriptor(vec![pair(SRC, DST, 0)]);
        let mut engine = h.engine(desc.clone());
        engine.start().await.unwrap();
        h.client.post(SRC, "one");
        engine.tick().await.unwrap();
        engine.shutdown().await.unwrap();
        drop(engine);

        h.client.post(SRC, "two");
        let mut restarted = h.engine(desc);
        restarted.start().await.unwrap();
        restarted.tick().await.unwrap();

        assert_eq!(h.texts(DST), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn long_text_is_split() {
        let h = Harness::new();
        let mut desc = descriptor(vec![pair(SRC, DST, 0)]);
        desc.settings.max_message_length = 10;
        let mut engine = h.engine(desc);
        engine.start().await.unwrap();

        h.client.post(SRC, "alpha beta\ngamma delta");
        engine.tick().await.unwrap();

        assert_eq!(h.texts(DST), vec!["alpha beta", "gamma", "delta"]);
    }

    #[tokio::test]
    async fn reload_applies_new_rules() {
        let h = Harness::new();
        let tmp = TempDir::new().unwrap();
        let config = tmp.path().join("tgrelay.toml");
        let write = |replace: &str| {
            std::fs::write(
                &config,
                format!(
                    r#"
[[replacement_rules]]
find = "Elite"
replace = "{replace}"

[[workers]]
worker_id = "alpha"
api_id = 1
api_hash = "h"

[[workers.channel_pairs]]
source = {SRC}
target = {DST}
"#
                ),
            )
            .unwrap();
        };
        write("Premium");
        let desc = load_config(&config).unwrap().materialize("alpha").unwrap();
        let mut engine = h
            .engine(desc)
            .with_reload(config.clone(), tmp.path().join("trigger_reload.flag"));
        engine.start().await.unwrap();
        assert!(!engine.reload().await.unwrap());

        write("Gold");
        assert!(engine.reload().await.unwrap());
        h.client.post(SRC, "Elite call");
        engine.tick().await.unwrap();
        assert_eq!(h.texts(DST), vec!["Gold call"]);
    }
}
