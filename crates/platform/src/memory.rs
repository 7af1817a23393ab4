//! In-memory [`ChatClient`] with scripted failures, used by engine tests
//! and dry runs.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::Mutex,
};

use {
    async_trait::async_trait,
    tgrelay_common::{ChatId, MessageId},
    tokio::{sync::mpsc, time::Instant},
};

use crate::{
    client::ChatClient,
    error::{Error, Result},
    model::{
        ChatInfo, DeletionEvent, HistoryOrder, HistoryQuery, Media, OutgoingAlbum, OutgoingMedia,
        OutgoingText, SourceMessage,
    },
};

/// One successful outbound call, as observed by the fake platform.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub chat_id: ChatId,
    /// `"text"`, `"media"`, `"album"` or `"forward"`.
    pub kind: &'static str,
    pub message_ids: Vec<MessageId>,
    /// Text or caption.
    pub text: Option<String>,
    pub entities: usize,
    pub reply_to: Option<MessageId>,
    /// Media references in send order.
    pub media_refs: Vec<String>,
    /// Whether a local file was uploaded (as opposed to a by-reference send).
    pub uploaded: bool,
    pub forwarded_from: Option<(ChatId, MessageId)>,
}

#[derive(Default)]
struct ChatState {
    history: BTreeMap<MessageId, SourceMessage>,
    next_id: MessageId,
    inaccessible: bool,
    forwards_restricted: bool,
}

#[derive(Default)]
struct State {
    chats: HashMap<ChatId, ChatState>,
    failures: HashMap<&'static str, VecDeque<fn() -> Error>>,
    attempts: Vec<(&'static str, Instant)>,
    sent: Vec<SentMessage>,
    deleted: Vec<(ChatId, Vec<MessageId>)>,
    downloads: Vec<PathBuf>,
    deletion_tx: Option<mpsc::Sender<DeletionEvent>>,
}

#[derive(Default)]
pub struct MemoryClient {
    state: Mutex<State>,
}

impl MemoryClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn add_chat(&self, chat_id: ChatId) {
        self.with_state(|s| {
            s.chats.entry(chat_id).or_default();
        });
    }

    /// Append a message with the next free id; returns that id.
    pub fn post(&self, chat_id: ChatId, text: &str) -> MessageId {
        self.push(SourceMessage {
            id: 0,
            chat_id,
            text: Some(text.into()),
            entities: Vec::new(),
            group_id: None,
            reply_to: None,
            forward: None,
            media: None,
        })
    }

    /// Append `message`. An id of 0 is replaced with the next free id.
    pub fn push(&self, mut message: SourceMessage) -> MessageId {
        self.with_state(|s| {
            let chat = s.chats.entry(message.chat_id).or_default();
            if message.id == 0 {
                message.id = chat.next_id + 1;
            }
            chat.next_id = chat.next_id.max(message.id);
            let id = message.id;
            chat.history.insert(id, message);
            id
        })
    }

    /// Make `get_chat` and history reads fail with [`Error::ChatPrivate`].
    pub fn set_inaccessible(&self, chat_id: ChatId, inaccessible: bool) {
        self.with_state(|s| s.chats.entry(chat_id).or_default().inaccessible = inaccessible);
    }

    pub fn restrict_forwards(&self, chat_id: ChatId) {
        self.with_state(|s| s.chats.entry(chat_id).or_default().forwards_restricted = true);
    }

    /// Queue an error for the next call of `op` (the trait method name).
    pub fn fail_next(&self, op: &'static str, make: fn() -> Error) {
        self.with_state(|s| s.failures.entry(op).or_default().push_back(make));
    }

    #[must_use]
    pub fn sent(&self) -> Vec<SentMessage> {
        self.with_state(|s| s.sent.clone())
    }

    #[must_use]
    pub fn sent_to(&self, chat_id: ChatId) -> Vec<SentMessage> {
        self.with_state(|s| {
            s.sent
                .iter()
                .filter(|m| m.chat_id == chat_id)
                .cloned()
                .collect()
        })
    }

    #[must_use]
    pub fn deleted(&self) -> Vec<(ChatId, Vec<MessageId>)> {
        self.with_state(|s| s.deleted.clone())
    }

    /// Instants at which `op` was attempted, successful or not.
    #[must_use]
    pub fn attempts(&self, op: &str) -> Vec<Instant> {
        self.with_state(|s| {
            s.attempts
                .iter()
                .filter(|(name, _)| *name == op)
                .map(|(_, at)| *at)
                .collect()
        })
    }

    #[must_use]
    pub fn downloads(&self) -> Vec<PathBuf> {
        self.with_state(|s| s.downloads.clone())
    }

    /// Push a deletion event to the current subscriber, if any.
    pub async fn emit_deletion(&self, event: DeletionEvent) -> bool {
        let tx = self.with_state(|s| s.deletion_tx.clone());
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    fn begin(&self, op: &'static str) -> Result<()> {
        self.with_state(|s| {
            s.attempts.push((op, Instant::now()));
            match s.failures.get_mut(op).and_then(VecDeque::pop_front) {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        })
    }

    fn accessible(s: &State, chat_id: ChatId) -> Result<()> {
        match s.chats.get(&chat_id) {
            Some(chat) if !chat.inaccessible => Ok(()),
            _ => Err(Error::ChatPrivate),
        }
    }

    /// Store an outbound message in the target chat and log it.
    fn deliver(s: &mut State, mut record: SentMessage, count: usize) -> Result<Vec<MessageId>> {
        Self::accessible(s, record.chat_id)?;
        let chat = s.chats.entry(record.chat_id).or_default();
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            chat.next_id += 1;
            let id = chat.next_id;
            chat.history.insert(id, SourceMessage {
                id,
                chat_id: record.chat_id,
                text: record.text.clone(),
                entities: Vec::new(),
                group_id: None,
                reply_to: record.reply_to,
                forward: None,
                media: None,
            });
            ids.push(id);
        }
        record.message_ids = ids.clone();
        s.sent.push(record);
        Ok(ids)
    }
}

fn record(chat_id: ChatId, kind: &'static str) -> SentMessage {
    SentMessage {
        chat_id,
        kind,
        message_ids: Vec::new(),
        text: None,
        entities: 0,
        reply_to: None,
        media_refs: Vec::new(),
        uploaded: false,
        forwarded_from: None,
    }
}

#[async_trait]
impl ChatClient for MemoryClient {
    async fn get_chat(&self, chat_id: ChatId) -> Result<ChatInfo> {
        self.begin("get_chat")?;
        self.with_state(|s| Self::accessible(s, chat_id))?;
        Ok(ChatInfo {
            id: chat_id,
            title: None,
        })
    }

    async fn fetch_messages(
        &self,
        chat_id: ChatId,
        query: HistoryQuery,
    ) -> Result<Vec<SourceMessage>> {
        self.begin("fetch_messages")?;
        self.with_state(|s| -> Result<Vec<SourceMessage>> {
            Self::accessible(s, chat_id)?;
            let history = s
                .chats
                .get(&chat_id)
                .map(|c| &c.history)
                .ok_or(Error::ChatPrivate)?;
            let window = history.values().filter(|m| query.contains(m.id));
            let out = match query.order {
                HistoryOrder::OldestFirst => window.take(query.limit).cloned().collect(),
                HistoryOrder::NewestFirst => window.rev().take(query.limit).cloned().collect(),
            };
            Ok(out)
        })
    }

    async fn send_text(&self, message: OutgoingText) -> Result<MessageId> {
        self.begin("send_text")?;
        self.with_state(|s| {
            let mut rec = record(message.chat_id, "text");
            rec.text = Some(message.text);
            rec.entities = message.entities.len();
            rec.reply_to = message.reply_to;
            Self::deliver(s, rec, 1).map(|ids| ids[0])
        })
    }

    async fn send_media(&self, message: OutgoingMedia) -> Result<MessageId> {
        self.begin("send_media")?;
        self.with_state(|s| {
            let mut rec = record(message.chat_id, "media");
            rec.text = message.caption;
            rec.entities = message.entities.len();
            rec.reply_to = message.reply_to;
            rec.media_refs = vec![message.media.file_ref];
            rec.uploaded = message.upload.is_some();
            Self::deliver(s, rec, 1).map(|ids| ids[0])
        })
    }

    async fn send_album(&self, album: OutgoingAlbum) -> Result<Vec<MessageId>> {
        self.begin("send_album")?;
        self.with_state(|s| {
            let mut rec = record(album.chat_id, "album");
            rec.text = album.caption;
            rec.entities = album.entities.len();
            rec.reply_to = album.reply_to;
            rec.uploaded = album.items.iter().all(|i| i.upload.is_some());
            rec.media_refs = album.items.iter().map(|i| i.media.file_ref.clone()).collect();
            let count = album.items.len();
            Self::deliver(s, rec, count)
        })
    }

    async fn forward_message(
        &self,
        from: ChatId,
        message_id: MessageId,
        to: ChatId,
    ) -> Result<MessageId> {
        self.begin("forward_message")?;
        self.with_state(|s| -> Result<MessageId> {
            Self::accessible(s, from)?;
            let chat = s.chats.get(&from).ok_or(Error::ChatPrivate)?;
            if chat.forwards_restricted {
                return Err(Error::ForwardsRestricted);
            }
            let original = chat
                .history
                .get(&message_id)
                .ok_or(Error::InvalidMessageId)?;
            let mut rec = record(to, "forward");
            rec.text = original.text.clone();
            rec.forwarded_from = Some((from, message_id));
            Self::deliver(s, rec, 1).map(|ids| ids[0])
        })
    }

    async fn download_media(&self, media: &Media, dest_dir: &Path) -> Result<PathBuf> {
        self.begin("download_media")?;
        tokio::fs::create_dir_all(dest_dir).await?;
        let path = dest_dir.join(format!("{}.bin", media.file_ref));
        tokio::fs::write(&path, media.file_ref.as_bytes()).await?;
        self.with_state(|s| s.downloads.push(path.clone()));
        Ok(path)
    }

    async fn delete_messages(&self, chat_id: ChatId, message_ids: &[MessageId]) -> Result<()> {
        self.begin("delete_messages")?;
        self.with_state(|s| {
            if let Some(chat) = s.chats.get_mut(&chat_id) {
                chat.history.retain(|id, _| !message_ids.contains(id));
            }
            s.deleted.push((chat_id, message_ids.to_vec()));
        });
        Ok(())
    }

    fn subscribe_deletions(&self) -> mpsc::Receiver<DeletionEvent> {
        let (tx, rx) = mpsc::channel(64);
        self.with_state(|s| s.deletion_tx = Some(tx));
        rx
    }
}
