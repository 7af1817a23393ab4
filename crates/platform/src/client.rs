use std::path::{Path, PathBuf};

use {
    async_trait::async_trait,
    tgrelay_common::{ChatId, MessageId},
    tokio::sync::mpsc,
};

use crate::{
    error::Result,
    model::{
        ChatInfo, DeletionEvent, HistoryQuery, Media, OutgoingAlbum, OutgoingMedia, OutgoingText,
        SourceMessage,
    },
};

/// Platform primitives the relay engine needs.
///
/// All errors are typed ([`crate::Error`]); transport failures surface as
/// generic, retryable errors.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Resolve a chat. Fails with a terminal error when it is inaccessible.
    async fn get_chat(&self, chat_id: ChatId) -> Result<ChatInfo>;

    /// Fetch history in the window described by `query`, ordered as
    /// `query.order` asks.
    async fn fetch_messages(
        &self,
        chat_id: ChatId,
        query: HistoryQuery,
    ) -> Result<Vec<SourceMessage>>;

    async fn send_text(&self, message: OutgoingText) -> Result<MessageId>;

    async fn send_media(&self, message: OutgoingMedia) -> Result<MessageId>;

    /// Send an album; returns the new ids in item order.
    async fn send_album(&self, album: OutgoingAlbum) -> Result<Vec<MessageId>>;

    /// Native forward of `message_id` from `from` to `to`.
    async fn forward_message(
        &self,
        from: ChatId,
        message_id: MessageId,
        to: ChatId,
    ) -> Result<MessageId>;

    /// Download media into `dest_dir`, returning the written file.
    async fn download_media(&self, media: &Media, dest_dir: &Path) -> Result<PathBuf>;

    async fn delete_messages(&self, chat_id: ChatId, message_ids: &[MessageId]) -> Result<()>;

    /// Subscribe to deletion events. The stream ends when the client shuts
    /// down; dropping the receiver stops the subscription.
    fn subscribe_deletions(&self) -> mpsc::Receiver<DeletionEvent>;
}
