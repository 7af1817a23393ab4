//! Message model shared by every [`crate::ChatClient`] implementation.

use {
    serde::{Deserialize, Serialize},
    tgrelay_common::{ChatId, MessageId},
};

/// A formatting span (bold, link, mention, ...). Extra fields such as `url`
/// are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEntity {
    #[serde(rename = "type")]
    pub kind: String,
    pub offset: u32,
    pub length: u32,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Document,
    Audio,
    Voice,
    Sticker,
    Animation,
    #[serde(other)]
    Other,
}

impl MediaKind {
    /// Stickers and animations are re-sent by reference, never downloaded.
    #[must_use]
    pub fn is_passthrough(self) -> bool {
        matches!(self, Self::Sticker | Self::Animation)
    }
}

/// Media attached to a message. `file_ref` is an opaque handle the platform
/// accepts for re-sending without an upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Media {
    pub kind: MediaKind,
    pub file_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Platform attributes (dimensions, duration, ...) preserved on re-upload.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub attributes: serde_json::Value,
}

/// Where a forwarded message originally came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardOrigin {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<MessageEntity>,
    /// Album identifier shared by every member of a media group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward: Option<ForwardOrigin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Media>,
}

impl SourceMessage {
    /// Non-empty text or caption.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatInfo {
    pub id: ChatId,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOrder {
    #[default]
    OldestFirst,
    NewestFirst,
}

/// History window: ids strictly between `min_id` and `max_id` (`max_id` of
/// 0 means unbounded), at most `limit` messages. With `OldestFirst` the
/// lowest ids in the window are returned, with `NewestFirst` the highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub min_id: MessageId,
    pub max_id: MessageId,
    pub limit: usize,
    pub order: HistoryOrder,
}

impl HistoryQuery {
    /// Messages newer than `cursor`, oldest first.
    #[must_use]
    pub fn after(cursor: MessageId, limit: usize) -> Self {
        Self {
            min_id: cursor,
            max_id: 0,
            limit,
            order: HistoryOrder::OldestFirst,
        }
    }

    /// The `limit` most recent messages up to and including `upto`.
    #[must_use]
    pub fn latest_upto(upto: MessageId, limit: usize) -> Self {
        Self {
            min_id: 0,
            max_id: upto.saturating_add(1),
            limit,
            order: HistoryOrder::NewestFirst,
        }
    }

    /// The single newest message.
    #[must_use]
    pub fn newest() -> Self {
        Self {
            min_id: 0,
            max_id: 0,
            limit: 1,
            order: HistoryOrder::NewestFirst,
        }
    }

    /// Ids within `radius` of `id` on either side.
    #[must_use]
    pub fn around(id: MessageId, radius: MessageId) -> Self {
        Self {
            min_id: (id - radius - 1).max(0),
            max_id: id + radius + 1,
            limit: usize::try_from(radius * 2 + 1).unwrap_or(usize::MAX),
            order: HistoryOrder::OldestFirst,
        }
    }

    #[must_use]
    pub fn contains(&self, id: MessageId) -> bool {
        id > self.min_id && (self.max_id == 0 || id < self.max_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingText {
    pub chat_id: ChatId,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<MessageEntity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
}

/// A single media send. With `upload` set the local file is uploaded,
/// otherwise the media is re-sent by reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMedia {
    pub chat_id: ChatId,
    pub media: Media,
    #[serde(skip)]
    pub upload: Option<std::path::PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<MessageEntity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlbumItem {
    pub media: Media,
    #[serde(skip)]
    pub upload: Option<std::path::PathBuf>,
}

/// Several media items sent as one grouped payload with one caption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingAlbum {
    pub chat_id: ChatId,
    pub items: Vec<AlbumItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<MessageEntity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
}

/// Messages removed on the platform. A missing `chat_id` means the platform
/// did not say which chat they belonged to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionEvent {
    #[serde(default)]
    pub chat_id: Option<ChatId>,
    pub message_ids: Vec<MessageId>,
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_keeps_extra_fields() {
        let raw = r#"{"type": "text_link", "offset": 0, "length": 4, "url": "https://x"}"#;
        let entity: MessageEntity = serde_json::from_str(raw).unwrap();
        assert_eq!(entity.kind, "text_link");
        assert_eq!(entity.extra["url"], "https://x");
        let back = serde_json::to_value(&entity).unwrap();
        assert_eq!(back["url"], "https://x");
    }

    #[test]
    fn unknown_media_kind_is_other() {
        let kind: MediaKind = serde_json::from_str(r#""poll""#).unwrap();
        assert_eq!(kind, MediaKind::Other);
        assert!(MediaKind::Sticker.is_passthrough());
        assert!(!MediaKind::Photo.is_passthrough());
    }

    #[test]
    fn query_windows() {
        let q = HistoryQuery::around(50, 10);
        assert!(q.contains(40));
        assert!(q.contains(60));
        assert!(!q.contains(39));
        assert!(!q.contains(61));
        assert_eq!(q.limit, 21);

        let q = HistoryQuery::latest_upto(100, 5);
        assert!(q.contains(100));
        assert!(!q.contains(101));

        assert!(HistoryQuery::after(7, 100).contains(8));
        assert!(!HistoryQuery::after(7, 100).contains(7));
    }
}
