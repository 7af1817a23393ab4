//! Payload preparation and per-target delivery.

use std::path::{Path, PathBuf};

use {
    tgrelay_common::{ChatId, MessageId},
    tgrelay_config::RelaySettings,
    tgrelay_platform::{
        AlbumItem, ChatClient, ForwardOrigin, HistoryQuery, Media, MessageEntity, OutgoingAlbum,
        OutgoingMedia, OutgoingText, Result as PlatformResult, SourceMessage,
    },
    tgrelay_transform::{RulePipeline, source_link, split_long_message},
    tracing::{debug, warn},
};

use crate::{
    classify::Classified,
    retry::{Attempt, RetryPolicy},
};

/// Album members are looked up within this many ids of the triggering one.
const ALBUM_RADIUS: MessageId = 10;

/// Content ready to be sent to any number of targets.
#[derive(Debug)]
pub(crate) enum Payload {
    Text {
        parts: Vec<String>,
        entities: Vec<MessageEntity>,
    },
    Media {
        media: Media,
        upload: Option<PathBuf>,
        caption: Option<String>,
        entities: Vec<MessageEntity>,
    },
    Album {
        items: Vec<AlbumItem>,
        /// Source id of each item, in item order.
        member_ids: Vec<MessageId>,
        caption: Option<String>,
        entities: Vec<MessageEntity>,
    },
    Empty,
}

impl Payload {
    /// Pair each source id with the target id it produced.
    pub(crate) fn map_ids(&self, message_id: MessageId, sent: &[MessageId]) -> Vec<(MessageId, MessageId)> {
        let Some(first) = sent.first().copied() else {
            return Vec::new();
        };
        match self {
            Self::Album { member_ids, .. } if member_ids.len() == sent.len() => {
                member_ids.iter().copied().zip(sent.iter().copied()).collect()
            },
            Self::Album { member_ids, .. } => member_ids.iter().map(|id| (*id, first)).collect(),
            _ => vec![(message_id, first)],
        }
    }

    /// Remove downloaded scratch files.
    pub(crate) async fn cleanup(&self) {
        let files: Vec<&Path> = match self {
            Self::Media {
                upload: Some(path), ..
            } => vec![path.as_path()],
            Self::Album { items, .. } => items.iter().filter_map(|i| i.upload.as_deref()).collect(),
            _ => Vec::new(),
        };
        for file in files {
            if let Err(e) = tokio::fs::remove_file(file).await {
                debug!(path = %file.display(), error = %e, "failed to remove scratch file");
            }
        }
    }
}

/// Text after rules and the optional source-link suffix.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Rendered {
    pub text: Option<String>,
    pub entities: Vec<MessageEntity>,
}

pub(crate) struct Deliverer<'a> {
    pub client: &'a dyn ChatClient,
    pub policy: RetryPolicy,
    pub pipeline: &'a RulePipeline,
    pub settings: &'a RelaySettings,
    pub scratch_dir: &'a Path,
}

impl Deliverer<'_> {
    /// Apply rules and append the source link. Formatting is kept only when
    /// no rule changed the text.
    pub(crate) fn render(
        &self,
        source: ChatId,
        message_id: MessageId,
        text: Option<&str>,
        entities: &[MessageEntity],
    ) -> Rendered {
        let outcome = self.pipeline.apply(text.unwrap_or_default());
        let mut out = outcome.text;
        if self.settings.add_source_link {
            out.push_str(&source_link(
                source,
                message_id,
                &self.settings.source_link_text,
            ));
        }
        Rendered {
            text: (!out.is_empty()).then_some(out),
            entities: if outcome.mutated {
                Vec::new()
            } else {
                entities.to_vec()
            },
        }
    }

    /// Every member of `group_id` around `message`, ascending.
    pub(crate) async fn fetch_album(
        &self,
        source: ChatId,
        message: &SourceMessage,
        group_id: i64,
    ) -> PlatformResult<Vec<SourceMessage>> {
        let window = self
            .client
            .fetch_messages(source, HistoryQuery::around(message.id, ALBUM_RADIUS))
            .await?;
        let mut members: Vec<_> = window
            .into_iter()
            .filter(|m| m.group_id == Some(group_id))
            .collect();
        if !members.iter().any(|m| m.id == message.id) {
            members.push(message.clone());
        }
        members.sort_by_key(|m| m.id);
        Ok(members)
    }

    /// Album caption: the first member carrying text.
    pub(crate) fn album_caption(members: &[SourceMessage]) -> Option<&SourceMessage> {
        members.iter().find(|m| m.text().is_some())
    }

    async fn download(&self, media: &Media) -> Option<PathBuf> {
        match self.client.download_media(media, self.scratch_dir).await {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(file_ref = %media.file_ref, error = %e, "media download failed, sending by reference");
                None
            },
        }
    }

    /// Build the content payload for `class`. Forwarded messages are
    /// prepared as their content copy.
    pub(crate) async fn prepare(
        &self,
        source: ChatId,
        message: &SourceMessage,
        class: &Classified,
        members: &[SourceMessage],
    ) -> Payload {
        match class {
            Classified::Album(_) => {
                let caption_from = Self::album_caption(members);
                let rendered = self.render(
                    source,
                    message.id,
                    caption_from.and_then(SourceMessage::text),
                    caption_from.map(|m| m.entities.as_slice()).unwrap_or_default(),
                );
                let mut items = Vec::new();
                let mut member_ids = Vec::new();
                for member in members {
                    let Some(media) = &member.media else {
                        continue;
                    };
                    let upload = if media.kind.is_passthrough() {
                        None
                    } else {
                        self.download(media).await
                    };
                    items.push(AlbumItem {
                        media: media.clone(),
                        upload,
                    });
                    member_ids.push(member.id);
                }
                Payload::Album {
                    items,
                    member_ids,
                    caption: rendered.text,
                    entities: rendered.entities,
                }
            },
            Classified::Passthrough(media) | Classified::Media(media) => {
                let rendered = self.render(source, message.id, message.text(), &message.entities);
                let upload = match class {
                    Classified::Media(_) => self.download(media).await,
                    _ => None,
                };
                Payload::Media {
                    media: media.clone(),
                    upload,
                    caption: rendered.text,
                    entities: rendered.entities,
                }
            },
            Classified::Text => {
                let rendered = self.render(source, message.id, message.text(), &message.entities);
                let Some(text) = rendered.text else {
                    return Payload::Empty;
                };
                let max = self.settings.max_message_length;
                if text.chars().count() > max {
                    Payload::Text {
                        parts: split_long_message(&text, max),
                        entities: Vec::new(),
                    }
                } else {
                    Payload::Text {
                        parts: vec![text],
                        entities: rendered.entities,
                    }
                }
            },
            Classified::Forwarded(_) | Classified::Empty => Payload::Empty,
        }
    }

    /// Native forward from the origin, then from the source itself.
    /// `None` means both were refused and a content copy is needed.
    pub(crate) async fn forward(
        &self,
        source: ChatId,
        message: &SourceMessage,
        origin: ForwardOrigin,
        target: ChatId,
    ) -> Option<Attempt<Vec<MessageId>>> {
        for (from, id) in [(origin.chat_id, origin.message_id), (source, message.id)] {
            let attempt = self
                .policy
                .run("forward_message", || {
                    self.client.forward_message(from, id, target)
                })
                .await;
            match attempt {
                Attempt::Done(sent) => return Some(Attempt::Done(vec![sent])),
                Attempt::Exhausted(e) => return Some(Attempt::Exhausted(e)),
                Attempt::Terminal(tgrelay_platform::Error::WriteForbidden) => {
                    return Some(Attempt::Terminal(
                        tgrelay_platform::Error::WriteForbidden,
                    ));
                },
                Attempt::Terminal(e) => {
                    debug!(from, message_id = id, target, error = %e, "forward refused, falling back");
                },
            }
        }
        None
    }

    /// Send `payload` to `target`.
    pub(crate) async fn send(
        &self,
        payload: &Payload,
        target: ChatId,
        reply_to: Option<MessageId>,
    ) -> Attempt<Vec<MessageId>> {
        match payload {
            Payload::Text { parts, entities } => {
                let mut sent = Vec::with_capacity(parts.len());
                for (i, part) in parts.iter().enumerate() {
                    let message = OutgoingText {
                        chat_id: target,
                        text: part.clone(),
                        entities: if parts.len() == 1 {
                            entities.clone()
                        } else {
                            Vec::new()
                        },
                        reply_to: if i == 0 { reply_to } else { None },
                    };
                    match self
                        .policy
                        .run("send_text", || self.client.send_text(message.clone()))
                        .await
                    {
                        Attempt::Done(id) => sent.push(id),
                        failed if sent.is_empty() => return failed.map_done(|_| Vec::new()),
                        failed => {
                            warn!(target, part = i, error = ?failed, "long message delivered partially");
                            break;
                        },
                    }
                }
                Attempt::Done(sent)
            },
            Payload::Media {
                media,
                upload,
                caption,
                entities,
            } => {
                let message = OutgoingMedia {
                    chat_id: target,
                    media: media.clone(),
                    upload: upload.clone(),
                    caption: caption.clone(),
                    entities: entities.clone(),
                    reply_to,
                };
                self.policy
                    .run("send_media", || self.client.send_media(message.clone()))
                    .await
                    .map_done(|id| vec![id])
            },
            Payload::Album {
                items,
                caption,
                entities,
                ..
            } => {
                if items.is_empty() {
                    return Attempt::Done(Vec::new());
                }
                let album = OutgoingAlbum {
                    chat_id: target,
                    items: items.clone(),
                    caption: caption.clone(),
                    entities: entities.clone(),
                    reply_to,
                };
                self.policy
                    .run("send_album", || self.client.send_album(album.clone()))
                    .await
            },
            Payload::Empty => Attempt::Done(Vec::new()),
        }
    }
}

impl<T> Attempt<T> {
    pub(crate) fn map_done<U>(self, f: impl FnOnce(T) -> U) -> Attempt<U> {
        match self {
            Self::Done(value) => Attempt::Done(f(value)),
            Self::Terminal(e) => Attempt::Terminal(e),
            Self::Exhausted(e) => Attempt::Exhausted(e),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        tgrelay_config::ReplacementRule,
        tgrelay_platform::{MediaKind, MemoryClient},
    };

    fn entity() -> MessageEntity {
        MessageEntity {
            kind: "bold".into(),
            offset: 0,
            length: 3,
            extra: serde_json::Map::new(),
        }
    }

    fn with_deliverer<R>(
        rules: &[ReplacementRule],
        settings: RelaySettings,
        f: impl FnOnce(&Deliverer<'_>) -> R,
    ) -> R {
        let client = MemoryClient::new();
        let pipeline = RulePipeline::new(rules);
        let scratch = std::env::temp_dir();
        let deliverer = Deliverer {
            client: &client,
            policy: RetryPolicy::from_settings(&settings),
            pipeline: &pipeline,
            settings: &settings,
            scratch_dir: &scratch,
        };
        f(&deliverer)
    }

    #[test]
    fn render_keeps_entities_only_without_mutation() {
        let rule = ReplacementRule {
            find: "Elite".into(),
            replace: "Premium".into(),
            ..Default::default()
        };
        with_deliverer(&[rule], RelaySettings::default(), |d| {
            let kept = d.render(-1001, 5, Some("Hey there"), &[entity()]);
            assert_eq!(kept.entities.len(), 1);
            let changed = d.render(-1001, 5, Some("Elite signal"), &[entity()]);
            assert_eq!(changed.text.as_deref(), Some("Premium signal"));
            assert!(changed.entities.is_empty());
        });
    }

    #[test]
    fn source_link_is_not_a_mutation() {
        let settings = RelaySettings {
            add_source_link: true,
            source_link_text: " {link}".into(),
            ..Default::default()
        };
        with_deliverer(&[], settings, |d| {
            let r = d.render(-1001, 5, Some("hi"), &[entity()]);
            assert_eq!(r.text.as_deref(), Some("hi https://t.me/c/1/5"));
            assert_eq!(r.entities.len(), 1);
            let empty = d.render(-1001, 5, None, &[]);
            assert_eq!(empty.text.as_deref(), Some(" https://t.me/c/1/5"));
        });
    }

    #[test]
    fn album_ids_pair_up() {
        let media = Media {
            kind: MediaKind::Photo,
            file_ref: "a".into(),
            file_name: None,
            mime_type: None,
            attributes: serde_json::Value::Null,
        };
        let item = AlbumItem {
            media,
            upload: None,
        };
        let album = Payload::Album {
            items: vec![item.clone(), item],
            member_ids: vec![10, 11],
            caption: None,
            entities: Vec::new(),
        };
        assert_eq!(album.map_ids(10, &[100, 101]), vec![(10, 100), (11, 101)]);
        assert_eq!(album.map_ids(10, &[100]), vec![(10, 100), (11, 100)]);
        assert!(album.map_ids(10, &[]).is_empty());

        let text = Payload::Text {
            parts: vec!["x".into()],
            entities: Vec::new(),
        };
        assert_eq!(text.map_ids(3, &[30, 31]), vec![(3, 30)]);
    }
}
