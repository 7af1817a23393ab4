//! Message classification.

use tgrelay_platform::{ForwardOrigin, Media, SourceMessage};

/// How a source message is relayed. Decided once per message.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    /// Forwarded post with a known origin: forward natively, falling back
    /// to a content copy.
    Forwarded(ForwardOrigin),
    /// Member of a media group; relayed as one album.
    Album(i64),
    /// Sticker or animation, re-sent by reference.
    Passthrough(Media),
    /// Other media: downloaded and re-uploaded.
    Media(Media),
    Text,
    /// Nothing relayable (service message, empty post).
    Empty,
}

/// Classify with full precedence: forward origin, album, passthrough
/// media, media, text.
#[must_use]
pub fn classify(message: &SourceMessage) -> Classified {
    match message.forward {
        Some(origin) => Classified::Forwarded(origin),
        None => classify_content(message),
    }
}

/// Classify ignoring the forward origin; used for the copy fallback.
#[must_use]
pub fn classify_content(message: &SourceMessage) -> Classified {
    if let Some(group_id) = message.group_id {
        return Classified::Album(group_id);
    }
    match &message.media {
        Some(media) if media.kind.is_passthrough() => Classified::Passthrough(media.clone()),
        Some(media) => Classified::Media(media.clone()),
        None if message.text().is_some() => Classified::Text,
        None => Classified::Empty,
    }
}
