use tgrelay_common::{ChatId, MessageId};

/// Public permalink of a channel message: `https://t.me/c/<id>/<msg>`,
/// where `<id>` is the chat id without its `-100` channel prefix.
#[must_use]
pub fn source_link_url(source: ChatId, message_id: MessageId) -> String {
    let raw = source.to_string();
    let short = raw
        .strip_prefix("-100")
        .or_else(|| raw.strip_prefix('-'))
        .unwrap_or(&raw);
    format!("https://t.me/c/{short}/{message_id}")
}

/// Render `template` with `{link}` replaced by the source permalink.
#[must_use]
pub fn source_link(source: ChatId, message_id: MessageId, template: &str) -> String {
    template.replace("{link}", &source_link_url(source, message_id))
}
