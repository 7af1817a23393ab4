//! HTTP bridge client.
//!
//! Every primitive is `POST <base_url>/<method>` with a JSON body (or a
//! multipart form when files are uploaded). Responses use the envelope
//! `{"ok": bool, "result": ..., "error": {"code", "seconds", "message"}}`.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use {
    async_trait::async_trait,
    reqwest::{
        Client, RequestBuilder,
        multipart::{Form, Part},
    },
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize, de::DeserializeOwned},
    serde_json::json,
    tgrelay_common::{ChatId, MessageId},
    tokio::sync::mpsc,
    tracing::{debug, warn},
};

use crate::{
    client::ChatClient,
    error::{Error, Result},
    model::{
        ChatInfo, DeletionEvent, HistoryQuery, Media, OutgoingAlbum, OutgoingMedia, OutgoingText,
        SourceMessage,
    },
};

const SESSION_HEADER: &str = "X-Relay-Session";
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(25);
/// Upper bound for one bridge call, uploads included.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const DELETION_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct HttpBridgeClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: Client,
    base_url: String,
    session_name: String,
    token: Option<Secret<String>>,
    poll_timeout: Duration,
    request_timeout: Duration,
}

impl std::fmt::Debug for HttpBridgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBridgeClient")
            .field("base_url", &self.inner.base_url)
            .field("session_name", &self.inner.session_name)
            .field("token", &self.inner.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: String,
    #[serde(default)]
    seconds: Option<u64>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct Sent {
    message_id: MessageId,
}

#[derive(Deserialize)]
struct SentAlbum {
    message_ids: Vec<MessageId>,
}

#[derive(Serialize)]
struct HistoryRequest {
    chat_id: ChatId,
    #[serde(flatten)]
    query: HistoryQuery,
}

impl HttpBridgeClient {
    pub fn new(
        base_url: impl Into<String>,
        session_name: impl Into<String>,
        token: Option<Secret<String>>,
    ) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::external("build http client", e))?;
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                base_url: base_url.into().trim_end_matches('/').to_string(),
                session_name: session_name.into(),
                token,
                poll_timeout: DEFAULT_POLL_TIMEOUT,
                request_timeout: DEFAULT_REQUEST_TIMEOUT,
            }),
        })
    }

    /// Override the `getDeletions` long-poll timeout.
    #[must_use]
    pub fn with_poll_timeout(self, poll_timeout: Duration) -> Self {
        self.with_timeouts(poll_timeout, self.inner.request_timeout)
    }

    /// Override the deadline of every other bridge call.
    #[must_use]
    pub fn with_request_timeout(self, request_timeout: Duration) -> Self {
        self.with_timeouts(self.inner.poll_timeout, request_timeout)
    }

    fn with_timeouts(&self, poll_timeout: Duration, request_timeout: Duration) -> Self {
        let inner = Inner {
            http: self.inner.http.clone(),
            base_url: self.inner.base_url.clone(),
            session_name: self.inner.session_name.clone(),
            token: self.inner.token.clone(),
            poll_timeout,
            request_timeout,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    fn request(&self, method: &str) -> RequestBuilder {
        let req = self
            .inner
            .http
            .post(format!("{}/{method}", self.inner.base_url))
            .timeout(self.inner.request_timeout)
            .header(SESSION_HEADER, &self.inner.session_name);
        match &self.inner.token {
            Some(token) => req.bearer_auth(token.expose_secret()),
            None => req,
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: &impl Serialize) -> Result<T> {
        let response = self
            .request(method)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::external(method.to_string(), e))?;
        decode(method, response).await
    }

    async fn call_form<T: DeserializeOwned>(&self, method: &str, form: Form) -> Result<T> {
        let response = self
            .request(method)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::external(method.to_string(), e))?;
        decode(method, response).await
    }

    async fn poll_deletions(&self) -> Result<Vec<DeletionEvent>> {
        let timeout = self.inner.poll_timeout;
        let response = self
            .request("getDeletions")
            .timeout(timeout + Duration::from_secs(10))
            .json(&json!({ "timeout": timeout.as_secs() }))
            .send()
            .await
            .map_err(|e| Error::external("getDeletions", e))?;
        decode("getDeletions", response).await
    }
}

async fn decode<T: DeserializeOwned>(method: &str, response: reqwest::Response) -> Result<T> {
    decode_optional(method, response)
        .await?
        .ok_or_else(|| Error::api("EMPTY_RESULT", format!("{method} returned no result")))
}

/// Like [`decode`], but a successful envelope may omit `result`.
async fn decode_optional<T: DeserializeOwned>(
    method: &str,
    response: reqwest::Response,
) -> Result<Option<T>> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::external(format!("{method}: read body"), e))?;

    let envelope: Envelope<T> = match serde_json::from_str(&body) {
        Ok(envelope) => envelope,
        Err(_) if !status.is_success() => {
            return Err(Error::api(format!("HTTP_{}", status.as_u16()), body));
        },
        Err(e) => return Err(e.into()),
    };

    if !envelope.ok {
        let err = envelope.error.map_or_else(
            || Error::api("UNKNOWN", format!("{method} failed without error details")),
            |e| Error::from_code(&e.code, e.seconds, e.message),
        );
        debug!(method, error = %err, "bridge call failed");
        return Err(err);
    }
    Ok(envelope.result)
}

async fn file_part(path: &Path, name_hint: Option<&str>) -> Result<Part> {
    let bytes = tokio::fs::read(path).await?;
    let file_name = name_hint
        .map(str::to_string)
        .or_else(|| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "upload".into());
    Ok(Part::bytes(bytes).file_name(file_name))
}

#[async_trait]
impl ChatClient for HttpBridgeClient {
    async fn get_chat(&self, chat_id: ChatId) -> Result<ChatInfo> {
        self.call("getChat", &json!({ "chat_id": chat_id })).await
    }

    async fn fetch_messages(
        &self,
        chat_id: ChatId,
        query: HistoryQuery,
    ) -> Result<Vec<SourceMessage>> {
        self.call("getMessages", &HistoryRequest { chat_id, query })
            .await
    }

    async fn send_text(&self, message: OutgoingText) -> Result<MessageId> {
        let sent: Sent = self.call("sendMessage", &message).await?;
        Ok(sent.message_id)
    }

    async fn send_media(&self, message: OutgoingMedia) -> Result<MessageId> {
        let sent: Sent = match &message.upload {
            Some(path) => {
                let form = Form::new()
                    .text("payload", serde_json::to_string(&message)?)
                    .part(
                        "file",
                        file_part(path, message.media.file_name.as_deref()).await?,
                    );
                self.call_form("sendMedia", form).await?
            },
            None => self.call("sendMedia", &message).await?,
        };
        Ok(sent.message_id)
    }

    async fn send_album(&self, album: OutgoingAlbum) -> Result<Vec<MessageId>> {
        let mut form = Form::new().text("payload", serde_json::to_string(&album)?);
        for (i, item) in album.items.iter().enumerate() {
            if let Some(path) = &item.upload {
                form = form.part(
                    format!("file_{i}"),
                    file_part(path, item.media.file_name.as_deref()).await?,
                );
            }
        }
        let sent: SentAlbum = self.call_form("sendAlbum", form).await?;
        Ok(sent.message_ids)
    }

    async fn forward_message(
        &self,
        from: ChatId,
        message_id: MessageId,
        to: ChatId,
    ) -> Result<MessageId> {
        let sent: Sent = self
            .call(
                "forwardMessage",
                &json!({
                    "from_chat_id": from,
                    "message_id": message_id,
                    "chat_id": to,
                }),
            )
            .await?;
        Ok(sent.message_id)
    }

    async fn download_media(&self, media: &Media, dest_dir: &Path) -> Result<PathBuf> {
        let response = self
            .request("downloadMedia")
            .json(&json!({ "media": media }))
            .send()
            .await
            .map_err(|e| Error::external("downloadMedia", e))?;

        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"));
        if is_json || !response.status().is_success() {
            // Success always carries raw bytes; an envelope here is an error.
            let err = match decode::<serde_json::Value>("downloadMedia", response).await {
                Ok(_) => Error::api("UNEXPECTED_RESULT", "downloadMedia returned JSON"),
                Err(e) => e,
            };
            return Err(err);
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::external("downloadMedia: read body", e))?;
        tokio::fs::create_dir_all(dest_dir).await?;
        let name = media.file_name.as_deref().unwrap_or("media");
        let path = dest_dir.join(format!("{}_{name}", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, &bytes).await?;
        debug!(path = %path.display(), size = bytes.len(), "downloaded media");
        Ok(path)
    }

    async fn delete_messages(&self, chat_id: ChatId, message_ids: &[MessageId]) -> Result<()> {
        let response = self
            .request("deleteMessages")
            .json(&json!({ "chat_id": chat_id, "message_ids": message_ids }))
            .send()
            .await
            .map_err(|e| Error::external("deleteMessages", e))?;
        decode_optional::<serde_json::Value>("deleteMessages", response).await?;
        Ok(())
    }

    fn subscribe_deletions(&self) -> mpsc::Receiver<DeletionEvent> {
        let (tx, rx) = mpsc::channel(64);
        let client = self.clone();
        tokio::spawn(async move {
            while !tx.is_closed() {
                match client.poll_deletions().await {
                    Ok(events) => {
                        for event in events {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "deletion poll failed");
                        tokio::time::sleep(DELETION_RETRY_DELAY).await;
                    },
                }
            }
        });
        rx
    }
}
