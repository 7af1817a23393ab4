//! Chat platform access.
//!
//! The relay engine talks to the platform only through [`ChatClient`]. The
//! workspace ships an HTTP bridge client (a gateway sidecar owns the wire
//! protocol and the authenticated session) and an in-memory client for
//! tests.

pub mod client;
pub mod error;
pub mod http;
pub mod memory;
pub mod model;

pub use {
    client::ChatClient,
    error::{Error, ErrorClass, Result},
    http::HttpBridgeClient,
    memory::{MemoryClient, SentMessage},
    model::{
        AlbumItem, ChatInfo, DeletionEvent, ForwardOrigin, HistoryOrder, HistoryQuery, Media,
        MediaKind, MessageEntity, OutgoingAlbum, OutgoingMedia, OutgoingText, SourceMessage,
    },
};
