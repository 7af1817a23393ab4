use std::{error::Error as StdError, time::Duration};

pub type Result<T> = std::result::Result<T, Error>;

/// Typed platform errors. The retry policy decides on [`Error::class`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("rate limited, retry after {seconds}s")]
    RateLimited { seconds: u64 },

    #[error("slow mode active, retry after {seconds}s")]
    SlowMode { seconds: u64 },

    #[error("message id is invalid")]
    InvalidMessageId,

    #[error("chat is private or inaccessible")]
    ChatPrivate,

    #[error("writing to the chat is forbidden")]
    WriteForbidden,

    #[error("forwarding from the chat is restricted")]
    ForwardsRestricted,

    /// Any other error code reported by the platform.
    #[error("platform error {code}: {message}")]
    Api { code: String, message: String },

    /// Transport or decoding failure talking to the platform.
    #[error("platform request failed: {context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

/// How delivery should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Wait the signaled duration, then retry.
    Wait(Duration),
    /// Never retry this message on this target.
    Terminal,
    /// Retry with exponential backoff.
    Transient,
}

impl Error {
    #[must_use]
    pub fn api(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            code: code.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Map a bridge error code to its typed variant.
    #[must_use]
    pub fn from_code(code: &str, seconds: Option<u64>, message: Option<String>) -> Self {
        match code {
            "FLOOD_WAIT" => Self::RateLimited {
                seconds: seconds.unwrap_or(0),
            },
            "SLOWMODE_WAIT" => Self::SlowMode {
                seconds: seconds.unwrap_or(0),
            },
            "MESSAGE_ID_INVALID" => Self::InvalidMessageId,
            "CHANNEL_PRIVATE" => Self::ChatPrivate,
            "CHAT_WRITE_FORBIDDEN" => Self::WriteForbidden,
            "CHAT_FORWARDS_RESTRICTED" => Self::ForwardsRestricted,
            other => Self::api(other, message.unwrap_or_default()),
        }
    }

    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RateLimited { seconds } | Self::SlowMode { seconds } => {
                ErrorClass::Wait(Duration::from_secs(*seconds))
            },
            Self::InvalidMessageId
            | Self::ChatPrivate
            | Self::WriteForbidden
            | Self::ForwardsRestricted => ErrorClass::Terminal,
            Self::Api { .. } | Self::External { .. } | Self::Io(_) | Self::SerdeJson(_) => {
                ErrorClass::Transient
            },
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.class() == ErrorClass::Terminal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_classes() {
        assert_eq!(
            Error::from_code("FLOOD_WAIT", Some(42), None).class(),
            ErrorClass::Wait(Duration::from_secs(42))
        );
        assert_eq!(
            Error::from_code("SLOWMODE_WAIT", Some(7), None).class(),
            ErrorClass::Wait(Duration::from_secs(7))
        );
        for code in [
            "MESSAGE_ID_INVALID",
            "CHANNEL_PRIVATE",
            "CHAT_WRITE_FORBIDDEN",
            "CHAT_FORWARDS_RESTRICTED",
        ] {
            assert!(Error::from_code(code, None, None).is_terminal(), "{code}");
        }
        let other = Error::from_code("TIMEOUT", None, Some("slow".into()));
        assert_eq!(other.class(), ErrorClass::Transient);
        assert_eq!(other.to_string(), "platform error TIMEOUT: slow");
    }

    #[test]
    fn transport_errors_are_transient() {
        let err = Error::external("send", std::io::Error::other("reset"));
        assert_eq!(err.class(), ErrorClass::Transient);
    }
}
