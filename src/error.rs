use thiserror::Error;

/// Categorizes errors for recovery decision-making.
///
/// This is a lightweight, cloneable representation of the error type
/// that callers can match on without destructuring the full error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// WebSocket protocol or transport error
    WebSocket,
    /// A bounded wait (Hello/Ready) expired
    Timeout,
    /// The remote closed with a code that cannot be recovered from
    FatalClose,
    /// A frame could not be decoded (JSON, opcode, or inflate)
    Decode,
    /// Configuration or usage error
    Usage,
    /// Identify quota cannot cover the fleet
    Quota,
    /// Other error
    Other,
}

/// Errors that can occur in ws-gateway
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// `connect()` was called while the shard was not idle
    #[error("shard {id} is not idle")]
    NotIdle { id: u32 },

    /// A bounded wait for a gateway signal expired
    #[error("timed out after {waited_ms}ms waiting for {waiting}")]
    Timeout {
        waiting: &'static str,
        waited_ms: u64,
    },

    /// The gateway closed with an irrecoverable code
    #[error("fatal gateway close {code}: {reason}")]
    FatalClose { code: u16, reason: String },

    /// The connection was severed before the in-flight call completed
    #[error("connection closed while waiting for {waiting}")]
    ConnectionClosed { waiting: &'static str },

    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Streaming or one-shot inflate failure
    #[error("decompression error: {0}")]
    Decompression(String),

    /// The token was already set; it is write-once
    #[error("token has already been set and cannot be replaced")]
    TokenAlreadySet,

    /// An operation required a token but none was set
    #[error("no token has been set")]
    MissingToken,

    /// The identify quota cannot cover the whole fleet
    #[error(
        "cannot identify {required} shard(s): only {remaining} session start(s) remaining, \
         resets in {reset_after_ms}ms"
    )]
    InsufficientSessionStarts {
        remaining: u32,
        required: u32,
        reset_after_ms: u64,
    },

    /// A shard id was not found in the current shard plan
    #[error("unknown shard id {id}")]
    UnknownShard { id: u32 },

    /// Fetching gateway information from the injected source failed
    #[error("gateway information fetch failed: {0}")]
    GatewayInfo(String),

    /// Channel send error (shard task gone)
    #[error("channel send error: {0}")]
    ChannelSend(String),
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WebSocket(_) => ErrorKind::WebSocket,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::FatalClose { .. } => ErrorKind::FatalClose,
            Error::Json(_) | Error::Decompression(_) => ErrorKind::Decode,
            Error::NotIdle { .. }
            | Error::TokenAlreadySet
            | Error::MissingToken
            | Error::UnknownShard { .. } => ErrorKind::Usage,
            Error::InsufficientSessionStarts { .. } => ErrorKind::Quota,
            Error::ConnectionClosed { .. } | Error::GatewayInfo(_) | Error::ChannelSend(_) => {
                ErrorKind::Other
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::NotIdle { id: 0 }.kind(), ErrorKind::Usage);
        assert_eq!(
            Error::Timeout {
                waiting: "Hello",
                waited_ms: 100
            }
            .kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            Error::FatalClose {
                code: 4004,
                reason: "Authentication failed".into()
            }
            .kind(),
            ErrorKind::FatalClose
        );
        assert_eq!(
            Error::Decompression("truncated stream".into()).kind(),
            ErrorKind::Decode
        );
    }

    #[test]
    fn test_quota_error_message_includes_reset() {
        let err = Error::InsufficientSessionStarts {
            remaining: 1,
            required: 4,
            reset_after_ms: 12_000,
        };
        let msg = err.to_string();
        assert!(msg.contains("only 1 session start"));
        assert!(msg.contains("12000ms"));
    }
}
