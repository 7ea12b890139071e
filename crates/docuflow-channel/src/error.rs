/*
[INPUT]:  Error sources (WebSocket transport, serialization, URLs)
[OUTPUT]: Structured error type with retry hints
[POS]:    Error handling layer - unified error type for the channel crate
[UPDATE]: When adding new error sources or improving error messages
*/

use thiserror::Error;

/// Main error type for the push channel
#[derive(Error, Debug)]
pub enum ChannelError {
    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parsing failed
    #[error("Invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),

    /// No connection is currently established
    #[error("Push channel not connected")]
    NotConnected,

    /// A connection is already established on this socket
    #[error("Push channel already connected")]
    AlreadyConnected,

    /// The outbound send queue has been closed
    #[error("Push channel send queue closed")]
    SendQueueClosed,
}

impl ChannelError {
    /// Check if the error is retryable by reconnecting
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChannelError::WebSocket(_)
                | ChannelError::NotConnected
                | ChannelError::SendQueueClosed
        )
    }
}

/// Result type alias for channel operations
pub type Result<T> = std::result::Result<T, ChannelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(ChannelError::WebSocket("reset by peer".to_string()).is_retryable());
        assert!(ChannelError::NotConnected.is_retryable());
        assert!(!ChannelError::AlreadyConnected.is_retryable());

        let parse_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(!ChannelError::Serialization(parse_err).is_retryable());
    }
}
