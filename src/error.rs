//! Error types for iwan-client

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

/// Every failure a caller of the client can observe.
///
/// The enum is `Clone` because one terminal error (a rejected handshake,
/// exhausted retries) is handed to every caller waiting on the connection.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Authentication rejected: {message}")]
    AuthRejected { code: Option<i64>, message: String },

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Client closed")]
    Closed,

    #[error("Remote error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
}

impl ClientError {
    /// Whether a failed connection attempt should be retried by the reconnector.
    ///
    /// Authentication rejections are never retried with the same credentials.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Network(_) | ClientError::Timeout(_))
    }

    /// Whether the error ends the client for good.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::AuthRejected { .. } | ClientError::Closed | ClientError::Config(_)
        )
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Json(Arc::new(e))
    }
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(Arc::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ClientError::Network("refused".into()).is_retryable());
        assert!(ClientError::Timeout("handshake".into()).is_retryable());
        assert!(!ClientError::AuthRejected {
            code: Some(401),
            message: "bad signature".into()
        }
        .is_retryable());
        assert!(!ClientError::ConnectionLost.is_retryable());
    }

    #[test]
    fn test_fatal_kinds() {
        assert!(ClientError::AuthRejected {
            code: None,
            message: "policy".into()
        }
        .is_fatal());
        assert!(ClientError::Closed.is_fatal());
        assert!(ClientError::Config("bad secret".into()).is_fatal());
        assert!(!ClientError::Network("refused".into()).is_fatal());
        assert!(!ClientError::Protocol("garbage".into()).is_fatal());
    }

    #[test]
    fn test_remote_error_display_keeps_code_and_message() {
        let err = ClientError::Remote {
            code: -32601,
            message: "Method not found".into(),
            data: None,
        };
        assert_eq!(err.to_string(), "Remote error -32601: Method not found");
    }

    #[test]
    fn test_json_error_converts() {
        let err: ClientError = serde_json::from_str::<Value>("{").unwrap_err().into();
        assert!(matches!(err, ClientError::Json(_)));
        // Clone shares the underlying error
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }
}
