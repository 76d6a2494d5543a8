//! Client error types.

use thiserror::Error;
use vellum_bson::Document;
use vellum_wire::WireError;

/// Client errors.
///
/// The variants keep failure kinds apart: transport failures
/// ([`ClientError::Io`], [`ClientError::ConnectionClosed`]), malformed
/// traffic ([`ClientError::Wire`], [`ClientError::UnexpectedReply`]),
/// correlation mistakes ([`ClientError::UnknownRequest`]), and failures
/// the server itself reported ([`ClientError::ServerError`],
/// [`ClientError::CursorNotFound`]).
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("no request with id {request_id} is awaiting a reply")]
    UnknownRequest { request_id: i32 },

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("server error {code} ({code_name}): {message}")]
    ServerError {
        code: i32,
        code_name: String,
        message: String,
    },

    #[error("cursor {cursor_id} is no longer known to the server")]
    CursorNotFound { cursor_id: i64 },

    #[error("cannot move {requested} documents, only {available} buffered")]
    CursorPosition { requested: usize, available: usize },

    #[error("incompatible server: {0}")]
    IncompatibleServer(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

impl ClientError {
    /// Returns whether retrying the operation on a fresh connection could
    /// succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_) | ClientError::Timeout | ClientError::ConnectionClosed
        )
    }

    /// Builds the error for a command reply whose `ok` field is not 1.
    pub(crate) fn from_command_failure(reply: &Document) -> ClientError {
        ClientError::ServerError {
            code: reply.get_integer("code").unwrap_or(0) as i32,
            code_name: reply.get_str("codeName").unwrap_or_default().to_string(),
            message: reply
                .get_str("errmsg")
                .unwrap_or("command failed")
                .to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_bson::doc;

    #[test]
    fn test_retryable_classification() {
        assert!(ClientError::Timeout.is_retryable());
        assert!(ClientError::ConnectionClosed.is_retryable());
        assert!(!ClientError::NotConnected.is_retryable());
        assert!(!ClientError::UnknownRequest { request_id: 3 }.is_retryable());
        assert!(!ClientError::Wire(WireError::NestedCompression).is_retryable());
    }

    #[test]
    fn test_from_command_failure() {
        let reply = doc! {
            "ok" => 0.0,
            "errmsg" => "ns not found",
            "code" => 26,
            "codeName" => "NamespaceNotFound",
        };
        match ClientError::from_command_failure(&reply) {
            ClientError::ServerError {
                code,
                code_name,
                message,
            } => {
                assert_eq!(code, 26);
                assert_eq!(code_name, "NamespaceNotFound");
                assert_eq!(message, "ns not found");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_from_command_failure_defaults() {
        let err = ClientError::from_command_failure(&doc! { "ok" => 0.0 });
        assert_eq!(
            err.to_string(),
            "server error 0 (): command failed"
        );
    }
}
