//! Error types for the mesh identity and transport layer

use hyper::StatusCode;
use std::fmt;
use thiserror::Error;

/// Classification of an outbound transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// The call did not complete before its deadline
    Timeout,
    /// The peer actively refused the connection
    Refused,
    /// The TLS handshake failed (bad certificate, untrusted peer, ...)
    Handshake,
    /// Any other transport-level failure
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Refused => "refused",
            TransportErrorKind::Handshake => "handshake",
            TransportErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// Main error type for mesh operations
#[derive(Error, Debug)]
pub enum Error {
    /// The workload identity agent could not be reached or returned garbage
    #[error("Identity agent unreachable: {0}")]
    IdentityAgentUnreachable(String),

    /// No credential has been loaded yet and the caller cannot proceed without one
    #[error("Credentials not initialized")]
    CredentialsNotInitialized,

    /// Request body could not be decoded
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// Peer is not permitted to call this service
    #[error("Unauthorized: {}", .peer_id.as_deref().unwrap_or("none"))]
    Unauthorized {
        /// The rejected peer identity, if one was presented
        peer_id: Option<String>,
    },

    /// The business-logic callback failed
    #[error("{0}")]
    CallbackFailure(String),

    /// Outbound transport failure
    #[error("Transport error ({kind}): {cause}")]
    Transport {
        /// Failure class
        kind: TransportErrorKind,
        /// Human-readable cause
        cause: String,
    },

    /// SPIFFE ID validation failed
    #[error("Invalid SPIFFE ID: {0}")]
    InvalidSpiffeId(String),

    /// Identity material from the agent could not be normalized
    #[error("Invalid identity document: {0}")]
    InvalidIdentity(String),

    /// Trust bundle validation failed
    #[error("Trust bundle validation failed: {0}")]
    TrustBundleError(String),

    /// TLS configuration error
    #[error("TLS configuration error: {0}")]
    TlsError(String),

    /// Listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Address we tried to bind
        addr: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Configuration rejected
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Network or I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing error
    #[error("URL parse error: {0}")]
    UrlError(#[from] url::ParseError),

    /// JSON encoding or decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an InvalidSpiffeId error with detailed message
    pub fn invalid_spiffe_id(msg: impl Into<String>) -> Self {
        Self::InvalidSpiffeId(msg.into())
    }

    /// Create an InvalidIdentity error with detailed message
    pub fn invalid_identity(msg: impl Into<String>) -> Self {
        Self::InvalidIdentity(msg.into())
    }

    /// Create a TlsError with detailed message
    pub fn tls_error(msg: impl Into<String>) -> Self {
        Self::TlsError(msg.into())
    }

    /// Create an IdentityAgentUnreachable error with detailed message
    pub fn agent_error(msg: impl Into<String>) -> Self {
        Self::IdentityAgentUnreachable(msg.into())
    }

    /// Create a Transport error
    pub fn transport(kind: TransportErrorKind, cause: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            cause: cause.into(),
        }
    }

    /// HTTP status class used when this error is returned to an inbound caller
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::MalformedRequest(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized { .. } => StatusCode::FORBIDDEN,
            Error::CredentialsNotInitialized => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the identity refresher should try again after this failure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::IdentityAgentUnreachable(_) | Error::Io(_) | Error::Transport { .. }
        )
    }

    /// The transport failure class, if this is a transport error
    pub fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            Error::Transport { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            Error::MalformedRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Unauthorized { peer_id: None }.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::CallbackFailure("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            Error::CredentialsNotInitialized.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_unauthorized_message_includes_peer() {
        let err = Error::Unauthorized {
            peer_id: Some("spiffe://example.org/evil".into()),
        };
        assert_eq!(err.to_string(), "Unauthorized: spiffe://example.org/evil");

        let err = Error::Unauthorized { peer_id: None };
        assert_eq!(err.to_string(), "Unauthorized: none");
    }

    #[test]
    fn test_callback_failure_message_is_verbatim() {
        let err = Error::CallbackFailure("database offline".into());
        assert_eq!(err.to_string(), "database offline");
    }

    #[test]
    fn test_retryable() {
        assert!(Error::agent_error("socket gone").is_retryable());
        assert!(!Error::invalid_identity("key mismatch").is_retryable());
        assert!(!Error::CredentialsNotInitialized.is_retryable());
    }

    #[test]
    fn test_transport_kind() {
        let err = Error::transport(TransportErrorKind::Timeout, "deadline elapsed");
        assert_eq!(err.transport_kind(), Some(TransportErrorKind::Timeout));
        assert!(err.to_string().contains("timeout"));
        assert_eq!(Error::CredentialsNotInitialized.transport_kind(), None);
    }
}
