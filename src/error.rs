//! Error types for Hearth

use std::io;
use thiserror::Error;

/// Result type for Hearth operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Boxed error produced by application handlers
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while driving a connection or the engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The request head could not be parsed
    #[error("Malformed request line or header block")]
    MalformedRequestLine,

    /// Request line exceeded the configured limit
    #[error("Request line too long: exceeds limit of {limit} bytes")]
    RequestLineTooLong {
        /// Configured request line limit
        limit: usize,
    },

    /// Header block exceeded the configured limit
    #[error("Headers too large: exceed limit of {limit} bytes")]
    HeadersTooLarge {
        /// Configured header block limit
        limit: usize,
    },

    /// Collected request body exceeded the caller's limit
    #[error("Body too large: exceeds limit of {limit} bytes")]
    BodyTooLarge {
        /// Caller-supplied collection limit
        limit: usize,
    },

    /// TLS handshake failed
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// TLS negotiated a protocol the configuration does not allow
    #[error("Unsupported negotiated protocol: {0}")]
    UnsupportedNegotiatedProtocol(String),

    /// The request head did not arrive before the response header deadline
    #[error("Response header timeout")]
    ResponseHeaderTimeout,

    /// The full exchange did not complete before the request deadline
    #[error("Request timeout")]
    RequestTimeout,

    /// The connection sat idle past the idle deadline (normal reclamation,
    /// not a failure)
    #[error("Idle timeout")]
    IdleTimeout,

    /// Application handler fault
    #[error("Handler failure: {0}")]
    Handler(#[source] BoxError),

    /// Connection refused by the admission cap
    #[error("Admission rejected: {active} of {limit} connection slots in use")]
    AdmissionRejected {
        /// Connections active at rejection time
        active: usize,
        /// Configured connection cap
        limit: usize,
    },

    /// Peer closed the transport mid-exchange
    #[error("Transport closed by peer")]
    TransportClosed,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Whether this error is a normal close rather than a failure
    #[must_use]
    pub fn is_normal_close(&self) -> bool {
        matches!(self, EngineError::IdleTimeout)
    }

    /// Whether this error is one of the three connection timeout classes
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            EngineError::ResponseHeaderTimeout
                | EngineError::RequestTimeout
                | EngineError::IdleTimeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_timeout_is_normal_close() {
        assert!(EngineError::IdleTimeout.is_normal_close());
        assert!(!EngineError::RequestTimeout.is_normal_close());
    }

    #[test]
    fn test_timeout_classification() {
        assert!(EngineError::ResponseHeaderTimeout.is_timeout());
        assert!(EngineError::RequestTimeout.is_timeout());
        assert!(EngineError::IdleTimeout.is_timeout());
        assert!(!EngineError::TransportClosed.is_timeout());
    }
}
