//! Protocol selection after the handshake
//!
//! The negotiated ALPN identifier decides which exchange stage is
//! installed. Negotiating the multiplexed protocol while it is disabled
//! fails the connection; silently downgrading would break the peer's
//! expectation of the wire protocol.

use tracing::trace;

use crate::stage::tls::ALPN_H2;
use crate::{EngineError, Result};

/// The exchange stage chosen for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectedProtocol {
    /// Sequential single-exchange stage
    Http1,
    /// Streaming-multiplexed stage
    Multiplexed,
}

/// Pick the stage for the negotiated protocol
///
/// Plaintext connections and handshakes without ALPN select HTTP/1.
///
/// # Errors
///
/// Returns [`EngineError::UnsupportedNegotiatedProtocol`] if the peer
/// negotiated the multiplexed protocol while multiplexing is disabled
pub fn select_protocol(alpn: Option<&[u8]>, multiplexing: bool) -> Result<SelectedProtocol> {
    let selected = match alpn {
        Some(proto) if proto == ALPN_H2 => {
            if !multiplexing {
                return Err(EngineError::UnsupportedNegotiatedProtocol(
                    String::from_utf8_lossy(proto).into_owned(),
                ));
            }
            SelectedProtocol::Multiplexed
        }
        _ => SelectedProtocol::Http1,
    };

    trace!(?selected, alpn = ?alpn.map(String::from_utf8_lossy), "protocol selected");
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::tls::ALPN_HTTP1;

    #[test]
    fn test_no_alpn_selects_http1() {
        assert_eq!(
            select_protocol(None, false).unwrap(),
            SelectedProtocol::Http1
        );
        assert_eq!(select_protocol(None, true).unwrap(), SelectedProtocol::Http1);
    }

    #[test]
    fn test_http1_alpn_selects_http1() {
        assert_eq!(
            select_protocol(Some(ALPN_HTTP1), true).unwrap(),
            SelectedProtocol::Http1
        );
    }

    #[test]
    fn test_h2_with_multiplexing_selects_multiplexed() {
        assert_eq!(
            select_protocol(Some(ALPN_H2), true).unwrap(),
            SelectedProtocol::Multiplexed
        );
    }

    #[test]
    fn test_h2_without_multiplexing_fails_connection() {
        let err = select_protocol(Some(ALPN_H2), false).unwrap_err();
        assert!(matches!(
            err,
            EngineError::UnsupportedNegotiatedProtocol(ref p) if p == "h2"
        ));
    }

    #[test]
    fn test_unknown_alpn_selects_http1() {
        assert_eq!(
            select_protocol(Some(b"spdy/3"), true).unwrap(),
            SelectedProtocol::Http1
        );
    }
}
