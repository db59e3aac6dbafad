//! TLS framing stage
//!
//! Builds the rustls acceptor from configured material and performs the
//! handshake under the connection's idle deadline, so a peer that never
//! completes the handshake cannot hold a connection slot past it.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::config::TlsOptions;
use crate::timer::{DeadlineMailbox, TimeoutKind};
use crate::{EngineError, Result};

/// ALPN identifier for the multiplexed protocol
pub const ALPN_H2: &[u8] = b"h2";
/// ALPN identifier for the sequential exchange protocol
pub const ALPN_HTTP1: &[u8] = b"http/1.1";

/// Build the acceptor for the configured TLS material
///
/// For PEM material the ALPN offer follows the multiplexing flag; a
/// preconfigured rustls config keeps its caller-owned offer list untouched.
///
/// # Errors
///
/// Returns error if certificate or key material cannot be loaded
pub fn build_acceptor(options: &TlsOptions, multiplexing: bool) -> Result<TlsAcceptor> {
    match options {
        TlsOptions::Pem { cert, key } => {
            let certs = load_certs(cert)?;
            let key = load_key(key)?;

            let mut config = rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .map_err(|e| EngineError::Config(format!("Invalid TLS material: {e}")))?;

            config.alpn_protocols = if multiplexing {
                vec![ALPN_H2.to_vec(), ALPN_HTTP1.to_vec()]
            } else {
                vec![ALPN_HTTP1.to_vec()]
            };

            Ok(TlsAcceptor::from(Arc::new(config)))
        }
        TlsOptions::Preconfigured(config) => Ok(TlsAcceptor::from(Arc::clone(config))),
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        EngineError::Config(format!("Cannot open certificate file {}: {e}", path.display()))
    })?;
    let certs: std::io::Result<Vec<_>> = rustls_pemfile::certs(&mut BufReader::new(file)).collect();
    let certs = certs
        .map_err(|e| EngineError::Config(format!("Invalid certificate PEM: {e}")))?;

    if certs.is_empty() {
        return Err(EngineError::Config(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        EngineError::Config(format!("Cannot open key file {}: {e}", path.display()))
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| EngineError::Config(format!("Invalid key PEM: {e}")))?
        .ok_or_else(|| {
            EngineError::Config(format!("No private key found in {}", path.display()))
        })
}

/// Drive the handshake to completion or fail when the idle deadline fires
///
/// The caller arms [`TimeoutKind::Idle`] before invoking; a fire during
/// the handshake surfaces as [`EngineError::IdleTimeout`] and the slot is
/// released by the normal close path.
///
/// # Errors
///
/// Returns error if the handshake fails or times out
pub async fn accept_with_deadline(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
    mailbox: &mut DeadlineMailbox,
) -> Result<TlsStream<TcpStream>> {
    tokio::select! {
        result = acceptor.accept(stream) => {
            let tls = result.map_err(|e| EngineError::Handshake(e.to_string()))?;
            debug!(
                alpn = ?tls.get_ref().1.alpn_protocol().map(String::from_utf8_lossy),
                "TLS handshake complete"
            );
            Ok(tls)
        }
        kind = mailbox.fired() => {
            debug!(?kind, "deadline fired during TLS handshake");
            Err(EngineError::IdleTimeout)
        }
    }
}
