//! Tagged-variant transport pipeline
//!
//! The stage chain is modelled as an enum over transports rather than a
//! stack of polymorphic stages: inserting the TLS framing stage means
//! constructing the `Tls` variant around the raw socket. Closing the value
//! tears down the whole chain exactly once.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

/// A connected duplex byte stream, plaintext or TLS-framed
pub enum Duplex {
    /// Raw TCP transport
    Plain(TcpStream),
    /// TLS framing stage wrapping the raw transport
    Tls(Box<TlsStream<TcpStream>>),
}

impl Duplex {
    /// Application protocol negotiated during the handshake, if any
    #[must_use]
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        match self {
            Duplex::Plain(_) => None,
            Duplex::Tls(tls) => tls.get_ref().1.alpn_protocol(),
        }
    }

    /// Whether the TLS framing stage is installed
    #[must_use]
    pub fn is_secure(&self) -> bool {
        matches!(self, Duplex::Tls(_))
    }
}

impl AsyncRead for Duplex {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Duplex::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Duplex::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Duplex {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Duplex::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Duplex::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Duplex::Plain(s) => Pin::new(s).poll_flush(cx),
            Duplex::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Duplex::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Duplex::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for Duplex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Duplex::Plain(_) => f.write_str("Duplex::Plain"),
            Duplex::Tls(_) => f.write_str("Duplex::Tls"),
        }
    }
}
