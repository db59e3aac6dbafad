//! Application handler boundary
//!
//! The engine depends on exactly one collaborator contract: a function from
//! a parsed request to a response. Everything else (routing, content
//! negotiation, business logic) lives behind it.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use http::{Request, Response, StatusCode};

use crate::error::{BoxError, EngineError};
use crate::http1::{RequestBody, ResponseBody};

/// Async function from request to response, supplied by the caller
#[derive(Clone)]
pub struct Handler {
    inner: Arc<
        dyn Fn(Request<RequestBody>) -> BoxFuture<'static, Result<Response<ResponseBody>, BoxError>>
            + Send
            + Sync,
    >,
}

impl Handler {
    /// Wrap an async function as the application handler
    pub fn new<F, Fut, E>(f: F) -> Self
    where
        F: Fn(Request<RequestBody>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Response<ResponseBody>, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        Self {
            inner: Arc::new(move |req| {
                let fut = f(req);
                Box::pin(async move { fut.await.map_err(Into::into) })
            }),
        }
    }

    pub(crate) fn call(
        &self,
        req: Request<RequestBody>,
    ) -> BoxFuture<'static, Result<Response<ResponseBody>, BoxError>> {
        (self.inner)(req)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Handler")
    }
}

/// Maps a connection-scope failure to a best-effort response
///
/// Invoked for `HandlerFailure` while the response head has not been
/// written yet. Once headers are on the wire the connection is aborted
/// instead.
#[derive(Clone)]
pub struct ServiceErrorHandler {
    inner: Arc<dyn Fn(&EngineError) -> Response<ResponseBody> + Send + Sync>,
}

impl ServiceErrorHandler {
    /// Wrap a failure-to-response mapping
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&EngineError) -> Response<ResponseBody> + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    pub(crate) fn call(&self, err: &EngineError) -> Response<ResponseBody> {
        (self.inner)(err)
    }
}

impl Default for ServiceErrorHandler {
    fn default() -> Self {
        Self::new(|_err| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(ResponseBody::from("internal server error"))
                .expect("static response is valid")
        })
    }
}

impl fmt::Debug for ServiceErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ServiceErrorHandler")
    }
}

/// Driver for a multiplexed connection, supplied by the caller
///
/// The engine owns protocol selection; the multiplexed codec itself is an
/// external collaborator. After a handshake negotiates the multiplexed
/// protocol, the factory receives the handshaken stream and drives it to
/// completion.
#[derive(Clone)]
pub struct MuxFactory {
    inner: Arc<
        dyn Fn(
                tokio_rustls::server::TlsStream<tokio::net::TcpStream>,
                ConnectionContext,
            ) -> BoxFuture<'static, crate::Result<()>>
            + Send
            + Sync,
    >,
}

impl MuxFactory {
    /// Wrap a multiplexed connection driver
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(tokio_rustls::server::TlsStream<tokio::net::TcpStream>, ConnectionContext) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: std::future::Future<Output = crate::Result<()>> + Send + 'static,
    {
        Self {
            inner: Arc::new(move |io, ctx| Box::pin(f(io, ctx))),
        }
    }

    pub(crate) fn call(
        &self,
        io: tokio_rustls::server::TlsStream<tokio::net::TcpStream>,
        ctx: ConnectionContext,
    ) -> BoxFuture<'static, crate::Result<()>> {
        (self.inner)(io, ctx)
    }
}

impl fmt::Debug for MuxFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MuxFactory")
    }
}

/// The three timeout durations in effect for a connection
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Deadline for the full request head to arrive
    pub response_header: Duration,
    /// Deadline for the whole request-to-response span
    pub request: Duration,
    /// Deadline for an idle keep-alive connection
    pub idle: Duration,
}

/// TLS session info for a secure connection
#[derive(Debug, Clone)]
pub struct TlsInfo {
    /// Application protocol negotiated during the handshake, if any
    pub alpn_protocol: Option<Vec<u8>>,
    /// Negotiated TLS protocol version
    pub protocol_version: Option<rustls::ProtocolVersion>,
}

/// Per-connection record, created at accept time
///
/// Handed to the application through request extensions; a handler can
/// retrieve it with `request.extensions().get::<ConnectionContext>()`.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    /// Engine-unique connection id
    pub id: u64,
    /// Local socket address
    pub local_addr: SocketAddr,
    /// Remote socket address
    pub peer_addr: SocketAddr,
    /// TLS session info if the connection is secure
    pub tls: Option<TlsInfo>,
    /// Timeouts in effect for this connection
    pub timeouts: Timeouts,
}

impl ConnectionContext {
    /// Whether the connection is TLS-wrapped
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }
}
