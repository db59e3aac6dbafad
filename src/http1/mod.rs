//! HTTP/1 exchange stage
//!
//! Owns one connection's request/response lifecycle: bounded head parsing,
//! the three timeout classes, dispatch into the application handler,
//! response serialization with backpressure, and keep-alive.

mod body;
pub mod parse;

pub use body::{RequestBody, ResponseBody};

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use futures_util::{FutureExt, StreamExt};
use http::header::{CONNECTION, CONTENT_LENGTH, DATE, EXPECT, SERVER, TRANSFER_ENCODING};
use http::{HeaderValue, Request, Response, StatusCode, Version};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::config::ServerOptions;
use crate::handler::ConnectionContext;
use crate::stage::Duplex;
use crate::timer::{DeadlineMailbox, TimeoutKind};
use crate::{EngineError, Result};

use body::{encode_chunk, BodyDecoder, LAST_CHUNK};
use parse::{body_framing, parse_head, scan_head, wants_keep_alive, BodyFraming, HeadScan};

/// Read granularity for the connection buffer
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Bound on the best-effort farewell write after a failure
const FAREWELL_WRITE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

const SERVER_ID: &str = concat!("hearth/", env!("CARGO_PKG_VERSION"));

/// Lifecycle state of one connection's exchange machine
///
/// Exactly one instance exists per live connection and transitions are
/// serialized on the connection's task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Reading bytes until a complete request line arrives
    AwaitingRequestLine,
    /// Request line seen, accumulating the header block
    ParsingHeaders,
    /// Head parsed, request being handed to the application
    DispatchingBody,
    /// Waiting for the application handler to yield a response
    AwaitingApplicationResponse,
    /// Serializing the response through the pipeline
    WritingResponse,
    /// Keep-alive connection waiting for the next request
    Idle,
    /// All stage resources released
    Closed,
}

/// The sequential single-exchange stage for one connection
pub(crate) struct Http1Exchange {
    io: Duplex,
    buf: BytesMut,
    ctx: ConnectionContext,
    options: Arc<ServerOptions>,
    mailbox: DeadlineMailbox,
    state: ExchangeState,
}

impl Http1Exchange {
    pub(crate) fn new(
        io: Duplex,
        ctx: ConnectionContext,
        options: Arc<ServerOptions>,
        mailbox: DeadlineMailbox,
    ) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            ctx,
            options,
            mailbox,
            state: ExchangeState::AwaitingRequestLine,
        }
    }

    /// Drive exchanges until the connection closes or a timeout fires
    ///
    /// All stage resources are released exactly once on return.
    pub(crate) async fn run(mut self) -> Result<()> {
        let result = self.drive().await;
        self.transition(ExchangeState::Closed);
        self.mailbox.disarm_all();
        let _ = self.io.shutdown().await;
        result
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            let keep = self.one_exchange().await?;
            if !keep {
                return Ok(());
            }

            self.transition(ExchangeState::Idle);
            // pipelined bytes already buffered skip the idle wait
            if self.buf.is_empty() {
                self.mailbox
                    .arm(TimeoutKind::Idle, self.ctx.timeouts.idle);
                tokio::select! {
                    result = read_some(&mut self.io, &mut self.buf) => {
                        if result? == 0 {
                            return Ok(()); // peer closed between exchanges
                        }
                    }
                    _ = self.mailbox.fired() => {
                        return Err(EngineError::IdleTimeout);
                    }
                }
                self.mailbox.disarm(TimeoutKind::Idle);
            }
        }
    }

    /// Run one request/response cycle; returns whether to keep the
    /// connection for another
    async fn one_exchange(&mut self) -> Result<bool> {
        self.transition(ExchangeState::AwaitingRequestLine);
        self.mailbox.arm(
            TimeoutKind::ResponseHeader,
            self.ctx.timeouts.response_header,
        );
        self.mailbox.arm(TimeoutKind::Request, self.ctx.timeouts.request);

        let head_end = loop {
            match scan_head(
                &self.buf,
                self.options.max_request_line_len,
                self.options.max_headers_len,
            ) {
                HeadScan::Complete { head_end } => break head_end,
                HeadScan::LineOverflow => {
                    return self
                        .refuse(
                            StatusCode::URI_TOO_LONG,
                            EngineError::RequestLineTooLong {
                                limit: self.options.max_request_line_len,
                            },
                        )
                        .await;
                }
                HeadScan::HeadersOverflow => {
                    return self
                        .refuse(
                            StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                            EngineError::HeadersTooLarge {
                                limit: self.options.max_headers_len,
                            },
                        )
                        .await;
                }
                HeadScan::Partial { line_seen } => {
                    if line_seen && self.state == ExchangeState::AwaitingRequestLine {
                        self.transition(ExchangeState::ParsingHeaders);
                    }
                    tokio::select! {
                        result = read_some(&mut self.io, &mut self.buf) => {
                            if result? == 0 {
                                if self.buf.is_empty() {
                                    return Ok(false); // peer never sent a request
                                }
                                return Err(EngineError::TransportClosed);
                            }
                        }
                        kind = self.mailbox.fired() => {
                            return self.timed_out(kind).await;
                        }
                    }
                }
            }
        };
        self.mailbox.disarm(TimeoutKind::ResponseHeader);

        let head = self.buf.split_to(head_end);
        let parsed = match parse_head(&head) {
            Ok(req) => req,
            Err(e) => {
                let status = match &e {
                    EngineError::HeadersTooLarge { .. } => {
                        StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
                    }
                    _ => StatusCode::BAD_REQUEST,
                };
                return self.refuse(status, e).await;
            }
        };
        let framing = match body_framing(&parsed) {
            Ok(f) => f,
            Err(e) => return self.refuse(StatusCode::BAD_REQUEST, e).await,
        };
        let request_keep_alive = wants_keep_alive(parsed.version(), parsed.headers());
        let is_head = parsed.method() == http::Method::HEAD;
        let version = parsed.version();

        if version == Version::HTTP_11 && wants_continue(&parsed) {
            write_guarded(
                &mut self.io,
                &mut self.mailbox,
                b"HTTP/1.1 100 Continue\r\n\r\n",
            )
            .await?;
        }

        self.transition(ExchangeState::DispatchingBody);
        let content_length = match framing {
            BodyFraming::ContentLength(n) => Some(n),
            _ => None,
        };
        let capacity = (self.options.chunk_buffer_max_size / READ_CHUNK_SIZE).max(1);
        let (body_tx, request_body) = RequestBody::channel(capacity, content_length);
        let mut decoder = BodyDecoder::new(framing);
        let mut body_tx = if decoder.is_done() {
            None
        } else {
            Some(body_tx)
        };

        let (mut parts, ()) = parsed.into_parts();
        parts.extensions.insert(self.ctx.clone());
        let request = Request::from_parts(parts, request_body);

        trace!(
            connection = self.ctx.id,
            method = %request.method(),
            target = %request.uri(),
            "dispatching request"
        );

        let handler_fut = AssertUnwindSafe(self.options.handler.call(request)).catch_unwind();
        tokio::pin!(handler_fut);

        self.transition(ExchangeState::AwaitingApplicationResponse);
        let mut handler_failed = false;
        let response: Response<ResponseBody> = loop {
            tokio::select! {
                outcome = handler_fut.as_mut() => {
                    match outcome {
                        Ok(Ok(response)) => break response,
                        Ok(Err(e)) => {
                            let err = EngineError::Handler(e);
                            warn!(connection = self.ctx.id, error = %err, "handler failed");
                            handler_failed = true;
                            break self.options.error_handler.call(&err);
                        }
                        Err(panic) => {
                            let err = EngineError::Handler(describe_panic(panic.as_ref()).into());
                            warn!(connection = self.ctx.id, error = %err, "handler panicked");
                            handler_failed = true;
                            break self.options.error_handler.call(&err);
                        }
                    }
                }
                kind = self.mailbox.fired() => {
                    // abandon the in-flight handler; its eventual result is
                    // discarded, never forcibly interrupted
                    return self.timed_out(kind).await;
                }
                step = body_step(&mut self.io, &mut self.buf, &mut decoder, &mut body_tx),
                        if body_tx.is_some() => {
                    step?;
                }
            }
        };

        self.transition(ExchangeState::WritingResponse);
        let keep = write_response(
            &mut self.io,
            &mut self.mailbox,
            response,
            version,
            is_head,
            request_keep_alive && !handler_failed,
        )
        .await?;
        self.mailbox.disarm(TimeoutKind::Request);

        if !keep {
            return Ok(false);
        }
        self.drain_residual_body(&mut decoder).await
    }

    /// Discard any unread request body so the next head starts clean
    ///
    /// Gives up (closing the connection) past the buffer cap or the idle
    /// deadline rather than draining an unbounded or stalled body.
    async fn drain_residual_body(&mut self, decoder: &mut BodyDecoder) -> Result<bool> {
        if decoder.is_done() {
            return Ok(true);
        }

        self.mailbox.arm(TimeoutKind::Idle, self.ctx.timeouts.idle);
        let mut drained = 0usize;
        loop {
            loop {
                match decoder.decode(&mut self.buf) {
                    Ok(Some(chunk)) => {
                        drained += chunk.len();
                        if drained > self.options.chunk_buffer_max_size {
                            return Ok(false);
                        }
                    }
                    Ok(None) => break,
                    Err(_) => return Ok(false),
                }
            }
            if decoder.is_done() {
                break;
            }
            tokio::select! {
                result = read_some(&mut self.io, &mut self.buf) => {
                    if result? == 0 {
                        return Ok(false);
                    }
                }
                _ = self.mailbox.fired() => {
                    return Ok(false);
                }
            }
        }
        self.mailbox.disarm(TimeoutKind::Idle);
        Ok(true)
    }

    /// Refuse the exchange with a minimal error response, then fail
    async fn refuse(&mut self, status: StatusCode, err: EngineError) -> Result<bool> {
        debug!(connection = self.ctx.id, error = %err, %status, "refusing request");
        self.transition(ExchangeState::WritingResponse);
        self.write_minimal(status).await;
        Err(err)
    }

    /// Handle a fired deadline: synthesize an unavailable response when the
    /// protocol state still permits, then fail the connection
    async fn timed_out(&mut self, kind: TimeoutKind) -> Result<bool> {
        let err = kind_error(kind);
        if !err.is_normal_close() {
            self.write_minimal(StatusCode::SERVICE_UNAVAILABLE).await;
        }
        Err(err)
    }

    /// Best-effort minimal response; never used once real headers are sent
    async fn write_minimal(&mut self, status: StatusCode) {
        let mut head = BytesMut::with_capacity(128);
        write_status_line(&mut head, status);
        head.extend_from_slice(b"content-length: 0\r\nconnection: close\r\ndate: ");
        head.extend_from_slice(httpdate::fmt_http_date(SystemTime::now()).as_bytes());
        head.extend_from_slice(b"\r\n\r\n");

        let _ = tokio::time::timeout(FAREWELL_WRITE_TIMEOUT, async {
            self.io.write_all(&head).await?;
            self.io.flush().await
        })
        .await;
    }

    fn transition(&mut self, next: ExchangeState) {
        trace!(
            connection = self.ctx.id,
            from = ?self.state,
            to = ?next,
            "exchange state"
        );
        self.state = next;
    }
}

/// Read more bytes into the connection buffer
async fn read_some(io: &mut Duplex, buf: &mut BytesMut) -> Result<usize> {
    buf.reserve(READ_CHUNK_SIZE);
    let n = io.read_buf(buf).await?;
    Ok(n)
}

/// Advance request body decoding by one unit: yield a decoded chunk to the
/// handler, or pull more bytes from the transport
async fn body_step(
    io: &mut Duplex,
    buf: &mut BytesMut,
    decoder: &mut BodyDecoder,
    tx: &mut Option<mpsc::Sender<Result<Bytes>>>,
) -> Result<()> {
    if let Some(chunk) = decoder.decode(buf)? {
        if let Some(sender) = tx {
            if sender.send(Ok(chunk)).await.is_err() {
                // handler dropped the body; leave the rest for the drain
                *tx = None;
            }
        }
    } else if !decoder.is_done() {
        let n = read_some(io, buf).await?;
        if n == 0 {
            return Err(EngineError::TransportClosed);
        }
    }
    if decoder.is_done() {
        // dropping the sender is body EOF for the handler
        *tx = None;
    }
    Ok(())
}

fn wants_continue(req: &Request<()>) -> bool {
    req.headers()
        .get(EXPECT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("100-continue"))
        .unwrap_or(false)
}

fn describe_panic(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

fn kind_error(kind: TimeoutKind) -> EngineError {
    match kind {
        TimeoutKind::ResponseHeader => EngineError::ResponseHeaderTimeout,
        TimeoutKind::Request => EngineError::RequestTimeout,
        TimeoutKind::Idle => EngineError::IdleTimeout,
    }
}

/// Write and flush, racing the armed deadlines
async fn write_guarded(
    io: &mut Duplex,
    mailbox: &mut DeadlineMailbox,
    bytes: &[u8],
) -> Result<()> {
    tokio::select! {
        result = async {
            io.write_all(bytes).await?;
            io.flush().await
        } => {
            result?;
            Ok(())
        }
        kind = mailbox.fired() => Err(kind_error(kind)),
    }
}

fn write_status_line(out: &mut BytesMut, status: StatusCode) {
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(status.as_str().as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// Serialize the response head and stream the body with backpressure
///
/// Framing is content-length when the body declares one, chunked
/// otherwise. Returns whether keep-alive framing was selected.
async fn write_response(
    io: &mut Duplex,
    mailbox: &mut DeadlineMailbox,
    response: Response<ResponseBody>,
    request_version: Version,
    is_head: bool,
    allow_keep_alive: bool,
) -> Result<bool> {
    let (parts, body) = response.into_parts();
    let status = parts.status;
    let mut headers = parts.headers;

    let response_close = headers.get_all(CONNECTION).iter().any(|v| {
        v.to_str()
            .map(|s| s.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
            .unwrap_or(false)
    });
    let keep = allow_keep_alive && !response_close;

    let bodyless_status = status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED;

    let mut chunked = false;
    if !bodyless_status {
        match body.len() {
            Some(len) => {
                if !headers.contains_key(CONTENT_LENGTH) {
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
                }
            }
            None => {
                // a stream with a declared length is written raw
                if !headers.contains_key(CONTENT_LENGTH) {
                    headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                    chunked = true;
                }
            }
        }
    }

    if !keep {
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
    } else if request_version == Version::HTTP_10 {
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    }
    if !headers.contains_key(DATE) {
        let date = httpdate::fmt_http_date(SystemTime::now());
        if let Ok(value) = HeaderValue::from_str(&date) {
            headers.insert(DATE, value);
        }
    }
    if !headers.contains_key(SERVER) {
        headers.insert(SERVER, HeaderValue::from_static(SERVER_ID));
    }

    let mut head = BytesMut::with_capacity(256);
    write_status_line(&mut head, status);
    for (name, value) in headers.iter() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    write_guarded(io, mailbox, &head).await?;

    if is_head || bodyless_status {
        return Ok(keep);
    }

    match body {
        ResponseBody::Empty => {}
        ResponseBody::Full(bytes) => {
            if !bytes.is_empty() {
                write_guarded(io, mailbox, &bytes).await?;
            }
        }
        ResponseBody::Stream(mut stream) => {
            loop {
                let item = tokio::select! {
                    item = stream.next() => item,
                    kind = mailbox.fired() => return Err(kind_error(kind)),
                };
                let Some(item) = item else { break };
                let chunk = item.map_err(EngineError::Handler)?;
                if chunk.is_empty() {
                    continue; // an empty chunk would terminate chunked framing
                }
                if chunked {
                    let mut framed = BytesMut::with_capacity(chunk.len() + 16);
                    encode_chunk(&mut framed, &chunk);
                    write_guarded(io, mailbox, &framed).await?;
                } else {
                    write_guarded(io, mailbox, &chunk).await?;
                }
            }
            if chunked {
                write_guarded(io, mailbox, LAST_CHUNK).await?;
            }
        }
    }

    Ok(keep)
}
