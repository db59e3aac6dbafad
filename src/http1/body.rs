//! Request and response bodies
//!
//! Request bodies are lazy: the connection task decodes wire framing and
//! feeds chunks through a bounded channel the handler pulls from, so no
//! more than the configured buffer of body bytes is ever held in memory.

use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use tokio::sync::mpsc;

use crate::error::BoxError;
use crate::{EngineError, Result};

use super::parse::BodyFraming;

/// Guard against absurd chunk-size lines
const MAX_CHUNK_LINE: usize = 256;

/// Lazily-consumed request body
///
/// Chunks arrive in wire order; `None` marks the end of the body.
pub struct RequestBody {
    rx: mpsc::Receiver<Result<Bytes>>,
    content_length: Option<u64>,
}

impl RequestBody {
    pub(crate) fn channel(
        capacity: usize,
        content_length: Option<u64>,
    ) -> (mpsc::Sender<Result<Bytes>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            tx,
            Self {
                rx,
                content_length,
            },
        )
    }

    /// A body with no bytes
    #[must_use]
    pub fn empty() -> Self {
        let (_tx, rx) = mpsc::channel(1);
        Self {
            rx,
            content_length: Some(0),
        }
    }

    /// Declared content length, if the request carried one
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Next body chunk, or `None` once the body is fully consumed
    pub async fn chunk(&mut self) -> Option<Result<Bytes>> {
        self.rx.recv().await
    }

    /// Collect the whole body, failing if it exceeds `limit` bytes
    ///
    /// # Errors
    ///
    /// Returns error if the body is larger than `limit` or the transport
    /// fails mid-body
    pub async fn bytes(mut self, limit: usize) -> Result<Bytes> {
        let mut collected = BytesMut::new();
        while let Some(chunk) = self.chunk().await {
            let chunk = chunk?;
            if collected.len() + chunk.len() > limit {
                return Err(EngineError::BodyTooLarge { limit });
            }
            collected.extend_from_slice(&chunk);
        }
        Ok(collected.freeze())
    }
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBody")
            .field("content_length", &self.content_length)
            .finish()
    }
}

/// Incremental decoder for the request body wire framing
#[derive(Debug)]
pub(crate) enum BodyDecoder {
    Length { remaining: u64 },
    Chunked { state: ChunkState },
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkState {
    Size,
    Data { remaining: u64 },
    DataEnd,
    Trailer,
}

impl BodyDecoder {
    pub(crate) fn new(framing: BodyFraming) -> Self {
        match framing {
            BodyFraming::None | BodyFraming::ContentLength(0) => BodyDecoder::Done,
            BodyFraming::ContentLength(n) => BodyDecoder::Length { remaining: n },
            BodyFraming::Chunked => BodyDecoder::Chunked {
                state: ChunkState::Size,
            },
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(self, BodyDecoder::Done)
    }

    /// Consume framed body bytes from `buf`, yielding at most one chunk
    ///
    /// Returns `None` when more wire bytes are needed or the body is done.
    ///
    /// # Errors
    ///
    /// Returns error on malformed chunked framing
    pub(crate) fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        match self {
            BodyDecoder::Done => Ok(None),
            BodyDecoder::Length { remaining } => {
                if buf.is_empty() {
                    return Ok(None);
                }
                let take = (*remaining).min(buf.len() as u64) as usize;
                let chunk = buf.split_to(take).freeze();
                *remaining -= take as u64;
                if *remaining == 0 {
                    *self = BodyDecoder::Done;
                }
                Ok(Some(chunk))
            }
            BodyDecoder::Chunked { state } => loop {
                match *state {
                    ChunkState::Size => {
                        let Some(nl) = buf.iter().position(|&b| b == b'\n') else {
                            if buf.len() > MAX_CHUNK_LINE {
                                return Err(EngineError::MalformedRequestLine);
                            }
                            return Ok(None);
                        };
                        let line = buf.split_to(nl + 1);
                        let size = parse_chunk_size(&line)?;
                        if size == 0 {
                            *state = ChunkState::Trailer;
                        } else {
                            *state = ChunkState::Data { remaining: size };
                        }
                    }
                    ChunkState::Data { remaining } => {
                        if buf.is_empty() {
                            return Ok(None);
                        }
                        let take = remaining.min(buf.len() as u64) as usize;
                        let chunk = buf.split_to(take).freeze();
                        let left = remaining - take as u64;
                        *state = if left == 0 {
                            ChunkState::DataEnd
                        } else {
                            ChunkState::Data { remaining: left }
                        };
                        return Ok(Some(chunk));
                    }
                    ChunkState::DataEnd => {
                        let Some(nl) = buf.iter().position(|&b| b == b'\n') else {
                            if buf.len() > 2 {
                                return Err(EngineError::MalformedRequestLine);
                            }
                            return Ok(None);
                        };
                        let line = buf.split_to(nl + 1);
                        if !(line.as_ref() == b"\r\n" || line.as_ref() == b"\n") {
                            return Err(EngineError::MalformedRequestLine);
                        }
                        *state = ChunkState::Size;
                    }
                    ChunkState::Trailer => {
                        let Some(nl) = buf.iter().position(|&b| b == b'\n') else {
                            if buf.len() > MAX_CHUNK_LINE {
                                return Err(EngineError::MalformedRequestLine);
                            }
                            return Ok(None);
                        };
                        let line = buf.split_to(nl + 1);
                        let is_blank = line.as_ref() == b"\r\n" || line.as_ref() == b"\n";
                        if is_blank {
                            *self = BodyDecoder::Done;
                            return Ok(None);
                        }
                        // discard trailer field line, keep scanning
                    }
                }
            },
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| EngineError::MalformedRequestLine)?
        .trim_end_matches(['\r', '\n']);
    // chunk extensions after ';' are ignored
    let size_text = text.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size_text, 16).map_err(|_| EngineError::MalformedRequestLine)
}

/// Response body producer
pub enum ResponseBody {
    /// No body bytes
    Empty,
    /// Complete in-memory body
    Full(Bytes),
    /// Streamed body; framed chunked unless the response declares a length
    Stream(BoxStream<'static, std::result::Result<Bytes, BoxError>>),
}

impl ResponseBody {
    /// A body with no bytes
    #[must_use]
    pub fn empty() -> Self {
        ResponseBody::Empty
    }

    /// A complete in-memory body
    pub fn full(bytes: impl Into<Bytes>) -> Self {
        ResponseBody::Full(bytes.into())
    }

    /// A streamed body
    pub fn stream<S>(stream: S) -> Self
    where
        S: futures_util::Stream<Item = std::result::Result<Bytes, BoxError>> + Send + 'static,
    {
        ResponseBody::Stream(Box::pin(stream))
    }

    /// Body length when known up front
    #[must_use]
    pub fn len(&self) -> Option<u64> {
        match self {
            ResponseBody::Empty => Some(0),
            ResponseBody::Full(bytes) => Some(bytes.len() as u64),
            ResponseBody::Stream(_) => None,
        }
    }

    /// Whether the body is known to be empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

impl From<&'static str> for ResponseBody {
    fn from(s: &'static str) -> Self {
        ResponseBody::Full(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for ResponseBody {
    fn from(s: String) -> Self {
        ResponseBody::Full(Bytes::from(s))
    }
}

impl From<Vec<u8>> for ResponseBody {
    fn from(v: Vec<u8>) -> Self {
        ResponseBody::Full(Bytes::from(v))
    }
}

impl From<Bytes> for ResponseBody {
    fn from(b: Bytes) -> Self {
        ResponseBody::Full(b)
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("ResponseBody::Empty"),
            ResponseBody::Full(b) => write!(f, "ResponseBody::Full({} bytes)", b.len()),
            ResponseBody::Stream(_) => f.write_str("ResponseBody::Stream"),
        }
    }
}

/// Append one chunk in chunked transfer coding
pub(crate) fn encode_chunk(out: &mut BytesMut, chunk: &[u8]) {
    use std::fmt::Write;

    let mut size = String::with_capacity(10);
    write!(size, "{:X}\r\n", chunk.len()).expect("writing to String cannot fail");
    out.extend_from_slice(size.as_bytes());
    out.extend_from_slice(chunk);
    out.extend_from_slice(b"\r\n");
}

/// Terminating chunk of a chunked body
pub(crate) const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut BodyDecoder, input: &[u8]) -> Vec<Bytes> {
        let mut buf = BytesMut::from(input);
        let mut chunks = Vec::new();
        while let Some(chunk) = decoder.decode(&mut buf).unwrap() {
            chunks.push(chunk);
        }
        chunks
    }

    #[test]
    fn test_length_decoder() {
        let mut decoder = BodyDecoder::new(BodyFraming::ContentLength(5));
        let chunks = decode_all(&mut decoder, b"hello");
        assert_eq!(chunks, vec![Bytes::from_static(b"hello")]);
        assert!(decoder.is_done());
    }

    #[test]
    fn test_length_decoder_split_across_reads() {
        let mut decoder = BodyDecoder::new(BodyFraming::ContentLength(8));
        let first = decode_all(&mut decoder, b"hell");
        assert_eq!(first, vec![Bytes::from_static(b"hell")]);
        assert!(!decoder.is_done());

        let second = decode_all(&mut decoder, b"oops");
        assert_eq!(second, vec![Bytes::from_static(b"oops")]);
        assert!(decoder.is_done());
    }

    #[test]
    fn test_chunked_decoder() {
        let mut decoder = BodyDecoder::new(BodyFraming::Chunked);
        let chunks = decode_all(&mut decoder, b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n");
        assert_eq!(
            chunks,
            vec![Bytes::from_static(b"hello"), Bytes::from_static(b" world")]
        );
        assert!(decoder.is_done());
    }

    #[test]
    fn test_chunked_decoder_with_extension_and_trailer() {
        let mut decoder = BodyDecoder::new(BodyFraming::Chunked);
        let chunks = decode_all(
            &mut decoder,
            b"4;name=value\r\ndata\r\n0\r\nx-trailer: t\r\n\r\n",
        );
        assert_eq!(chunks, vec![Bytes::from_static(b"data")]);
        assert!(decoder.is_done());
    }

    #[test]
    fn test_chunked_decoder_malformed_size() {
        let mut decoder = BodyDecoder::new(BodyFraming::Chunked);
        let mut buf = BytesMut::from(&b"zz\r\ndata"[..]);
        assert!(decoder.decode(&mut buf).is_err());
    }

    #[test]
    fn test_empty_framings_are_done_immediately() {
        assert!(BodyDecoder::new(BodyFraming::None).is_done());
        assert!(BodyDecoder::new(BodyFraming::ContentLength(0)).is_done());
    }

    #[test]
    fn test_encode_chunk() {
        let mut out = BytesMut::new();
        encode_chunk(&mut out, b"hello world, this is a chunk");
        assert_eq!(&out[..4], b"1C\r\n");
        assert!(out.ends_with(b"\r\n"));
    }

    #[tokio::test]
    async fn test_request_body_channel() {
        let (tx, mut body) = RequestBody::channel(4, Some(5));
        tx.send(Ok(Bytes::from_static(b"hello"))).await.unwrap();
        drop(tx);

        assert_eq!(body.content_length(), Some(5));
        let chunk = body.chunk().await.unwrap().unwrap();
        assert_eq!(chunk, Bytes::from_static(b"hello"));
        assert!(body.chunk().await.is_none());
    }

    #[tokio::test]
    async fn test_request_body_bytes_limit() {
        let (tx, body) = RequestBody::channel(4, None);
        tx.send(Ok(Bytes::from_static(b"0123456789"))).await.unwrap();
        drop(tx);

        assert!(body.bytes(5).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_body() {
        let mut body = RequestBody::empty();
        assert!(body.chunk().await.is_none());
    }
}
