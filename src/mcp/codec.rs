//! Newline-delimited JSON-RPC framing.
//!
//! Each frame is one JSON value followed by `\n`. A line holding a JSON
//! array is a batch and is yielded element by element. A malformed line is
//! reported and skipped; the stream stays usable. Transport failures are
//! fatal.

use rust_mcp_schema::schema_utils::ServerMessage;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
const READ_CHUNK: usize = 8 * 1024;

/// A frame that could not be decoded. When the peer sent something that
/// looks like a request, its id and method are kept so the caller can still
/// answer it.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeError {
    pub detail: String,
    pub request_id: Option<Value>,
    pub method: Option<String>,
}

impl DecodeError {
    fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            request_id: None,
            method: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed frame: {}", .0.detail)]
    Decode(DecodeError),
    #[error("unable to encode frame: {0}")]
    Encode(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Writes one frame and its newline in a single write, then flushes.
    pub async fn send<T: Serialize + ?Sized>(&mut self, frame: &T) -> Result<(), CodecError> {
        let mut payload =
            serde_json::to_vec(frame).map_err(|err| CodecError::Encode(err.to_string()))?;
        payload.push(b'\n');
        self.inner.write_all(&payload).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

enum LineEvent {
    Line(Vec<u8>),
    Oversized,
    NeedMore,
}

/// Splits incoming bytes on `\n`, dropping a trailing `\r`. Lines longer
/// than the limit are reported once and discarded up to the next newline.
#[derive(Default)]
struct LineBuffer {
    buffer: Vec<u8>,
    discarding: bool,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    fn next_line(&mut self, max_len: usize) -> LineEvent {
        loop {
            match memchr::memchr(b'\n', &self.buffer) {
                Some(newline_index) => {
                    let mut line: Vec<u8> = self.buffer.drain(..=newline_index).collect();
                    line.pop();
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }
                    if line.len() > max_len {
                        return LineEvent::Oversized;
                    }
                    return LineEvent::Line(line);
                }
                None if self.buffer.len() > max_len => {
                    self.buffer.clear();
                    if self.discarding {
                        return LineEvent::NeedMore;
                    }
                    self.discarding = true;
                    return LineEvent::Oversized;
                }
                None => return LineEvent::NeedMore,
            }
        }
    }

    fn take_remainder(&mut self) -> Option<Vec<u8>> {
        if std::mem::take(&mut self.discarding) {
            self.buffer.clear();
            return None;
        }
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}

pub struct FrameReader<R> {
    inner: R,
    lines: LineBuffer,
    decoded: VecDeque<Result<ServerMessage, DecodeError>>,
    max_frame_bytes: usize,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_frame_bytes(inner, DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(inner: R, max_frame_bytes: usize) -> Self {
        Self {
            inner,
            lines: LineBuffer::default(),
            decoded: VecDeque::new(),
            max_frame_bytes,
            eof: false,
        }
    }

    /// Next decoded message, `Ok(None)` on clean end of stream.
    pub async fn next_frame(&mut self) -> Result<Option<ServerMessage>, CodecError> {
        loop {
            if let Some(frame) = self.decoded.pop_front() {
                return frame.map(Some).map_err(CodecError::Decode);
            }

            match self.lines.next_line(self.max_frame_bytes) {
                LineEvent::Line(line) => {
                    self.decode_line(&line);
                    continue;
                }
                LineEvent::Oversized => {
                    return Err(CodecError::Decode(DecodeError::new(format!(
                        "frame exceeds {} bytes",
                        self.max_frame_bytes
                    ))));
                }
                LineEvent::NeedMore => {}
            }

            if self.eof {
                match self.lines.take_remainder() {
                    Some(rest) => {
                        self.decode_line(&rest);
                        continue;
                    }
                    None => return Ok(None),
                }
            }

            let mut chunk = [0u8; READ_CHUNK];
            let read = self.inner.read(&mut chunk).await?;
            if read == 0 {
                self.eof = true;
            } else {
                self.lines.push(&chunk[..read]);
            }
        }
    }

    fn decode_line(&mut self, line: &[u8]) {
        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            return;
        }
        match serde_json::from_slice::<Value>(trimmed) {
            Ok(Value::Array(items)) if items.is_empty() => {
                self.decoded
                    .push_back(Err(DecodeError::new("empty batch")));
            }
            Ok(Value::Array(items)) => {
                for item in items {
                    self.decoded.push_back(decode_message(item));
                }
            }
            Ok(value) => self.decoded.push_back(decode_message(value)),
            Err(err) => self
                .decoded
                .push_back(Err(DecodeError::new(err.to_string()))),
        }
    }
}

fn decode_message(value: Value) -> Result<ServerMessage, DecodeError> {
    let request_id = value.get("id").filter(|id| !id.is_null()).cloned();
    let method = value
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_string);
    serde_json::from_value::<ServerMessage>(value).map_err(|err| DecodeError {
        detail: err.to_string(),
        request_id,
        method,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;

    async fn reader_over(bytes: &'static [u8]) -> FrameReader<&'static [u8]> {
        FrameReader::new(bytes)
    }

    fn response_id(message: &ServerMessage) -> Option<i64> {
        match message {
            ServerMessage::Response(response) => match &response.id {
                rust_mcp_schema::RequestId::Integer(id) => Some(*id),
                _ => None,
            },
            _ => None,
        }
    }

    #[tokio::test]
    async fn malformed_line_does_not_poison_the_stream() {
        let mut reader = reader_over(
            b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\
              {not json\n\
              \n\
              {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{}}\r\n",
        )
        .await;

        let first = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(response_id(&first), Some(1));
        assert!(matches!(
            reader.next_frame().await,
            Err(CodecError::Decode(_))
        ));
        let second = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(response_id(&second), Some(2));
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn batches_are_yielded_in_order() {
        let mut reader = reader_over(
            b"[{\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{}},{\"jsonrpc\":\"2.0\",\"id\":8,\"result\":{}}]\n",
        )
        .await;
        let first = reader.next_frame().await.unwrap().unwrap();
        let second = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(response_id(&first), Some(7));
        assert_eq!(response_id(&second), Some(8));
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unterminated_trailing_frame_is_decoded_at_eof() {
        let mut reader = reader_over(b"{\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{}}").await;
        let frame = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(response_id(&frame), Some(3));
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_line_is_skipped_up_to_newline() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut reader = FrameReader::with_max_frame_bytes(rx, 48);
        tokio::spawn(async move {
            tx.write_all(&[b'x'; 100]).await.unwrap();
            tx.write_all(b"\n{\"jsonrpc\":\"2.0\",\"id\":4,\"result\":{}}\n")
                .await
                .unwrap();
        });

        assert!(matches!(
            reader.next_frame().await,
            Err(CodecError::Decode(_))
        ));
        let frame = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(response_id(&frame), Some(4));
    }

    #[tokio::test]
    async fn writer_appends_newline() {
        let mut out = Vec::<u8>::new();
        {
            let mut writer = FrameWriter::new(&mut out);
            writer.send(&json!({"jsonrpc": "2.0", "method": "ping"})).await.unwrap();
        }
        assert_eq!(out.last(), Some(&b'\n'));
        assert_eq!(out.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[test]
    fn decode_error_keeps_request_identity() {
        let err = decode_message(json!({"jsonrpc": "2.0", "id": 9, "method": 5})).unwrap_err();
        assert_eq!(err.request_id, Some(json!(9)));
        assert!(err.method.is_none());
    }
}
