//! Line splitting and `data:` event decoding for agent response streams.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use futures::StreamExt as _;
use futures::stream;
use tracing::debug;

use crate::errors::RelayError;
use crate::event::{EventKind, StreamEvent};

/// Boxed stream of decoded events for one invocation.
pub type EventStream =
    Pin<Box<dyn futures::Stream<Item = Result<StreamEvent, RelayError>> + Send + 'static>>;

/// Longest line accepted from a response body.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Splits arbitrary byte chunks into complete text lines.
pub struct LineSplitter {
    buf: Vec<u8>,
    /// Bytes of `buf` already known to hold no `\n`.
    scanned: usize,
    max_line: usize,
}

impl Default for LineSplitter {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl LineSplitter {
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_line,
        }
    }

    /// Appends a chunk and returns every line it completed, without the
    /// trailing `\n`/`\r\n`. Fails once an unterminated line grows past the
    /// limit.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Result<Vec<String>, RelayError> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.buf[from..].iter().position(|b| *b == b'\n') {
            let end = from + offset;
            lines.push(decode_line_bytes(&self.buf[start..end]));
            start = end + 1;
            from = start;
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();
        if self.buf.len() > self.max_line {
            return Err(RelayError::Decode(format!(
                "stream line exceeds {} bytes",
                self.max_line
            )));
        }
        Ok(lines)
    }

    /// Flushes an unterminated final line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        self.scanned = 0;
        let line = std::mem::take(&mut self.buf);
        Some(decode_line_bytes(&line))
    }
}

fn decode_line_bytes(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Turns stream lines into [`StreamEvent`]s.
///
/// Accepts both layouts seen in the wild: the event name inside the JSON
/// object (`data:{"event":"...","data":{...}}`) and the name on a preceding
/// `event:` line with the message object as `data:`.
#[derive(Default)]
pub struct EventDecoder {
    pending_event: Option<String>,
}

impl EventDecoder {
    /// Decodes one line. Returns `None` for lines that carry no event,
    /// including malformed `data:` payloads.
    pub fn decode_line(&mut self, line: &str) -> Option<StreamEvent> {
        if line.trim().is_empty() {
            self.pending_event = None;
            return None;
        }
        if let Some(name) = line.strip_prefix("event:") {
            self.pending_event = Some(name.trim().to_string());
            return None;
        }
        let payload = line.strip_prefix("data:")?.trim();

        let value: serde_json::Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, line = payload, "skipping undecodable stream line");
                return None;
            }
        };
        if !value.is_object() {
            debug!(line = payload, "skipping non-object stream line");
            return None;
        }

        match value.get("event").and_then(|v| v.as_str()) {
            Some(name) => {
                let kind = EventKind::from_wire(name);
                let data = value.get("data").unwrap_or(&serde_json::Value::Null);
                Some(StreamEvent::from_payload(kind, &value, data))
            }
            None => {
                let name = self.pending_event.as_deref()?;
                let kind = EventKind::from_wire(name);
                Some(StreamEvent::from_payload(kind, &value, &value))
            }
        }
    }
}

/// Decodes a whole sequence of lines. Mostly useful for tests and for bodies
/// that were already read.
pub fn decode_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<StreamEvent> {
    let mut decoder = EventDecoder::default();
    lines
        .into_iter()
        .filter_map(|line| decoder.decode_line(line))
        .collect()
}

/// Lazily decodes a response body into events, chunk by chunk.
///
/// Transport errors end the stream with [`RelayError::Network`]. With an
/// `idle_timeout`, a body that produces no chunk for that long is treated as
/// stalled.
pub fn decode_byte_stream<S, E>(bytes_stream: S, idle_timeout: Option<Duration>) -> EventStream
where
    S: futures::Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    struct State<S> {
        bytes_stream: Pin<Box<S>>,
        splitter: LineSplitter,
        decoder: EventDecoder,
        pending: VecDeque<StreamEvent>,
        idle_timeout: Option<Duration>,
        done: bool,
    }

    let events = stream::try_unfold(
        State {
            bytes_stream: Box::pin(bytes_stream),
            splitter: LineSplitter::default(),
            decoder: EventDecoder::default(),
            pending: VecDeque::new(),
            idle_timeout,
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Ok(Some((event, state)));
                }
                if state.done {
                    return Ok(None);
                }

                let next = match state.idle_timeout {
                    Some(limit) => tokio::time::timeout(limit, state.bytes_stream.next())
                        .await
                        .map_err(|_| {
                            RelayError::Network(format!("stream stalled: no data for {limit:?}"))
                        })?,
                    None => state.bytes_stream.next().await,
                };

                match next {
                    Some(Ok(chunk)) => {
                        for line in state.splitter.push_chunk(&chunk)? {
                            if let Some(event) = state.decoder.decode_line(&line) {
                                state.pending.push_back(event);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        return Err(RelayError::Network(format!("stream read failed: {e}")));
                    }
                    None => {
                        if let Some(line) = state.splitter.finish()
                            && let Some(event) = state.decoder.decode_line(&line)
                        {
                            state.pending.push_back(event);
                        }
                        state.done = true;
                    }
                }
            }
        },
    );
    Box::pin(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Role;
    use futures::StreamExt as _;

    fn chunks(parts: &[&'static str]) -> Vec<Result<bytes::Bytes, std::io::Error>> {
        parts
            .iter()
            .map(|part| Ok(bytes::Bytes::from_static(part.as_bytes())))
            .collect()
    }

    #[test]
    fn splitter_handles_partial_chunk_boundaries() {
        let mut splitter = LineSplitter::default();
        assert!(splitter.push_chunk(b"data:{\"a\":").expect("chunk").is_empty());
        let lines = splitter.push_chunk(b"1}\r\ndata:x\n\ntail").expect("chunk");
        assert_eq!(lines, vec!["data:{\"a\":1}", "data:x", ""]);
        assert_eq!(splitter.finish().as_deref(), Some("tail"));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn splitter_keeps_multibyte_characters_split_across_chunks() {
        let text = "data:你好\n".as_bytes();
        let mut splitter = LineSplitter::default();
        assert!(splitter.push_chunk(&text[..7]).expect("chunk").is_empty());
        assert_eq!(
            splitter.push_chunk(&text[7..]).expect("chunk"),
            vec!["data:你好"]
        );
    }

    #[test]
    fn splitter_resumes_scan_across_many_small_chunks() {
        let mut splitter = LineSplitter::default();
        for byte in b"data:abc" {
            assert!(splitter.push_chunk(&[*byte]).expect("chunk").is_empty());
        }
        assert_eq!(
            splitter.push_chunk(b"def\nnext").expect("chunk"),
            vec!["data:abcdef"]
        );
        assert_eq!(splitter.finish().as_deref(), Some("next"));
    }

    #[test]
    fn splitter_rejects_unterminated_oversized_line() {
        let mut splitter = LineSplitter::with_max_line(8);
        assert_eq!(
            splitter.push_chunk(b"data:ab\nshort").expect("chunk"),
            vec!["data:ab"]
        );
        let err = splitter.push_chunk(b"-and-longer").expect_err("too long");
        assert!(matches!(err, RelayError::Decode(_)), "{err:?}");
    }

    #[test]
    fn decoder_ignores_non_data_and_malformed_lines() {
        let events = decode_lines([
            ": keep-alive",
            "id: 3",
            "data: not json",
            "data: [DONE]",
            "data: \"string\"",
            r#"data:{"event":"conversation.message.delta","data":{"content":"ok"}}"#,
        ]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::MessageDelta);
        assert_eq!(events[0].text(), Some("ok"));
    }

    #[test]
    fn decoder_uses_event_line_when_payload_has_no_event_field() {
        let events = decode_lines([
            "event:conversation.message.completed",
            r#"data:{"role":"assistant","type":"answer","content":"Hi"}"#,
            "",
            r#"data:{"role":"assistant","content":"orphan"}"#,
        ]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::MessageCompleted);
        assert_eq!(events[0].role, Role::Assistant);
        assert_eq!(events[0].text(), Some("Hi"));
    }

    #[tokio::test]
    async fn byte_stream_decodes_across_chunks_and_flushes_tail() {
        let body = chunks(&[
            "data:{\"event\":\"conversation.message.delta\",\"data\":{\"content\":\"Hel\"}}\ndata:{\"event\":\"conver",
            "sation.message.delta\",\"data\":{\"content\":\"lo\"}}\n",
            "data:{\"event\":\"conversation.chat.completed\",\"data\":{}}",
        ]);
        let events: Vec<_> = decode_byte_stream(stream::iter(body), None)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .expect("events");
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].text(), Some("lo"));
        assert_eq!(events[2].kind, EventKind::ChatCompleted);
    }

    #[tokio::test]
    async fn byte_stream_transport_error_becomes_network_error() {
        let body: Vec<Result<bytes::Bytes, std::io::Error>> = vec![
            Ok(bytes::Bytes::from_static(b"data:{\"event\":\"delta\",\"data\":{\"content\":\"a\"}}\n")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ];
        let mut events = decode_byte_stream(stream::iter(body), None);
        assert!(matches!(events.next().await, Some(Ok(_))));
        assert!(matches!(events.next().await, Some(Err(RelayError::Network(_)))));
    }

    #[tokio::test]
    async fn endless_line_ends_stream_with_decode_error() {
        let line = vec![b'x'; MAX_LINE_BYTES / 2];
        let body: Vec<Result<bytes::Bytes, std::io::Error>> = (0..3)
            .map(|_| Ok(bytes::Bytes::from(line.clone())))
            .collect();
        let mut events = decode_byte_stream(stream::iter(body), None);
        assert!(matches!(
            events.next().await,
            Some(Err(RelayError::Decode(_)))
        ));
    }

    #[tokio::test]
    async fn stalled_byte_stream_hits_idle_timeout() {
        let body = stream::pending::<Result<bytes::Bytes, std::io::Error>>();
        let mut events = decode_byte_stream(body, Some(Duration::from_millis(20)));
        match events.next().await {
            Some(Err(RelayError::Network(message))) => {
                assert!(message.contains("stalled"), "{message}");
                assert!(message.contains("20ms"), "{message}");
            }
            other => panic!("expected stall error, got {other:?}"),
        }
    }
}
