//! Server-Sent Events parsing for provider streaming responses.
//!
//! Providers frame streaming output slightly differently, but all of them
//! speak SSE at the transport level. The parser buffers raw bytes and
//! splits on blank-line event boundaries; provider adapters decode the
//! `data` payloads themselves.

use futures::{Stream, StreamExt};

use crate::{GatewayError, GatewayResult, ProviderFailure};

/// One parsed SSE event.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE parser over raw byte chunks.
#[derive(Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes in and returns every complete event found.
    pub fn push(&mut self, chunk: &[u8]) -> GatewayResult<Vec<SseEvent>> {
        let text = std::str::from_utf8(chunk).map_err(|e| {
            GatewayError::provider(ProviderFailure::Decode, format!("invalid UTF-8 in stream: {e}"))
        })?;
        self.buffer.push_str(text);

        let mut events = Vec::new();
        while let Some(boundary) = find_event_boundary(&self.buffer) {
            let block = self.buffer[..boundary.start].to_string();
            self.buffer = self.buffer[boundary.start + boundary.len..].to_string();
            if let Some(event) = parse_event_block(&block) {
                events.push(event);
            }
        }
        Ok(events)
    }
}

struct Boundary {
    start: usize,
    len: usize,
}

fn find_event_boundary(buffer: &str) -> Option<Boundary> {
    let lf = buffer.find("\n\n").map(|start| Boundary { start, len: 2 });
    let crlf = buffer
        .find("\r\n\r\n")
        .map(|start| Boundary { start, len: 4 });
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.start <= b.start { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

fn parse_event_block(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data_lines = Vec::new();

    for line in block.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        // id: and retry: fields are irrelevant here and skipped.
    }

    if data_lines.is_empty() && event.is_none() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data_lines.join("\n"),
    })
}

/// Adapts a reqwest response body into a stream of SSE events.
pub fn sse_stream(response: reqwest::Response) -> impl Stream<Item = GatewayResult<SseEvent>> {
    let mut parser = SseParser::new();
    response
        .bytes_stream()
        .map(move |chunk| match chunk {
            Ok(bytes) => parser.push(&bytes),
            Err(e) => Err(GatewayError::provider(
                ProviderFailure::Network,
                format!("stream read failed: {e}"),
            )),
        })
        .flat_map(|result| match result {
            Ok(events) => futures::stream::iter(events.into_iter().map(Ok)).left_stream(),
            Err(e) => futures::stream::iter(vec![Err(e)]).right_stream(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_event() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: {\"x\":1}\n\n").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"x\":1}");
        assert!(events[0].event.is_none());
    }

    #[test]
    fn parses_named_events() {
        let mut parser = SseParser::new();
        let events = parser
            .push(b"event: content_block_delta\ndata: {\"text\":\"hi\"}\n\n")
            .unwrap();
        assert_eq!(events[0].event.as_deref(), Some("content_block_delta"));
        assert_eq!(events[0].data, "{\"text\":\"hi\"}");
    }

    #[test]
    fn buffers_partial_events_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: par").unwrap().is_empty());
        assert!(parser.push(b"tial").unwrap().is_empty());
        let events = parser.push(b"\n\ndata: next\n\n").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "partial");
        assert_eq!(events[1].data, "next");
    }

    #[test]
    fn handles_crlf_boundaries() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: one\r\n\r\ndata: two\r\n\r\n").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "one");
        assert_eq!(events[1].data, "two");
    }

    #[test]
    fn joins_multi_line_data() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: line1\ndata: line2\n\n").unwrap();
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn skips_comment_only_blocks() {
        let mut parser = SseParser::new();
        let events = parser.push(b": keep-alive\n\ndata: real\n\n").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "real");
    }

    #[test]
    fn rejects_invalid_utf8() {
        let mut parser = SseParser::new();
        assert!(parser.push(&[0xff, 0xfe]).is_err());
    }
}
