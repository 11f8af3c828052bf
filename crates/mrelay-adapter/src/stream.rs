use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use mrelay_protocol::ErrorEnvelope;
use mrelay_protocol::sse::{SseDecoder, data_frame, named_frame};

use crate::response::{StreamHandle, UsageAccumulator};

/// Upstream stream framings seen in the wild: SSE (OpenAI, Anthropic, Baidu,
/// Ali), NDJSON (Ollama), and JSON arrays (Gemini `streamGenerateContent`).
/// The decoder sniffs the framing from the first non-whitespace bytes and
/// yields raw event payload strings in arrival order.
#[derive(Debug)]
enum DecoderMode {
    Unknown,
    Sse(SseDecoder),
    Ndjson(String),
    JsonArray(JsonArrayDecoder),
}

#[derive(Debug)]
pub struct UpstreamDecoder {
    mode: DecoderMode,
    pending: String,
}

impl Default for UpstreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamDecoder {
    pub fn new() -> Self {
        Self {
            mode: DecoderMode::Unknown,
            pending: String::new(),
        }
    }

    pub fn push(&mut self, chunk: &Bytes) -> Vec<String> {
        let Ok(text) = std::str::from_utf8(chunk) else {
            return Vec::new();
        };

        match &mut self.mode {
            DecoderMode::Unknown => {
                self.pending.push_str(text);
                let combined = std::mem::take(&mut self.pending);
                let first = combined.chars().find(|c| !c.is_whitespace());
                match first {
                    Some('d' | 'e' | ':') => {
                        let mut decoder = SseDecoder::new();
                        let events = drain_sse(decoder.push_str(&combined));
                        self.mode = DecoderMode::Sse(decoder);
                        events
                    }
                    Some('[') => {
                        let mut decoder = JsonArrayDecoder::new();
                        let events = decoder.push_str(&combined);
                        self.mode = DecoderMode::JsonArray(decoder);
                        events
                    }
                    Some('{') => {
                        let mut buffer = combined;
                        let events = drain_ndjson(&mut buffer);
                        self.mode = DecoderMode::Ndjson(buffer);
                        events
                    }
                    Some(_) => {
                        // Unrecognized framing; buffer until it becomes clear.
                        self.pending = combined;
                        Vec::new()
                    }
                    None => Vec::new(),
                }
            }
            DecoderMode::Sse(decoder) => drain_sse(decoder.push_str(text)),
            DecoderMode::Ndjson(buffer) => {
                buffer.push_str(text);
                drain_ndjson(buffer)
            }
            DecoderMode::JsonArray(decoder) => decoder.push_str(text),
        }
    }

    pub fn finish(&mut self) -> Vec<String> {
        match &mut self.mode {
            DecoderMode::Unknown => {
                let tail = self.pending.trim();
                if tail.is_empty() {
                    Vec::new()
                } else {
                    vec![tail.to_string()]
                }
            }
            DecoderMode::Sse(decoder) => drain_sse(decoder.finish()),
            DecoderMode::Ndjson(buffer) => {
                let mut events = drain_ndjson(buffer);
                let tail = buffer.trim();
                if !tail.is_empty() {
                    events.push(tail.to_string());
                }
                buffer.clear();
                events
            }
            DecoderMode::JsonArray(decoder) => decoder.finish(),
        }
    }
}

fn drain_sse(frames: Vec<mrelay_protocol::sse::SseFrame>) -> Vec<String> {
    frames
        .into_iter()
        .filter(|frame| !frame.data.is_empty())
        .map(|frame| frame.data)
        .collect()
}

fn drain_ndjson(buffer: &mut String) -> Vec<String> {
    let mut out = Vec::new();
    while let Some(pos) = buffer.find('\n') {
        let mut line = buffer[..pos].to_string();
        buffer.drain(..=pos);
        if line.ends_with('\r') {
            line.pop();
        }
        let line = line.trim();
        if !line.is_empty() {
            out.push(line.to_string());
        }
    }
    out
}

/// Splits a top-level JSON array of objects into one payload per object
/// without waiting for the closing bracket.
#[derive(Debug)]
struct JsonArrayDecoder {
    current: String,
    depth: usize,
    in_string: bool,
    escape: bool,
    seen_array: bool,
}

impl JsonArrayDecoder {
    fn new() -> Self {
        Self {
            current: String::new(),
            depth: 0,
            in_string: false,
            escape: false,
            seen_array: false,
        }
    }

    fn push_str(&mut self, text: &str) -> Vec<String> {
        let mut out = Vec::new();
        for ch in text.chars() {
            if !self.seen_array {
                if ch == '[' {
                    self.seen_array = true;
                }
                continue;
            }
            if self.depth == 0 {
                if ch == '{' {
                    self.depth = 1;
                    self.current.push(ch);
                }
                continue;
            }

            self.current.push(ch);
            if self.in_string {
                if self.escape {
                    self.escape = false;
                } else if ch == '\\' {
                    self.escape = true;
                } else if ch == '"' {
                    self.in_string = false;
                }
                continue;
            }
            match ch {
                '"' => self.in_string = true,
                '{' => self.depth += 1,
                '}' => {
                    self.depth -= 1;
                    if self.depth == 0 && !self.current.is_empty() {
                        out.push(std::mem::take(&mut self.current));
                    }
                }
                _ => {}
            }
        }
        out
    }

    fn finish(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        if self.depth == 0 && !self.current.trim().is_empty() {
            out.push(std::mem::take(&mut self.current));
        }
        out
    }
}

/// Translates one upstream event payload into zero or more canonical SSE
/// frames, updating the usage accumulator along the way.
pub trait StreamMapper: Send + 'static {
    fn on_event(&mut self, data: &str, usage: &UsageAccumulator) -> Vec<Bytes>;
    /// Upstream finished cleanly; emit trailers (`data: [DONE]`, stop events).
    fn on_end(&mut self, usage: &UsageAccumulator) -> Vec<Bytes>;
}

struct RelayStreamState {
    body: Pin<Box<dyn Stream<Item = Result<Bytes, wreq::Error>> + Send>>,
    decoder: UpstreamDecoder,
    mapper: Box<dyn StreamMapper>,
    usage: Arc<UsageAccumulator>,
    pending: VecDeque<Bytes>,
    timeout: Duration,
    done: bool,
}

/// Wraps an upstream streaming response into ordered canonical frames.
///
/// Order preservation holds by construction: each upstream chunk is decoded
/// and mapped before the next is read, and mapped frames drain FIFO. A stalled
/// upstream past the inactivity timeout, or a mid-stream transport error,
/// turns into one in-band error frame and ends the stream; whatever usage was
/// accumulated stays readable through the returned handle.
pub fn relay_stream(
    response: wreq::Response,
    timeout: Duration,
    usage: Arc<UsageAccumulator>,
    mapper: Box<dyn StreamMapper>,
) -> StreamHandle {
    let state = RelayStreamState {
        body: Box::pin(response.bytes_stream()),
        decoder: UpstreamDecoder::new(),
        mapper,
        usage: usage.clone(),
        pending: VecDeque::new(),
        timeout,
        done: false,
    };

    let frames = futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(frame) = state.pending.pop_front() {
                return Some((Ok(frame), state));
            }
            if state.done {
                return None;
            }

            match tokio::time::timeout(state.timeout, state.body.next()).await {
                Err(_) => {
                    state.done = true;
                    state.pending.push_back(in_band_error("stream inactivity timeout"));
                }
                Ok(Some(Ok(chunk))) => {
                    for data in state.decoder.push(&chunk) {
                        state
                            .pending
                            .extend(state.mapper.on_event(&data, &state.usage));
                    }
                }
                Ok(Some(Err(err))) => {
                    state.done = true;
                    state
                        .pending
                        .push_back(in_band_error(&format!("upstream stream error: {err}")));
                }
                Ok(None) => {
                    state.done = true;
                    for data in state.decoder.finish() {
                        state
                            .pending
                            .extend(state.mapper.on_event(&data, &state.usage));
                    }
                    state.pending.extend(state.mapper.on_end(&state.usage));
                }
            }
        }
    });

    StreamHandle {
        frames: Box::pin(frames),
        usage,
    }
}

/// Headers are long gone when a stream dies, so the error ships as an event.
pub fn in_band_error(message: &str) -> Bytes {
    let envelope = ErrorEnvelope::new(message, "upstream_error", None);
    data_frame(&envelope.to_bytes())
}

pub fn in_band_named_error(message: &str) -> Bytes {
    let envelope = ErrorEnvelope::new(message, "upstream_error", None);
    named_frame("error", &envelope.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_sniffs_sse() {
        let mut decoder = UpstreamDecoder::new();
        let events = decoder.push(&Bytes::from_static(b"data: {\"x\":1}\n\ndata: [DONE]\n\n"));
        assert_eq!(events, vec!["{\"x\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn decoder_sniffs_json_array_across_chunks() {
        let mut decoder = UpstreamDecoder::new();
        let mut events = decoder.push(&Bytes::from_static(b"[{\"a\":1},"));
        events.extend(decoder.push(&Bytes::from_static(b"{\"b\":\"}\"}]")));
        assert_eq!(events, vec!["{\"a\":1}".to_string(), "{\"b\":\"}\"}".to_string()]);
    }

    #[test]
    fn decoder_sniffs_ndjson() {
        let mut decoder = UpstreamDecoder::new();
        let events = decoder.push(&Bytes::from_static(b"{\"a\":1}\n{\"b\":2}\n"));
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn split_sse_field_across_chunks() {
        let mut decoder = UpstreamDecoder::new();
        assert!(decoder.push(&Bytes::from_static(b"da")).is_empty());
        let events = decoder.push(&Bytes::from_static(b"ta: {\"k\":2}\n\n"));
        assert_eq!(events, vec!["{\"k\":2}".to_string()]);
    }
}
