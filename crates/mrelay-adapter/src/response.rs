use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bytes::Bytes;
use futures_util::Stream;
use http::StatusCode;

use mrelay_protocol::Usage;

/// Token usage observed while a response flows through the relay.
///
/// Streamed responses update this concurrently with the client copy; the
/// pipeline reads the final snapshot at settle time, including after client
/// disconnect or stream abort, so whatever was observed is what gets billed.
#[derive(Debug, Default)]
pub struct UsageAccumulator {
    prompt_tokens: AtomicU32,
    completion_tokens: AtomicU32,
    /// Set when the upstream reported an explicit usage block; estimation
    /// stops adding on top once this flips.
    reported: AtomicBool,
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prompt(prompt_tokens: u32) -> Self {
        let acc = Self::default();
        acc.prompt_tokens.store(prompt_tokens, Ordering::Relaxed);
        acc
    }

    /// Trust an explicit usage block from the upstream.
    pub fn observe_reported(&self, usage: &Usage) {
        self.reported.store(true, Ordering::Relaxed);
        if usage.prompt_tokens > 0 {
            self.prompt_tokens.store(usage.prompt_tokens, Ordering::Relaxed);
        }
        if usage.completion_tokens > 0 {
            self.completion_tokens
                .store(usage.completion_tokens, Ordering::Relaxed);
        }
    }

    /// On-the-fly estimate for providers that never report usage.
    pub fn add_estimated_completion(&self, tokens: u32) {
        if !self.reported.load(Ordering::Relaxed) {
            self.completion_tokens.fetch_add(tokens, Ordering::Relaxed);
        }
    }

    pub fn has_report(&self) -> bool {
        self.reported.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Usage {
        Usage::new(
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
        )
    }
}

/// Ordered canonical SSE frames plus the usage handle that survives the
/// stream. Dropping `frames` cancels the upstream read.
pub struct StreamHandle {
    pub frames: Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>,
    pub usage: Arc<UsageAccumulator>,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("frames", &"<opaque>")
            .finish()
    }
}

/// What an adapter hands back to the pipeline.
#[derive(Debug)]
pub enum AdapterResponse {
    Json {
        status: StatusCode,
        body: Bytes,
        usage: Option<Usage>,
    },
    Stream {
        status: StatusCode,
        handle: StreamHandle,
    },
}
