//! Streaming consumer: one request/response exchange with latency milestones.
//!
//! [`consume`] opens the stream through a [`Backend`], appends every
//! fragment to the output in arrival order, and measures time to first
//! content, generation time and total time on the monotonic clock.

use crate::backend::{Backend, VisionRequest};
use crate::client_pool::ClientHandle;
use crate::PipelineError;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Latency milestones of one streamed exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTiming {
    /// Dispatch to first non-empty fragment. Equals `total` when nothing arrived.
    pub ttft: Duration,
    /// First fragment to end of stream.
    pub generation: Duration,
    /// Dispatch to end of stream.
    pub total: Duration,
    /// Whether any content was received at all.
    pub received_content: bool,
}

/// The assembled output of a completed stream.
#[derive(Debug, Clone)]
pub struct StreamOutput {
    pub text: String,
    /// Length of `text` in characters.
    pub char_count: usize,
    pub timing: StreamTiming,
}

/// A stream that failed, with whatever text arrived before the failure.
#[derive(Debug)]
pub struct StreamAbort {
    pub error: PipelineError,
    pub partial_text: String,
    /// Dispatch to failure.
    pub elapsed: Duration,
}

impl StreamAbort {
    fn new(error: PipelineError, partial_text: String, t0: Instant) -> Self {
        Self {
            error,
            partial_text,
            elapsed: t0.elapsed(),
        }
    }
}

/// Run one streamed exchange to completion.
///
/// `on_fragment` sees every non-empty fragment in order; its second argument
/// is `true` for the first one. `cancel` is checked before dispatch and on
/// every received chunk. An empty stream is not an error here.
pub async fn consume<F>(
    backend: &dyn Backend,
    handle: &ClientHandle,
    request: &VisionRequest,
    cancel: Option<&AtomicBool>,
    mut on_fragment: F,
) -> Result<StreamOutput, StreamAbort>
where
    F: FnMut(&str, bool),
{
    let is_cancelled = || cancel.is_some_and(|c| c.load(Ordering::Relaxed));

    let t0 = Instant::now();
    if is_cancelled() {
        return Err(StreamAbort::new(PipelineError::Cancelled, String::new(), t0));
    }

    let mut stream = match backend.open_stream(handle, request).await {
        Ok(s) => s,
        Err(e) => return Err(StreamAbort::new(e, String::new(), t0)),
    };

    let mut text = String::new();
    let mut t_first: Option<Instant> = None;

    while let Some(item) = stream.next().await {
        if is_cancelled() {
            return Err(StreamAbort::new(PipelineError::Cancelled, text, t0));
        }
        let fragments = match item {
            Ok(f) => f,
            Err(e) => return Err(StreamAbort::new(e, text, t0)),
        };
        for fragment in fragments.iter().filter(|f| !f.is_empty()) {
            let first = t_first.is_none();
            if first {
                t_first = Some(Instant::now());
            }
            text.push_str(fragment);
            on_fragment(fragment, first);
        }
    }

    let t_end = Instant::now();
    let first = t_first.unwrap_or(t_end);
    let timing = StreamTiming {
        ttft: first - t0,
        generation: t_end - first,
        total: t_end - t0,
        received_content: t_first.is_some(),
    };
    tracing::debug!(
        image = %request.image_name,
        ttft_ms = timing.ttft.as_millis() as u64,
        gen_ms = timing.generation.as_millis() as u64,
        chars = text.chars().count(),
        "stream complete"
    );

    Ok(StreamOutput {
        char_count: text.chars().count(),
        text,
        timing,
    })
}
