//! Backend trait and the normalized vision request.
//!
//! The [`Backend`] trait abstracts over inference providers. An adapter turns
//! a [`VisionRequest`] into the provider's HTTP call and exposes the streamed
//! response as a [`FragmentStream`]: one item per received chunk, each
//! carrying the content fragments decoded from it, in arrival order.
//! Built-in implementations: [`OpenAiBackend`], [`OllamaBackend`],
//! [`MockBackend`].
//!
//! ## Architecture
//!
//! ```text
//! ItemRunner ──► VisionRequest ──► Backend::open_stream() ──► FragmentStream
//!                                          │
//!                           ┌──────────────┴──────────────┐
//!                      OpenAiBackend                 OllamaBackend
//!                   {base}/chat/completions          {base}/api/chat
//!                     SSE frames, [DONE]           NDJSON, "done": true
//! ```

pub mod mock;
pub mod ndjson;
pub mod ollama;
pub mod openai;
pub mod sse;

pub use mock::{MockBackend, MockReply};
pub use ollama::OllamaBackend;
pub use openai::OpenAiBackend;

use crate::client_pool::ClientHandle;
use crate::error::Result;
use crate::PipelineError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;

/// Stream of decoded content fragments, one `Vec` per received chunk.
///
/// A chunk may decode to zero fragments (keep-alives, role frames). The
/// stream ends when the provider signals completion or the body ends; an
/// `Err` item aborts it.
pub type FragmentStream = BoxStream<'static, Result<Vec<String>>>;

/// A provider-agnostic vision request: one prompt plus one image.
#[derive(Debug, Clone)]
pub struct VisionRequest {
    /// Model identifier sent to the provider.
    pub model: String,
    pub prompt: String,
    /// `data:<mime>;base64,...` URL of the encoded image.
    pub image_url: Arc<str>,
    /// File name of the source image, for logging and scripted mocks.
    pub image_name: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl VisionRequest {
    /// The base64 payload without its `data:...;base64,` prefix.
    pub fn image_base64(&self) -> &str {
        match self.image_url.split_once(";base64,") {
            Some((_, b64)) => b64,
            None => &self.image_url,
        }
    }
}

/// Abstraction over streaming vision providers.
///
/// # Object Safety
///
/// This trait is object-safe and designed to be used as `Arc<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Send `request` through `handle` and return the streamed response.
    ///
    /// Connect failures and non-success statuses are returned as errors
    /// here; failures while reading the body surface as `Err` stream items.
    async fn open_stream(
        &self,
        handle: &ClientHandle,
        request: &VisionRequest,
    ) -> Result<FragmentStream>;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Incremental decoder turning raw body chunks into content fragments.
pub(crate) trait FragmentDecoder: Send + 'static {
    /// Feed one chunk; return the fragments of every complete frame in it.
    fn feed(&mut self, chunk: &[u8]) -> Result<Vec<String>>;

    /// Decode whatever is left in the buffer once the body has ended.
    fn finish(&mut self) -> Result<Vec<String>>;

    /// Whether the provider has signalled the end of the response.
    fn is_done(&self) -> bool;
}

/// Drive `decoder` over a response body, yielding one item per chunk.
pub(crate) fn fragment_stream<S, B, D>(body: S, decoder: D) -> FragmentStream
where
    S: Stream<Item = std::result::Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    D: FragmentDecoder,
{
    let state = (Box::pin(body), decoder, false);
    futures::stream::unfold(state, |(mut body, mut decoder, finished)| async move {
        if finished || decoder.is_done() {
            return None;
        }
        match body.next().await {
            Some(Ok(chunk)) => match decoder.feed(chunk.as_ref()) {
                Ok(fragments) => Some((Ok(fragments), (body, decoder, false))),
                Err(e) => Some((Err(e), (body, decoder, true))),
            },
            Some(Err(e)) => Some((Err(PipelineError::Request(e)), (body, decoder, true))),
            None => {
                let rest = decoder.finish();
                Some((rest, (body, decoder, true)))
            }
        }
    })
    .boxed()
}

/// Send a prepared request and turn a non-success status into [`PipelineError::HttpError`].
pub(crate) async fn send_checked(
    request: reqwest::RequestBuilder,
    url: &str,
) -> Result<reqwest::Response> {
    let resp = request.send().await.map_err(|e| {
        if e.is_timeout() {
            PipelineError::Request(e)
        } else {
            PipelineError::Transport(format!("Failed to connect to {}: {}", url, e))
        }
    })?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = resp.text().await.unwrap_or_default();
        return Err(PipelineError::HttpError {
            status,
            body,
            retry_after,
        });
    }
    Ok(resp)
}

/// Parse a `Retry-After` header value given in (possibly fractional) seconds.
pub(crate) fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

/// Turn a provider `error` field into a transport error, if present.
pub(crate) fn provider_error(frame: &serde_json::Value) -> Option<PipelineError> {
    let err = frame.get("error")?;
    let message = err
        .get("message")
        .and_then(|m| m.as_str())
        .or_else(|| err.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string());
    Some(PipelineError::Transport(format!("provider error: {}", message)))
}
