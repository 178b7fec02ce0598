//! Mock backend for testing without a live endpoint.
//!
//! [`MockBackend`] plays scripted [`MockReply`]s, allowing downstream
//! consumers to write deterministic tests against this crate.
//!
//! # Example
//!
//! ```
//! use vision_batch::backend::{MockBackend, MockReply};
//!
//! let mock = MockBackend::fixed("{\"total\": 12.5}")
//!     .for_image("blurry.jpg", vec![MockReply::fail("connection reset"), MockReply::text("{}")]);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use super::{Backend, FragmentStream, VisionRequest};
use crate::client_pool::ClientHandle;
use crate::error::Result;
use crate::PipelineError;

/// One scripted response.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Stream these chunks, one fragment each, then complete.
    Chunks(Vec<String>),
    /// Fail before any chunk is received (connect failure).
    Fail(String),
    /// Stream these chunks, then fail mid-stream.
    FailAfter(Vec<String>, String),
}

impl MockReply {
    /// A reply streamed as a single chunk.
    pub fn text(text: impl Into<String>) -> Self {
        MockReply::Chunks(vec![text.into()])
    }

    /// A reply streamed in the given pieces.
    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MockReply::Chunks(chunks.into_iter().map(Into::into).collect())
    }

    /// A connect failure.
    pub fn fail(message: impl Into<String>) -> Self {
        MockReply::Fail(message.into())
    }
}

/// A test backend that plays canned replies.
///
/// Replies queued for a specific image name via [`for_image`](Self::for_image)
/// are consumed first, in order. Otherwise the default replies are returned
/// in order, cycling back to the beginning when exhausted.
#[derive(Debug)]
pub struct MockBackend {
    replies: Vec<MockReply>,
    index: AtomicUsize,
    per_image: Mutex<HashMap<String, VecDeque<MockReply>>>,
    calls: Mutex<Vec<String>>,
    chunk_delay: Duration,
}

impl MockBackend {
    /// Create a mock backend with the given default replies.
    pub fn new(replies: Vec<MockReply>) -> Self {
        assert!(!replies.is_empty(), "MockBackend requires at least one reply");
        Self {
            replies,
            index: AtomicUsize::new(0),
            per_image: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            chunk_delay: Duration::ZERO,
        }
    }

    /// Create a mock that always streams the same text as one chunk.
    pub fn fixed(response: impl Into<String>) -> Self {
        Self::new(vec![MockReply::text(response)])
    }

    /// Queue replies for requests about `image_name`.
    pub fn for_image(self, image_name: impl Into<String>, replies: Vec<MockReply>) -> Self {
        if let Ok(mut per_image) = self.per_image.lock() {
            per_image
                .entry(image_name.into())
                .or_default()
                .extend(replies);
        }
        self
    }

    /// Sleep this long before each chunk (use with a paused tokio clock).
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Total number of `open_stream` calls.
    pub fn calls(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Number of `open_stream` calls for `image_name`.
    pub fn calls_for(&self, image_name: &str) -> usize {
        self.calls
            .lock()
            .map(|c| c.iter().filter(|n| *n == image_name).count())
            .unwrap_or(0)
    }

    fn next_reply(&self, image_name: &str) -> MockReply {
        let queued = self
            .per_image
            .lock()
            .ok()
            .and_then(|mut per_image| per_image.get_mut(image_name)?.pop_front());
        if let Some(reply) = queued {
            return reply;
        }
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % self.replies.len();
        self.replies[idx].clone()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn open_stream(
        &self,
        _handle: &ClientHandle,
        request: &VisionRequest,
    ) -> Result<FragmentStream> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.image_name.clone());
        }

        let (chunks, failure) = match self.next_reply(&request.image_name) {
            MockReply::Fail(message) => return Err(PipelineError::Transport(message)),
            MockReply::Chunks(chunks) => (chunks, None),
            MockReply::FailAfter(chunks, message) => (chunks, Some(message)),
        };

        let mut items: Vec<Result<Vec<String>>> = chunks.into_iter().map(|c| Ok(vec![c])).collect();
        if let Some(message) = failure {
            items.push(Err(PipelineError::Transport(message)));
        }

        let delay = self.chunk_delay;
        Ok(futures::stream::iter(items)
            .then(move |item| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                item
            })
            .boxed())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_pool::ClientPool;

    fn request(image: &str) -> VisionRequest {
        VisionRequest {
            model: "test".into(),
            prompt: "test".into(),
            image_url: "data:image/png;base64,".into(),
            image_name: image.into(),
            temperature: None,
            max_tokens: None,
        }
    }

    fn handle() -> std::sync::Arc<ClientHandle> {
        ClientPool::new()
            .get_client("k", "http://unused", Duration::from_secs(1))
            .unwrap()
    }

    async fn collect(mock: &MockBackend, image: &str) -> Result<Vec<String>> {
        let mut stream = mock.open_stream(&handle(), &request(image)).await?;
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            out.extend(item?);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_mock_cycles_replies() {
        let mock = MockBackend::new(vec![MockReply::text("first"), MockReply::text("second")]);
        assert_eq!(collect(&mock, "a.png").await.unwrap(), vec!["first"]);
        assert_eq!(collect(&mock, "b.png").await.unwrap(), vec!["second"]);
        assert_eq!(collect(&mock, "c.png").await.unwrap(), vec!["first"]);
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn test_mock_per_image_queue_then_default() {
        let mock = MockBackend::fixed("ok").for_image("x.png", vec![MockReply::fail("refused")]);
        assert!(matches!(collect(&mock, "x.png").await, Err(PipelineError::Transport(_))));
        assert_eq!(collect(&mock, "x.png").await.unwrap(), vec!["ok"]);
        assert_eq!(mock.calls_for("x.png"), 2);
    }

    #[tokio::test]
    async fn test_mock_fail_after_partial_chunks() {
        let mock = MockBackend::new(vec![MockReply::FailAfter(
            vec!["{\"a\"".into()],
            "reset".into(),
        )]);
        let mut stream = mock.open_stream(&handle(), &request("a.png")).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), vec!["{\"a\""]);
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_chunk_delay() {
        let mock = MockBackend::new(vec![MockReply::chunks(["a", "b"])])
            .with_chunk_delay(Duration::from_millis(50));
        let start = tokio::time::Instant::now();
        assert_eq!(collect(&mock, "a.png").await.unwrap(), vec!["a", "b"]);
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }
}
