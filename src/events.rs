//! Progress events for live display of a batch run.
//!
//! Events are a read-only projection of the pipeline's state machine: the
//! orchestrator and item runner emit them, nothing consumes them internally.
//! Each event serializes to one JSON object tagged by `"event"`, so a stream
//! of them can be forwarded as NDJSON to a web client.

use crate::types::{Outcome, RunTotals};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events emitted during a batch run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// The batch is about to start.
    RunStart {
        total: usize,
        model_name: String,
        output_dir: PathBuf,
    },
    /// An image's state machine has started.
    ItemStart {
        index: usize,
        total: usize,
        image_name: String,
    },
    /// A content fragment arrived.
    Token { index: usize, chunk: String },
    /// The first content fragment of an attempt arrived.
    FirstToken { index: usize, ttft_seconds: f64 },
    /// A transport retry is about to sleep.
    Retry {
        index: usize,
        /// Retry number (1-indexed).
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    /// An image reached its terminal outcome.
    ItemEnd {
        index: usize,
        image_name: String,
        status: Outcome,
        output_file: Option<PathBuf>,
    },
    /// The batch finished.
    Done {
        totals: RunTotals,
        summary_file: Option<PathBuf>,
    },
    /// The batch aborted before dispatch.
    Fatal { message: String },
}

impl Event {
    /// One line of NDJSON, without the trailing newline.
    pub fn to_ndjson(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!("{{\"event\":\"fatal\",\"message\":\"unserializable event: {}\"}}", e)
        })
    }
}

/// Handler for batch progress events.
///
/// Called synchronously from the pipeline; implementations should return
/// quickly (forward to a channel rather than doing I/O inline).
///
/// # Example
///
/// ```
/// use vision_batch::events::{Event, EventHandler};
///
/// struct PrintHandler;
///
/// impl EventHandler for PrintHandler {
///     fn on_event(&self, event: Event) {
///         match event {
///             Event::Token { chunk, .. } => print!("{}", chunk),
///             Event::ItemEnd { image_name, status, .. } => {
///                 println!("\n[{}] {}", status, image_name)
///             }
///             _ => {}
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: Event);
}

/// Emit an event if a handler is present. No-op otherwise.
pub(crate) fn emit(handler: &Option<Arc<dyn EventHandler>>, event: Event) {
    if let Some(ref h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
///
/// # Example
///
/// ```
/// use vision_batch::events::{Event, FnEventHandler};
/// use std::sync::Arc;
///
/// let handler = Arc::new(FnEventHandler(|event: Event| {
///     println!("{}", event.to_ndjson());
/// }));
/// ```
pub struct FnEventHandler<F: Fn(Event) + Send + Sync>(pub F);

impl<F: Fn(Event) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: Event) {
        (self.0)(event);
    }
}

/// An [`EventHandler`] that forwards into a tokio unbounded channel.
///
/// Events sent after the receiver is dropped are discarded.
#[derive(Debug, Clone)]
pub struct ChannelEventHandler {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelEventHandler {
    /// Create a handler and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventHandler for ChannelEventHandler {
    fn on_event(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_tagged_snake_case() {
        let line = Event::FirstToken {
            index: 2,
            ttft_seconds: 0.25,
        }
        .to_ndjson();
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["event"], "first_token");
        assert_eq!(v["index"], 2);

        let v = serde_json::to_value(Event::ItemEnd {
            index: 1,
            image_name: "a.png".into(),
            status: Outcome::JsonParseFailed,
            output_file: None,
        })
        .unwrap();
        assert_eq!(v["event"], "item_end");
        assert_eq!(v["status"], "json_parse_failed");
    }

    #[tokio::test]
    async fn test_channel_handler_delivers_in_order() {
        let (handler, mut rx) = ChannelEventHandler::new();
        let handler: Option<Arc<dyn EventHandler>> = Some(Arc::new(handler));
        emit(&handler, Event::Fatal { message: "a".into() });
        emit(&handler, Event::Fatal { message: "b".into() });
        assert_eq!(rx.recv().await, Some(Event::Fatal { message: "a".into() }));
        assert_eq!(rx.recv().await, Some(Event::Fatal { message: "b".into() }));
    }

    #[test]
    fn test_channel_handler_survives_dropped_receiver() {
        let (handler, rx) = ChannelEventHandler::new();
        drop(rx);
        handler.on_event(Event::Fatal { message: "ignored".into() });
    }

    #[test]
    fn test_emit_without_handler_is_noop() {
        emit(&None, Event::Fatal { message: "x".into() });
    }
}
