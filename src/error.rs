use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the batch pipeline and its components.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Missing credential, endpoint or model, or an invalid setting.
    ///
    /// Raised before any dispatch begins and aborts the whole batch.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The input directory or image list cannot be used.
    #[error("Invalid input: {0}")]
    Input(String),

    /// Low-level HTTP transport failure (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// HTTP error with status code, response body, and optional Retry-After hint.
    ///
    /// Returned by [`Backend`](crate::backend::Backend) implementations when
    /// the provider answers with a non-success status code.
    #[error("HTTP {status}: {body}")]
    HttpError {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// Transport failure described by text (connect failure, broken stream,
    /// provider error frame).
    #[error("Transport error: {0}")]
    Transport(String),

    /// A provider frame could not be decoded.
    #[error("JSON decoding failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Image decoding or re-encoding failed.
    #[error("Image processing failed: {0}")]
    Image(#[from] image::ImageError),

    /// Reading an input file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Writing an output file failed.
    #[error("Failed to write {}: {source}", path.display())]
    Persistence {
        /// Target path of the failed write.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The batch was cancelled via the cancellation flag.
    #[error("cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Shorthand for a [`PipelineError::Persistence`] error.
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Persistence {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
