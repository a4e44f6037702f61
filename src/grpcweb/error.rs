//! Framing errors.

use bytes::Bytes;

/// Boxed error type used for body errors crossing crate boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while transcoding between native and web framing.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Bytes followed the trailer frame.
    #[error("extra data after trailer frame")]
    ExtraData,

    /// The stream ended after data frames without a trailer frame.
    #[error("stream ended without a trailer frame")]
    MissingTrailers,

    /// The stream ended in the middle of a frame.
    #[error("stream ended inside a frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },

    /// A frame declared a payload larger than the configured bound.
    #[error("frame too large ({len} bytes, max {max})")]
    FrameTooLarge { len: usize, max: usize },

    /// A trailer block line could not be parsed as `Key: Value`.
    #[error("malformed trailer line: {0:?}")]
    MalformedTrailer(String),

    /// The underlying body failed.
    #[error("body error: {0}")]
    Body(#[source] BoxError),

    /// An I/O error surfaced through the codec.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Short label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            FrameError::ExtraData => "extra_data",
            FrameError::MissingTrailers => "missing_trailers",
            FrameError::Truncated { .. } => "truncated",
            FrameError::FrameTooLarge { .. } => "frame_too_large",
            FrameError::MalformedTrailer(_) => "malformed_trailer",
            FrameError::Body(_) | FrameError::Io(_) => "body",
        }
    }
}

/// A decode failure together with every message decoded before it.
#[derive(Debug, thiserror::Error)]
#[error("{error} (after {} messages)", .messages.len())]
pub struct PartialDecode {
    #[source]
    pub error: FrameError,
    pub messages: Vec<Bytes>,
}

pub type Result<T> = std::result::Result<T, FrameError>;
