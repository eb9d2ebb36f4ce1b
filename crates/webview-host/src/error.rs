//! Error types for the browser runtime, the frame pipeline and the wire protocol.

use thiserror::Error;

/// Failures reported by the browser runtime (tab acquisition, capture, input).
#[derive(Debug, Error)]
pub enum BrowserError {
    /// The debugger endpoint could not be reached or never came up.
    #[error("browser runtime unavailable: {0}")]
    Unavailable(String),

    /// The browser answered a command with an error.
    #[error("CDP error: {0}")]
    Cdp(String),

    /// A command did not complete in time.
    #[error("timed out after {timeout_ms}ms: {context}")]
    Timeout { timeout_ms: u64, context: String },

    /// The connection to the browser is gone.
    #[error("browser connection closed")]
    Closed,

    /// The browser sent something we could not interpret.
    #[error("unexpected browser response: {0}")]
    Protocol(String),
}

/// Failures while turning a captured still into encoded rectangles.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("decode failed: {0}")]
    Decode(String),

    #[error("encode failed: {0}")]
    Encode(String),

    /// The blocking worker running the pipeline panicked or was cancelled.
    #[error("pipeline task failed: {0}")]
    Join(String),
}

impl From<image::ImageError> for FrameError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Encoding(e) => FrameError::Encode(e.to_string()),
            other => FrameError::Decode(other.to_string()),
        }
    }
}

/// Malformed binary messages on either channel.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,

    #[error("truncated {kind} message: need {needed} bytes, got {got}")]
    Truncated {
        kind: &'static str,
        needed: usize,
        got: usize,
    },

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("invalid {field} value {value} in {kind} message")]
    InvalidValue {
        kind: &'static str,
        field: &'static str,
        value: u32,
    },

    #[error("frame needs {0} chunks, more than the header can address")]
    TooManyChunks(usize),

    #[error("not a frame message (tag 0x{0:02x})")]
    UnknownFrameTag(u8),
}
