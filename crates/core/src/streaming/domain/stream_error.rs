use thiserror::Error;

use crate::shared::locator::StreamKey;

/// Failures surfaced to stream consumers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("failed to open {locator}: {reason}")]
    OpenFailed { locator: String, reason: String },
    #[error("stream {key} is unavailable")]
    Unavailable { key: StreamKey },
    #[error("failed to start capture thread for {key}: {reason}")]
    Spawn { key: StreamKey, reason: String },
}

/// Why `get_frame` returned nothing.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The connection is fatal or closed and will not produce frames again.
    #[error("connection is unavailable")]
    Unavailable,
    /// Nothing has been captured yet; retry later.
    #[error("no frame captured yet")]
    Empty,
}
