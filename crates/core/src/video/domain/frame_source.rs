use crate::shared::frame::Frame;
use crate::shared::locator::Locator;
use crate::shared::stream_metadata::StreamMetadata;

pub type SourceError = Box<dyn std::error::Error + Send + Sync>;

/// An opened, live video source.
///
/// Implementations handle codec and transport details; the capture thread
/// only sees decoded [`Frame`]s. A source is owned by exactly one capture
/// thread, hence `&mut self`.
pub trait FrameSource: Send {
    fn metadata(&self) -> StreamMetadata;

    /// Blocks until the next frame is decoded. End of stream and transport
    /// failures are both reported as errors.
    fn read(&mut self) -> Result<Frame, SourceError>;

    /// Releases the underlying device or connection. Idempotent.
    fn release(&mut self);
}

/// Opens [`FrameSource`]s for locators. Shared by every capture thread so
/// that a degraded connection can be reopened.
pub trait FrameSourceFactory: Send + Sync {
    fn open(&self, locator: &Locator) -> Result<Box<dyn FrameSource>, SourceError>;
}
