use crate::shared::frame::Frame;

/// Encodes annotated frames for transport to a viewer.
pub trait FrameEncoder: Send + Sync {
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>>;

    /// MIME type of the encoded bytes.
    fn content_type(&self) -> &'static str;
}
