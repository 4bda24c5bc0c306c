use crate::shared::bounding_box::BoundingBox;
use crate::shared::frame::Frame;

/// One face found in a frame.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
}

/// Detects faces and embeds each one.
///
/// Shared across consumer threads, hence `&self`.
pub trait FaceAnalyzer: Send + Sync {
    fn analyze(
        &self,
        frame: &Frame,
    ) -> Result<Vec<DetectedFace>, Box<dyn std::error::Error + Send + Sync>>;
}
