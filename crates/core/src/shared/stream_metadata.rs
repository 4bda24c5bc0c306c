use crate::shared::constants::DEFAULT_FPS;

/// Geometry and nominal rate reported by an opened frame source.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamMetadata {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub codec: String,
}

impl StreamMetadata {
    /// Metadata with the frame rate falling back to [`DEFAULT_FPS`] when the
    /// source reports none (common for RTSP and capture devices).
    pub fn new(width: u32, height: u32, fps: f64, codec: impl Into<String>) -> Self {
        let fps = if fps.is_finite() && fps > 0.0 {
            fps
        } else {
            DEFAULT_FPS
        };
        Self {
            width,
            height,
            fps,
            codec: codec.into(),
        }
    }
}
