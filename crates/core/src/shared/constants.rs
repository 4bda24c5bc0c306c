use std::time::Duration;

pub const YOLO_MODEL_NAME: &str = "yolo11n-pose_widerface.onnx";
pub const YOLO_MODEL_URL: &str =
    "https://github.com/neutrinographics/faceguard/releases/download/v0.1.0/yolo11n-pose_widerface.onnx";

pub const EMBEDDING_MODEL_NAME: &str = "w600k_r50.onnx";
pub const EMBEDDING_MODEL_URL: &str =
    "https://github.com/neutrinographics/faceguard/releases/download/v0.1.0/w600k_r50.onnx";

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff", "tif", "webp"];

/// Frames kept per connection before the oldest is evicted.
pub const DEFAULT_BUFFER_CAPACITY: usize = 30;

/// Nominal rate assumed when a source does not report one.
pub const DEFAULT_FPS: f64 = 25.0;

/// Cosine similarity a face must exceed to be matched to an identity.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.5;

/// Minimum time between two presence events for the same identity.
pub const DEFAULT_DEBOUNCE_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(60);
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(30);

/// Placeholder geometry when a connection has not reported dimensions yet.
pub const PLACEHOLDER_WIDTH: u32 = 640;
pub const PLACEHOLDER_HEIGHT: u32 = 480;
