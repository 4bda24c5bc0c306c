pub mod bounding_box;
pub mod clock;
pub mod constants;
pub mod frame;
pub mod locator;
pub mod model_resolver;
pub mod stream_metadata;
