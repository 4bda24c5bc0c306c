//! Live camera ingestion with face recognition and attendance events.
//!
//! Cameras are opened once per [`shared::locator::StreamKey`] by the
//! [`streaming::infrastructure::stream_supervisor::StreamSupervisor`], which
//! keeps a capture thread per connection. Consumers attach through
//! [`pipeline::stream_service::StreamService`] and receive annotated,
//! encoded frames together with debounced enter/exit events.

pub mod annotation;
pub mod attendance;
pub mod config;
pub mod pipeline;
pub mod recognition;
pub mod shared;
pub mod streaming;
pub mod video;

#[cfg(test)]
pub(crate) mod testing;
