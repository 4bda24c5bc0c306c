pub mod session_logger;
pub mod stream_service;
pub mod stream_session;
