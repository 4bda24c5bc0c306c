pub mod connection;
pub mod frame_buffer;
pub mod stream_error;
