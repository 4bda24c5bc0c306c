pub mod ffmpeg_source;
pub mod jpeg_encoder;
