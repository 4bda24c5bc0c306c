use std::time::Duration;

use crate::shared::frame::Frame;
use crate::shared::locator::Locator;
use crate::shared::stream_metadata::StreamMetadata;
use crate::video::domain::frame_source::{FrameSource, FrameSourceFactory, SourceError};

/// Socket timeout for network sources. Without it a dead camera blocks
/// `read` indefinitely and the capture thread never notices the failure.
const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens devices, files and network streams through ffmpeg-next
/// (libavformat + libavdevice + libavcodec).
pub struct FfmpegSourceFactory {
    network_timeout: Duration,
}

impl FfmpegSourceFactory {
    pub fn new(network_timeout: Duration) -> Self {
        Self { network_timeout }
    }
}

impl Default for FfmpegSourceFactory {
    fn default() -> Self {
        Self::new(DEFAULT_NETWORK_TIMEOUT)
    }
}

impl FrameSourceFactory for FfmpegSourceFactory {
    fn open(&self, locator: &Locator) -> Result<Box<dyn FrameSource>, SourceError> {
        ffmpeg_next::init()?;
        let input = match locator {
            Locator::Device(index) => open_device(*index)?,
            Locator::Url(url) => {
                let mut options = ffmpeg_next::Dictionary::new();
                if url.starts_with("rtsp") {
                    options.set("rtsp_transport", "tcp");
                }
                let micros = self.network_timeout.as_micros().to_string();
                options.set("timeout", &micros);
                ffmpeg_next::format::input_with_dictionary(url.as_str(), options)?
            }
            Locator::File(path) => ffmpeg_next::format::input(path)?,
        };
        Ok(Box::new(FfmpegFrameSource::from_input(input)?))
    }
}

#[cfg(target_os = "linux")]
fn open_device(index: u32) -> Result<ffmpeg_next::format::context::Input, SourceError> {
    open_with_device_format(&format!("/dev/video{index}"), &["video4linux2", "v4l2"])
}

#[cfg(target_os = "macos")]
fn open_device(index: u32) -> Result<ffmpeg_next::format::context::Input, SourceError> {
    open_with_device_format(&index.to_string(), &["avfoundation"])
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn open_device(index: u32) -> Result<ffmpeg_next::format::context::Input, SourceError> {
    Err(format!("capture device {index}: device indexes are not supported on this platform").into())
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn open_with_device_format(
    path: &str,
    format_names: &[&str],
) -> Result<ffmpeg_next::format::context::Input, SourceError> {
    ffmpeg_next::device::register_all();
    let format = ffmpeg_next::device::input::video()
        .find(|f| format_names.contains(&f.name()))
        .ok_or_else(|| format!("no capture backend among {format_names:?}"))?;
    let context = ffmpeg_next::format::open_with(
        &path,
        &ffmpeg_next::format::format::Format::Input(format),
        ffmpeg_next::Dictionary::new(),
    )?;
    match context {
        ffmpeg_next::format::context::Context::Input(input) => Ok(input),
        _ => Err(format!("{path} did not open as an input").into()),
    }
}

/// A decoding session over one opened input.
///
/// Each `read` pulls packets until the decoder yields a frame, converting it
/// to tightly-packed RGB24. The scaler is rebuilt if the stream changes
/// resolution mid-flight (some cameras do after a reconnect on their side).
pub struct FfmpegFrameSource {
    input: Option<ffmpeg_next::format::context::Input>,
    decoder: ffmpeg_next::decoder::Video,
    scaler: Option<Scaler>,
    video_stream_index: usize,
    metadata: StreamMetadata,
    frame_index: usize,
    flushing: bool,
}

struct Scaler {
    context: ffmpeg_next::software::scaling::Context,
    format: ffmpeg_next::format::Pixel,
    width: u32,
    height: u32,
}

// Safety: a FfmpegFrameSource is owned by a single capture thread at a time.
// The raw pointers inside ffmpeg types are never shared across threads.
unsafe impl Send for FfmpegFrameSource {}

impl FfmpegFrameSource {
    fn from_input(input: ffmpeg_next::format::context::Input) -> Result<Self, SourceError> {
        let stream = input
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or("No video stream found")?;
        let video_stream_index = stream.index();
        let codec_ctx = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())?;
        let decoder = codec_ctx.decoder().video()?;

        let rate = stream.avg_frame_rate();
        let fps = if rate.denominator() != 0 {
            rate.numerator() as f64 / rate.denominator() as f64
        } else {
            0.0
        };
        let metadata = StreamMetadata::new(
            decoder.width(),
            decoder.height(),
            fps,
            decoder
                .codec()
                .map(|c| c.name().to_string())
                .unwrap_or_default(),
        );

        Ok(Self {
            input: Some(input),
            decoder,
            scaler: None,
            video_stream_index,
            metadata,
            frame_index: 0,
            flushing: false,
        })
    }

    fn try_receive(&mut self) -> Result<Option<Frame>, SourceError> {
        let mut decoded = ffmpeg_next::util::frame::video::Video::empty();
        if self.decoder.receive_frame(&mut decoded).is_err() {
            return Ok(None);
        }

        let (width, height, format) = (decoded.width(), decoded.height(), decoded.format());
        let stale = self
            .scaler
            .as_ref()
            .map_or(true, |s| s.width != width || s.height != height || s.format != format);
        if stale {
            let context = ffmpeg_next::software::scaling::Context::get(
                format,
                width,
                height,
                ffmpeg_next::format::Pixel::RGB24,
                width,
                height,
                ffmpeg_next::software::scaling::Flags::BILINEAR,
            )?;
            self.scaler = Some(Scaler {
                context,
                format,
                width,
                height,
            });
            self.metadata.width = width;
            self.metadata.height = height;
        }

        let mut rgb = ffmpeg_next::util::frame::video::Video::empty();
        if let Some(scaler) = self.scaler.as_mut() {
            scaler.context.run(&decoded, &mut rgb)?;
        }
        let pixels = extract_rgb_pixels(&rgb, width, height);
        let frame = Frame::new(pixels, width, height, 3, self.frame_index);
        self.frame_index += 1;
        Ok(Some(frame))
    }
}

impl FrameSource for FfmpegFrameSource {
    fn metadata(&self) -> StreamMetadata {
        self.metadata.clone()
    }

    fn read(&mut self) -> Result<Frame, SourceError> {
        if self.input.is_none() {
            return Err("source released".into());
        }
        if let Some(frame) = self.try_receive()? {
            return Ok(frame);
        }
        if self.flushing {
            return Err("end of stream".into());
        }

        loop {
            let next = match self.input.as_mut() {
                Some(input) => input.packets().next(),
                None => return Err("source released".into()),
            };
            let Some((stream, packet)) = next else {
                let _ = self.decoder.send_eof();
                self.flushing = true;
                return match self.try_receive()? {
                    Some(frame) => Ok(frame),
                    None => Err("end of stream".into()),
                };
            };

            if stream.index() != self.video_stream_index {
                continue;
            }
            if self.decoder.send_packet(&packet).is_err() {
                continue;
            }
            if let Some(frame) = self.try_receive()? {
                return Ok(frame);
            }
        }
    }

    fn release(&mut self) {
        self.input = None;
        self.scaler = None;
    }
}

/// Copies pixel data out of an ffmpeg frame, dropping per-row stride padding.
fn extract_rgb_pixels(
    rgb_frame: &ffmpeg_next::util::frame::video::Video,
    width: u32,
    height: u32,
) -> Vec<u8> {
    let stride = rgb_frame.stride(0);
    let data = rgb_frame.data(0);
    let row_bytes = width as usize * 3;

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(&data[start..start + row_bytes]);
    }
    pixels
}
