use crate::annotation::infrastructure::bitmap_font::{draw_text, text_height, text_width};
use crate::shared::frame::Frame;

pub const RECONNECTING_MESSAGE: &str = "RECONNECTING...";
pub const UNAVAILABLE_MESSAGE: &str = "STREAM UNAVAILABLE";

const MAX_SCALE: u32 = 4;
const MARGIN: u32 = 10;
const TEXT_COLOR: [u8; 3] = [255, 255, 255];

/// Black frame with `message` centered in white, at the largest scale
/// that fits.
pub fn placeholder_frame(width: u32, height: u32, message: &str) -> Frame {
    let mut frame = Frame::blank(width.max(1), height.max(1));
    let scale = (1..=MAX_SCALE)
        .rev()
        .find(|&s| text_width(message, s) + 2 * MARGIN <= frame.width())
        .unwrap_or(1);

    let x = (frame.width() as i64 - text_width(message, scale) as i64) / 2;
    let y = (frame.height() as i64 - text_height(scale) as i64) / 2;
    draw_text(&mut frame, x, y, message, scale, TEXT_COLOR);
    frame
}
