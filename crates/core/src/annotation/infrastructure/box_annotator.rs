use crate::annotation::domain::frame_annotator::FrameAnnotator;
use crate::annotation::infrastructure::bitmap_font::{draw_text, text_height};
use crate::recognition::domain::match_result::MatchResult;
use crate::shared::bounding_box::BoundingBox;
use crate::shared::frame::Frame;

pub const MATCHED_COLOR: [u8; 3] = [0, 255, 0];
pub const UNKNOWN_COLOR: [u8; 3] = [255, 0, 0];

/// Outlines each face and writes its label above the box: green for
/// recognized identities, red for unknown faces.
pub struct BoxAnnotator {
    thickness: u32,
    font_scale: u32,
}

impl BoxAnnotator {
    pub fn new(thickness: u32, font_scale: u32) -> Self {
        Self {
            thickness: thickness.max(1),
            font_scale: font_scale.max(1),
        }
    }
}

impl Default for BoxAnnotator {
    fn default() -> Self {
        Self::new(2, 2)
    }
}

impl FrameAnnotator for BoxAnnotator {
    fn annotate(&self, frame: &mut Frame, matches: &[MatchResult]) {
        for m in matches {
            let color = if m.is_match() {
                MATCHED_COLOR
            } else {
                UNKNOWN_COLOR
            };
            draw_rect(frame, &m.bbox, self.thickness, color);

            let label_h = text_height(self.font_scale) as i64;
            let above = m.bbox.y as i64 - label_h - 4;
            let label_y = if above >= 0 { above } else { m.bbox.bottom() as i64 + 4 };
            draw_text(
                frame,
                m.bbox.x as i64,
                label_y,
                &m.label(),
                self.font_scale,
                color,
            );
        }
    }
}

/// Draws a rectangle outline growing inwards from `bbox`'s edges.
fn draw_rect(frame: &mut Frame, bbox: &BoundingBox, thickness: u32, color: [u8; 3]) {
    let (x1, y1) = (bbox.x as i64, bbox.y as i64);
    let (x2, y2) = (bbox.right() as i64 - 1, bbox.bottom() as i64 - 1);
    if x2 < x1 || y2 < y1 {
        return;
    }
    for t in 0..thickness as i64 {
        for x in x1..=x2 {
            frame.put_pixel(x, y1 + t, color);
            frame.put_pixel(x, y2 - t, color);
        }
        for y in y1..=y2 {
            frame.put_pixel(x1 + t, y, color);
            frame.put_pixel(x2 - t, y, color);
        }
    }
}
