use crate::recognition::domain::match_result::MatchResult;
use crate::shared::frame::Frame;

/// Draws recognition results onto a frame in place.
pub trait FrameAnnotator: Send + Sync {
    fn annotate(&self, frame: &mut Frame, matches: &[MatchResult]);
}
