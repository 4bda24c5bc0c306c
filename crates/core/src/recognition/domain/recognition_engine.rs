use std::sync::Arc;

use crate::annotation::domain::frame_annotator::FrameAnnotator;
use crate::recognition::domain::embedding::cosine_similarity;
use crate::recognition::domain::face_analyzer::FaceAnalyzer;
use crate::recognition::domain::gallery::{GalleryEntry, IdentityGallery};
use crate::recognition::domain::match_result::MatchResult;
use crate::shared::frame::Frame;

/// Annotated copy of a frame and what was recognized in it.
#[derive(Clone, Debug)]
pub struct Recognition {
    pub frame: Frame,
    pub matches: Vec<MatchResult>,
}

/// Turns a raw frame into identity matches against a gallery snapshot.
pub struct RecognitionEngine {
    analyzer: Arc<dyn FaceAnalyzer>,
    annotator: Arc<dyn FrameAnnotator>,
    threshold: f64,
}

impl RecognitionEngine {
    pub fn new(
        analyzer: Arc<dyn FaceAnalyzer>,
        annotator: Arc<dyn FrameAnnotator>,
        threshold: f64,
    ) -> Self {
        Self {
            analyzer,
            annotator,
            threshold,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn analyzer(&self) -> &Arc<dyn FaceAnalyzer> {
        &self.analyzer
    }

    /// Analyzer failures are contained: the frame comes back unannotated
    /// with no matches.
    pub fn process(&self, frame: &Frame, gallery: &IdentityGallery) -> Recognition {
        let faces = match self.analyzer.analyze(frame) {
            Ok(faces) => faces,
            Err(e) => {
                log::warn!("Face analysis failed on frame {}: {e}", frame.index());
                return Recognition {
                    frame: frame.clone(),
                    matches: Vec::new(),
                };
            }
        };

        let matches: Vec<MatchResult> = faces
            .into_iter()
            .map(|face| {
                let (entry, similarity) = best_match(&face.embedding, gallery, self.threshold);
                MatchResult {
                    bbox: face.bbox,
                    identity: entry.map(|e| e.info.clone()),
                    similarity,
                }
            })
            .collect();
        log::debug!(
            "Frame {}: {} face(s), {} matched",
            frame.index(),
            matches.len(),
            matches.iter().filter(|m| m.is_match()).count()
        );

        let mut annotated = frame.clone();
        self.annotator.annotate(&mut annotated, &matches);
        Recognition {
            frame: annotated,
            matches,
        }
    }
}

/// Highest-similarity gallery entry for `embedding`.
///
/// The first entry wins on exact ties. The entry is returned only if its
/// similarity is strictly above `threshold`; the similarity is always
/// returned, and is -1 for an empty gallery.
pub fn best_match<'g>(
    embedding: &[f32],
    gallery: &'g IdentityGallery,
    threshold: f64,
) -> (Option<&'g GalleryEntry>, f64) {
    let mut best: Option<&GalleryEntry> = None;
    let mut best_similarity = -1.0f64;
    for entry in gallery.entries() {
        let similarity = cosine_similarity(embedding, &entry.embedding);
        if best.is_none() || similarity > best_similarity {
            best = Some(entry);
            best_similarity = similarity;
        }
    }
    if best_similarity > threshold {
        (best, best_similarity)
    } else {
        (None, best_similarity)
    }
}
