use crate::recognition::domain::face_analyzer::FaceAnalyzer;
use crate::recognition::domain::gallery::{GalleryError, IdentityGallery, IdentityInfo};
use crate::recognition::domain::identity_store::IdentityStore;
use crate::shared::frame::Frame;

/// Embeds every registered image and averages the results per identity.
///
/// Images that cannot be decoded or contain no face are skipped with a
/// warning; the first detected face of an image is used.
pub fn build_gallery(
    store: &dyn IdentityStore,
    analyzer: &dyn FaceAnalyzer,
) -> Result<IdentityGallery, GalleryError> {
    let records = store.load_all().map_err(GalleryError::Store)?;

    let mut samples = Vec::with_capacity(records.len());
    let mut skipped = 0usize;
    for record in &records {
        let img = match image::open(&record.image_path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                log::warn!("Skipping {}: {e}", record.image_path.display());
                skipped += 1;
                continue;
            }
        };
        let frame = Frame::from_rgb_image(img, 0);
        let face = match analyzer.analyze(&frame) {
            Ok(faces) => faces.into_iter().next(),
            Err(e) => {
                log::warn!("Skipping {}: {e}", record.image_path.display());
                None
            }
        };
        match face {
            Some(face) => samples.push((
                IdentityInfo::new(record.user_id.clone(), record.name.clone()),
                face.embedding,
            )),
            None => {
                log::warn!("No face found in {}", record.image_path.display());
                skipped += 1;
            }
        }
    }

    let gallery = IdentityGallery::from_samples(samples)?;
    log::info!(
        "Gallery built: {} identities from {} images ({skipped} skipped)",
        gallery.len(),
        records.len()
    );
    Ok(gallery)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognition::domain::face_analyzer::DetectedFace;
    use crate::recognition::infrastructure::directory_identity_store::DirectoryIdentityStore;
    use crate::shared::bounding_box::BoundingBox;
    use crate::testing::FixedAnalyzer;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_png(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        image::RgbImage::new(16, 16).save(path).unwrap();
    }

    fn face(embedding: Vec<f32>) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox::new(0, 0, 16, 16),
            embedding,
        }
    }

    #[test]
    fn test_builds_one_entry_per_identity() {
        let tmp = TempDir::new().unwrap();
        write_png(&tmp.path().join("1_alice/a.png"));
        write_png(&tmp.path().join("1_alice/b.png"));
        write_png(&tmp.path().join("2_bob/a.png"));
        let store = DirectoryIdentityStore::new(tmp.path());
        let analyzer = FixedAnalyzer::faces(vec![face(vec![1.0, 0.0]), face(vec![0.0, 1.0])]);

        let gallery = build_gallery(&store, &analyzer).unwrap();

        let names: Vec<&str> = gallery.entries().iter().map(|e| e.info.name.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob"]);
        assert_eq!(gallery.entries()[0].embedding, vec![1.0, 0.0]);
        assert_eq!(analyzer.calls(), 3);
    }

    #[test]
    fn test_undecodable_and_faceless_images_are_skipped() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("1_alice")).unwrap();
        fs::write(tmp.path().join("1_alice/broken.jpg"), b"not an image").unwrap();
        write_png(&tmp.path().join("2_bob/a.png"));
        let store = DirectoryIdentityStore::new(tmp.path());

        let gallery = build_gallery(&store, &FixedAnalyzer::faces(Vec::new())).unwrap();
        assert!(gallery.is_empty());
    }
}
