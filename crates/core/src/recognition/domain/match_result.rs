use crate::recognition::domain::gallery::{IdentityInfo, IdentityKey};
use crate::shared::bounding_box::BoundingBox;

/// Outcome of matching one detected face against the gallery.
#[derive(Clone, Debug, PartialEq)]
pub struct MatchResult {
    pub bbox: BoundingBox,
    /// The matched identity, `None` for unknown faces.
    pub identity: Option<IdentityInfo>,
    /// Best similarity found, also reported for unknown faces.
    pub similarity: f64,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        self.identity.is_some()
    }

    pub fn key(&self) -> Option<IdentityKey> {
        self.identity.as_ref().map(IdentityInfo::key)
    }

    /// `"alice (0.81)"` or `"Unknown (0.30)"`.
    pub fn label(&self) -> String {
        match &self.identity {
            Some(info) => format!("{} ({:.2})", info.name, self.similarity),
            None => format!("Unknown ({:.2})", self.similarity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels() {
        let bbox = BoundingBox::new(0, 0, 10, 10);
        let matched = MatchResult {
            bbox,
            identity: Some(IdentityInfo::new("1", "alice")),
            similarity: 0.8123,
        };
        let unknown = MatchResult {
            bbox,
            identity: None,
            similarity: 0.3,
        };
        assert_eq!(matched.label(), "alice (0.81)");
        assert_eq!(unknown.label(), "Unknown (0.30)");
        assert_eq!(matched.key().unwrap().as_str(), "1_alice");
        assert!(unknown.key().is_none());
    }
}
