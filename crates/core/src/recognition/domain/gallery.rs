use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::recognition::domain::embedding::mean_embedding;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("identity store unavailable: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("embeddings for {key} differ in dimension")]
    RaggedEmbeddings { key: IdentityKey },
    #[error("embedding for {key} has {found} dimensions, gallery uses {expected}")]
    DimensionMismatch {
        key: IdentityKey,
        expected: usize,
        found: usize,
    },
}

/// `"{user_id}_{name}"`, unique per registered person.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn new(user_id: &str, name: &str) -> Self {
        Self(format!("{user_id}_{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityInfo {
    pub user_id: String,
    pub name: String,
}

impl IdentityInfo {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
        }
    }

    pub fn key(&self) -> IdentityKey {
        IdentityKey::new(&self.user_id, &self.name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GalleryEntry {
    pub key: IdentityKey,
    pub info: IdentityInfo,
    pub embedding: Vec<f32>,
}

/// Immutable set of reference embeddings, ordered by identity key.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IdentityGallery {
    entries: Vec<GalleryEntry>,
}

impl IdentityGallery {
    /// Builds a gallery from per-image embeddings, averaging each identity.
    /// Identities without embeddings are left out.
    pub fn from_samples(
        samples: impl IntoIterator<Item = (IdentityInfo, Vec<f32>)>,
    ) -> Result<Self, GalleryError> {
        let mut grouped: BTreeMap<IdentityKey, (IdentityInfo, Vec<Vec<f32>>)> = BTreeMap::new();
        for (info, embedding) in samples {
            grouped
                .entry(info.key())
                .or_insert_with(|| (info, Vec::new()))
                .1
                .push(embedding);
        }

        let mut entries = Vec::with_capacity(grouped.len());
        for (key, (info, embeddings)) in grouped {
            let embedding = mean_embedding(&embeddings)
                .ok_or_else(|| GalleryError::RaggedEmbeddings { key: key.clone() })?;
            entries.push(GalleryEntry {
                key,
                info,
                embedding,
            });
        }
        Self::new(entries)
    }

    /// Sorts `entries` by key; every embedding must share one dimension.
    /// On duplicate keys the first entry is kept.
    pub fn new(mut entries: Vec<GalleryEntry>) -> Result<Self, GalleryError> {
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries.dedup_by(|later, earlier| later.key == earlier.key);

        if let Some(first) = entries.first() {
            let expected = first.embedding.len();
            if let Some(bad) = entries.iter().find(|e| e.embedding.len() != expected) {
                return Err(GalleryError::DimensionMismatch {
                    key: bad.key.clone(),
                    expected,
                    found: bad.embedding.len(),
                });
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&GalleryEntry> {
        self.entries
            .binary_search_by(|e| e.key.cmp(key))
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The currently published gallery.
///
/// Readers take a cheap snapshot and keep using it even if a reload
/// publishes a new gallery meanwhile.
#[derive(Default)]
pub struct SharedGallery {
    current: RwLock<Arc<IdentityGallery>>,
}

impl SharedGallery {
    pub fn new(gallery: IdentityGallery) -> Self {
        Self {
            current: RwLock::new(Arc::new(gallery)),
        }
    }

    pub fn snapshot(&self) -> Arc<IdentityGallery> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Replaces the gallery wholesale, returning the previous one.
    pub fn publish(&self, gallery: IdentityGallery) -> Arc<IdentityGallery> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, Arc::new(gallery))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn entry(user_id: &str, name: &str, embedding: Vec<f32>) -> GalleryEntry {
        let info = IdentityInfo::new(user_id, name);
        GalleryEntry {
            key: info.key(),
            info,
            embedding,
        }
    }

    #[test]
    fn test_identity_key_format() {
        assert_eq!(IdentityInfo::new("42", "alice").key().as_str(), "42_alice");
    }

    #[test]
    fn test_entries_are_ordered_by_key() {
        let gallery = IdentityGallery::new(vec![
            entry("2", "bob", vec![0.0, 1.0]),
            entry("1", "alice", vec![1.0, 0.0]),
        ])
        .unwrap();
        let keys: Vec<&str> = gallery.entries().iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["1_alice", "2_bob"]);
        assert!(gallery.get(&IdentityKey::new("2", "bob")).is_some());
        assert!(gallery.get(&IdentityKey::new("3", "carol")).is_none());
    }

    #[test]
    fn test_samples_are_averaged_per_identity() {
        let alice = IdentityInfo::new("1", "alice");
        let bob = IdentityInfo::new("2", "bob");
        let gallery = IdentityGallery::from_samples(vec![
            (alice.clone(), vec![1.0, 0.0]),
            (bob, vec![0.0, 1.0]),
            (alice.clone(), vec![0.0, 1.0]),
        ])
        .unwrap();

        assert_eq!(gallery.len(), 2);
        let entry = gallery.get(&alice.key()).unwrap();
        assert_relative_eq!(entry.embedding[0], 0.5);
        assert_relative_eq!(entry.embedding[1], 0.5);
    }

    #[test]
    fn test_mixed_dimensions_are_rejected() {
        let result = IdentityGallery::new(vec![
            entry("1", "alice", vec![1.0, 0.0]),
            entry("2", "bob", vec![1.0, 0.0, 0.0]),
        ]);
        assert!(matches!(result, Err(GalleryError::DimensionMismatch { .. })));

        let ragged = IdentityGallery::from_samples(vec![
            (IdentityInfo::new("1", "alice"), vec![1.0]),
            (IdentityInfo::new("1", "alice"), vec![1.0, 0.0]),
        ]);
        assert!(matches!(ragged, Err(GalleryError::RaggedEmbeddings { .. })));
    }

    #[test]
    fn test_snapshot_survives_publish() {
        let shared = SharedGallery::default();
        let before = shared.snapshot();
        assert!(before.is_empty());

        let next = IdentityGallery::new(vec![entry("1", "alice", vec![1.0])]).unwrap();
        let previous = shared.publish(next);

        assert!(previous.is_empty());
        assert!(before.is_empty());
        assert_eq!(shared.snapshot().len(), 1);
    }
}
