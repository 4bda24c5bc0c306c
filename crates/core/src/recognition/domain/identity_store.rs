use std::path::PathBuf;

/// One registered face image of a person.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityRecord {
    pub user_id: String,
    pub name: String,
    pub image_path: PathBuf,
}

/// Persistent source of registered identities.
pub trait IdentityStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<IdentityRecord>, Box<dyn std::error::Error + Send + Sync>>;
}
