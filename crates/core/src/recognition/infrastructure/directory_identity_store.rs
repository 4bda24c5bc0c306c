use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use image::ImageFormat;
use thiserror::Error;

use crate::recognition::domain::gallery::GalleryError;
use crate::recognition::domain::identity_store::{IdentityRecord, IdentityStore};
use crate::shared::constants::IMAGE_EXTENSIONS;

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("invalid identity {user_id:?}/{name:?}: {reason}")]
    InvalidIdentity {
        user_id: String,
        name: String,
        reason: &'static str,
    },
    #[error("none of the {0} images could be decoded")]
    NoValidImages(usize),
    #[error("identity directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to save {path}: {source}")]
    Save {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("images saved but the gallery could not be rebuilt: {0}")]
    Gallery(#[from] GalleryError),
}

/// A registered person and how many face images they have.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisteredUser {
    pub user_id: String,
    pub name: String,
    pub image_count: usize,
}

/// Identity images laid out as `<root>/<user_id>_<name>/<image>`.
///
/// Directories without an underscore are not identities and are skipped.
pub struct DirectoryIdentityStore {
    root: PathBuf,
}

impl DirectoryIdentityStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Decodes each input and stores it as `<user_id>_<name>/<name>_NNNN.jpg`,
    /// numbering after any images already registered. Undecodable inputs are
    /// skipped; at least one must decode. Returns the saved paths.
    pub fn register<P: AsRef<Path>>(
        &self,
        user_id: &str,
        name: &str,
        images: &[P],
    ) -> Result<Vec<PathBuf>, RegistrationError> {
        validate_identity(user_id, name)?;
        let decoded: Vec<_> = images
            .iter()
            .filter_map(|input| {
                let input = input.as_ref();
                match image::open(input) {
                    Ok(img) => Some(img),
                    Err(e) => {
                        log::warn!("Skipping {}: {e}", input.display());
                        None
                    }
                }
            })
            .collect();
        if decoded.is_empty() {
            return Err(RegistrationError::NoValidImages(images.len()));
        }

        let dir = self.root.join(format!("{user_id}_{name}"));
        fs::create_dir_all(&dir).map_err(|source| RegistrationError::Io {
            path: dir.clone(),
            source,
        })?;
        let mut sequence = next_sequence(&dir, name)?;

        let mut saved = Vec::with_capacity(decoded.len());
        for img in decoded {
            let path = dir.join(format!("{name}_{sequence:04}.jpg"));
            img.to_rgb8()
                .save_with_format(&path, ImageFormat::Jpeg)
                .map_err(|source| RegistrationError::Save {
                    path: path.clone(),
                    source,
                })?;
            sequence += 1;
            saved.push(path);
        }
        log::info!(
            "Registered {} images for {user_id} ({name}) in {}",
            saved.len(),
            dir.display()
        );
        Ok(saved)
    }

    /// Every registered person, ordered by directory name.
    pub fn list_users(&self) -> Result<Vec<RegisteredUser>, RegistrationError> {
        self.identity_dirs()?
            .into_iter()
            .map(|(dir, user_id, name)| {
                Ok(RegisteredUser {
                    image_count: images_in(&dir)?.len(),
                    user_id,
                    name,
                })
            })
            .collect()
    }

    /// Face images registered under `user_id`, empty when unknown.
    pub fn user_images(&self, user_id: &str) -> Result<Vec<PathBuf>, RegistrationError> {
        let mut images = Vec::new();
        for (dir, id, _) in self.identity_dirs()? {
            if id == user_id {
                images.extend(images_in(&dir)?);
            }
        }
        Ok(images)
    }

    fn identity_dirs(&self) -> Result<Vec<(PathBuf, String, String)>, RegistrationError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.root).map_err(|source| RegistrationError::Io {
            path: self.root.clone(),
            source,
        })?;
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        Ok(dirs
            .into_iter()
            .filter_map(|dir| {
                let dir_name = dir.file_name().and_then(|n| n.to_str())?;
                let Some((user_id, name)) = parse_identity_dir(dir_name) else {
                    log::debug!("Skipping {}: not <user_id>_<name>", dir.display());
                    return None;
                };
                let (user_id, name) = (user_id.to_string(), name.to_string());
                Some((dir, user_id, name))
            })
            .collect())
    }
}

impl IdentityStore for DirectoryIdentityStore {
    fn load_all(&self) -> Result<Vec<IdentityRecord>, Box<dyn std::error::Error + Send + Sync>> {
        if !self.root.exists() {
            log::warn!("Identity directory {} does not exist", self.root.display());
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for (dir, user_id, name) in self.identity_dirs()? {
            records.extend(images_in(&dir)?.into_iter().map(|image_path| IdentityRecord {
                user_id: user_id.clone(),
                name: name.clone(),
                image_path,
            }));
        }
        Ok(records)
    }
}

fn validate_identity(user_id: &str, name: &str) -> Result<(), RegistrationError> {
    let reason = if user_id.is_empty() || name.is_empty() {
        Some("user id and name must be non-empty")
    } else if user_id.contains('_') {
        Some("user id must not contain '_'")
    } else if [user_id, name]
        .iter()
        .any(|part| part.contains(['/', '\\']) || *part == "." || *part == "..")
    {
        Some("user id and name must be plain directory names")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(RegistrationError::InvalidIdentity {
            user_id: user_id.to_string(),
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// One past the highest `<name>_NNNN` already in `dir`, starting at 1.
fn next_sequence(dir: &Path, name: &str) -> Result<u32, RegistrationError> {
    let prefix = format!("{name}_");
    let highest = images_in(dir)?
        .iter()
        .filter_map(|p| p.file_stem()?.to_str()?.strip_prefix(&prefix)?.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    Ok(highest + 1)
}

fn images_in(dir: &Path) -> Result<Vec<PathBuf>, RegistrationError> {
    let entries = fs::read_dir(dir).map_err(|source| RegistrationError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut images: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_image(p))
        .collect();
    images.sort();
    Ok(images)
}

/// Splits at the first underscore; both halves must be non-empty.
fn parse_identity_dir(dir_name: &str) -> Option<(&str, &str)> {
    let (user_id, name) = dir_name.split_once('_')?;
    if user_id.is_empty() || name.is_empty() {
        return None;
    }
    Some((user_id, name))
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
