use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum MediaStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Media file not found: {0}")]
    NotFound(String),
    #[error("Invalid path component: {0}")]
    InvalidPathComponent(String),
}

pub type MediaStoreResult<T> = Result<T, MediaStoreError>;

/// Resolves a photo delta's logical file name to a local path. Absence is an
/// expected failure (the file may reappear or be re-attached), not
/// corruption.
#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn resolve(&self, file_name: &str) -> MediaStoreResult<PathBuf>;
}

/// Media store rooted at a single directory of captured photos.
pub struct LocalMediaStore {
    base_path: PathBuf,
}

impl LocalMediaStore {
    /// Creates the store, ensuring the base directory exists.
    pub fn new(base_path_str: &str) -> io::Result<Self> {
        let base_path = PathBuf::from(base_path_str);
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    /// Rejects file names that could escape the base directory.
    fn sanitize_component(component: &str) -> MediaStoreResult<&str> {
        if component.is_empty()
            || component.contains('/')
            || component.contains('\\')
            || component == "."
            || component == ".."
        {
            Err(MediaStoreError::InvalidPathComponent(component.to_string()))
        } else {
            Ok(component)
        }
    }
}

#[async_trait]
impl MediaStore for LocalMediaStore {
    async fn resolve(&self, file_name: &str) -> MediaStoreResult<PathBuf> {
        let sanitized = Self::sanitize_component(file_name)?;
        let path = self.base_path.join(sanitized);

        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            Ok(_) => Err(MediaStoreError::NotFound(file_name.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(MediaStoreError::NotFound(file_name.to_string()))
            }
            Err(e) => Err(MediaStoreError::Io(e)),
        }
    }
}

/// Remote object key for an uploaded photo, namespaced per survey.
pub fn remote_media_path(survey_id: &str, file_name: &str) -> String {
    format!("user-media/{}/{}", survey_id, file_name)
}
