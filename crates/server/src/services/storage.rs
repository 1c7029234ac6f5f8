// Photo storage
//
// The core only talks to `ImageStore`; `LocalImageStore` keeps files on disk
// under the media directory, served back by the static file layer.

use std::path::{Path, PathBuf};

use axum::async_trait;
use chrono::Utc;
use tokio::fs;
use uuid::Uuid;

use crate::error::{AppError, Result, ValidationErrors};

pub const ALLOWED_IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

#[derive(Debug, Clone)]
pub struct ImageConstraints {
    pub max_bytes: usize,
    pub allowed_extensions: &'static [&'static str],
}

impl ImageConstraints {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            allowed_extensions: ALLOWED_IMAGE_EXTENSIONS,
        }
    }

    /// Returns the normalized extension of an acceptable image.
    pub fn check(&self, file_name: &str, size: usize) -> Result<String> {
        let mut errors = ValidationErrors::new();

        if size == 0 {
            errors.add("image", "Image is empty");
        }
        if size > self.max_bytes {
            errors.add(
                "image",
                format!("Image exceeds the {} size limit", format_megabytes(self.max_bytes)),
            );
        }

        let extension = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if !self.allowed_extensions.contains(&extension.as_str()) {
            errors.add(
                "image",
                format!(
                    "Unsupported image format; allowed: {}",
                    self.allowed_extensions.join(", ")
                ),
            );
        }

        errors.into_result()?;
        Ok(extension)
    }
}

fn format_megabytes(bytes: usize) -> String {
    const MB: usize = 1024 * 1024;
    if bytes % MB == 0 {
        format!("{} MB", bytes / MB)
    } else {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    }
}

#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Validates and persists an image, returning its storage reference.
    async fn store(
        &self,
        file_name: &str,
        bytes: &[u8],
        constraints: &ImageConstraints,
    ) -> Result<String>;

    /// Public URL under which a stored reference can be fetched.
    fn resolve(&self, reference: &str) -> String;

    async fn remove(&self, reference: &str) -> Result<()>;
}

pub struct LocalImageStore {
    base_path: PathBuf,
    public_url: String,
}

impl LocalImageStore {
    pub fn new(base_path: impl Into<PathBuf>, public_url: &str) -> Self {
        Self {
            base_path: base_path.into(),
            public_url: public_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to create media directory: {e}")))?;
        Ok(())
    }

    fn path_of(&self, reference: &str) -> Result<PathBuf> {
        if reference.split('/').any(|part| part == ".." || part.is_empty()) {
            return Err(AppError::BadRequest(format!(
                "Invalid image reference: {reference}"
            )));
        }
        Ok(self.base_path.join(reference))
    }
}

#[async_trait]
impl ImageStore for LocalImageStore {
    async fn store(
        &self,
        file_name: &str,
        bytes: &[u8],
        constraints: &ImageConstraints,
    ) -> Result<String> {
        let extension = constraints.check(file_name, bytes.len())?;

        let reference = format!(
            "photos/{}/{}.{extension}",
            Utc::now().format("%Y/%m/%d"),
            Uuid::new_v4()
        );
        let path = self.path_of(&reference)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::Internal(format!("Failed to create directories: {e}")))?;
        }

        fs::write(&path, bytes)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to write image: {e}")))?;

        Ok(reference)
    }

    fn resolve(&self, reference: &str) -> String {
        format!("{}/{reference}", self.public_url)
    }

    async fn remove(&self, reference: &str) -> Result<()> {
        let path = self.path_of(reference)?;
        if fs::try_exists(&path).await.unwrap_or(false) {
            fs::remove_file(&path)
                .await
                .map_err(|e| AppError::Internal(format!("Failed to delete image: {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: usize = 1024 * 1024;

    #[test]
    fn size_limit_is_inclusive() {
        let constraints = ImageConstraints::new(5 * MB);
        assert_eq!(constraints.check("site.JPG", 5 * MB).unwrap(), "jpg");
        assert!(constraints.check("site.jpg", 4 * MB).is_ok());

        let err = constraints.check("site.jpg", 6 * MB).unwrap_err();
        match err {
            AppError::Validation(errors) => {
                assert!(errors.field("image").unwrap()[0].contains("5 MB"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn small_limits_are_reported_with_decimals() {
        let constraints = ImageConstraints::new(MB / 2);
        match constraints.check("site.png", MB) {
            Err(AppError::Validation(errors)) => {
                assert!(errors.field("image").unwrap()[0].contains("0.50 MB"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_formats() {
        let constraints = ImageConstraints::new(5 * MB);
        assert!(constraints.check("plan.pdf", 10).is_err());
        assert!(constraints.check("noextension", 10).is_err());
        assert!(constraints.check("photo.webp", 10).is_ok());
    }

    #[tokio::test]
    async fn stores_resolves_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalImageStore::new(dir.path(), "/media/");
        store.init().await.unwrap();

        let constraints = ImageConstraints::new(MB);
        let reference = store
            .store("front.png", b"\x89PNG fake", &constraints)
            .await
            .unwrap();
        assert!(reference.starts_with("photos/"));
        assert!(reference.ends_with(".png"));
        assert!(dir.path().join(&reference).exists());
        assert_eq!(store.resolve(&reference), format!("/media/{reference}"));

        store.remove(&reference).await.unwrap();
        assert!(!dir.path().join(&reference).exists());
        assert!(store.remove("../outside.png").await.is_err());
    }
}
