//! Flat-file image store.
//!
//! One directory per entity under the store root:
//!
//! ```text
//! <root>/<id>/metadata.json   — serialized metadata snapshot
//! <root>/<id>/image.body      — artifact bytes, allocated empty at add
//! ```
//!
//! Flat files are not transactional, so every metadata operation runs
//! under one store-wide lock.

use crate::error::{ForgeError, Result};
use crate::storage::ImageStore;
use crate::types::PersistentImage;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const METADATA_FILE: &str = "metadata.json";
const BODY_FILE: &str = "image.body";

/// Flat-file-with-JSON-metadata store.
pub struct FileStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| ForgeError::IoError { path: root.clone(), source: e })?;
        info!(root = %root.display(), "Opened file store");
        Ok(Self { root, lock: Mutex::new(()) })
    }

    /// sha256 fingerprint of an entity's artifact bytes.
    pub async fn fingerprint_artifact(&self, id: &str) -> Result<String> {
        let body = self.image_dir(id).join(BODY_FILE);
        let bytes = tokio::fs::read(&body)
            .await
            .map_err(|e| ForgeError::IoError { path: body, source: e })?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(format!("sha256:{:x}", hasher.finalize()))
    }

    fn image_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    async fn read_metadata(&self, path: &Path) -> Result<PersistentImage> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ForgeError::IoError { path: path.to_path_buf(), source: e })?;
        serde_json::from_str(&content).map_err(|e| {
            ForgeError::StorageError(format!("Corrupt metadata at {}: {}", path.display(), e))
        })
    }

    async fn write_metadata(&self, image: &PersistentImage) -> Result<()> {
        let path = self.image_dir(&image.id).join(METADATA_FILE);
        let content = serde_json::to_string_pretty(image)
            .map_err(|e| ForgeError::StorageError(format!("Failed to serialize metadata: {}", e)))?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| ForgeError::IoError { path, source: e })
    }
}

#[async_trait]
impl ImageStore for FileStore {
    async fn image_with_id(&self, id: &str) -> Result<PersistentImage> {
        let _guard = self.lock.lock().await;
        let path = self.image_dir(id).join(METADATA_FILE);
        if !path.exists() {
            return Err(ForgeError::ImageNotFound { image_id: id.to_string() });
        }
        self.read_metadata(&path).await
    }

    async fn images_from_query(
        &self,
        query: &HashMap<String, String>,
    ) -> Result<Vec<PersistentImage>> {
        let _guard = self.lock.lock().await;
        let mut matches = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| ForgeError::IoError { path: self.root.clone(), source: e })?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ForgeError::IoError { path: self.root.clone(), source: e })?
        {
            let metadata_path = entry.path().join(METADATA_FILE);
            if !metadata_path.exists() {
                continue;
            }
            match self.read_metadata(&metadata_path).await {
                Ok(image) if image.matches_query(query) => matches.push(image),
                Ok(_) => {}
                Err(e) => warn!(path = %metadata_path.display(), "Skipping unreadable record: {}", e),
            }
        }
        Ok(matches)
    }

    async fn add_image(&self, image: &mut PersistentImage) -> Result<()> {
        let _guard = self.lock.lock().await;
        let dir = self.image_dir(&image.id);
        if dir.join(METADATA_FILE).exists() {
            return Err(ForgeError::ImageAlreadyExists { image_id: image.id.clone() });
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ForgeError::IoError { path: dir.clone(), source: e })?;

        // Allocate the artifact backing and stamp the handle.
        let body = dir.join(BODY_FILE);
        tokio::fs::write(&body, b"")
            .await
            .map_err(|e| ForgeError::IoError { path: body.clone(), source: e })?;
        image.artifact = Some(body.to_string_lossy().to_string());

        self.write_metadata(image).await?;
        debug!(id = %image.id, kind = %image.kind(), "Added image");
        Ok(())
    }

    async fn save_image(&self, image: &PersistentImage) -> Result<()> {
        let _guard = self.lock.lock().await;
        if !self.image_dir(&image.id).join(METADATA_FILE).exists() {
            return Err(ForgeError::ImageNotFound { image_id: image.id.clone() });
        }
        self.write_metadata(image).await
    }

    async fn delete_image_with_id(&self, id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let dir = self.image_dir(id);
        if !dir.exists() {
            return Err(ForgeError::ImageNotFound { image_id: id.to_string() });
        }
        // Remove each piece independently so one failure does not stop the
        // rest.
        for name in [METADATA_FILE, BODY_FILE] {
            let path = dir.join(name);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), "Failed to remove: {}", e);
                }
            }
        }
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            warn!(path = %dir.display(), "Failed to remove image directory: {}", e);
        }
        info!(id, "Deleted image");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::query;
    use crate::types::{ImageStatus, PersistentImage};

    async fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("images")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_add_then_fetch_round_trips_metadata() {
        let (_dir, store) = store().await;
        let mut image = PersistentImage::base("img-1", "<template/>");
        image.parameters.insert("compress".to_string(), serde_json::json!(true));
        store.add_image(&mut image).await.unwrap();

        // add_image allocated a fresh artifact handle.
        let artifact = image.artifact.clone().unwrap();
        assert!(std::path::Path::new(&artifact).exists());

        let fetched = store.image_with_id("img-1").await.unwrap();
        assert_eq!(fetched.metadata(), image.metadata());
        assert_eq!(fetched.artifact, image.artifact);
    }

    #[tokio::test]
    async fn test_add_duplicate_fails() {
        let (_dir, store) = store().await;
        let mut image = PersistentImage::base("img-1", "<template/>");
        store.add_image(&mut image).await.unwrap();
        let mut dup = PersistentImage::base("img-1", "<template/>");
        assert!(matches!(
            store.add_image(&mut dup).await,
            Err(ForgeError::ImageAlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_save_requires_managed_entity() {
        let (_dir, store) = store().await;
        let image = PersistentImage::base("img-1", "<template/>");
        assert!(matches!(
            store.save_image(&image).await,
            Err(ForgeError::ImageNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_save_overwrites_snapshot() {
        let (_dir, store) = store().await;
        let mut image = PersistentImage::base("img-1", "<template/>");
        store.add_image(&mut image).await.unwrap();

        image.status = ImageStatus::Complete;
        image.percent_complete = 100;
        store.save_image(&image).await.unwrap();

        let fetched = store.image_with_id("img-1").await.unwrap();
        assert_eq!(fetched.status, ImageStatus::Complete);
        assert_eq!(fetched.percent_complete, 100);
    }

    #[tokio::test]
    async fn test_query_by_type_and_backref() {
        let (_dir, store) = store().await;
        let mut base = PersistentImage::base("img-b", "<template/>");
        let mut t1 = PersistentImage::target("img-t1", "img-b", "mock");
        let mut t2 = PersistentImage::target("img-t2", "other-base", "mock");
        store.add_image(&mut base).await.unwrap();
        store.add_image(&mut t1).await.unwrap();
        store.add_image(&mut t2).await.unwrap();

        let found = store
            .images_from_query(&query(&[
                ("type", "target_image"),
                ("base_image_id", "img-b"),
            ]))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "img-t1");
    }

    #[tokio::test]
    async fn test_delete_removes_metadata_and_artifact() {
        let (_dir, store) = store().await;
        let mut image = PersistentImage::base("img-1", "<template/>");
        store.add_image(&mut image).await.unwrap();
        let artifact = image.artifact.clone().unwrap();

        store.delete_image_with_id("img-1").await.unwrap();
        assert!(!std::path::Path::new(&artifact).exists());
        assert!(matches!(
            store.image_with_id("img-1").await,
            Err(ForgeError::ImageNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_unknown_reports_not_found() {
        let (_dir, store) = store().await;
        assert!(matches!(
            store.delete_image_with_id("missing").await,
            Err(ForgeError::ImageNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_fingerprint_artifact() {
        let (_dir, store) = store().await;
        let mut image = PersistentImage::base("img-1", "<template/>");
        store.add_image(&mut image).await.unwrap();
        tokio::fs::write(image.artifact.as_ref().unwrap(), b"artifact bytes")
            .await
            .unwrap();
        let fingerprint = store.fingerprint_artifact("img-1").await.unwrap();
        assert!(fingerprint.starts_with("sha256:"));
    }
}
