//! SQLite-backed image store.
//!
//! Metadata records live in an SQLite database; artifact bodies are plain
//! files under an artifacts directory, addressed by the handle stored on
//! the entity. SQLite's own atomicity serializes metadata writes, so no
//! store-wide lock is needed here.

use crate::error::{ForgeError, Result};
use crate::storage::ImageStore;
use crate::types::PersistentImage;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// SQLite-backed store.
pub struct SqliteStore {
    pool: SqlitePool,
    artifacts_dir: PathBuf,
}

impl SqliteStore {
    /// Open (creating if needed) a store with a database at `db_path` and
    /// artifact bodies under `artifacts_dir`.
    pub async fn new(db_path: impl AsRef<Path>, artifacts_dir: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.as_ref();
        let artifacts_dir = artifacts_dir.into();
        info!(db = %db_path.display(), "Opening sqlite image store");

        if db_path != Path::new(":memory:") {
            if let Some(parent) = db_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ForgeError::IoError { path: parent.to_path_buf(), source: e })?;
            }
        }
        tokio::fs::create_dir_all(&artifacts_dir)
            .await
            .map_err(|e| ForgeError::IoError { path: artifacts_dir.clone(), source: e })?;

        let options = SqliteConnectOptions::from_str(db_path.to_str().ok_or_else(|| {
            ForgeError::InvalidConfig { reason: "Invalid database path".to_string() }
        })?)
        .map_err(|e| ForgeError::DatabaseError(e.to_string()))?
        .create_if_missing(true);

        // An in-memory database exists per connection, so it must not be
        // pooled across several.
        let max_connections = if db_path == Path::new(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| ForgeError::DatabaseError(e.to_string()))?;

        let store = Self { pool, artifacts_dir };
        store.run_migrations().await?;
        Ok(store)
    }

    /// In-memory database (for tests).
    pub async fn new_in_memory(artifacts_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::new(":memory:", artifacts_dir).await
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS images (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                metadata TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ForgeError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    fn decode(metadata: &str) -> Result<PersistentImage> {
        serde_json::from_str(metadata)
            .map_err(|e| ForgeError::StorageError(format!("Corrupt metadata record: {}", e)))
    }

    fn encode(image: &PersistentImage) -> Result<String> {
        serde_json::to_string(image)
            .map_err(|e| ForgeError::StorageError(format!("Failed to serialize metadata: {}", e)))
    }
}

#[async_trait]
impl ImageStore for SqliteStore {
    async fn image_with_id(&self, id: &str) -> Result<PersistentImage> {
        let row = sqlx::query("SELECT metadata FROM images WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ForgeError::DatabaseError(e.to_string()))?
            .ok_or_else(|| ForgeError::ImageNotFound { image_id: id.to_string() })?;
        Self::decode(row.get::<String, _>("metadata").as_str())
    }

    async fn images_from_query(
        &self,
        query: &HashMap<String, String>,
    ) -> Result<Vec<PersistentImage>> {
        // Narrow by the type discriminator in SQL, match the remaining
        // predicate keys against the decoded metadata.
        let rows = match query.get("type") {
            Some(kind) => sqlx::query("SELECT metadata FROM images WHERE kind = ?")
                .bind(kind)
                .fetch_all(&self.pool)
                .await,
            None => sqlx::query("SELECT metadata FROM images").fetch_all(&self.pool).await,
        }
        .map_err(|e| ForgeError::DatabaseError(e.to_string()))?;

        let mut matches = Vec::new();
        for row in rows {
            let metadata: String = row.get("metadata");
            match Self::decode(&metadata) {
                Ok(image) if image.matches_query(query) => matches.push(image),
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable record: {}", e),
            }
        }
        Ok(matches)
    }

    async fn add_image(&self, image: &mut PersistentImage) -> Result<()> {
        let existing = sqlx::query("SELECT id FROM images WHERE id = ?")
            .bind(&image.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ForgeError::DatabaseError(e.to_string()))?;
        if existing.is_some() {
            return Err(ForgeError::ImageAlreadyExists { image_id: image.id.clone() });
        }

        // Allocate the artifact backing and stamp the handle.
        let body = self.artifacts_dir.join(format!("{}.body", image.id));
        tokio::fs::write(&body, b"")
            .await
            .map_err(|e| ForgeError::IoError { path: body.clone(), source: e })?;
        image.artifact = Some(body.to_string_lossy().to_string());

        sqlx::query("INSERT INTO images (id, kind, status, metadata) VALUES (?, ?, ?, ?)")
            .bind(&image.id)
            .bind(image.kind().as_str())
            .bind(image.status.as_str())
            .bind(Self::encode(image)?)
            .execute(&self.pool)
            .await
            .map_err(|e| ForgeError::DatabaseError(e.to_string()))?;
        debug!(id = %image.id, kind = %image.kind(), "Added image");
        Ok(())
    }

    async fn save_image(&self, image: &PersistentImage) -> Result<()> {
        let result = sqlx::query("UPDATE images SET status = ?, metadata = ? WHERE id = ?")
            .bind(image.status.as_str())
            .bind(Self::encode(image)?)
            .bind(&image.id)
            .execute(&self.pool)
            .await
            .map_err(|e| ForgeError::DatabaseError(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::ImageNotFound { image_id: image.id.clone() });
        }
        Ok(())
    }

    async fn delete_image_with_id(&self, id: &str) -> Result<()> {
        let image = self.image_with_id(id).await?;

        let result = sqlx::query("DELETE FROM images WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| ForgeError::DatabaseError(e.to_string()))?;
        if result.rows_affected() == 0 {
            warn!(id, "Metadata record vanished before delete");
        }

        if let Some(artifact) = image.artifact {
            if let Err(e) = tokio::fs::remove_file(&artifact).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(%artifact, "Failed to remove artifact: {}", e);
                }
            }
        }
        info!(id, "Deleted image");
        Ok(())
    }
}
