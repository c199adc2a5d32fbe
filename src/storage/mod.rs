//! Storage-agnostic persistence for image entities.
//!
//! The orchestration core only speaks [`ImageStore`]; the backing store is
//! interchangeable. Two backends ship here: a flat-file store with JSON
//! metadata and an SQLite store. The artifact bytes are stored and
//! addressed separately from the metadata record in both.

use crate::error::Result;
use crate::types::PersistentImage;
use async_trait::async_trait;
use std::collections::HashMap;

pub mod file;
pub mod sqlite;

pub use file::FileStore;
pub use sqlite::SqliteStore;

/// CRUD interface over persisted image entities.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Fetch one entity by identifier.
    async fn image_with_id(&self, id: &str) -> Result<PersistentImage>;

    /// All entities whose persisted metadata matches every key/value in
    /// the predicate. Predicates should include a `type` discriminator.
    async fn images_from_query(
        &self,
        query: &HashMap<String, String>,
    ) -> Result<Vec<PersistentImage>>;

    /// Begin managing a new entity: fails if the identifier is already
    /// managed, otherwise allocates backing storage for the artifact bytes
    /// (stamping the handle onto the entity) and writes the initial
    /// metadata snapshot.
    async fn add_image(&self, image: &mut PersistentImage) -> Result<()>;

    /// Overwrite the metadata snapshot of an already-managed entity.
    /// Fails if the entity is not managed; use [`ImageStore::add_image`]
    /// first.
    async fn save_image(&self, image: &PersistentImage) -> Result<()>;

    /// Best-effort removal of both metadata and artifact bytes. Individual
    /// failures after the entity is located are logged, not raised, so
    /// deletion can make partial progress.
    async fn delete_image_with_id(&self, id: &str) -> Result<()>;
}

/// Convenience: build a query predicate from pairs.
pub fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}
