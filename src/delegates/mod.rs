//! Delegate contracts for OS and cloud plugins.
//!
//! The orchestration core never touches a disk image or a cloud API
//! itself; it invokes these hooks at fixed pipeline points and treats any
//! error as a stage failure. Hooks receive the owning [`Builder`] for
//! access to the in-progress entities and are never called concurrently
//! for the same entity.

use crate::builder::Builder;
use crate::error::Result;
use crate::types::PersistentImage;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// Install-time content a cloud delegate pushes through the OS delegate
/// before `create_target_image` runs (extra packages, files, repos).
#[derive(Debug, Clone)]
pub struct CloudContent {
    /// Content class understood by the OS delegate (e.g. "package", "file").
    pub content_type: String,
    /// Content payload or location.
    pub payload: String,
}

/// Operating-system plugin hooks.
#[async_trait]
pub trait OsDelegate: Send + Sync {
    /// Install the OS described by `template` into the builder's base
    /// image artifact.
    async fn create_base_image(
        &self,
        builder: &Builder,
        template: &str,
        parameters: &HashMap<String, Value>,
    ) -> Result<()>;

    /// Customize a copy of `base_image`'s artifact for a cloud target.
    async fn create_target_image(
        &self,
        builder: &Builder,
        target: &str,
        base_image: &PersistentImage,
        parameters: &HashMap<String, Value>,
    ) -> Result<()>;

    /// Accept extra install-time content from a cloud delegate. Optional.
    async fn add_cloud_plugin_content(&self, _content: &[CloudContent]) -> Result<()> {
        Ok(())
    }
}

/// Cloud plugin hooks.
#[async_trait]
pub trait CloudDelegate: Send + Sync {
    /// Gate for the target-image stage. Returning `false` short-circuits
    /// the OS-specific step entirely; the delegate has produced whatever
    /// it needs on its own. Optional, defaults to `true`.
    async fn builder_should_create_target_image(
        &self,
        _builder: &Builder,
        _target: &str,
        _parameters: &HashMap<String, Value>,
    ) -> Result<bool> {
        Ok(true)
    }

    /// Invoked before the OS delegate customizes the target image. Optional.
    async fn builder_will_create_target_image(
        &self,
        _builder: &Builder,
        _target: &str,
        _parameters: &HashMap<String, Value>,
    ) -> Result<()> {
        Ok(())
    }

    /// Invoked after the OS delegate customized the target image. Optional.
    async fn builder_did_create_target_image(
        &self,
        _builder: &Builder,
        _target: &str,
        _parameters: &HashMap<String, Value>,
    ) -> Result<()> {
        Ok(())
    }

    /// Upload the target image's artifact to the provider, stamping
    /// `identifier_on_provider` on the builder's provider image.
    async fn push_image_to_provider(
        &self,
        builder: &Builder,
        credentials: Option<&str>,
        parameters: &HashMap<String, Value>,
    ) -> Result<()>;

    /// Create the provider image by snapshotting an existing artifact
    /// already present at the provider.
    async fn snapshot_image_on_provider(
        &self,
        builder: &Builder,
        credentials: Option<&str>,
        parameters: &HashMap<String, Value>,
    ) -> Result<()>;

    /// Remove the image from the provider ahead of local deletion.
    async fn delete_from_provider(
        &self,
        builder: &Builder,
        credentials: Option<&str>,
    ) -> Result<()>;
}
