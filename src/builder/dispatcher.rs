//! Build dispatch and in-flight build tracking.
//!
//! The `BuildDispatcher` is the public face of the pipeline: its entry
//! points construct the entity, wire its webhook workers, persist it, and
//! hand it to a `Builder` running on its own task. The dispatcher also
//! keeps the registry of in-flight builds, garbage-collected when an
//! entity's status notification lands on a terminal status.

use crate::builder::{status_is_terminal, Builder, OsSelector, Stage};
use crate::callbacks::CallbackWorker;
use crate::context::AppContext;
use crate::error::Result;
use crate::events::{topic, Notification, Observer};
use crate::types::{ImageCell, ImageDetails, PersistentImage, SharedImage};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

/// Where the base image for a derived build comes from.
pub enum BaseSource {
    /// An already-persisted base image.
    Existing(String),
    /// Build a new base image from a template first.
    Build { template: String },
}

/// Where the target image for a provider build comes from.
pub enum TargetSource {
    /// An already-persisted target image.
    Existing(String),
    /// Build the target image (and possibly its base) first.
    Build { base: BaseSource, target: String },
}

/// An accepted build: the entity handle plus the builder driving it.
///
/// The entity is returned immediately; the build proceeds asynchronously.
/// Observe progress by polling storage, via webhooks, or by awaiting
/// [`Builder::wait_for_completion`].
pub struct BuildHandle {
    pub image: SharedImage,
    pub builder: Arc<Builder>,
}

/// Registry of in-flight builds and entry point for new ones.
pub struct BuildDispatcher {
    ctx: Arc<AppContext>,
    builders: Mutex<HashMap<String, Arc<Builder>>>,
}

impl BuildDispatcher {
    /// Create a dispatcher and subscribe it to status notifications for
    /// terminal-status garbage collection.
    pub fn new(ctx: Arc<AppContext>) -> Arc<Self> {
        let dispatcher = Arc::new(Self { ctx: ctx.clone(), builders: Mutex::new(HashMap::new()) });
        let observer: Arc<dyn Observer> = dispatcher.clone();
        ctx.notifier.add_observer(&observer, topic::STATUS, None);
        dispatcher
    }

    /// Build a base image from an abstract template.
    pub async fn build_image_from_template(
        &self,
        template: &str,
        os: OsSelector,
        parameters: HashMap<String, Value>,
        callbacks: &[String],
    ) -> Result<BuildHandle> {
        let mut image = PersistentImage::base(Uuid::new_v4().to_string(), template);
        image.parameters = parameters.clone();
        info!(image_id = %image.id, "Dispatching base image build");
        self.launch(image, Stage::Base, None, Some(os), parameters, None, callbacks, true).await
    }

    /// Customize a base image for one cloud target, implicitly building
    /// the base first when asked to.
    pub async fn customize_image_for_target(
        &self,
        base: BaseSource,
        target: &str,
        os: OsSelector,
        parameters: HashMap<String, Value>,
        callbacks: &[String],
    ) -> Result<BuildHandle> {
        let (base_id, upstream) =
            self.resolve_base(base, &os, &parameters).await?;

        let mut image = PersistentImage::target(Uuid::new_v4().to_string(), base_id, target);
        image.parameters = parameters.clone();
        info!(image_id = %image.id, target, "Dispatching target image build");
        self.launch(image, Stage::Target, upstream, Some(os), parameters, None, callbacks, true)
            .await
    }

    /// Create an image on a cloud provider, by pushing a target image's
    /// artifact or by snapshotting at the provider.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_image_on_provider(
        &self,
        target: TargetSource,
        provider: &str,
        credentials: Option<String>,
        snapshot: bool,
        os: Option<OsSelector>,
        parameters: HashMap<String, Value>,
        callbacks: &[String],
    ) -> Result<BuildHandle> {
        let (target_id, upstream) = match target {
            TargetSource::Existing(id) => {
                // Fail fast on a dangling reference.
                self.ctx.store.image_with_id(&id).await?;
                (id, None)
            }
            TargetSource::Build { base, target } => {
                let os = os.clone().ok_or_else(|| crate::error::ForgeError::InvalidConfig {
                    reason: "chained provider build requires an OS selector".to_string(),
                })?;
                let handle = self
                    .customize_image_for_target(base, &target, os, parameters.clone(), &[])
                    .await?;
                (handle.image.id(), Some(handle.builder))
            }
        };

        let mut image = PersistentImage::provider(Uuid::new_v4().to_string(), target_id, provider);
        image.parameters = parameters.clone();
        if let ImageDetails::Provider { credentials: c, .. } = &mut image.details {
            *c = credentials.clone();
        }
        let stage = if snapshot { Stage::ProviderSnapshot } else { Stage::ProviderPush };
        info!(image_id = %image.id, provider, snapshot, "Dispatching provider image build");
        self.launch(image, stage, upstream, None, parameters, credentials, callbacks, true).await
    }

    /// Delete a persisted image. Provider-backed entities are removed
    /// from the provider first via the owning cloud delegate.
    pub async fn delete_image(
        &self,
        image_id: &str,
        credentials: Option<String>,
        callbacks: &[String],
    ) -> Result<BuildHandle> {
        let mut image = self.ctx.store.image_with_id(image_id).await?;
        if let ImageDetails::Provider { credentials: c, .. } = &mut image.details {
            *c = credentials.clone();
        }
        info!(image_id, "Dispatching image deletion");
        self.launch(image, Stage::Delete, None, None, HashMap::new(), credentials, callbacks, false)
            .await
    }

    /// The builder currently driving an in-flight image, if any.
    pub fn builder_for_image(&self, image_id: &str) -> Option<Arc<Builder>> {
        self.builders.lock().unwrap_or_else(|e| e.into_inner()).get(image_id).cloned()
    }

    /// Number of in-flight builds.
    pub fn active_builds(&self) -> usize {
        self.builders.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn resolve_base(
        &self,
        base: BaseSource,
        os: &OsSelector,
        parameters: &HashMap<String, Value>,
    ) -> Result<(String, Option<Arc<Builder>>)> {
        match base {
            BaseSource::Existing(id) => {
                // Fail fast on a dangling reference.
                self.ctx.store.image_with_id(&id).await?;
                Ok((id, None))
            }
            BaseSource::Build { template } => {
                let handle = self
                    .build_image_from_template(&template, os.clone(), parameters.clone(), &[])
                    .await?;
                Ok((handle.image.id(), Some(handle.builder)))
            }
        }
    }

    /// Wire the entity, persist it, register the builder and spawn the
    /// stage task. Callback workers are in place before the first status
    /// change can happen.
    #[allow(clippy::too_many_arguments)]
    async fn launch(
        &self,
        image: PersistentImage,
        stage: Stage,
        upstream: Option<Arc<Builder>>,
        os: Option<OsSelector>,
        parameters: HashMap<String, Value>,
        credentials: Option<String>,
        callbacks: &[String],
        persist: bool,
    ) -> Result<BuildHandle> {
        let cell = ImageCell::new(image, self.ctx.notifier.clone());
        let image_id = cell.id();

        let mut workers = Vec::new();
        for url in callbacks {
            let worker = CallbackWorker::spawn(cell.clone(), url, self.ctx.transport.clone())?;
            let observer: Arc<dyn Observer> = worker.clone();
            self.ctx.notifier.add_observer(&observer, topic::ALL, Some(&image_id));
            workers.push(worker);
        }

        if persist {
            // Synchronous add on the calling path, before any stage task
            // starts; this also allocates the artifact backing.
            let mut snapshot = cell.snapshot();
            self.ctx.store.add_image(&mut snapshot).await?;
            let artifact = snapshot.artifact;
            cell.modify(|img| img.artifact = artifact);
        }

        let builder = Builder::new(
            self.ctx.clone(),
            stage,
            cell.clone(),
            upstream,
            os,
            parameters,
            credentials,
            workers,
        );
        self.builders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(image_id, builder.clone());
        builder.start();
        Ok(BuildHandle { image: cell, builder })
    }
}

impl Observer for BuildDispatcher {
    fn notify(&self, notification: &Notification) {
        // The only garbage-collection mechanism for finished work: drop
        // the builder when its entity settles into a terminal status.
        if notification.message == topic::STATUS && status_is_terminal(&notification.user_info) {
            let removed = self
                .builders
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&notification.sender);
            if removed.is_some() {
                debug!(image_id = %notification.sender, "Collected finished builder");
            }
        }
    }
}
