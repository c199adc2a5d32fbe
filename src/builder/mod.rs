//! Build stage orchestration.
//!
//! A `Builder` drives one entity through one stage of the pipeline on a
//! dedicated task: waiting out its upstream dependency, resolving the
//! OS/cloud delegates, invoking their hooks in the stage's fixed order,
//! and settling the entity into a terminal status. Errors from delegates
//! never escape the stage task; the entity's `status_detail.error` is the
//! sole carrier of failure information.

mod dispatcher;

pub use dispatcher::{BaseSource, BuildDispatcher, BuildHandle, TargetSource};

use crate::context::AppContext;
use crate::delegates::OsDelegate;
use crate::error::{ForgeError, Result};
use crate::types::{ImageDetails, ImageStatus, PersistentImage, SharedImage};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::callbacks::CallbackWorker;

/// Which OS plugin should service a build, with progressively less
/// specific matching on version and arch.
#[derive(Debug, Clone)]
pub struct OsSelector {
    pub name: String,
    pub version: Option<String>,
    pub arch: Option<String>,
}

impl OsSelector {
    pub fn new(name: &str, version: Option<&str>, arch: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            version: version.map(String::from),
            arch: arch.map(String::from),
        }
    }
}

/// One phase of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Base,
    Target,
    ProviderPush,
    ProviderSnapshot,
    Delete,
}

impl Stage {
    /// Convert to string representation (used in activity messages).
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Base => "base",
            Stage::Target => "target",
            Stage::ProviderPush => "provider-push",
            Stage::ProviderSnapshot => "provider-snapshot",
            Stage::Delete => "delete",
        }
    }

    /// Admission queue this stage must pass through, if any.
    fn queue_name(&self, image: &PersistentImage) -> Option<String> {
        match self {
            Stage::Base | Stage::Target => Some("local".to_string()),
            Stage::ProviderPush | Stage::ProviderSnapshot => match &image.details {
                ImageDetails::Provider { provider, .. } => Some(provider.clone()),
                _ => None,
            },
            Stage::Delete => None,
        }
    }
}

/// Orchestrates one entity through one build stage.
pub struct Builder {
    ctx: Arc<AppContext>,
    stage: Stage,
    image: SharedImage,
    /// Builder this stage depends on, when this same dispatch chain
    /// kicked it off.
    upstream: Option<Arc<Builder>>,
    os: Option<OsSelector>,
    parameters: HashMap<String, Value>,
    credentials: Option<String>,
    abort: AtomicBool,
    /// Resolved during the target stage so cloud delegates can push
    /// install-time content through the OS delegate.
    os_delegate: Mutex<Option<Arc<dyn OsDelegate>>>,
    workers: Mutex<Vec<Arc<CallbackWorker>>>,
    terminal_tx: watch::Sender<Option<ImageStatus>>,
    terminal_rx: watch::Receiver<Option<ImageStatus>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Builder {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ctx: Arc<AppContext>,
        stage: Stage,
        image: SharedImage,
        upstream: Option<Arc<Builder>>,
        os: Option<OsSelector>,
        parameters: HashMap<String, Value>,
        credentials: Option<String>,
        workers: Vec<Arc<CallbackWorker>>,
    ) -> Arc<Self> {
        let (terminal_tx, terminal_rx) = watch::channel(None);
        Arc::new(Self {
            ctx,
            stage,
            image,
            upstream,
            os,
            parameters,
            credentials,
            abort: AtomicBool::new(false),
            os_delegate: Mutex::new(None),
            workers: Mutex::new(workers),
            terminal_tx,
            terminal_rx,
            task: Mutex::new(None),
        })
    }

    /// Spawn the stage task. The build proceeds asynchronously; observe
    /// progress via notifications, webhooks, or [`Builder::wait_for_completion`].
    pub(crate) fn start(self: &Arc<Self>) {
        let builder = self.clone();
        let handle = tokio::spawn(async move { builder.run().await });
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// The entity this stage owns.
    pub fn image(&self) -> &SharedImage {
        &self.image
    }

    /// Stage being executed.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Shared services, for delegates that need reservations or storage.
    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    /// Build parameters for this stage.
    pub fn parameters(&self) -> &HashMap<String, Value> {
        &self.parameters
    }

    /// OS delegate resolved for the running target stage, for cloud
    /// delegates that push content through it.
    pub fn os_delegate(&self) -> Option<Arc<dyn OsDelegate>> {
        self.os_delegate.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Dereference the entity's back-reference via storage. The parent's
    /// lifecycle is independent, so this can legitimately fail with a
    /// not-found error.
    pub async fn parent_image(&self) -> Result<PersistentImage> {
        let snapshot = self.image.snapshot();
        let parent_id = snapshot.parent_id().ok_or_else(|| ForgeError::ImageNotFound {
            image_id: format!("{} has no parent reference", snapshot.id),
        })?;
        self.ctx.store.image_with_id(parent_id).await
    }

    /// Cooperatively ask delegates to stop. Idempotent; does not kill the
    /// stage task.
    pub fn abort(&self) {
        if !self.abort.swap(true, Ordering::SeqCst) {
            info!(image_id = %self.image.id(), "Abort requested");
        }
    }

    /// True once [`Builder::abort`] has been called. Delegates should
    /// poll this between expensive steps.
    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Wait until the stage settles into a terminal status.
    pub async fn wait_for_completion(&self) -> ImageStatus {
        let mut rx = self.terminal_rx.clone();
        loop {
            if let Some(status) = *rx.borrow() {
                return status;
            }
            if rx.changed().await.is_err() {
                // Stage task dropped without settling; report what the
                // entity shows.
                return self.image.status();
            }
        }
    }

    async fn run(self: Arc<Self>) {
        let image_id = self.image.id();
        debug!(image_id = %image_id, stage = self.stage.as_str(), "Stage task started");

        let result = self.execute().await;

        let terminal = match (&self.stage, &result) {
            (Stage::Delete, Ok(())) => ImageStatus::Deleted,
            (Stage::Delete, Err(_)) => ImageStatus::DeleteFailed,
            (_, Ok(())) => ImageStatus::Complete,
            (_, Err(_)) => ImageStatus::Failed,
        };
        match &result {
            Ok(()) => {
                let percent = if self.stage == Stage::Delete { None } else { Some(100) };
                self.image.update(percent, Some(terminal), Some("done"), None);
                info!(image_id = %image_id, stage = self.stage.as_str(), "Stage complete");
            }
            Err(e) => {
                let error = e.to_string();
                warn!(image_id = %image_id, stage = self.stage.as_str(), "Stage failed: {}", error);
                self.image.update(None, Some(terminal), Some("failed"), Some(&error));
            }
        }

        // Best-effort persistence flush; a successful delete already
        // removed the record.
        if !(self.stage == Stage::Delete && result.is_ok()) {
            if let Err(e) = self.ctx.store.save_image(&self.image.snapshot()).await {
                warn!(image_id = %image_id, "Failed to flush terminal state: {}", e);
            }
        }

        // Workers are torn down exactly once, success or failure, so a
        // mid-build error cannot leak a delivery task.
        let workers: Vec<_> =
            self.workers.lock().unwrap_or_else(|e| e.into_inner()).drain(..).collect();
        for worker in workers {
            worker.shut_down(true).await;
        }

        let _ = self.terminal_tx.send(Some(terminal));
    }

    async fn execute(&self) -> Result<()> {
        if let Some(upstream) = &self.upstream {
            self.image.update(
                None,
                Some(ImageStatus::Pending),
                Some("waiting for upstream build"),
                None,
            );
            let status = upstream.wait_for_completion().await;
            if status != ImageStatus::Complete {
                // Never build on top of a failed dependency.
                let reason = upstream
                    .image()
                    .snapshot()
                    .status_detail
                    .error
                    .unwrap_or_else(|| format!("upstream finished with status {}", status));
                return Err(ForgeError::UpstreamFailed {
                    upstream_id: upstream.image().id(),
                    reason,
                });
            }
        }

        if self.aborted() {
            return Err(ForgeError::BuildFailed {
                image_id: self.image.id(),
                reason: "aborted before the stage started".to_string(),
            });
        }

        // Admission gate: cap simultaneous expensive work per named class.
        let queue = self.stage.queue_name(&self.image.snapshot());
        let _permit = match &queue {
            Some(name) => self.ctx.reservations.enter_queue(name).await,
            None => None,
        };

        let starting_status =
            if self.stage == Stage::Delete { ImageStatus::Deleting } else { ImageStatus::Building };
        self.image.update(
            None,
            Some(starting_status),
            Some(&format!("running {} stage", self.stage.as_str())),
            None,
        );

        match self.ctx.config.stage_timeout_secs {
            Some(seconds) => {
                tokio::time::timeout(Duration::from_secs(seconds), self.run_delegates())
                    .await
                    .map_err(|_| ForgeError::StageTimeout { seconds })?
            }
            None => self.run_delegates().await,
        }
    }

    async fn run_delegates(&self) -> Result<()> {
        match self.stage {
            Stage::Base => self.run_base().await,
            Stage::Target => self.run_target().await,
            Stage::ProviderPush => self.run_provider(false).await,
            Stage::ProviderSnapshot => self.run_provider(true).await,
            Stage::Delete => self.run_delete().await,
        }
    }

    fn os_selector(&self) -> Result<&OsSelector> {
        self.os.as_ref().ok_or_else(|| ForgeError::InvalidConfig {
            reason: "stage requires an OS selector".to_string(),
        })
    }

    fn resolve_os(&self) -> Result<Arc<dyn OsDelegate>> {
        let os = self.os_selector()?;
        self.ctx.plugins.os_delegate_for(&os.name, os.version.as_deref(), os.arch.as_deref())
    }

    async fn run_base(&self) -> Result<()> {
        let os = self.resolve_os()?;
        let template = self.image.snapshot().template.ok_or_else(|| ForgeError::InvalidConfig {
            reason: "base build has no template".to_string(),
        })?;
        os.create_base_image(self, &template, &self.parameters).await
    }

    async fn run_target(&self) -> Result<()> {
        let snapshot = self.image.snapshot();
        let ImageDetails::Target { target, .. } = snapshot.details.clone() else {
            return Err(ForgeError::Internal("target stage on a non-target entity".to_string()));
        };

        let cloud = self.ctx.plugins.cloud_delegate_for(&target)?;
        let os = self.resolve_os()?;
        *self.os_delegate.lock().unwrap_or_else(|e| e.into_inner()) = Some(os.clone());

        if cloud.builder_should_create_target_image(self, &target, &self.parameters).await? {
            cloud.builder_will_create_target_image(self, &target, &self.parameters).await?;
            // A fresh, independent copy of the base artifact is made by
            // the OS delegate; the handle is never shared.
            let base_image = self.parent_image().await?;
            os.create_target_image(self, &target, &base_image, &self.parameters).await?;
            cloud.builder_did_create_target_image(self, &target, &self.parameters).await?;
        } else {
            debug!(%target, "Cloud delegate short-circuited the OS step");
        }
        Ok(())
    }

    async fn run_provider(&self, snapshot_stage: bool) -> Result<()> {
        let snapshot = self.image.snapshot();
        let ImageDetails::Provider { provider, .. } = &snapshot.details else {
            return Err(ForgeError::Internal("provider stage on a non-provider entity".to_string()));
        };
        let cloud = self.ctx.plugins.cloud_delegate_for(provider)?;
        if snapshot_stage {
            cloud
                .snapshot_image_on_provider(self, self.credentials.as_deref(), &self.parameters)
                .await
        } else {
            cloud.push_image_to_provider(self, self.credentials.as_deref(), &self.parameters).await
        }
    }

    async fn run_delete(&self) -> Result<()> {
        let snapshot = self.image.snapshot();
        if let ImageDetails::Provider { provider, .. } = &snapshot.details {
            // The provider copy goes first; local metadata survives a
            // remote failure so the deletion can be retried.
            let cloud = self.ctx.plugins.cloud_delegate_for(provider)?;
            cloud.delete_from_provider(self, self.credentials.as_deref()).await?;
        }
        self.ctx.store.delete_image_with_id(&snapshot.id).await
    }
}

/// True when a status-change payload landed on a terminal status.
pub(crate) fn status_is_terminal(user_info: &HashMap<String, String>) -> bool {
    user_info
        .get("new")
        .and_then(|s| ImageStatus::parse(s))
        .map(|s| s.is_terminal())
        .unwrap_or(false)
}
