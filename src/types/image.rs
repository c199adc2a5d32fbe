//! Image entity model.
//!
//! A `PersistentImage` is the in-memory representation of one build
//! artifact: a base image built from a template, a target image customized
//! for one cloud, or a provider image pushed to a specific cloud account.
//! The artifact bytes themselves are owned by the image store; the entity
//! only carries an opaque handle to them.

use crate::error::{ForgeError, Result};
use crate::events::{topic, NotificationCenter};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Build lifecycle status of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImageStatus {
    /// Created and persisted, no worker started yet.
    #[default]
    New,
    /// Waiting on an upstream dependency to finish.
    Pending,
    /// The owning builder is actively invoking delegates.
    Building,
    /// Build finished successfully.
    Complete,
    /// Build finished with an error.
    Failed,
    /// Deletion in progress.
    Deleting,
    /// Deleted from storage (and, where applicable, the provider).
    Deleted,
    /// Deletion attempted and failed.
    DeleteFailed,
}

impl ImageStatus {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::New => "NEW",
            ImageStatus::Pending => "PENDING",
            ImageStatus::Building => "BUILDING",
            ImageStatus::Complete => "COMPLETE",
            ImageStatus::Failed => "FAILED",
            ImageStatus::Deleting => "DELETING",
            ImageStatus::Deleted => "DELETED",
            ImageStatus::DeleteFailed => "DELETEFAILED",
        }
    }

    /// Parse status from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "NEW" => Some(ImageStatus::New),
            "PENDING" => Some(ImageStatus::Pending),
            "BUILDING" => Some(ImageStatus::Building),
            "COMPLETE" => Some(ImageStatus::Complete),
            "FAILED" => Some(ImageStatus::Failed),
            "DELETING" => Some(ImageStatus::Deleting),
            "DELETED" => Some(ImageStatus::Deleted),
            "DELETEFAILED" => Some(ImageStatus::DeleteFailed),
            _ => None,
        }
    }

    /// True if the lifecycle will not progress further without external
    /// re-invocation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ImageStatus::Complete
                | ImageStatus::Failed
                | ImageStatus::Deleted
                | ImageStatus::DeleteFailed
        )
    }
}

impl std::fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Entity type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    Base,
    Target,
    Provider,
}

impl ImageKind {
    /// Convert to string representation (used in queries and webhook bodies).
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageKind::Base => "base_image",
            ImageKind::Target => "target_image",
            ImageKind::Provider => "provider_image",
        }
    }

    /// Parse kind from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "base_image" => Some(ImageKind::Base),
            "target_image" => Some(ImageKind::Target),
            "provider_image" => Some(ImageKind::Provider),
            _ => None,
        }
    }
}

impl std::fmt::Display for ImageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Human-readable progress detail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDetail {
    /// What the build is currently doing.
    pub activity: String,
    /// Error text once the build has failed.
    pub error: Option<String>,
}

/// Kind-specific fields of an image entity.
///
/// Back-references (`base_image_id`, `target_image_id`) are lookup keys
/// only; the referenced entity's lifecycle is independent and it may no
/// longer exist in storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ImageDetails {
    #[serde(rename = "base_image")]
    Base,
    #[serde(rename = "target_image")]
    Target {
        base_image_id: String,
        target: String,
    },
    #[serde(rename = "provider_image")]
    Provider {
        target_image_id: String,
        provider: String,
        #[serde(default)]
        identifier_on_provider: Option<String>,
        #[serde(default)]
        provider_account_identifier: Option<String>,
        /// Transient cloud credentials. Never serialized.
        #[serde(skip)]
        credentials: Option<String>,
    },
}

/// One build artifact and its lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentImage {
    /// Opaque unique identifier, assigned once at construction.
    pub id: String,
    pub status: ImageStatus,
    /// Integer 0-100.
    pub percent_complete: u8,
    pub status_detail: StatusDetail,
    /// Opaque build description.
    #[serde(default)]
    pub template: Option<String>,
    /// Opaque installed-software manifest produced by the OS delegate.
    #[serde(default)]
    pub icicle: Option<String>,
    /// Free-form build parameters.
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    /// Free-form properties stamped by delegates.
    #[serde(default)]
    pub properties: HashMap<String, String>,
    /// Opaque handle to the artifact bytes, owned by the image store.
    /// Never copied between entities.
    #[serde(default)]
    pub artifact: Option<String>,
    #[serde(flatten)]
    pub details: ImageDetails,
}

impl PersistentImage {
    /// Create a base image from a template.
    pub fn base(id: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ImageStatus::New,
            percent_complete: 0,
            status_detail: StatusDetail::default(),
            template: Some(template.into()),
            icicle: None,
            parameters: HashMap::new(),
            properties: HashMap::new(),
            artifact: None,
            details: ImageDetails::Base,
        }
    }

    /// Create a target image derived from a base image.
    pub fn target(
        id: impl Into<String>,
        base_image_id: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            details: ImageDetails::Target {
                base_image_id: base_image_id.into(),
                target: target.into(),
            },
            ..Self::empty(id)
        }
    }

    /// Create a provider image derived from a target image.
    pub fn provider(
        id: impl Into<String>,
        target_image_id: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            details: ImageDetails::Provider {
                target_image_id: target_image_id.into(),
                provider: provider.into(),
                identifier_on_provider: None,
                provider_account_identifier: None,
                credentials: None,
            },
            ..Self::empty(id)
        }
    }

    fn empty(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ImageStatus::New,
            percent_complete: 0,
            status_detail: StatusDetail::default(),
            template: None,
            icicle: None,
            parameters: HashMap::new(),
            properties: HashMap::new(),
            artifact: None,
            details: ImageDetails::Base,
        }
    }

    /// Entity type discriminator.
    pub fn kind(&self) -> ImageKind {
        match self.details {
            ImageDetails::Base => ImageKind::Base,
            ImageDetails::Target { .. } => ImageKind::Target,
            ImageDetails::Provider { .. } => ImageKind::Provider,
        }
    }

    /// The persisted metadata snapshot: every declared field except the
    /// opaque artifact handle and transient credentials.
    pub fn metadata(&self) -> serde_json::Map<String, Value> {
        let mut map = serde_json::Map::new();
        map.insert("type".into(), Value::String(self.kind().as_str().to_string()));
        map.insert("identifier".into(), Value::String(self.id.clone()));
        map.insert("status".into(), Value::String(self.status.to_string()));
        map.insert("percent_complete".into(), Value::from(self.percent_complete));
        map.insert(
            "status_detail".into(),
            serde_json::to_value(&self.status_detail).unwrap_or(Value::Null),
        );
        map.insert(
            "template".into(),
            self.template.clone().map(Value::String).unwrap_or(Value::Null),
        );
        map.insert(
            "icicle".into(),
            self.icicle.clone().map(Value::String).unwrap_or(Value::Null),
        );
        map.insert(
            "parameters".into(),
            serde_json::to_value(&self.parameters).unwrap_or(Value::Null),
        );
        map.insert(
            "properties".into(),
            serde_json::to_value(&self.properties).unwrap_or(Value::Null),
        );
        match &self.details {
            ImageDetails::Base => {}
            ImageDetails::Target { base_image_id, target } => {
                map.insert("base_image_id".into(), Value::String(base_image_id.clone()));
                map.insert("target".into(), Value::String(target.clone()));
            }
            ImageDetails::Provider {
                target_image_id,
                provider,
                identifier_on_provider,
                provider_account_identifier,
                credentials: _,
            } => {
                map.insert("target_image_id".into(), Value::String(target_image_id.clone()));
                map.insert("provider".into(), Value::String(provider.clone()));
                map.insert(
                    "identifier_on_provider".into(),
                    identifier_on_provider.clone().map(Value::String).unwrap_or(Value::Null),
                );
                map.insert(
                    "provider_account_identifier".into(),
                    provider_account_identifier
                        .clone()
                        .map(Value::String)
                        .unwrap_or(Value::Null),
                );
            }
        }
        map
    }

    /// The webhook snapshot: the persisted metadata minus raw
    /// back-reference identifiers.
    pub fn webhook_metadata(&self) -> serde_json::Map<String, Value> {
        let mut map = self.metadata();
        map.remove("base_image_id");
        map.remove("target_image_id");
        map
    }

    /// True if every key/value pair in `query` matches this entity's
    /// persisted metadata (values compared as strings).
    pub fn matches_query(&self, query: &HashMap<String, String>) -> bool {
        let metadata = self.metadata();
        query.iter().all(|(key, expected)| match metadata.get(key) {
            Some(Value::String(s)) => s == expected,
            Some(Value::Null) => false,
            Some(other) => other.to_string() == *expected,
            None => false,
        })
    }

    /// Back-reference to the parent entity, if this kind has one.
    pub fn parent_id(&self) -> Option<&str> {
        match &self.details {
            ImageDetails::Base => None,
            ImageDetails::Target { base_image_id, .. } => Some(base_image_id),
            ImageDetails::Provider { target_image_id, .. } => Some(target_image_id),
        }
    }
}

/// Shared handle to an image entity.
pub type SharedImage = Arc<ImageCell>;

/// Self-notifying wrapper around a [`PersistentImage`].
///
/// Setters compare-and-swap: writing the current value again is a no-op
/// and fires no notification; a real change posts exactly one notification
/// carrying the old and new values, after the write lock is released.
///
/// Only the stage task that owns the entity mutates it, so notifications
/// for one entity are delivered in the order its state actually changed.
pub struct ImageCell {
    inner: RwLock<PersistentImage>,
    notifier: Arc<NotificationCenter>,
}

impl ImageCell {
    /// Wrap an entity with an injected notifier.
    pub fn new(image: PersistentImage, notifier: Arc<NotificationCenter>) -> SharedImage {
        Arc::new(Self { inner: RwLock::new(image), notifier })
    }

    /// Entity identifier.
    pub fn id(&self) -> String {
        self.read().id.clone()
    }

    /// Entity type discriminator.
    pub fn kind(&self) -> ImageKind {
        self.read().kind()
    }

    /// Current status.
    pub fn status(&self) -> ImageStatus {
        self.read().status
    }

    /// Clone the current entity state.
    pub fn snapshot(&self) -> PersistentImage {
        self.read().clone()
    }

    /// Set the build status. No-op (and no notification) if unchanged.
    pub fn set_status(&self, new: ImageStatus) {
        self.update(None, Some(new), None, None);
    }

    /// Set the completion percentage, clamped to 100. No-op if unchanged.
    pub fn set_percent_complete(&self, percent: u8) {
        self.update(Some(percent), None, None, None);
    }

    /// Apply zero or more of percentage, status, activity and error under
    /// one write lock, then post the resulting notifications.
    pub fn update(
        &self,
        percent: Option<u8>,
        status: Option<ImageStatus>,
        activity: Option<&str>,
        error: Option<&str>,
    ) {
        let id;
        let mut pending: Vec<(&str, HashMap<String, String>)> = Vec::new();
        {
            let mut image = self.inner.write().unwrap_or_else(|e| e.into_inner());
            id = image.id.clone();
            if let Some(activity) = activity {
                image.status_detail.activity = activity.to_string();
            }
            if let Some(error) = error {
                image.status_detail.error = Some(error.to_string());
            }
            if let Some(percent) = percent {
                let percent = percent.min(100);
                if image.percent_complete != percent {
                    let mut info = HashMap::new();
                    info.insert("old".to_string(), image.percent_complete.to_string());
                    info.insert("new".to_string(), percent.to_string());
                    image.percent_complete = percent;
                    pending.push((topic::PERCENTAGE, info));
                }
            }
            if let Some(status) = status {
                if image.status != status {
                    let mut info = HashMap::new();
                    info.insert("old".to_string(), image.status.to_string());
                    info.insert("new".to_string(), status.to_string());
                    image.status = status;
                    pending.push((topic::STATUS, info));
                }
            }
        }
        for (message, info) in pending {
            self.notifier.post_notification(message, &id, info);
        }
    }

    /// Mutate fields that do not notify (template, icicle, parameters,
    /// properties, artifact handle, provider details).
    pub fn modify<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut PersistentImage) -> R,
    {
        let mut image = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut image)
    }

    /// Validate an artifact-bytes dereference: returns the handle or a
    /// not-found error when the backing bytes were never allocated.
    pub fn artifact(&self) -> Result<String> {
        let image = self.read();
        image.artifact.clone().ok_or_else(|| ForgeError::StorageError(format!(
            "image {} has no artifact allocated",
            image.id
        )))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PersistentImage> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Notification, Observer};
    use std::sync::Mutex;

    struct Recorder {
        notes: Mutex<Vec<Notification>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self { notes: Mutex::new(Vec::new()) })
        }
    }

    impl Observer for Recorder {
        fn notify(&self, notification: &Notification) {
            self.notes.lock().unwrap().push(notification.clone());
        }
    }

    fn cell_with_recorder() -> (SharedImage, Arc<Recorder>) {
        let notifier = Arc::new(NotificationCenter::new());
        let recorder = Recorder::new();
        let observer: Arc<dyn Observer> = recorder.clone();
        notifier.add_observer(&observer, topic::ALL, None);
        let cell = ImageCell::new(PersistentImage::base("img-1", "<template/>"), notifier);
        (cell, recorder)
    }

    #[test]
    fn test_same_value_fires_no_notification() {
        let (cell, recorder) = cell_with_recorder();
        cell.set_status(ImageStatus::New);
        cell.set_percent_complete(0);
        assert!(recorder.notes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_real_change_fires_exactly_one_notification() {
        let (cell, recorder) = cell_with_recorder();
        cell.set_status(ImageStatus::Building);

        let notes = recorder.notes.lock().unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].message, topic::STATUS);
        assert_eq!(notes[0].sender, "img-1");
        assert_eq!(notes[0].user_info.get("old").unwrap(), "NEW");
        assert_eq!(notes[0].user_info.get("new").unwrap(), "BUILDING");
    }

    #[test]
    fn test_update_applies_fields_atomically() {
        let (cell, recorder) = cell_with_recorder();
        cell.update(Some(50), Some(ImageStatus::Building), Some("installing"), None);

        let snapshot = cell.snapshot();
        assert_eq!(snapshot.percent_complete, 50);
        assert_eq!(snapshot.status, ImageStatus::Building);
        assert_eq!(snapshot.status_detail.activity, "installing");
        assert_eq!(recorder.notes.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_percent_clamped() {
        let (cell, _recorder) = cell_with_recorder();
        cell.set_percent_complete(250);
        assert_eq!(cell.snapshot().percent_complete, 100);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            ImageStatus::New,
            ImageStatus::Pending,
            ImageStatus::Building,
            ImageStatus::Complete,
            ImageStatus::Failed,
            ImageStatus::Deleting,
            ImageStatus::Deleted,
            ImageStatus::DeleteFailed,
        ] {
            assert_eq!(ImageStatus::parse(status.as_str()), Some(status));
        }
        assert!(ImageStatus::parse("BOGUS").is_none());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ImageStatus::Complete.is_terminal());
        assert!(ImageStatus::Failed.is_terminal());
        assert!(ImageStatus::Deleted.is_terminal());
        assert!(ImageStatus::DeleteFailed.is_terminal());
        assert!(!ImageStatus::Building.is_terminal());
        assert!(!ImageStatus::Pending.is_terminal());
    }

    #[test]
    fn test_metadata_excludes_credentials_and_artifact() {
        let mut image = PersistentImage::provider("img-p", "img-t", "mockcloud");
        image.artifact = Some("/somewhere/image.body".to_string());
        if let ImageDetails::Provider { credentials, .. } = &mut image.details {
            *credentials = Some("secret".to_string());
        }

        let metadata = image.metadata();
        assert!(!metadata.contains_key("credentials"));
        assert!(!metadata.contains_key("artifact"));
        assert_eq!(metadata.get("type").unwrap(), "provider_image");
        assert_eq!(metadata.get("target_image_id").unwrap(), "img-t");

        let webhook = image.webhook_metadata();
        assert!(!webhook.contains_key("target_image_id"));
        assert_eq!(webhook.get("provider").unwrap(), "mockcloud");
    }

    #[test]
    fn test_matches_query() {
        let image = PersistentImage::target("img-t", "img-b", "mock");
        let mut query = HashMap::new();
        query.insert("type".to_string(), "target_image".to_string());
        query.insert("base_image_id".to_string(), "img-b".to_string());
        assert!(image.matches_query(&query));

        query.insert("target".to_string(), "other".to_string());
        assert!(!image.matches_query(&query));
    }

    #[test]
    fn test_credentials_never_serialized() {
        let mut image = PersistentImage::provider("img-p", "img-t", "mockcloud");
        if let ImageDetails::Provider { credentials, .. } = &mut image.details {
            *credentials = Some("hunter2".to_string());
        }
        let json = serde_json::to_string(&image).unwrap();
        assert!(!json.contains("hunter2"));
    }
}
