//! Notification center for entity state changes.
//!
//! Provides the publish/subscribe mechanism that links image-state mutation
//! to internal bookkeeping (build dispatch garbage collection) and external
//! webhook delivery, without the publisher knowing who listens.
//!
//! Observers register for a `(message, sender)` pair. Publication snapshots
//! the matching observer set under the lock and dispatches with the lock
//! released, so a handler may re-register or unregister during dispatch
//! without deadlocking.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

/// Well-known notification topics.
pub mod topic {
    /// An image's status changed.
    pub const STATUS: &str = "image.status";
    /// An image's completion percentage changed.
    pub const PERCENTAGE: &str = "image.percentage";
    /// Wildcard topic matching every message.
    pub const ALL: &str = "all";
}

/// A single posted notification.
#[derive(Debug, Clone)]
pub struct Notification {
    /// Topic string (e.g. "image.status").
    pub message: String,
    /// Identifier of the entity that changed.
    pub sender: String,
    /// Topic-specific payload (e.g. old/new status values).
    pub user_info: HashMap<String, String>,
}

impl Notification {
    /// Create a new notification.
    pub fn new(message: &str, sender: &str, user_info: HashMap<String, String>) -> Self {
        Self { message: message.to_string(), sender: sender.to_string(), user_info }
    }
}

/// Receiver of notifications.
///
/// Implementations must not block: long-running work belongs on a channel
/// drained by a dedicated task (see `callbacks::CallbackWorker`).
pub trait Observer: Send + Sync {
    fn notify(&self, notification: &Notification);
}

struct Registration {
    observer: Weak<dyn Observer>,
    /// `None` subscribes to every sender.
    sender: Option<String>,
}

/// Thread-safe publish/subscribe registry keyed by `(message, sender)`.
///
/// Explicitly constructed and passed by reference; there is no process-wide
/// instance.
#[derive(Default)]
pub struct NotificationCenter {
    registry: Mutex<HashMap<String, Vec<Registration>>>,
}

impl NotificationCenter {
    /// Create a new notification center with no observers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for a topic, optionally filtered to a single
    /// sender. Use [`topic::ALL`] to receive every topic.
    ///
    /// Observers are held weakly; a dropped observer is pruned on the next
    /// publication.
    pub fn add_observer(&self, observer: &Arc<dyn Observer>, message: &str, sender: Option<&str>) {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.entry(message.to_string()).or_default().push(Registration {
            observer: Arc::downgrade(observer),
            sender: sender.map(|s| s.to_string()),
        });
    }

    /// Remove the registration of `observer` under `message` whose sender
    /// filter matches `sender`. Registrations of the same observer for
    /// other senders are untouched.
    pub fn remove_observer(
        &self,
        observer: &Arc<dyn Observer>,
        message: &str,
        sender: Option<&str>,
    ) {
        let target = Arc::as_ptr(observer) as *const ();
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entries) = registry.get_mut(message) {
            entries.retain(|r| match r.observer.upgrade() {
                Some(o) => {
                    Arc::as_ptr(&o) as *const () != target || r.sender.as_deref() != sender
                }
                None => false,
            });
            if entries.is_empty() {
                registry.remove(message);
            }
        }
    }

    /// Post a notification to the union of the wildcard topic's observers
    /// and the specific topic's observers whose sender filter matches.
    ///
    /// Dispatch order across observers is unspecified. Callbacks run with
    /// the registry lock released.
    pub fn post_notification(
        &self,
        message: &str,
        sender: &str,
        user_info: HashMap<String, String>,
    ) {
        let notification = Notification::new(message, sender, user_info);
        let recipients = self.snapshot_recipients(message, sender);
        debug!(
            message,
            sender,
            recipients = recipients.len(),
            "Posting notification"
        );
        for observer in recipients {
            observer.notify(&notification);
        }
    }

    /// Number of live registrations under a topic (dead weak refs ignored).
    pub fn observer_count(&self, message: &str) -> usize {
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry
            .get(message)
            .map(|entries| entries.iter().filter(|r| r.observer.strong_count() > 0).count())
            .unwrap_or(0)
    }

    /// Collect matching live observers, deduped by identity, and prune
    /// dead registrations while holding the lock.
    fn snapshot_recipients(&self, message: &str, sender: &str) -> Vec<Arc<dyn Observer>> {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let mut seen: Vec<*const ()> = Vec::new();
        let mut recipients: Vec<Arc<dyn Observer>> = Vec::new();

        for key in [topic::ALL, message] {
            if key == topic::ALL && message == topic::ALL {
                // Posting to "all" directly only matches the wildcard topic once.
                continue;
            }
            let Some(entries) = registry.get_mut(key) else { continue };
            entries.retain(|registration| {
                let Some(observer) = registration.observer.upgrade() else {
                    return false;
                };
                let sender_matches = match &registration.sender {
                    None => true,
                    Some(filter) => filter == sender,
                };
                if sender_matches {
                    let ptr = Arc::as_ptr(&observer) as *const ();
                    if !seen.contains(&ptr) {
                        seen.push(ptr);
                        recipients.push(observer);
                    }
                }
                true
            });
        }

        recipients
    }
}
