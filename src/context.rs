//! Application context.
//!
//! The source design kept the notification center, reservation manager,
//! plugin registry and dispatcher as process-wide singletons. Here they
//! are explicitly constructed once and passed by reference, so tests can
//! create fully isolated instances.

use crate::callbacks::{CallbackTransport, HttpTransport};
use crate::config::Config;
use crate::error::Result;
use crate::events::NotificationCenter;
use crate::plugins::PluginManager;
use crate::reservations::ReservationManager;
use crate::storage::ImageStore;
use std::sync::Arc;
use std::time::Duration;

/// Shared services every builder needs.
pub struct AppContext {
    pub config: Config,
    pub notifier: Arc<NotificationCenter>,
    pub reservations: Arc<ReservationManager>,
    pub store: Arc<dyn ImageStore>,
    pub plugins: Arc<PluginManager>,
    pub transport: Arc<dyn CallbackTransport>,
}

impl AppContext {
    /// Wire up a context with the production webhook transport.
    pub fn new(
        config: Config,
        store: Arc<dyn ImageStore>,
        plugins: Arc<PluginManager>,
    ) -> Result<Arc<Self>> {
        let transport: Arc<dyn CallbackTransport> =
            Arc::new(HttpTransport::new(Duration::from_secs(config.webhook_timeout_secs))?);
        Self::with_transport(config, store, plugins, transport)
    }

    /// Wire up a context with an injected webhook transport (for tests).
    pub fn with_transport(
        config: Config,
        store: Arc<dyn ImageStore>,
        plugins: Arc<PluginManager>,
        transport: Arc<dyn CallbackTransport>,
    ) -> Result<Arc<Self>> {
        let notifier = Arc::new(NotificationCenter::new());
        let reservations = Arc::new(ReservationManager::new(&config)?);
        Ok(Arc::new(Self { config, notifier, reservations, store, plugins, transport }))
    }
}
