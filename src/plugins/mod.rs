//! Plugin registry and capability resolution.
//!
//! Maps a capability request (an OS triple or a cloud-target name) to a
//! delegate implementation without the orchestration core knowing about
//! specific clouds or operating systems at compile time. Plugins register
//! explicitly at startup; there is no filesystem scanning or dynamic
//! loading.
//!
//! OS lookup is progressively less specific: `(Fedora, 20, x86_64)` falls
//! back to `(Fedora, 20, *)`, then `(Fedora, *, *)` before failing.

use crate::delegates::{CloudDelegate, OsDelegate};
use crate::error::{ForgeError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};

/// One capability a plugin claims.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetSpec {
    /// A cloud-target name (e.g. "ec2", "mockcloud").
    Cloud(String),
    /// An OS triple; `None` components are wildcards.
    Os {
        name: String,
        version: Option<String>,
        arch: Option<String>,
    },
}

impl TargetSpec {
    /// OS triple with all components present.
    pub fn os(name: &str, version: &str, arch: &str) -> Self {
        TargetSpec::Os {
            name: name.to_string(),
            version: Some(version.to_string()),
            arch: Some(arch.to_string()),
        }
    }

    /// OS name with wildcard version and arch.
    pub fn os_any(name: &str) -> Self {
        TargetSpec::Os { name: name.to_string(), version: None, arch: None }
    }

    fn describe(&self) -> String {
        match self {
            TargetSpec::Cloud(name) => name.clone(),
            TargetSpec::Os { name, version, arch } => format!(
                "({}, {}, {})",
                name,
                version.as_deref().unwrap_or("*"),
                arch.as_deref().unwrap_or("*")
            ),
        }
    }
}

/// Maintainer-supplied plugin metadata.
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    pub name: String,
    pub maintainer: String,
    pub version: String,
    pub targets: Vec<TargetSpec>,
}

/// Constructor for a plugin's delegate singleton.
pub enum PluginFactory {
    Os(Box<dyn Fn() -> Arc<dyn OsDelegate> + Send + Sync>),
    Cloud(Box<dyn Fn() -> Arc<dyn CloudDelegate> + Send + Sync>),
}

enum Delegate {
    Os(Arc<dyn OsDelegate>),
    Cloud(Arc<dyn CloudDelegate>),
}

struct RegisteredPlugin {
    descriptor: PluginDescriptor,
    factory: PluginFactory,
    /// Cached delegate singleton, created on first resolution.
    instance: Mutex<Option<Delegate>>,
    /// False when every declared target was already claimed.
    active: bool,
    /// Load-time problems (duplicate target claims).
    error: Option<String>,
}

impl RegisteredPlugin {
    fn delegate(&self) -> Delegate {
        let mut instance = self.instance.lock().unwrap_or_else(|e| e.into_inner());
        if instance.is_none() {
            *instance = Some(match &self.factory {
                PluginFactory::Os(f) => Delegate::Os(f()),
                PluginFactory::Cloud(f) => Delegate::Cloud(f()),
            });
        }
        match instance.as_ref() {
            Some(Delegate::Os(d)) => Delegate::Os(d.clone()),
            Some(Delegate::Cloud(d)) => Delegate::Cloud(d.clone()),
            None => unreachable!(),
        }
    }
}

/// Registry snapshot for introspection.
#[derive(Debug, Clone)]
pub struct PluginInfo {
    pub name: String,
    pub maintainer: String,
    pub version: String,
    pub active: bool,
    pub error: Option<String>,
}

/// Capability-to-delegate registry.
pub struct PluginManager {
    plugins: RwLock<Vec<Arc<RegisteredPlugin>>>,
    os_index: RwLock<HashMap<(String, Option<String>, Option<String>), usize>>,
    cloud_index: RwLock<HashMap<String, usize>>,
}

impl PluginManager {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            plugins: RwLock::new(Vec::new()),
            os_index: RwLock::new(HashMap::new()),
            cloud_index: RwLock::new(HashMap::new()),
        }
    }

    /// Register a plugin for each of its declared targets.
    ///
    /// A target already claimed by an earlier plugin is a warning, not a
    /// failure: the first registrant wins and the conflict is recorded on
    /// the new plugin. A plugin whose every target was claimed is marked
    /// inactive.
    pub fn register(&self, descriptor: PluginDescriptor, factory: PluginFactory) {
        let mut plugins = self.plugins.write().unwrap_or_else(|e| e.into_inner());
        let mut os_index = self.os_index.write().unwrap_or_else(|e| e.into_inner());
        let mut cloud_index = self.cloud_index.write().unwrap_or_else(|e| e.into_inner());

        let slot = plugins.len();
        let mut claimed = 0usize;
        let mut conflicts = Vec::new();

        for target in &descriptor.targets {
            let taken = match target {
                TargetSpec::Cloud(name) => {
                    if cloud_index.contains_key(name) {
                        true
                    } else {
                        cloud_index.insert(name.clone(), slot);
                        false
                    }
                }
                TargetSpec::Os { name, version, arch } => {
                    let key = (name.clone(), version.clone(), arch.clone());
                    if os_index.contains_key(&key) {
                        true
                    } else {
                        os_index.insert(key, slot);
                        false
                    }
                }
            };
            if taken {
                warn!(
                    plugin = %descriptor.name,
                    target = %target.describe(),
                    "Target already claimed by an earlier plugin"
                );
                conflicts.push(target.describe());
            } else {
                claimed += 1;
            }
        }

        let active = claimed > 0;
        let error = if conflicts.is_empty() {
            None
        } else {
            Some(format!("targets already claimed: {}", conflicts.join(", ")))
        };
        info!(
            plugin = %descriptor.name,
            version = %descriptor.version,
            targets = claimed,
            active,
            "Registered plugin"
        );
        plugins.push(Arc::new(RegisteredPlugin {
            descriptor,
            factory,
            instance: Mutex::new(None),
            active,
            error,
        }));
    }

    /// Resolve the OS delegate for an OS triple, progressively nulling the
    /// last still-present component on each miss.
    pub fn os_delegate_for(
        &self,
        name: &str,
        version: Option<&str>,
        arch: Option<&str>,
    ) -> Result<Arc<dyn OsDelegate>> {
        let requested = TargetSpec::Os {
            name: name.to_string(),
            version: version.map(String::from),
            arch: arch.map(String::from),
        }
        .describe();

        let candidates = [
            (name.to_string(), version.map(String::from), arch.map(String::from)),
            (name.to_string(), version.map(String::from), None),
            (name.to_string(), None, None),
        ];

        let os_index = self.os_index.read().unwrap_or_else(|e| e.into_inner());
        for key in &candidates {
            if let Some(&slot) = os_index.get(key) {
                return match self.plugin_at(slot)?.delegate() {
                    Delegate::Os(d) => Ok(d),
                    Delegate::Cloud(_) => Err(ForgeError::PluginNotFound { target: requested }),
                };
            }
        }
        Err(ForgeError::PluginNotFound { target: requested })
    }

    /// Resolve the cloud delegate for a cloud-target name (exact match).
    pub fn cloud_delegate_for(&self, target: &str) -> Result<Arc<dyn CloudDelegate>> {
        let cloud_index = self.cloud_index.read().unwrap_or_else(|e| e.into_inner());
        let Some(&slot) = cloud_index.get(target) else {
            return Err(ForgeError::PluginNotFound { target: target.to_string() });
        };
        match self.plugin_at(slot)?.delegate() {
            Delegate::Cloud(d) => Ok(d),
            Delegate::Os(_) => Err(ForgeError::PluginNotFound { target: target.to_string() }),
        }
    }

    /// Snapshot of every registered plugin's state.
    pub fn plugin_info(&self) -> Vec<PluginInfo> {
        let plugins = self.plugins.read().unwrap_or_else(|e| e.into_inner());
        plugins
            .iter()
            .map(|p| PluginInfo {
                name: p.descriptor.name.clone(),
                maintainer: p.descriptor.maintainer.clone(),
                version: p.descriptor.version.clone(),
                active: p.active,
                error: p.error.clone(),
            })
            .collect()
    }

    fn plugin_at(&self, slot: usize) -> Result<Arc<RegisteredPlugin>> {
        let plugins = self.plugins.read().unwrap_or_else(|e| e.into_inner());
        plugins
            .get(slot)
            .cloned()
            .ok_or_else(|| ForgeError::Internal(format!("dangling plugin slot {}", slot)))
    }
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use crate::delegates::{CloudDelegate, OsDelegate};
    use crate::types::PersistentImage;
    use async_trait::async_trait;
    use serde_json::Value;

    struct NoopOs;

    #[async_trait]
    impl OsDelegate for NoopOs {
        async fn create_base_image(
            &self,
            _builder: &Builder,
            _template: &str,
            _parameters: &HashMap<String, Value>,
        ) -> Result<()> {
            Ok(())
        }

        async fn create_target_image(
            &self,
            _builder: &Builder,
            _target: &str,
            _base_image: &PersistentImage,
            _parameters: &HashMap<String, Value>,
        ) -> Result<()> {
            Ok(())
        }
    }

    struct NoopCloud;

    #[async_trait]
    impl CloudDelegate for NoopCloud {
        async fn push_image_to_provider(
            &self,
            _builder: &Builder,
            _credentials: Option<&str>,
            _parameters: &HashMap<String, Value>,
        ) -> Result<()> {
            Ok(())
        }

        async fn snapshot_image_on_provider(
            &self,
            _builder: &Builder,
            _credentials: Option<&str>,
            _parameters: &HashMap<String, Value>,
        ) -> Result<()> {
            Ok(())
        }

        async fn delete_from_provider(
            &self,
            _builder: &Builder,
            _credentials: Option<&str>,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn descriptor(name: &str, targets: Vec<TargetSpec>) -> PluginDescriptor {
        PluginDescriptor {
            name: name.to_string(),
            maintainer: "tests".to_string(),
            version: "1.0".to_string(),
            targets,
        }
    }

    fn os_factory() -> PluginFactory {
        PluginFactory::Os(Box::new(|| Arc::new(NoopOs)))
    }

    fn cloud_factory() -> PluginFactory {
        PluginFactory::Cloud(Box::new(|| Arc::new(NoopCloud)))
    }

    #[test]
    fn test_exact_os_match() {
        let manager = PluginManager::new();
        manager.register(
            descriptor("fedora", vec![TargetSpec::os("Fedora", "20", "x86_64")]),
            os_factory(),
        );
        assert!(manager.os_delegate_for("Fedora", Some("20"), Some("x86_64")).is_ok());
    }

    #[test]
    fn test_progressive_wildcard_fallback() {
        let manager = PluginManager::new();
        manager.register(
            descriptor(
                "fedora-20",
                vec![TargetSpec::Os {
                    name: "Fedora".to_string(),
                    version: Some("20".to_string()),
                    arch: None,
                }],
            ),
            os_factory(),
        );
        manager.register(
            descriptor("fedora-any", vec![TargetSpec::os_any("Fedora")]),
            os_factory(),
        );

        // (Fedora, 20, x86_64) falls back to (Fedora, 20, *).
        assert!(manager.os_delegate_for("Fedora", Some("20"), Some("x86_64")).is_ok());
        // (Fedora, 21, aarch64) falls back to (Fedora, *, *).
        assert!(manager.os_delegate_for("Fedora", Some("21"), Some("aarch64")).is_ok());
        // Unknown OS name is a hard error naming the original request.
        let err = manager
            .os_delegate_for("Plan9", Some("1"), Some("mips"))
            .err()
            .expect("expected an error for unknown OS");
        assert!(err.to_string().contains("Plan9"));
    }

    #[test]
    fn test_cloud_exact_match_only() {
        let manager = PluginManager::new();
        manager.register(
            descriptor("mockcloud", vec![TargetSpec::Cloud("mockcloud".to_string())]),
            cloud_factory(),
        );
        assert!(manager.cloud_delegate_for("mockcloud").is_ok());
        assert!(manager.cloud_delegate_for("othercloud").is_err());
    }

    #[test]
    fn test_duplicate_target_first_registrant_wins() {
        let manager = PluginManager::new();
        manager.register(
            descriptor("first", vec![TargetSpec::Cloud("ec2".to_string())]),
            cloud_factory(),
        );
        manager.register(
            descriptor("second", vec![TargetSpec::Cloud("ec2".to_string())]),
            cloud_factory(),
        );

        let info = manager.plugin_info();
        assert!(info[0].active);
        assert!(info[0].error.is_none());
        assert!(!info[1].active);
        assert!(info[1].error.as_ref().unwrap().contains("ec2"));
    }

    #[test]
    fn test_delegate_is_cached_singleton() {
        let manager = PluginManager::new();
        manager.register(
            descriptor("mockcloud", vec![TargetSpec::Cloud("mockcloud".to_string())]),
            cloud_factory(),
        );
        let a = manager.cloud_delegate_for("mockcloud").unwrap();
        let b = manager.cloud_delegate_for("mockcloud").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
