//! Host resource arbitration for concurrent builds.
//!
//! The `ReservationManager` is the single arbiter of host-wide scarce
//! resources: disk headroom on watched mount points, named mutexes for
//! shared external dependencies, bounded admission queues for expensive
//! classes of work, and a TCP port allocator. Stage tasks contending for
//! the same resource go through it rather than coordinating directly.

use crate::config::Config;
use crate::error::{ForgeError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Free-space probe for a filesystem path.
///
/// Separated out so tests can run against a fake filesystem.
pub trait SpaceProbe: Send + Sync {
    fn free_bytes(&self, path: &Path) -> Result<u64>;
}

/// statvfs-backed probe used in production.
pub struct StatvfsProbe;

impl SpaceProbe for StatvfsProbe {
    fn free_bytes(&self, path: &Path) -> Result<u64> {
        let stat = nix::sys::statvfs::statvfs(path)
            .map_err(|e| ForgeError::InsufficientResources {
                reason: format!("statvfs({}) failed: {}", path.display(), e),
            })?;
        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }
}

struct WatchedPath {
    /// Headroom that must stay free on this mount.
    min_free: u64,
    /// Outstanding reservations: file path -> reserved size in bytes.
    reservations: HashMap<PathBuf, u64>,
}

struct PortAllocator {
    start: u16,
    end: u16,
    next_offset: u32,
}

/// Arbiter of shared host resources across concurrently running builds.
pub struct ReservationManager {
    paths: Mutex<HashMap<PathBuf, WatchedPath>>,
    named_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    queues: HashMap<String, Arc<Semaphore>>,
    ports: Mutex<PortAllocator>,
    default_min_free: u64,
    probe: Box<dyn SpaceProbe>,
}

impl ReservationManager {
    /// Build a manager from configuration, probing free space via statvfs.
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_probe(config, Box::new(StatvfsProbe))
    }

    /// Build a manager with an injected free-space probe.
    ///
    /// Rejects a configuration whose port range is inverted; every later
    /// range computation relies on `start <= end`.
    pub fn with_probe(config: &Config, probe: Box<dyn SpaceProbe>) -> Result<Self> {
        config.validate()?;
        let queues = config
            .build_queues
            .iter()
            .map(|(name, cap)| (name.clone(), Arc::new(Semaphore::new(*cap))))
            .collect();
        // Seed from the pid so independently started processes on the same
        // host begin at different offsets.
        let span = (config.port_range_end - config.port_range_start) as u32 + 1;
        let ports = PortAllocator {
            start: config.port_range_start,
            end: config.port_range_end,
            next_offset: std::process::id() % span,
        };
        Ok(Self {
            paths: Mutex::new(HashMap::new()),
            named_locks: Mutex::new(HashMap::new()),
            queues,
            ports: Mutex::new(ports),
            default_min_free: config.min_free_bytes,
            probe,
        })
    }

    // ========================
    // Space reservation
    // ========================

    /// Register a filesystem mount point to watch. `min_free` defaults to
    /// the configured headroom.
    pub fn add_path(&self, path: impl Into<PathBuf>, min_free: Option<u64>) {
        let path = path.into();
        let mut paths = self.lock_paths();
        paths.entry(path).or_insert_with(|| WatchedPath {
            min_free: min_free.unwrap_or(self.default_min_free),
            reservations: HashMap::new(),
        });
    }

    /// Attempt to reserve `size` bytes for a file about to be written.
    ///
    /// Returns `false` without reserving when the watched mount cannot
    /// accommodate the request. Files on unwatched mounts are not limited.
    ///
    /// The accounting is deliberately best-effort against other processes
    /// writing to the same filesystem, but the check and the insert happen
    /// under one lock acquisition, so two concurrent reserves in this
    /// process cannot both pass against the same headroom.
    pub fn reserve_space_for_file(&self, size: u64, filepath: impl AsRef<Path>) -> Result<bool> {
        let filepath = filepath.as_ref();
        let mut paths = self.lock_paths();
        let Some(mount) = Self::mount_of(&paths, filepath) else {
            debug!(file = %filepath.display(), "File is on an unwatched mount, not reserving");
            return Ok(true);
        };

        let free = self.probe.free_bytes(&mount)?;
        let Some(watched) = paths.get_mut(&mount) else {
            return Ok(true);
        };
        let available = free
            .saturating_sub(watched.min_free)
            .saturating_sub(Self::outstanding(watched));
        if size > available {
            warn!(
                file = %filepath.display(),
                requested = size,
                available,
                "Rejecting space reservation"
            );
            return Ok(false);
        }

        watched.reservations.insert(filepath.to_path_buf(), size);
        debug!(file = %filepath.display(), size, mount = %mount.display(), "Reserved space");
        Ok(true)
    }

    /// Remove a pending reservation. Idempotent unless `strict`, in which
    /// case a missing reservation is an error.
    pub fn cancel_reservation_for_file(
        &self,
        filepath: impl AsRef<Path>,
        strict: bool,
    ) -> Result<()> {
        let filepath = filepath.as_ref();
        let mut paths = self.lock_paths();
        let removed = paths
            .values_mut()
            .any(|watched| watched.reservations.remove(filepath).is_some());
        if !removed && strict {
            return Err(ForgeError::ReservationNotFound { path: filepath.to_path_buf() });
        }
        Ok(())
    }

    /// Free space on a watched mount after subtracting its headroom and
    /// the not-yet-materialized share of outstanding reservations.
    ///
    /// A reservation shrinks as its file grows on disk, so this
    /// approximates remaining free space rather than hard-allocating it.
    pub fn available_space_for_path(&self, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref();
        let free = self.probe.free_bytes(path)?;
        let paths = self.lock_paths();
        let Some(watched) = paths.get(path) else {
            return Ok(free);
        };
        Ok(free.saturating_sub(watched.min_free).saturating_sub(Self::outstanding(watched)))
    }

    /// Reserved bytes not yet materialized on disk.
    fn outstanding(watched: &WatchedPath) -> u64 {
        watched
            .reservations
            .iter()
            .map(|(file, reserved)| {
                let on_disk = std::fs::metadata(file).map(|m| m.len()).unwrap_or(0);
                reserved.saturating_sub(on_disk)
            })
            .sum()
    }

    fn mount_of(paths: &HashMap<PathBuf, WatchedPath>, filepath: &Path) -> Option<PathBuf> {
        paths
            .keys()
            .filter(|mount| filepath.starts_with(mount))
            .max_by_key(|mount| mount.as_os_str().len())
            .cloned()
    }

    // ========================
    // Named locks
    // ========================

    /// A mutex keyed by an arbitrary string, created lazily and exactly
    /// once. Hold the guard for the duration of the serialized operation;
    /// dropping it releases the lock.
    pub fn named_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.named_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // ========================
    // Admission queues
    // ========================

    /// Wait for a slot in a named bounded-concurrency queue.
    ///
    /// Returns `None` for unknown queue names, which are unlimited by
    /// design. Dropping the permit releases the slot.
    pub async fn enter_queue(&self, name: &str) -> Option<OwnedSemaphorePermit> {
        let semaphore = self.queues.get(name)?.clone();
        debug!(queue = name, "Waiting for admission slot");
        match semaphore.acquire_owned().await {
            Ok(permit) => Some(permit),
            // The semaphore is never closed.
            Err(_) => None,
        }
    }

    /// Free slots currently available in a named queue.
    pub fn queue_capacity(&self, name: &str) -> Option<usize> {
        self.queues.get(name).map(|s| s.available_permits())
    }

    // ========================
    // Port allocation
    // ========================

    /// Next TCP port from the configured range, wrapping around.
    pub fn next_port(&self) -> u16 {
        let mut ports = self.ports.lock().unwrap_or_else(|e| e.into_inner());
        let span = (ports.end - ports.start) as u32 + 1;
        let port = ports.start + (ports.next_offset % span) as u16;
        ports.next_offset = (ports.next_offset + 1) % span;
        port
    }

    fn lock_paths(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, WatchedPath>> {
        self.paths.lock().unwrap_or_else(|e| e.into_inner())
    }
}
