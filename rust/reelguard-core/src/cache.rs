//! Versioned identifier snapshots for the detector.
//!
//! The detector runs on every qualifying UI event, so it reads from an
//! immutable [`CacheSnapshot`] behind an `Arc` instead of the repository.
//! Updates build a whole new snapshot and swap the pointer; a reader holding
//! the old `Arc` keeps a consistent view of both targets.

use crate::identifiers::IdentifierConfig;
use crate::target::{MonitoredTarget, PerTarget};
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;

/// Version of a snapshot that has never been loaded. Any real configuration,
/// including pristine defaults stamped 0, is newer.
const UNLOADED: i64 = i64::MIN;

/// Qualified identifier sets for both targets at one version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSnapshot {
    pub ids: PerTarget<HashSet<String>>,
    pub version: i64,
}

impl CacheSnapshot {
    fn empty() -> Self {
        Self {
            ids: PerTarget::default(),
            version: UNLOADED,
        }
    }

    fn from_config(config: &IdentifierConfig) -> Self {
        Self {
            ids: PerTarget::from_fn(|target| {
                config
                    .identifiers(target)
                    .iter()
                    .map(|id| qualify(target, id))
                    .collect()
            }),
            version: config.last_updated,
        }
    }

    pub fn identifiers(&self, target: MonitoredTarget) -> &HashSet<String> {
        self.ids.get(target)
    }
}

/// Expand a bare resource name to `<package>:id/<name>`, the form UI nodes
/// report. Already-qualified identifiers pass through unchanged.
pub fn qualify(target: MonitoredTarget, id: &str) -> String {
    if id.contains(":id/") {
        id.to_string()
    } else {
        format!("{}:id/{}", target.package(), id)
    }
}

pub struct IdentifierCache {
    snapshot: RwLock<Arc<CacheSnapshot>>,
}

impl Default for IdentifierCache {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentifierCache {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(CacheSnapshot::empty())),
        }
    }

    /// The current snapshot. Cheap; never waits on a writer building a new one.
    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn version(&self) -> i64 {
        self.snapshot().version
    }

    /// Apply `config` if it is newer than the cached version. Returns whether
    /// the snapshot was replaced.
    pub fn apply(&self, config: &IdentifierConfig) -> bool {
        if config.last_updated <= self.version() {
            log::debug!(
                "cache: ignoring stale identifier config (version {})",
                config.last_updated
            );
            return false;
        }

        // Built outside the lock; only the pointer swap is guarded.
        let next = Arc::new(CacheSnapshot::from_config(config));
        let mut current = self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if next.version <= current.version {
            return false;
        }
        log::debug!(
            "cache: updated to version {} (YouTube: {}, Instagram: {})",
            next.version,
            next.ids.youtube.len(),
            next.ids.instagram.len()
        );
        *current = next;
        true
    }

    pub fn clear(&self) {
        *self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(CacheSnapshot::empty());
        log::debug!("cache: cleared");
    }

    /// Apply the receiver's current value, then every later change until the
    /// sender goes away.
    pub async fn follow(self: Arc<Self>, mut rx: watch::Receiver<IdentifierConfig>) {
        loop {
            let config = rx.borrow_and_update().clone();
            self.apply(&config);
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}
