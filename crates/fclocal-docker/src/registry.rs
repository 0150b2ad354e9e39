//! Tracked-container registry.
//!
//! Every container the orchestrator creates is recorded here until it is
//! confirmed stopped, so a shutdown can stop whatever is still alive.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Set of container names created by this process and not yet stopped.
#[derive(Debug, Default)]
pub struct ContainerRegistry {
    names: Mutex<BTreeSet<String>>,
    shutting_down: AtomicBool,
}

impl ContainerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly created container.
    pub async fn track(&self, name: &str) {
        self.names.lock().await.insert(name.to_string());
        tracing::trace!(container = %name, "Tracking container");
    }

    /// Forget a container after a confirmed stop or exit.
    pub async fn untrack(&self, name: &str) {
        if self.names.lock().await.remove(name) {
            tracing::trace!(container = %name, "Untracked container");
        }
    }

    /// Whether `name` is currently tracked.
    pub async fn contains(&self, name: &str) -> bool {
        self.names.lock().await.contains(name)
    }

    /// Snapshot of tracked names.
    pub async fn tracked(&self) -> Vec<String> {
        self.names.lock().await.iter().cloned().collect()
    }

    /// Number of tracked containers.
    pub async fn len(&self) -> usize {
        self.names.lock().await.len()
    }

    /// Whether no containers are tracked.
    pub async fn is_empty(&self) -> bool {
        self.names.lock().await.is_empty()
    }

    /// Mark the registry as shutting down.
    ///
    /// Returns `true` only for the first caller.
    pub fn begin_shutdown(&self) -> bool {
        !self.shutting_down.swap(true, Ordering::SeqCst)
    }

    /// Whether a shutdown has started.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_track_untrack() {
        let registry = ContainerRegistry::new();
        registry.track("a").await;
        registry.track("b").await;
        registry.track("a").await;
        assert_eq!(registry.len().await, 2);

        registry.untrack("a").await;
        assert!(!registry.contains("a").await);
        assert_eq!(registry.tracked().await, vec!["b".to_string()]);
    }

    #[test]
    fn test_begin_shutdown_once() {
        let registry = ContainerRegistry::new();
        assert!(registry.begin_shutdown());
        assert!(!registry.begin_shutdown());
        assert!(registry.is_shutting_down());
    }
}
