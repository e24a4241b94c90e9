//! Worker registry for managing registered workers.
//!
//! This module tracks each worker's capability tags, in-flight load, and a
//! rolling per-domain performance score. Workers may be added or removed at
//! runtime; removal never affects in-flight invocations, which hold their own
//! reference to the worker.

use crate::Worker;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Performance score assumed for a domain a worker has no history in.
const DEFAULT_PERFORMANCE: f64 = 0.5;

/// Point-in-time view of a registered worker, used by the selector.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    /// The worker's unique ID.
    pub id: String,
    /// The worker's description.
    pub description: String,
    /// Declared capability tags.
    pub capabilities: BTreeSet<String>,
    /// Number of in-flight invocations.
    pub load: usize,
    /// Rolling performance score per domain.
    pub performance: HashMap<String, f64>,
}

impl WorkerSnapshot {
    /// Rolling performance score for a domain, defaulting for unseen domains.
    #[must_use]
    pub fn performance_for(&self, domain: &str) -> f64 {
        self.performance.get(domain).copied().unwrap_or(DEFAULT_PERFORMANCE)
    }
}

struct WorkerEntry {
    worker: Arc<dyn Worker>,
    load: usize,
    performance: HashMap<String, f64>,
}

/// Registry for managing workers.
pub struct WorkerRegistry {
    /// Map of worker ID to entry.
    workers: Arc<RwLock<HashMap<String, WorkerEntry>>>,
    /// Smoothing factor for the exponentially weighted performance score.
    alpha: f64,
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("worker_count", &self.workers.try_read().map(|w| w.len()).unwrap_or(0))
            .field("alpha", &self.alpha)
            .finish_non_exhaustive()
    }
}

impl WorkerRegistry {
    /// Creates a new empty worker registry with the default smoothing factor.
    #[must_use]
    pub fn new() -> Self {
        Self::with_alpha(0.3)
    }

    /// Creates a registry with a custom performance smoothing factor.
    ///
    /// # Arguments
    /// * `alpha` - EWMA smoothing factor in [0, 1]; higher weights recent outcomes more.
    #[must_use]
    pub fn with_alpha(alpha: f64) -> Self {
        Self { workers: Arc::new(RwLock::new(HashMap::new())), alpha: alpha.clamp(0.0, 1.0) }
    }

    /// Registers a worker in the registry.
    ///
    /// Replacing an existing worker keeps its load counter and performance
    /// history; invocations already bound to the old instance are unaffected.
    ///
    /// # Arguments
    /// * `worker` - The worker to register
    ///
    /// # Returns
    /// Returns `true` if the worker was newly registered, `false` if it replaced an existing worker.
    pub async fn register_worker(&self, worker: Arc<dyn Worker>) -> bool {
        let id = worker.id().to_string();

        debug!(worker_id = %id, "Registering worker");

        let mut workers = self.workers.write().await;
        match workers.get_mut(&id) {
            Some(entry) => {
                warn!(worker_id = %id, "Worker replaced in registry");
                entry.worker = worker;
                false
            }
            None => {
                workers.insert(
                    id,
                    WorkerEntry { worker, load: 0, performance: HashMap::new() },
                );
                true
            }
        }
    }

    /// Retrieves a worker by ID.
    ///
    /// # Arguments
    /// * `id` - The worker ID to look up
    ///
    /// # Returns
    /// Returns `Some(Arc<dyn Worker>)` if found, `None` otherwise.
    pub async fn get_worker(&self, id: &str) -> Option<Arc<dyn Worker>> {
        let workers = self.workers.read().await;
        workers.get(id).map(|entry| Arc::clone(&entry.worker))
    }

    /// Lists all registered workers as snapshots.
    ///
    /// # Returns
    /// Returns a vector of worker snapshots.
    pub async fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let workers = self.workers.read().await;
        workers
            .iter()
            .map(|(id, entry)| WorkerSnapshot {
                id: id.clone(),
                description: entry.worker.description().to_string(),
                capabilities: entry.worker.capabilities(),
                load: entry.load,
                performance: entry.performance.clone(),
            })
            .collect()
    }

    /// Unregisters a worker from the registry.
    ///
    /// # Arguments
    /// * `id` - The worker ID to unregister
    ///
    /// # Returns
    /// Returns `true` if the worker was found and removed, `false` otherwise.
    pub async fn unregister_worker(&self, id: &str) -> bool {
        debug!(worker_id = %id, "Unregistering worker");

        let mut workers = self.workers.write().await;
        let removed = workers.remove(id).is_some();

        if !removed {
            warn!(worker_id = %id, "Attempted to unregister non-existent worker");
        }

        removed
    }

    /// Checks if a worker is registered.
    pub async fn is_registered(&self, id: &str) -> bool {
        let workers = self.workers.read().await;
        workers.contains_key(id)
    }

    /// Returns the number of registered workers.
    pub async fn count(&self) -> usize {
        let workers = self.workers.read().await;
        workers.len()
    }

    /// Increments the in-flight load for a worker at invocation start.
    ///
    /// # Arguments
    /// * `id` - The worker ID
    pub async fn begin_work(&self, id: &str) {
        let mut workers = self.workers.write().await;
        if let Some(entry) = workers.get_mut(id) {
            entry.load += 1;
            debug!(worker_id = %id, load = entry.load, "Incremented worker load");
        } else {
            warn!(worker_id = %id, "begin_work for unknown worker");
        }
    }

    /// Decrements the in-flight load without a performance update (the
    /// invocation was cancelled or never produced a gradable outcome).
    ///
    /// # Arguments
    /// * `id` - The worker ID
    pub async fn abort_work(&self, id: &str) {
        let mut workers = self.workers.write().await;
        if let Some(entry) = workers.get_mut(id) {
            if entry.load > 0 {
                entry.load -= 1;
            } else {
                warn!(worker_id = %id, "Attempted to decrement load below zero");
            }
        }
    }

    /// Decrements the load and folds an outcome quality into the worker's
    /// rolling per-domain performance score.
    ///
    /// # Arguments
    /// * `id` - The worker ID
    /// * `domain` - Domain of the completed invocation
    /// * `quality` - Outcome quality in [0, 1] (1.0 = accepted output, 0.0 = failure)
    pub async fn finish_work(&self, id: &str, domain: &str, quality: f64) {
        let quality = quality.clamp(0.0, 1.0);
        let mut workers = self.workers.write().await;
        let Some(entry) = workers.get_mut(id) else {
            warn!(worker_id = %id, "finish_work for unknown worker");
            return;
        };

        if entry.load > 0 {
            entry.load -= 1;
        } else {
            warn!(worker_id = %id, "Attempted to decrement load below zero");
        }

        let previous = entry.performance.get(domain).copied().unwrap_or(DEFAULT_PERFORMANCE);
        let updated = self.alpha * quality + (1.0 - self.alpha) * previous;
        entry.performance.insert(domain.to_string(), updated);
        debug!(
            worker_id = %id,
            domain = %domain,
            quality,
            score = updated,
            "Updated worker performance"
        );
    }

    /// Current load for a worker.
    pub async fn load_of(&self, id: &str) -> usize {
        let workers = self.workers.read().await;
        workers.get(id).map(|entry| entry.load).unwrap_or(0)
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PromptWorker;

    fn worker(id: &str, tags: &[&str]) -> Arc<dyn Worker> {
        Arc::new(PromptWorker::new(
            id.to_string(),
            format!("{} worker", id),
            tags.iter().map(|t| t.to_string()).collect(),
        ))
    }

    #[tokio::test]
    async fn test_register_and_count() {
        let registry = WorkerRegistry::new();
        assert!(registry.register_worker(worker("drafter", &["article"])).await);
        assert!(registry.register_worker(worker("editor", &["summary"])).await);
        assert_eq!(registry.count().await, 2);
        assert!(registry.is_registered("drafter").await);
    }

    #[tokio::test]
    async fn test_replace_keeps_stats() {
        let registry = WorkerRegistry::new();
        registry.register_worker(worker("drafter", &["article"])).await;
        registry.begin_work("drafter").await;

        let was_new = registry.register_worker(worker("drafter", &["article", "legal"])).await;
        assert!(!was_new);
        assert_eq!(registry.load_of("drafter").await, 1);

        let snapshot = registry.snapshot().await;
        assert!(snapshot[0].capabilities.contains("legal"));
    }

    #[tokio::test]
    async fn test_unregister_does_not_touch_inflight_handle() {
        let registry = WorkerRegistry::new();
        registry.register_worker(worker("drafter", &["article"])).await;

        let handle = registry.get_worker("drafter").await.unwrap();
        assert!(registry.unregister_worker("drafter").await);
        assert!(!registry.is_registered("drafter").await);

        // The held reference still works after removal.
        assert_eq!(handle.id(), "drafter");
    }

    #[tokio::test]
    async fn test_load_tracking() {
        let registry = WorkerRegistry::new();
        registry.register_worker(worker("drafter", &["article"])).await;

        registry.begin_work("drafter").await;
        registry.begin_work("drafter").await;
        assert_eq!(registry.load_of("drafter").await, 2);

        registry.abort_work("drafter").await;
        assert_eq!(registry.load_of("drafter").await, 1);

        registry.finish_work("drafter", "general", 1.0).await;
        assert_eq!(registry.load_of("drafter").await, 0);

        // Underflow is a warning, not a panic.
        registry.abort_work("drafter").await;
        assert_eq!(registry.load_of("drafter").await, 0);
    }

    #[tokio::test]
    async fn test_performance_ewma_moves_toward_outcomes() {
        let registry = WorkerRegistry::with_alpha(0.5);
        registry.register_worker(worker("drafter", &["article"])).await;

        registry.begin_work("drafter").await;
        registry.finish_work("drafter", "legal", 1.0).await;
        let snapshot = registry.snapshot().await;
        let after_success = snapshot[0].performance_for("legal");
        assert!(after_success > DEFAULT_PERFORMANCE);

        registry.begin_work("drafter").await;
        registry.finish_work("drafter", "legal", 0.0).await;
        let snapshot = registry.snapshot().await;
        let after_failure = snapshot[0].performance_for("legal");
        assert!(after_failure < after_success);

        // Other domains are untouched.
        assert!((snapshot[0].performance_for("medical") - DEFAULT_PERFORMANCE).abs() < f64::EPSILON);
    }
}
