//! Per-provider usage and cost tracking.
//!
//! Recording is non-blocking and best-effort: a failure to track never
//! interferes with the invocation that produced the usage.

use quill_abstraction::UnitUsage;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

/// Accumulated metrics for one provider.
#[derive(Debug, Clone, Default)]
pub struct ProviderMetrics {
    /// Number of completed requests.
    pub request_count: u64,
    /// Total input units.
    pub input_units: u64,
    /// Total output units.
    pub output_units: u64,
    /// Estimated cost in USD.
    pub estimated_cost: f64,
}

/// Snapshot of cost metrics across all providers.
#[derive(Debug, Clone, Default)]
pub struct CostMetrics {
    /// Per-provider metrics.
    pub providers: HashMap<String, ProviderMetrics>,
}

impl CostMetrics {
    /// Total cost across all providers.
    #[must_use]
    pub fn total_cost(&self) -> f64 {
        self.providers.values().map(|m| m.estimated_cost).sum()
    }

    /// Total units across all providers.
    #[must_use]
    pub fn total_units(&self) -> u64 {
        self.providers.values().map(|m| m.input_units + m.output_units).sum()
    }
}

/// Cost tracker keyed by provider.
pub struct CostTracker {
    metrics: RwLock<HashMap<String, ProviderMetrics>>,
}

impl std::fmt::Debug for CostTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostTracker").finish_non_exhaustive()
    }
}

impl CostTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self { metrics: RwLock::new(HashMap::new()) }
    }

    /// Records usage for a provider call.
    ///
    /// # Arguments
    /// * `provider_id` - Provider that served the call
    /// * `usage` - Measured unit usage
    /// * `cost` - Cost computed from the provider's price card
    pub fn track_usage(&self, provider_id: &str, usage: &UnitUsage, cost: f64) {
        let mut metrics =
            self.metrics.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = metrics.entry(provider_id.to_string()).or_default();

        entry.request_count += 1;
        entry.input_units += usage.input_units;
        entry.output_units += usage.output_units;
        entry.estimated_cost += cost;

        debug!(
            provider_id,
            input_units = usage.input_units,
            output_units = usage.output_units,
            cost,
            total_cost = entry.estimated_cost,
            "Tracked provider usage"
        );
    }

    /// Snapshot of current metrics.
    #[must_use]
    pub fn snapshot(&self) -> CostMetrics {
        let metrics = self.metrics.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        CostMetrics { providers: metrics.clone() }
    }

    /// Clears all metrics.
    pub fn reset(&self) {
        let mut metrics =
            self.metrics.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        metrics.clear();
    }
}

impl Default for CostTracker {
    fn default() -> Self {
        Self::new()
    }
}
