//! Types for the provider routing system.

use crate::task::ContentType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Static profile of an upstream provider: what it supports and what it
/// costs. Rolling quality/latency/reliability live in the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderProfile {
    /// Provider identifier.
    pub id: String,
    /// Content types the provider can produce.
    pub supported_content: Vec<ContentType>,
    /// Price per one million input units, USD.
    pub input_price_per_1m: f64,
    /// Price per one million output units, USD.
    pub output_price_per_1m: f64,
    /// Baseline latency used until rolling measurements accumulate.
    pub base_latency_ms: u64,
    /// Provider-class execution timeout override; the engine default applies
    /// when unset.
    pub timeout_secs: Option<u64>,
}

impl ProviderProfile {
    /// Creates a profile.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        supported_content: Vec<ContentType>,
        input_price_per_1m: f64,
        output_price_per_1m: f64,
        base_latency_ms: u64,
    ) -> Self {
        Self {
            id: id.into(),
            supported_content,
            input_price_per_1m,
            output_price_per_1m,
            base_latency_ms,
            timeout_secs: None,
        }
    }

    /// Sets a provider-class execution timeout.
    #[must_use]
    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    /// Whether the provider supports a content type.
    #[must_use]
    pub fn supports(&self, content_type: ContentType) -> bool {
        self.supported_content.contains(&content_type)
    }

    /// Estimated cost for a unit budget, assuming the typical one-quarter
    /// input, three-quarters output split seen for writing workloads.
    #[must_use]
    pub fn estimate_cost(&self, units: u64) -> f64 {
        let input = units as f64 * 0.25;
        let output = units as f64 * 0.75;
        (input / 1_000_000.0) * self.input_price_per_1m
            + (output / 1_000_000.0) * self.output_price_per_1m
    }

    /// Exact cost for measured usage.
    #[must_use]
    pub fn exact_cost(&self, input_units: u64, output_units: u64) -> f64 {
        (input_units as f64 / 1_000_000.0) * self.input_price_per_1m
            + (output_units as f64 / 1_000_000.0) * self.output_price_per_1m
    }
}

/// What the router needs to know to order providers for one invocation.
#[derive(Debug, Clone, Copy)]
pub struct RouteRequest {
    /// Content type the invocation produces.
    pub content_type: ContentType,
    /// Estimated units, for cost scoring.
    pub estimated_units: u64,
}

/// An ordered provider route: a primary plus fallbacks, consumed in order on
/// failure.
#[derive(Debug, Clone)]
pub struct ProviderRoute {
    /// Best-scoring provider.
    pub primary: String,
    /// Remaining providers, best first.
    pub fallbacks: Vec<String>,
}

impl ProviderRoute {
    /// All providers in consumption order.
    #[must_use]
    pub fn ordered(&self) -> Vec<String> {
        let mut all = Vec::with_capacity(1 + self.fallbacks.len());
        all.push(self.primary.clone());
        all.extend(self.fallbacks.iter().cloned());
        all
    }

    /// Total providers in the route.
    #[must_use]
    pub fn len(&self) -> usize {
        1 + self.fallbacks.len()
    }

    /// A route always has at least its primary.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Errors that can occur during provider routing.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// No providers registered at all.
    #[error("No providers registered")]
    NoProvidersRegistered,

    /// No provider can serve this request right now.
    #[error("No eligible provider for content type '{content_type}': {reason}")]
    NoEligibleProvider {
        /// The requested content type.
        content_type: String,
        /// Why every candidate was excluded.
        reason: String,
    },
}
