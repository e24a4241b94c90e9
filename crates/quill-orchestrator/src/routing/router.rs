//! Provider router: scores candidates and produces ordered fallback routes.
//!
//! Scoring combines rolling quality, inverse cost, inverse latency, and
//! reliability, with weights from configuration. Open circuits are excluded
//! from scoring entirely; half-open circuits are scored but capped strictly
//! below every closed provider, so recovery is gradual and automatic.

use super::circuit_breaker::{CircuitBreaker, CircuitState};
use super::cost::{CostMetrics, CostTracker};
use super::types::{ProviderProfile, ProviderRoute, RouteRequest, RoutingError};
use crate::config::RouterConfig;
use quill_abstraction::{Provider, UnitUsage};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Smoothing factor for rolling quality and latency.
const STAT_ALPHA: f64 = 0.3;

/// Quality assumed for a provider with no history yet.
const INITIAL_QUALITY: f64 = 0.7;

struct ProviderEntry {
    profile: ProviderProfile,
    handle: Arc<dyn Provider>,
    /// Rolling acceptance quality in [0, 1].
    quality: f64,
    /// Rolling observed latency.
    latency_ms: f64,
}

/// Router over registered providers.
pub struct ProviderRouter {
    providers: RwLock<HashMap<String, ProviderEntry>>,
    breaker: CircuitBreaker,
    weights: RouterConfig,
    tracker: CostTracker,
}

impl std::fmt::Debug for ProviderRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRouter")
            .field("provider_count", &self.providers.try_read().map(|p| p.len()).unwrap_or(0))
            .field("weights", &self.weights)
            .finish_non_exhaustive()
    }
}

impl ProviderRouter {
    /// Creates a router with the given scoring weights and a default
    /// circuit breaker.
    #[must_use]
    pub fn new(weights: RouterConfig) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            breaker: CircuitBreaker::new(),
            weights,
            tracker: CostTracker::new(),
        }
    }

    /// Replaces the circuit breaker (shorter windows for tests, stricter
    /// thresholds for fragile deployments).
    #[must_use]
    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    /// Registers a provider with its profile.
    ///
    /// # Returns
    /// Returns `true` if newly registered, `false` if it replaced an entry.
    pub fn register_provider(&self, profile: ProviderProfile, handle: Arc<dyn Provider>) -> bool {
        let id = profile.id.clone();
        let mut providers =
            self.providers.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        let was_new = !providers.contains_key(&id);
        if !was_new {
            warn!(provider_id = %id, "Provider replaced in router");
        }
        let latency_ms = profile.base_latency_ms as f64;
        providers.insert(
            id,
            ProviderEntry { profile, handle, quality: INITIAL_QUALITY, latency_ms },
        );
        was_new
    }

    /// Removes a provider. In-flight invocations keep their own handle.
    pub fn unregister_provider(&self, provider_id: &str) -> bool {
        let mut providers =
            self.providers.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        providers.remove(provider_id).is_some()
    }

    /// The execution handle for a provider.
    #[must_use]
    pub fn handle(&self, provider_id: &str) -> Option<Arc<dyn Provider>> {
        let providers = self.providers.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        providers.get(provider_id).map(|entry| Arc::clone(&entry.handle))
    }

    /// The profile for a provider.
    #[must_use]
    pub fn profile(&self, provider_id: &str) -> Option<ProviderProfile> {
        let providers = self.providers.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        providers.get(provider_id).map(|entry| entry.profile.clone())
    }

    /// Estimated cost of a unit budget on a provider.
    #[must_use]
    pub fn estimate_cost(&self, provider_id: &str, units: u64) -> Option<f64> {
        self.profile(provider_id).map(|profile| profile.estimate_cost(units))
    }

    /// The cheapest estimated cost any eligible provider offers for a
    /// request. Used for pre-approval cost estimates.
    #[must_use]
    pub fn cheapest_estimate(&self, request: &RouteRequest) -> Option<f64> {
        let providers = self.providers.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        providers
            .values()
            .filter(|entry| entry.profile.supports(request.content_type))
            .map(|entry| entry.profile.estimate_cost(request.estimated_units))
            .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    }

    /// Produces an ordered provider route for an invocation.
    ///
    /// # Errors
    /// Returns `RoutingError` when no provider is registered, none supports
    /// the content type, or every candidate's circuit is open.
    pub fn route(&self, request: &RouteRequest) -> Result<ProviderRoute, RoutingError> {
        struct Candidate {
            id: String,
            state: CircuitState,
            score: f64,
        }

        let (mut candidates, any_registered, any_supporting) = {
            let providers =
                self.providers.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            let any_registered = !providers.is_empty();

            let supporting: Vec<(&String, &ProviderEntry)> = providers
                .iter()
                .filter(|(_, entry)| entry.profile.supports(request.content_type))
                .collect();
            let any_supporting = !supporting.is_empty();

            let eligible: Vec<(&String, &ProviderEntry, CircuitState)> = supporting
                .into_iter()
                .filter_map(|(id, entry)| {
                    let state = self.breaker.state_of(id);
                    if state.excludes_from_routing() {
                        debug!(provider_id = %id, "Skipping provider with open circuit");
                        None
                    } else {
                        Some((id, entry, state))
                    }
                })
                .collect();

            let max_cost = eligible
                .iter()
                .map(|(_, entry, _)| entry.profile.estimate_cost(request.estimated_units))
                .fold(0.0_f64, f64::max);
            let max_latency =
                eligible.iter().map(|(_, entry, _)| entry.latency_ms).fold(0.0_f64, f64::max);

            let candidates: Vec<Candidate> = eligible
                .into_iter()
                .map(|(id, entry, state)| {
                    let cost = entry.profile.estimate_cost(request.estimated_units);
                    let cost_factor = if max_cost > 0.0 { 1.0 - cost / max_cost } else { 1.0 };
                    let latency_factor =
                        if max_latency > 0.0 { 1.0 - entry.latency_ms / max_latency } else { 1.0 };
                    let reliability = 1.0 - self.breaker.failure_rate(id);

                    let score = self.weights.quality_weight * entry.quality
                        + self.weights.cost_weight * cost_factor
                        + self.weights.latency_weight * latency_factor
                        + self.weights.reliability_weight * reliability;

                    Candidate { id: id.clone(), state, score }
                })
                .collect();

            (candidates, any_registered, any_supporting)
        };

        if !any_registered {
            return Err(RoutingError::NoProvidersRegistered);
        }
        if !any_supporting {
            return Err(RoutingError::NoEligibleProvider {
                content_type: request.content_type.to_string(),
                reason: "no provider supports this content type".to_string(),
            });
        }
        if candidates.is_empty() {
            return Err(RoutingError::NoEligibleProvider {
                content_type: request.content_type.to_string(),
                reason: "all supporting providers have open circuits".to_string(),
            });
        }

        // Half-open providers recover gradually: their score is capped
        // strictly below every closed provider's.
        let min_closed = candidates
            .iter()
            .filter(|c| c.state == CircuitState::Closed)
            .map(|c| c.score)
            .fold(f64::INFINITY, f64::min);
        if min_closed.is_finite() {
            for candidate in &mut candidates {
                if candidate.state == CircuitState::HalfOpen {
                    candidate.score = candidate.score.min(min_closed - 1e-6);
                }
            }
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut ids = candidates.into_iter().map(|c| c.id);
        let primary = ids.next().expect("non-empty candidate list");
        let fallbacks: Vec<String> = ids.collect();

        debug!(primary = %primary, fallbacks = fallbacks.len(), "Provider route computed");
        Ok(ProviderRoute { primary, fallbacks })
    }

    /// Records a successful provider call: feeds the breaker, rolling stats,
    /// and the cost tracker.
    ///
    /// # Arguments
    /// * `provider_id` - Provider that served the call
    /// * `latency_ms` - Observed latency
    /// * `usage` - Measured usage
    pub fn record_success(&self, provider_id: &str, latency_ms: u64, usage: &UnitUsage) {
        self.breaker.record_success(provider_id);

        let mut providers =
            self.providers.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(entry) = providers.get_mut(provider_id) {
            entry.quality = STAT_ALPHA * 1.0 + (1.0 - STAT_ALPHA) * entry.quality;
            entry.latency_ms =
                STAT_ALPHA * latency_ms as f64 + (1.0 - STAT_ALPHA) * entry.latency_ms;
            let cost = entry.profile.exact_cost(usage.input_units, usage.output_units);
            self.tracker.track_usage(provider_id, usage, cost);
        }
    }

    /// Records a failed provider call.
    ///
    /// # Arguments
    /// * `provider_id` - Provider whose call failed
    pub fn record_failure(&self, provider_id: &str) {
        self.breaker.record_failure(provider_id);

        let mut providers =
            self.providers.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(entry) = providers.get_mut(provider_id) {
            entry.quality = (1.0 - STAT_ALPHA) * entry.quality;
        }
    }

    /// Current circuit state for a provider.
    #[must_use]
    pub fn circuit_state(&self, provider_id: &str) -> CircuitState {
        self.breaker.state_of(provider_id)
    }

    /// Snapshot of per-provider cost metrics.
    #[must_use]
    pub fn cost_metrics(&self) -> CostMetrics {
        self.tracker.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ContentType;
    use crate::EchoProvider;
    use std::time::Duration;

    fn profile(id: &str, input_price: f64, output_price: f64, latency: u64) -> ProviderProfile {
        ProviderProfile::new(
            id,
            vec![ContentType::Article, ContentType::Summary],
            input_price,
            output_price,
            latency,
        )
    }

    fn router_with(entries: &[(&str, f64, f64, u64)]) -> ProviderRouter {
        let router = ProviderRouter::new(RouterConfig::default());
        for (id, input_price, output_price, latency) in entries {
            router.register_provider(
                profile(id, *input_price, *output_price, *latency),
                Arc::new(EchoProvider::new(id.to_string())),
            );
        }
        router
    }

    fn request() -> RouteRequest {
        RouteRequest { content_type: ContentType::Article, estimated_units: 1_200 }
    }

    #[test]
    fn test_no_providers_registered() {
        let router = ProviderRouter::new(RouterConfig::default());
        assert!(matches!(router.route(&request()), Err(RoutingError::NoProvidersRegistered)));
    }

    #[test]
    fn test_unsupported_content_type() {
        let router = ProviderRouter::new(RouterConfig::default());
        router.register_provider(
            ProviderProfile::new("tech-only", vec![ContentType::Technical], 1.0, 2.0, 500),
            Arc::new(EchoProvider::new("tech-only".to_string())),
        );

        let err = router.route(&request()).unwrap_err();
        assert!(matches!(err, RoutingError::NoEligibleProvider { .. }));
    }

    #[test]
    fn test_route_produces_primary_and_fallbacks() {
        let router = router_with(&[
            ("expensive-slow", 30.0, 60.0, 3_000),
            ("cheap-fast", 0.25, 1.25, 400),
        ]);

        let route = router.route(&request()).unwrap();
        // Same quality/reliability at start: cost and latency decide.
        assert_eq!(route.primary, "cheap-fast");
        assert_eq!(route.fallbacks, vec!["expensive-slow".to_string()]);
    }

    #[test]
    fn test_open_circuit_excluded_entirely() {
        let router = router_with(&[("a", 1.0, 2.0, 500), ("b", 1.0, 2.0, 500)])
            .with_circuit_breaker(CircuitBreaker::with_settings(
                0.5,
                Duration::from_secs(300),
                Duration::from_secs(60),
                4,
            ));

        for _ in 0..6 {
            router.record_failure("a");
        }
        assert!(matches!(router.circuit_state("a"), CircuitState::Open(_)));

        let route = router.route(&request()).unwrap();
        assert_eq!(route.primary, "b");
        assert!(route.fallbacks.is_empty());
    }

    #[test]
    fn test_all_circuits_open_is_an_error() {
        let router = router_with(&[("a", 1.0, 2.0, 500)]).with_circuit_breaker(
            CircuitBreaker::with_settings(0.5, Duration::from_secs(300), Duration::from_secs(60), 4),
        );
        for _ in 0..6 {
            router.record_failure("a");
        }

        let err = router.route(&request()).unwrap_err();
        match err {
            RoutingError::NoEligibleProvider { reason, .. } => {
                assert!(reason.contains("open circuits"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_half_open_capped_below_closed() {
        let router = router_with(&[
            // Half-open candidate is otherwise far better on cost/latency.
            ("recovering", 0.25, 1.25, 400),
            ("steady", 30.0, 60.0, 3_000),
        ])
        .with_circuit_breaker(CircuitBreaker::with_settings(
            0.5,
            Duration::from_secs(300),
            Duration::from_millis(10),
            4,
        ));

        for _ in 0..6 {
            router.record_failure("recovering");
        }
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(router.circuit_state("recovering"), CircuitState::HalfOpen);

        let route = router.route(&request()).unwrap();
        assert_eq!(route.primary, "steady");
        assert_eq!(route.fallbacks, vec!["recovering".to_string()]);
    }

    #[test]
    fn test_success_improves_quality_and_tracks_cost() {
        let router = router_with(&[("a", 4.0, 12.0, 1_000)]);
        router.record_success("a", 800, &UnitUsage::new(250_000, 750_000));

        let metrics = router.cost_metrics();
        let a = &metrics.providers["a"];
        assert_eq!(a.request_count, 1);
        // 250k @ $4/1M + 750k @ $12/1M = $1 + $9.
        assert!((a.estimated_cost - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_cheapest_estimate() {
        let router = router_with(&[
            ("pricey", 30.0, 60.0, 3_000),
            ("cheap", 0.25, 1.25, 400),
        ]);
        let cheapest = router.cheapest_estimate(&request()).unwrap();
        let cheap_direct = router.estimate_cost("cheap", 1_200).unwrap();
        assert!((cheapest - cheap_direct).abs() < 1e-12);
    }

    #[test]
    fn test_deterministic_tie_break_by_id() {
        let router = router_with(&[("zeta", 1.0, 2.0, 500), ("alpha", 1.0, 2.0, 500)]);
        let route = router.route(&request()).unwrap();
        assert_eq!(route.primary, "alpha");
    }
}
