//! Provider routing: scoring, fallback ordering, circuit breaking, and
//! cost tracking.

pub mod circuit_breaker;
pub mod cost;
pub mod router;
pub mod types;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use cost::{CostMetrics, CostTracker, ProviderMetrics};
pub use router::ProviderRouter;
pub use types::{ProviderProfile, ProviderRoute, RouteRequest, RoutingError};
