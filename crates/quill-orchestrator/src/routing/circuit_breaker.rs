//! Circuit breaker pattern for provider failure detection.
//!
//! Each provider gets a sliding window of call outcomes. When the failure
//! rate over the window crosses the threshold (with a minimum sample count so
//! a cold provider is not condemned on its first hiccup), the circuit opens
//! and the provider is skipped entirely. After a cooldown the circuit moves
//! to half-open and admits one probe: success closes it, failure reopens it.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Circuit breaker state for a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Skipping the provider until the cooldown expires.
    Open(SystemTime),
    /// Testing recovery with one probe request.
    HalfOpen,
}

impl CircuitState {
    /// Whether routing should exclude the provider in this state.
    #[must_use]
    pub fn excludes_from_routing(&self) -> bool {
        matches!(self, CircuitState::Open(_))
    }
}

struct BreakerEntry {
    state: CircuitState,
    /// Sliding window of (time, success) outcomes.
    outcomes: VecDeque<(SystemTime, bool)>,
}

impl BreakerEntry {
    fn new() -> Self {
        Self { state: CircuitState::Closed, outcomes: VecDeque::new() }
    }

    fn prune(&mut self, window: Duration) {
        let now = SystemTime::now();
        while let Some(&(at, _)) = self.outcomes.front() {
            match now.duration_since(at) {
                Ok(age) if age > window => {
                    self.outcomes.pop_front();
                }
                // Clock went backwards: drop the entry rather than keep a
                // future-dated sample alive forever.
                Err(_) => {
                    self.outcomes.pop_front();
                }
                _ => break,
            }
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / self.outcomes.len() as f64
    }
}

/// Circuit breaker tracking provider health and gating routing.
pub struct CircuitBreaker {
    entries: RwLock<HashMap<String, BreakerEntry>>,
    /// Failure rate above which the circuit opens.
    failure_threshold: f64,
    /// Sliding window for the failure rate.
    window: Duration,
    /// Cooldown before an open circuit admits a probe.
    cooldown: Duration,
    /// Minimum outcomes in the window before the circuit may open.
    min_samples: usize,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("failure_threshold", &self.failure_threshold)
            .field("window", &self.window)
            .field("cooldown", &self.cooldown)
            .field("min_samples", &self.min_samples)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Creates a breaker with default settings: 50% threshold over a
    /// 5-minute window, 60-second cooldown, 8 minimum samples.
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(0.5, Duration::from_secs(300), Duration::from_secs(60), 8)
    }

    /// Creates a breaker with custom settings.
    ///
    /// # Arguments
    /// * `failure_threshold` - Failure rate in (0, 1] that opens the circuit
    /// * `window` - Sliding window for the rate
    /// * `cooldown` - Time an open circuit waits before probing
    /// * `min_samples` - Outcomes required before the circuit may open
    #[must_use]
    pub fn with_settings(
        failure_threshold: f64,
        window: Duration,
        cooldown: Duration,
        min_samples: usize,
    ) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            failure_threshold,
            window,
            cooldown,
            min_samples,
        }
    }

    /// Records a successful call.
    ///
    /// # Arguments
    /// * `provider_id` - Provider identifier
    pub fn record_success(&self, provider_id: &str) {
        let mut entries =
            self.entries.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = entries.entry(provider_id.to_string()).or_insert_with(BreakerEntry::new);

        if entry.state == CircuitState::HalfOpen {
            // Successful probe: close and forget the failures that opened us,
            // so stale history cannot immediately reopen the circuit.
            entry.state = CircuitState::Closed;
            entry.outcomes.clear();
            debug!(provider_id, "Circuit breaker: HalfOpen -> Closed (recovery successful)");
        }

        entry.outcomes.push_back((SystemTime::now(), true));
        entry.prune(self.window);
        self.maybe_open(provider_id, entry);
    }

    /// Records a failed call.
    ///
    /// # Arguments
    /// * `provider_id` - Provider identifier
    pub fn record_failure(&self, provider_id: &str) {
        let mut entries =
            self.entries.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = entries.entry(provider_id.to_string()).or_insert_with(BreakerEntry::new);

        entry.outcomes.push_back((SystemTime::now(), false));
        entry.prune(self.window);

        if entry.state == CircuitState::HalfOpen {
            entry.state = CircuitState::Open(SystemTime::now());
            warn!(provider_id, "Circuit breaker: HalfOpen -> Open (recovery failed)");
            return;
        }

        self.maybe_open(provider_id, entry);
    }

    fn maybe_open(&self, provider_id: &str, entry: &mut BreakerEntry) {
        if entry.state != CircuitState::Closed {
            return;
        }
        if entry.outcomes.len() < self.min_samples {
            return;
        }
        let rate = entry.failure_rate();
        if rate > self.failure_threshold {
            entry.state = CircuitState::Open(SystemTime::now());
            warn!(
                provider_id,
                failure_rate = rate,
                threshold = self.failure_threshold,
                samples = entry.outcomes.len(),
                "Circuit breaker: Closed -> Open (failure rate exceeded threshold)"
            );
        }
    }

    /// Current state for a provider, transitioning Open to HalfOpen when the
    /// cooldown has elapsed.
    ///
    /// # Arguments
    /// * `provider_id` - Provider identifier
    pub fn state_of(&self, provider_id: &str) -> CircuitState {
        let mut entries =
            self.entries.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = entries.entry(provider_id.to_string()).or_insert_with(BreakerEntry::new);

        if let CircuitState::Open(opened_at) = entry.state {
            let expired = opened_at.elapsed().map(|age| age >= self.cooldown).unwrap_or(true);
            if expired {
                entry.state = CircuitState::HalfOpen;
                debug!(provider_id, "Circuit breaker: Open -> HalfOpen (cooldown elapsed)");
            }
        }

        entry.state
    }

    /// Whether routing should skip the provider right now.
    pub fn should_skip(&self, provider_id: &str) -> bool {
        self.state_of(provider_id).excludes_from_routing()
    }

    /// Failure rate over the current window.
    pub fn failure_rate(&self, provider_id: &str) -> f64 {
        let entries = self.entries.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.get(provider_id).map_or(0.0, BreakerEntry::failure_rate)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn fast_breaker() -> CircuitBreaker {
        CircuitBreaker::with_settings(0.5, Duration::from_secs(300), Duration::from_millis(100), 8)
    }

    #[test]
    fn test_opens_after_high_failure_rate() {
        let breaker = fast_breaker();
        for _ in 0..6 {
            breaker.record_failure("p");
        }
        for _ in 0..2 {
            breaker.record_success("p");
        }

        assert!(breaker.should_skip("p"));
        assert!(matches!(breaker.state_of("p"), CircuitState::Open(_)));
    }

    #[test]
    fn test_stays_closed_under_threshold() {
        let breaker = fast_breaker();
        for _ in 0..3 {
            breaker.record_failure("p");
        }
        for _ in 0..7 {
            breaker.record_success("p");
        }

        assert!(!breaker.should_skip("p"));
        assert_eq!(breaker.state_of("p"), CircuitState::Closed);
    }

    #[test]
    fn test_min_samples_guard() {
        let breaker = fast_breaker();
        // 100% failures, but below min_samples: stays closed.
        for _ in 0..7 {
            breaker.record_failure("p");
        }
        assert_eq!(breaker.state_of("p"), CircuitState::Closed);

        breaker.record_failure("p");
        assert!(matches!(breaker.state_of("p"), CircuitState::Open(_)));
    }

    #[test]
    fn test_half_open_after_cooldown_then_closes_on_success() {
        let breaker = fast_breaker();
        for _ in 0..8 {
            breaker.record_failure("p");
        }
        assert!(breaker.should_skip("p"));

        thread::sleep(Duration::from_millis(150));
        assert_eq!(breaker.state_of("p"), CircuitState::HalfOpen);
        assert!(!breaker.should_skip("p"));

        breaker.record_success("p");
        assert_eq!(breaker.state_of("p"), CircuitState::Closed);
        // History was reset; the old failures cannot reopen the circuit.
        assert!(breaker.failure_rate("p") < 0.01);
    }

    #[test]
    fn test_half_open_reopens_on_failure() {
        let breaker = fast_breaker();
        for _ in 0..8 {
            breaker.record_failure("p");
        }
        thread::sleep(Duration::from_millis(150));
        assert_eq!(breaker.state_of("p"), CircuitState::HalfOpen);

        breaker.record_failure("p");
        assert!(matches!(breaker.state_of("p"), CircuitState::Open(_)));
    }

    #[test]
    fn test_failure_rate_calculation() {
        let breaker = CircuitBreaker::new();
        for _ in 0..2 {
            breaker.record_failure("p");
        }
        for _ in 0..3 {
            breaker.record_success("p");
        }
        assert!((breaker.failure_rate("p") - 0.4).abs() < 0.01);
    }
}
