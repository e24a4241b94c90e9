//! TOML configuration file support for the orchestrator.
//!
//! Every tunable in the system (selector weights, router weights, approval
//! timeout, retry and concurrency limits) lives here with a sensible default,
//! so a deployment can run with no config file at all.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading the file.
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("Failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error.
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Worker-selection tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct SelectorConfig {
    /// Weight of capability-tag overlap in the worker score.
    #[serde(default = "default_capability_weight")]
    pub capability_weight: f64,
    /// Weight of the rolling per-domain performance score.
    #[serde(default = "default_performance_weight")]
    pub performance_weight: f64,
    /// Weight of inverse current load.
    #[serde(default = "default_load_weight")]
    pub load_weight: f64,
    /// Minimum score a primary worker must reach; below this the selection
    /// fails rather than degrading silently.
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    /// Maximum workers selected for a parallel-mode task.
    #[serde(default = "default_max_parallel_workers")]
    pub max_parallel_workers: usize,
    /// Pairwise Jaccard similarity ceiling for parallel-mode capability sets.
    #[serde(default = "default_jaccard_limit")]
    pub jaccard_limit: f64,
}

fn default_capability_weight() -> f64 {
    0.5
}
fn default_performance_weight() -> f64 {
    0.3
}
fn default_load_weight() -> f64 {
    0.2
}
fn default_min_score() -> f64 {
    0.35
}
fn default_max_parallel_workers() -> usize {
    3
}
fn default_jaccard_limit() -> f64 {
    0.6
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            capability_weight: default_capability_weight(),
            performance_weight: default_performance_weight(),
            load_weight: default_load_weight(),
            min_score: default_min_score(),
            max_parallel_workers: default_max_parallel_workers(),
            jaccard_limit: default_jaccard_limit(),
        }
    }
}

/// Provider-routing tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Weight of historical quality (acceptance rate).
    #[serde(default = "default_quality_weight")]
    pub quality_weight: f64,
    /// Weight of inverse normalized cost.
    #[serde(default = "default_cost_weight")]
    pub cost_weight: f64,
    /// Weight of inverse normalized latency.
    #[serde(default = "default_latency_weight")]
    pub latency_weight: f64,
    /// Weight of reliability (1 - recent error rate).
    #[serde(default = "default_reliability_weight")]
    pub reliability_weight: f64,
}

fn default_quality_weight() -> f64 {
    0.4
}
fn default_cost_weight() -> f64 {
    0.2
}
fn default_latency_weight() -> f64 {
    0.15
}
fn default_reliability_weight() -> f64 {
    0.25
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            quality_weight: default_quality_weight(),
            cost_weight: default_cost_weight(),
            latency_weight: default_latency_weight(),
            reliability_weight: default_reliability_weight(),
        }
    }
}

/// Approval-policy tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalConfig {
    /// Seconds before an unresolved approval request expires.
    #[serde(default = "default_approval_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_approval_timeout_secs() -> u64 {
    30 * 60
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self { timeout_secs: default_approval_timeout_secs() }
    }
}

impl ApprovalConfig {
    /// Approval timeout as a `Duration`.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Workflow-engine tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Maximum concurrent invocations within one workflow stage.
    #[serde(default = "default_stage_concurrency")]
    pub stage_concurrency: usize,
    /// Maximum concurrent invocations across all workflows.
    #[serde(default = "default_global_concurrency")]
    pub global_concurrency: usize,
    /// Additional attempts after the first failed provider call.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds before a single invocation execution times out.
    #[serde(default = "default_invocation_timeout_secs")]
    pub invocation_timeout_secs: u64,
}

fn default_stage_concurrency() -> usize {
    3
}
fn default_global_concurrency() -> usize {
    16
}
fn default_max_retries() -> u32 {
    2
}
fn default_invocation_timeout_secs() -> u64 {
    120
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stage_concurrency: default_stage_concurrency(),
            global_concurrency: default_global_concurrency(),
            max_retries: default_max_retries(),
            invocation_timeout_secs: default_invocation_timeout_secs(),
        }
    }
}

impl EngineConfig {
    /// Invocation timeout as a `Duration`.
    #[must_use]
    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs)
    }
}

/// Classifier tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    /// Samples drawn for the majority vote when confidence is low.
    #[serde(default = "default_vote_samples")]
    pub vote_samples: usize,
    /// Confidence below which the vote is triggered.
    #[serde(default = "default_vote_threshold")]
    pub vote_threshold: f64,
    /// Confidence below which classification escalates to a human.
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: f64,
}

fn default_vote_samples() -> usize {
    3
}
fn default_vote_threshold() -> f64 {
    0.7
}
fn default_escalation_threshold() -> f64 {
    0.5
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            vote_samples: default_vote_samples(),
            vote_threshold: default_vote_threshold(),
            escalation_threshold: default_escalation_threshold(),
        }
    }
}

/// Registry tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Smoothing factor for the exponentially weighted performance score.
    #[serde(default = "default_performance_alpha")]
    pub performance_alpha: f64,
}

fn default_performance_alpha() -> f64 {
    0.3
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { performance_alpha: default_performance_alpha() }
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrchestratorConfig {
    /// Worker-selection tunables.
    #[serde(default)]
    pub selector: SelectorConfig,
    /// Provider-routing tunables.
    #[serde(default)]
    pub router: RouterConfig,
    /// Approval-policy tunables.
    #[serde(default)]
    pub approval: ApprovalConfig,
    /// Workflow-engine tunables.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Classifier tunables.
    #[serde(default)]
    pub classifier: ClassifierConfig,
    /// Registry tunables.
    #[serde(default)]
    pub registry: RegistryConfig,
}

impl OrchestratorConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: OrchestratorConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates configuration ranges.
    ///
    /// # Errors
    /// Returns error if any tunable is out of range.
    pub fn validate(&self) -> Result<()> {
        let selector_sum = self.selector.capability_weight
            + self.selector.performance_weight
            + self.selector.load_weight;
        if (selector_sum - 1.0).abs() > 0.001 {
            return Err(ConfigError::Validation(format!(
                "Selector weights must sum to 1.0, got {:.3}",
                selector_sum
            )));
        }

        if !(0.0..=1.0).contains(&self.selector.min_score) {
            return Err(ConfigError::Validation(format!(
                "Selector min_score must be in [0, 1], got {}",
                self.selector.min_score
            )));
        }

        if self.selector.max_parallel_workers == 0 {
            return Err(ConfigError::Validation(
                "max_parallel_workers must be at least 1".to_string(),
            ));
        }

        let router_sum = self.router.quality_weight
            + self.router.cost_weight
            + self.router.latency_weight
            + self.router.reliability_weight;
        if (router_sum - 1.0).abs() > 0.001 {
            return Err(ConfigError::Validation(format!(
                "Router weights must sum to 1.0, got {:.3}",
                router_sum
            )));
        }

        if self.approval.timeout_secs == 0 {
            return Err(ConfigError::Validation("Approval timeout must be positive".to_string()));
        }

        if self.engine.stage_concurrency == 0 || self.engine.global_concurrency == 0 {
            return Err(ConfigError::Validation(
                "Concurrency limits must be at least 1".to_string(),
            ));
        }

        if self.engine.invocation_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "Invocation timeout must be positive".to_string(),
            ));
        }

        if self.classifier.vote_samples == 0 {
            return Err(ConfigError::Validation("vote_samples must be at least 1".to_string()));
        }

        if self.classifier.escalation_threshold > self.classifier.vote_threshold {
            return Err(ConfigError::Validation(format!(
                "escalation_threshold ({}) must not exceed vote_threshold ({})",
                self.classifier.escalation_threshold, self.classifier.vote_threshold
            )));
        }

        if !(0.0..=1.0).contains(&self.registry.performance_alpha) {
            return Err(ConfigError::Validation(format!(
                "performance_alpha must be in [0, 1], got {}",
                self.registry.performance_alpha
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.stage_concurrency, 3);
        assert_eq!(config.approval.timeout_secs, 1800);
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[selector]
min_score = 0.5

[engine]
stage_concurrency = 2
max_retries = 1
"#
        )
        .unwrap();

        let config = OrchestratorConfig::load(file.path()).unwrap();
        assert!((config.selector.min_score - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.engine.stage_concurrency, 2);
        assert_eq!(config.engine.max_retries, 1);
        // Untouched sections keep defaults
        assert!((config.router.quality_weight - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rejects_bad_selector_weights() {
        let mut config = OrchestratorConfig::default();
        config.selector.capability_weight = 0.9;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sum to 1.0"));
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let mut config = OrchestratorConfig::default();
        config.engine.stage_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_classifier_thresholds() {
        let mut config = OrchestratorConfig::default();
        config.classifier.escalation_threshold = 0.9;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("escalation_threshold"));
    }
}
