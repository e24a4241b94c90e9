// Error taxonomy for orchestration

use quill_abstraction::{ProviderError, ValidationViolation};
use thiserror::Error;

use crate::permission::PermissionError;
use crate::routing::RoutingError;
use crate::selector::SelectionError;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Workflow-level errors surfaced to callers.
///
/// Every failure carries the specific request/invocation that caused it;
/// callers never see a bare "something went wrong".
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// The classifier could not reach a confident classification; the task
    /// needs human classification.
    #[error("Classification confidence {confidence:.2} below threshold for task '{task_id}'")]
    ClassificationLowConfidence {
        /// Task that failed classification.
        task_id: String,
        /// Winning sample's confidence.
        confidence: f64,
    },

    /// No worker met the minimum selection score.
    #[error("No qualified worker: {detail}")]
    NoQualifiedWorker {
        /// What was requested and how close the best candidate came.
        detail: String,
    },

    /// A quota on the subject's grant would be exceeded.
    #[error("Quota exceeded for subject '{subject}': {detail}")]
    QuotaExceeded {
        /// Subject whose grant was charged.
        subject: String,
        /// Which quota and by how much.
        detail: String,
    },

    /// An approval request was explicitly denied.
    #[error("Approval request '{request_id}' denied{}", reason.as_ref().map(|r| format!(": {}", r)).unwrap_or_default())]
    ApprovalDenied {
        /// The denied request.
        request_id: String,
        /// Approver-supplied reason, if any.
        reason: Option<String>,
    },

    /// An approval request expired without resolution.
    #[error("Approval request '{request_id}' expired before resolution")]
    ApprovalExpired {
        /// The expired request.
        request_id: String,
    },

    /// Every provider in the fallback route failed.
    #[error("All providers failed for invocation '{invocation_id}' after {attempts} attempts: {last_error}")]
    ProviderUnavailable {
        /// Invocation whose route was exhausted.
        invocation_id: String,
        /// Number of attempts made.
        attempts: u32,
        /// The final provider error.
        last_error: String,
    },

    /// A provider was skipped because its circuit breaker is open.
    #[error("Provider '{provider_id}' circuit is open")]
    ProviderCircuitOpen {
        /// The skipped provider.
        provider_id: String,
    },

    /// Aggregated output failed the quality validation pass.
    #[error("Output validation failed: {}", violations.iter().map(|v| v.check.as_str()).collect::<Vec<_>>().join(", "))]
    ValidationFailed {
        /// The specific checks that failed.
        violations: Vec<ValidationViolation>,
    },

    /// The workflow was cancelled.
    #[error("Workflow cancelled")]
    Cancelled,

    /// An operation exceeded its deadline.
    #[error("Timeout: {operation}")]
    Timeout {
        /// Description of the timed-out operation.
        operation: String,
    },

    /// The caller's input was rejected before any work started.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A referenced resource does not exist.
    #[error("Not found: {resource} '{id}'")]
    NotFound {
        /// Resource kind (workflow, approval request, worker).
        resource: String,
        /// The missing identifier.
        id: String,
    },

    /// A permission-manager failure not covered by a dedicated variant.
    #[error("Permission error: {0}")]
    Permission(PermissionError),

    /// A routing failure not covered by a dedicated variant.
    #[error("Routing error: {0}")]
    Routing(RoutingError),
}

impl OrchestrationError {
    /// Returns `true` if a local retry (next provider, later attempt) is
    /// permitted. Approval and quota errors are never retried automatically.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ProviderUnavailable { .. } | Self::Timeout { .. })
    }
}

impl From<SelectionError> for OrchestrationError {
    fn from(err: SelectionError) -> Self {
        match err {
            SelectionError::NoWorkersRegistered => {
                Self::NoQualifiedWorker { detail: "no workers registered".to_string() }
            }
            SelectionError::NoQualifiedWorker { domain, best_score } => Self::NoQualifiedWorker {
                detail: format!("domain '{}', best candidate scored {:.2}", domain, best_score),
            },
        }
    }
}

impl From<PermissionError> for OrchestrationError {
    fn from(err: PermissionError) -> Self {
        match err {
            PermissionError::QuotaExceeded { subject, reason } => {
                Self::QuotaExceeded { subject, detail: reason }
            }
            PermissionError::Denied { request_id, reason } => {
                Self::ApprovalDenied { request_id, reason }
            }
            PermissionError::Expired { request_id } => Self::ApprovalExpired { request_id },
            PermissionError::RequestNotFound { request_id } => {
                Self::NotFound { resource: "approval request".to_string(), id: request_id }
            }
            other => Self::Permission(other),
        }
    }
}

impl From<RoutingError> for OrchestrationError {
    fn from(err: RoutingError) -> Self {
        Self::Routing(err)
    }
}

impl From<ProviderError> for OrchestrationError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Timeout { provider, seconds } => Self::Timeout {
                operation: format!("provider '{}' call ({}s)", provider, seconds),
            },
            other => Self::ProviderUnavailable {
                invocation_id: String::new(),
                attempts: 1,
                last_error: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let unavailable = OrchestrationError::ProviderUnavailable {
            invocation_id: "inv-1".to_string(),
            attempts: 3,
            last_error: "connection reset".to_string(),
        };
        assert!(unavailable.is_retryable());

        let denied =
            OrchestrationError::ApprovalDenied { request_id: "apr-1".to_string(), reason: None };
        assert!(!denied.is_retryable());

        let quota = OrchestrationError::QuotaExceeded {
            subject: "user-1".to_string(),
            detail: "daily units".to_string(),
        };
        assert!(!quota.is_retryable());
    }

    #[test]
    fn test_selection_error_mapping() {
        let err: OrchestrationError = SelectionError::NoQualifiedWorker {
            domain: "legal".to_string(),
            best_score: 0.21,
        }
        .into();
        assert!(matches!(err, OrchestrationError::NoQualifiedWorker { .. }));
        assert!(err.to_string().contains("legal"));
    }

    #[test]
    fn test_validation_failed_lists_checks() {
        let err = OrchestrationError::ValidationFailed {
            violations: vec![
                quill_abstraction::ValidationViolation::new("min-length", "too short"),
                quill_abstraction::ValidationViolation::new("placeholder", "contains TODO"),
            ],
        };
        let rendered = err.to_string();
        assert!(rendered.contains("min-length"));
        assert!(rendered.contains("placeholder"));
    }
}
