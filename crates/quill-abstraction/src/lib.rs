//! Provider abstraction layer for Quill.
//!
//! This module defines the core traits and types for interacting with upstream
//! execution providers, together with the narrow interfaces Quill consumes
//! from external collaborators (document context, identity, notifications,
//! telemetry) and the pluggable output validation seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Represents an error that can occur when calling an upstream provider.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderError {
    /// An error occurred during the request itself (e.g., network issues, invalid request).
    #[error("Request Error: {0}")]
    RequestError(String),

    /// The provider returned an error response (e.g., invalid input, refused content).
    #[error("Provider Response Error: {0}")]
    ResponseError(String),

    /// An error occurred during serialization or deserialization.
    #[error("Serialization Error: {0}")]
    SerializationError(String),

    /// The provider is temporarily unavailable (overloaded, maintenance, transport failure).
    #[error("Provider '{provider}' unavailable{}", message.as_ref().map(|m| format!(": {}", m)).unwrap_or_default())]
    Unavailable {
        /// The provider identifier.
        provider: String,
        /// Optional error message from the provider.
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// The provider rejected the request due to rate limiting.
    #[error("Provider '{provider}' rate limited{}", message.as_ref().map(|m| format!(": {}", m)).unwrap_or_default())]
    RateLimited {
        /// The provider identifier.
        provider: String,
        /// Optional error message from the provider.
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// The request exceeded the execution deadline.
    #[error("Provider '{provider}' timed out after {seconds}s")]
    Timeout {
        /// The provider identifier.
        provider: String,
        /// Elapsed seconds before the deadline fired.
        seconds: u64,
    },

    /// Other unexpected errors.
    #[error("Other Provider Error: {0}")]
    Other(String),
}

impl ProviderError {
    /// Returns `true` when a retry against another provider (or the same one
    /// later) has a reasonable chance of succeeding.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::RateLimited { .. } | Self::Timeout { .. } | Self::RequestError(_)
        )
    }
}

/// A unit of work sent to a provider: the instructions plus any accumulated
/// context the worker wants the provider to see.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRequest {
    /// Instructions describing what to produce.
    pub instructions: String,
    /// Prior material the provider should take into account (document excerpt,
    /// earlier drafts, research notes).
    pub context: Option<String>,
    /// Upper bound on output units the caller is willing to consume.
    pub max_units: Option<u64>,
}

impl WorkRequest {
    /// Creates a request with instructions only.
    #[must_use]
    pub fn new(instructions: impl Into<String>) -> Self {
        Self { instructions: instructions.into(), context: None, max_units: None }
    }

    /// Attaches prior context material.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Bounds the output size.
    #[must_use]
    pub fn with_max_units(mut self, max_units: u64) -> Self {
        self.max_units = Some(max_units);
        self
    }
}

/// The response from a provider for one unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkResponse {
    /// The produced content.
    pub content: String,

    /// Optional: the identifier of the provider that produced the response.
    pub provider_id: Option<String>,

    /// Optional: usage statistics for the request.
    pub usage: Option<UnitUsage>,
}

/// Usage statistics for one provider call, in abstract work units
/// (for language-model providers these are tokens).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UnitUsage {
    /// Units consumed by the input side of the request.
    pub input_units: u64,

    /// Units consumed producing the output.
    pub output_units: u64,
}

impl UnitUsage {
    /// Creates usage statistics.
    #[must_use]
    pub fn new(input_units: u64, output_units: u64) -> Self {
        Self { input_units, output_units }
    }

    /// Total units across input and output.
    #[must_use]
    pub fn total_units(&self) -> u64 {
        self.input_units + self.output_units
    }
}

/// A trait that defines the interface for any upstream execution backend.
///
/// Implementations wrap a concrete service (a hosted language-model API, a
/// local inference server, a scripted stand-in for tests) behind a uniform
/// call surface. Providers are registered with the router and consumed by
/// workers; a provider bound to an executing invocation is never swapped
/// mid-flight.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Returns the unique identifier of this provider.
    fn id(&self) -> &str;

    /// Executes one unit of work.
    ///
    /// # Errors
    /// Returns a `ProviderError` if the call fails; `is_transient()` on the
    /// error decides whether the caller may fail over to another provider.
    async fn execute(&self, request: &WorkRequest) -> Result<WorkResponse, ProviderError>;
}

/// Document context fetched from the host editor for a task scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentContext {
    /// The text visible within the requested scope.
    pub text: String,
    /// Arbitrary metadata about the scope (title, section path, word count).
    pub metadata: serde_json::Value,
}

/// Error fetching document context.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// The referenced scope does not exist.
    #[error("Unknown scope reference: {0}")]
    UnknownScope(String),

    /// The backing store failed.
    #[error("Context store error: {0}")]
    Store(String),
}

/// Read-only access to the host document store, used to build tasks and
/// seed shared context. Supplied by the surrounding application.
#[async_trait]
pub trait ContextSource: Send + Sync {
    /// Fetches the text and metadata for a task scope reference.
    async fn get_context(&self, scope_ref: &str) -> Result<DocumentContext, ContextError>;
}

/// Error resolving a request token to a subject.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The token is unknown or expired.
    #[error("Unknown or expired token")]
    UnknownToken,

    /// The identity backend failed.
    #[error("Identity backend error: {0}")]
    Backend(String),
}

/// Resolves request tokens to subject identifiers for permission lookups.
/// Supplied by the surrounding application.
#[async_trait]
pub trait SubjectResolver: Send + Sync {
    /// Resolves a request token to a stable subject identifier.
    async fn resolve_subject(&self, request_token: &str) -> Result<String, IdentityError>;
}

/// A pending-approval notice surfaced to a human approver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalNotice {
    /// The approval request identifier to resolve.
    pub request_id: String,
    /// The subject whose grant is being charged.
    pub subject: String,
    /// The worker awaiting approval.
    pub worker_id: String,
    /// Requested capability.
    pub capability: String,
    /// Requested units.
    pub units: u64,
    /// Estimated cost in USD.
    pub estimated_cost: f64,
}

/// Fire-and-forget channel for surfacing pending approvals to a human.
///
/// Delivery failure must never block the approval timeout clock, so this
/// trait is synchronous and infallible from the caller's point of view;
/// implementations swallow and log their own delivery errors.
pub trait NotificationSink: Send + Sync {
    /// Delivers a pending-approval notice. Best effort.
    fn notify(&self, notice: ApprovalNotice);
}

/// A best-effort telemetry event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricEvent {
    /// Event name (e.g., "invocation.succeeded").
    pub name: String,
    /// Arbitrary structured payload.
    pub payload: serde_json::Value,
}

/// Best-effort telemetry sink, never on the critical path of approval or
/// execution.
pub trait MetricsSink: Send + Sync {
    /// Emits a telemetry event. Best effort.
    fn emit(&self, event: MetricEvent);
}

/// A specific validation violation found in aggregated workflow output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationViolation {
    /// Identifier of the check that failed (e.g., "min-length").
    pub check: String,
    /// Human-readable description of the violation.
    pub detail: String,
}

impl ValidationViolation {
    /// Creates a violation record.
    #[must_use]
    pub fn new(check: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { check: check.into(), detail: detail.into() }
    }
}

/// Policy-defined quality check run over a workflow's aggregated output.
///
/// An empty violation list means the output passed. Violations are surfaced
/// verbatim to the caller so a failing workflow is never a bare error.
pub trait OutputValidator: Send + Sync {
    /// Validates aggregated output, returning every violation found.
    fn validate(&self, output: &str) -> Vec<ValidationViolation>;
}
