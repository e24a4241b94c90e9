//! Task and classification types.
//!
//! A task is immutable once submitted; retries create a new task. The task
//! identifier is supplied by the caller and doubles as the idempotency key
//! for submission.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Externally supplied task identifier (idempotency key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    /// Creates a task id from an external identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Task priority, used for scheduling hints and approval notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    /// Background work, no urgency.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Deadline-sensitive work.
    High,
}

/// Reference into the host document the task operates on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentScope {
    /// Opaque scope reference understood by the context source collaborator.
    pub scope_ref: String,
    /// Optional reference to prior content the task builds on.
    pub prior_content_ref: Option<String>,
}

impl DocumentScope {
    /// Creates a scope with no prior content reference.
    #[must_use]
    pub fn new(scope_ref: impl Into<String>) -> Self {
        Self { scope_ref: scope_ref.into(), prior_content_ref: None }
    }

    /// Sets the prior content reference.
    #[must_use]
    pub fn with_prior_content(mut self, prior_ref: impl Into<String>) -> Self {
        self.prior_content_ref = Some(prior_ref.into());
        self
    }
}

/// A unit of writing work submitted for processing. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Externally supplied identifier; submissions with the same id are
    /// idempotent.
    pub id: TaskId,
    /// Free-text description of the work.
    pub description: String,
    /// Document context the task operates on.
    pub scope: DocumentScope,
    /// Optional caller-supplied domain hint (e.g., "legal").
    pub domain_hint: Option<String>,
    /// Scheduling priority.
    pub priority: TaskPriority,
    /// Optional hard deadline.
    pub deadline: Option<DateTime<Utc>>,
    /// Submission timestamp.
    pub submitted_at: DateTime<Utc>,
}

impl Task {
    /// Creates a task with default priority and no deadline.
    #[must_use]
    pub fn new(id: impl Into<TaskId>, description: impl Into<String>, scope: DocumentScope) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            scope,
            domain_hint: None,
            priority: TaskPriority::default(),
            deadline: None,
            submitted_at: Utc::now(),
        }
    }

    /// Sets the domain hint.
    #[must_use]
    pub fn with_domain_hint(mut self, hint: impl Into<String>) -> Self {
        self.domain_hint = Some(hint.into());
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Content type produced by a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// Long-form articles and essays.
    Article,
    /// Condensations of existing material.
    Summary,
    /// Letters, emails, memos.
    Correspondence,
    /// Documentation and technical writing.
    Technical,
    /// Fiction, narrative, and stylized prose.
    Creative,
    /// Promotional and persuasive copy.
    Marketing,
}

impl ContentType {
    /// Parses a content type from its snake_case name.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "article" => Some(ContentType::Article),
            "summary" => Some(ContentType::Summary),
            "correspondence" => Some(ContentType::Correspondence),
            "technical" => Some(ContentType::Technical),
            "creative" => Some(ContentType::Creative),
            "marketing" => Some(ContentType::Marketing),
            _ => None,
        }
    }

    /// The capability tag workers declare to handle this content type.
    #[must_use]
    pub fn capability_tag(&self) -> &'static str {
        match self {
            ContentType::Article => "article",
            ContentType::Summary => "summary",
            ContentType::Correspondence => "correspondence",
            ContentType::Technical => "technical",
            ContentType::Creative => "creative",
            ContentType::Marketing => "marketing",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.capability_tag())
    }
}

/// Ordinal task complexity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    /// Short, mechanical edits.
    Low,
    /// Routine drafting.
    Medium,
    /// Substantial multi-section work.
    High,
    /// Specialist work needing domain expertise.
    Expert,
}

impl Complexity {
    /// Baseline unit estimate for one invocation at this complexity.
    ///
    /// Used for quota pre-checks and approval requests before any provider
    /// is called; the finalized charge uses actual reported usage.
    #[must_use]
    pub fn estimated_units(&self) -> u64 {
        match self {
            Complexity::Low => 400,
            Complexity::Medium => 1_200,
            Complexity::High => 2_500,
            Complexity::Expert => 5_000,
        }
    }
}

/// How many workers a task wants and how they coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaborationMode {
    /// One worker, one invocation.
    Single,
    /// Primary drafts, supporting workers refine in order.
    Sequential,
    /// Primary and supporting workers run concurrently on disjoint parts.
    Parallel,
    /// Supporting workers produce material first, primary synthesizes.
    Collaborative,
}

/// Structured analysis of a task, produced once per task and cached for the
/// workflow's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    /// Kind of content the task produces.
    pub content_type: ContentType,
    /// Ordinal complexity.
    pub complexity: Complexity,
    /// Domain tag (e.g., "legal", "medical", "general").
    pub domain: String,
    /// Coordination shape for worker selection and planning.
    pub collaboration_mode: CollaborationMode,
    /// Classifier confidence in [0, 1].
    pub confidence: f64,
}

impl Classification {
    /// The capability tags a worker should carry to handle this
    /// classification: the domain plus the content-type tag.
    #[must_use]
    pub fn capability_tags(&self) -> BTreeSet<String> {
        let mut tags = BTreeSet::new();
        tags.insert(self.domain.clone());
        tags.insert(self.content_type.capability_tag().to_string());
        tags
    }
}
