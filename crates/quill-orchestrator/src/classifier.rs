//! Task classification.
//!
//! Classification normally goes through a pluggable backend (a language-model
//! call in production). Low-confidence results are re-sampled and settled by
//! majority vote; results that stay below the escalation threshold terminate
//! with a needs-human-classification error. When the backend is unavailable
//! the rule-based keyword classifier answers instead, at reduced confidence,
//! rather than failing the task outright. Classification is produced once per
//! task and cached for the task's lifetime.

use crate::config::ClassifierConfig;
use crate::error::{OrchestrationError, Result};
use crate::task::{Classification, CollaborationMode, Complexity, ContentType, Task, TaskId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Errors a classification backend can report.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend cannot be reached; the caller should fall back.
    #[error("Classification backend unavailable: {0}")]
    Unavailable(String),

    /// The backend answered with something unusable.
    #[error("Classification backend returned invalid result: {0}")]
    InvalidResult(String),
}

/// Pluggable classification backend.
///
/// Implementations must be deterministic for identical task content and a
/// fixed backend version; residual non-determinism is bounded by the majority
/// vote in `TaskClassifier`.
#[async_trait]
pub trait ClassifierBackend: Send + Sync {
    /// Produces one classification sample for a task.
    async fn classify(&self, task: &Task) -> std::result::Result<Classification, BackendError>;
}

/// Task classifier with voting, escalation, and rule-based fallback.
pub struct TaskClassifier {
    backend: Option<Arc<dyn ClassifierBackend>>,
    config: ClassifierConfig,
    cache: RwLock<HashMap<TaskId, Classification>>,
}

impl std::fmt::Debug for TaskClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskClassifier")
            .field("has_backend", &self.backend.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TaskClassifier {
    /// Creates a classifier that uses only the rule-based keyword classifier.
    #[must_use]
    pub fn new(config: ClassifierConfig) -> Self {
        Self { backend: None, config, cache: RwLock::new(HashMap::new()) }
    }

    /// Attaches a classification backend.
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn ClassifierBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Classifies a task, caching the result for the task's lifetime.
    ///
    /// # Errors
    /// Returns `ClassificationLowConfidence` when the majority vote stays
    /// below the escalation threshold — the task needs human classification.
    pub async fn classify(&self, task: &Task) -> Result<Classification> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(&task.id) {
                return Ok(cached.clone());
            }
        }

        let classification = match &self.backend {
            Some(backend) => self.classify_with_backend(task, backend.as_ref()).await?,
            None => keyword_classify(task),
        };

        debug!(
            task_id = %task.id,
            domain = %classification.domain,
            content_type = %classification.content_type,
            confidence = classification.confidence,
            "Task classified"
        );

        self.cache.write().await.insert(task.id.clone(), classification.clone());
        Ok(classification)
    }

    /// Classifies through the backend, voting on low-confidence results.
    async fn classify_with_backend(
        &self,
        task: &Task,
        backend: &dyn ClassifierBackend,
    ) -> Result<Classification> {
        let first = match backend.classify(task).await {
            Ok(sample) => sample,
            Err(err) => {
                warn!(task_id = %task.id, error = %err, "Classification backend failed, using keyword fallback");
                return Ok(keyword_classify(task));
            }
        };

        if first.confidence >= self.config.vote_threshold {
            return Ok(first);
        }

        // Low confidence: draw more samples and take a majority vote over
        // (content type, domain).
        let mut samples = vec![first];
        while samples.len() < self.config.vote_samples {
            match backend.classify(task).await {
                Ok(sample) => samples.push(sample),
                Err(err) => {
                    warn!(task_id = %task.id, error = %err, "Vote sample failed");
                    break;
                }
            }
        }

        let winner = majority_vote(samples);
        if winner.confidence < self.config.escalation_threshold {
            return Err(OrchestrationError::ClassificationLowConfidence {
                task_id: task.id.to_string(),
                confidence: winner.confidence,
            });
        }

        Ok(winner)
    }
}

/// Settles a set of samples by majority over (content type, domain), breaking
/// ties by the lexicographically smallest vote key for determinism. The
/// winner's confidence is the mean confidence of its group.
fn majority_vote(samples: Vec<Classification>) -> Classification {
    let mut groups: HashMap<String, Vec<Classification>> = HashMap::new();
    for sample in samples {
        let key = format!("{}/{}", sample.content_type, sample.domain);
        groups.entry(key).or_default().push(sample);
    }

    let mut keyed: Vec<(String, Vec<Classification>)> = groups.into_iter().collect();
    keyed.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(&b.0)));

    let (_, group) = keyed.into_iter().next().expect("at least one sample");
    let mean_confidence = group.iter().map(|c| c.confidence).sum::<f64>() / group.len() as f64;

    let mut winner = group.into_iter().next().expect("non-empty group");
    winner.confidence = mean_confidence;
    winner
}

/// Rule-based keyword classifier. Deterministic; confidence capped at 0.6.
#[must_use]
pub fn keyword_classify(task: &Task) -> Classification {
    let lower = task.description.to_lowercase();

    let content_type = detect_content_type(&lower);
    let domain = task.domain_hint.clone().unwrap_or_else(|| detect_domain(&lower));
    let complexity = detect_complexity(&lower, &domain);
    let collaboration_mode = detect_collaboration(&lower, complexity);

    // Strong keyword signal earns the cap; a bare default stays at the
    // escalation boundary so downstream policy can still notice.
    let strong_signal =
        content_type.is_some() || domain != "general" || task.domain_hint.is_some();
    let confidence = if strong_signal { 0.6 } else { 0.5 };

    Classification {
        content_type: content_type.unwrap_or(ContentType::Article),
        complexity,
        domain,
        collaboration_mode,
        confidence,
    }
}

fn detect_content_type(lower: &str) -> Option<ContentType> {
    if lower.contains("summar") || lower.contains("condense") || lower.contains("abstract") {
        return Some(ContentType::Summary);
    }
    if lower.contains("email") || lower.contains("letter") || lower.contains("memo") {
        return Some(ContentType::Correspondence);
    }
    if lower.contains("documentation")
        || lower.contains("manual")
        || lower.contains("guide")
        || lower.contains("reference")
    {
        return Some(ContentType::Technical);
    }
    if lower.contains("story") || lower.contains("fiction") || lower.contains("poem")
        || lower.contains("narrative")
    {
        return Some(ContentType::Creative);
    }
    if lower.contains("campaign")
        || lower.contains("slogan")
        || lower.contains("landing page")
        || lower.contains("ad copy")
    {
        return Some(ContentType::Marketing);
    }
    if lower.contains("article") || lower.contains("essay") || lower.contains("blog") {
        return Some(ContentType::Article);
    }
    None
}

fn detect_domain(lower: &str) -> String {
    if lower.contains("contract") || lower.contains("legal") || lower.contains("compliance")
        || lower.contains("clause")
    {
        return "legal".to_string();
    }
    if lower.contains("medical") || lower.contains("clinical") || lower.contains("patient") {
        return "medical".to_string();
    }
    if lower.contains("financ") || lower.contains("earnings") || lower.contains("investment") {
        return "finance".to_string();
    }
    if lower.contains("engineer") || lower.contains("software") || lower.contains("api") {
        return "technology".to_string();
    }
    "general".to_string()
}

fn detect_complexity(lower: &str, domain: &str) -> Complexity {
    let words = lower.split_whitespace().count();
    let base = match words {
        0..=7 => Complexity::Low,
        8..=24 => Complexity::Medium,
        _ => Complexity::High,
    };

    let specialist = domain != "general"
        || lower.contains("expert")
        || lower.contains("regulatory")
        || lower.contains("peer-reviewed");

    if specialist {
        match base {
            Complexity::Low => Complexity::Medium,
            Complexity::Medium => Complexity::High,
            Complexity::High | Complexity::Expert => Complexity::Expert,
        }
    } else {
        base
    }
}

fn detect_collaboration(lower: &str, complexity: Complexity) -> CollaborationMode {
    if lower.contains("sections") || lower.contains("chapters") || lower.contains("parts") {
        return CollaborationMode::Parallel;
    }
    if lower.contains("research") && complexity >= Complexity::High {
        return CollaborationMode::Collaborative;
    }
    if lower.contains("then revise") || lower.contains("then polish") || lower.contains("and edit")
    {
        return CollaborationMode::Sequential;
    }
    if complexity >= Complexity::Expert {
        return CollaborationMode::Collaborative;
    }
    CollaborationMode::Single
}
