//! Worker selector for dynamic worker selection based on capabilities,
//! performance, and load.

use crate::config::SelectorConfig;
use crate::registry::{WorkerRegistry, WorkerSnapshot};
use crate::task::{Classification, CollaborationMode};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur during worker selection.
#[derive(Debug, Error)]
pub enum SelectionError {
    /// The registry is empty.
    #[error("No workers registered")]
    NoWorkersRegistered,

    /// No worker met the minimum score; a weak match is never returned silently.
    #[error("No qualified worker for domain '{domain}' (best score {best_score:.2})")]
    NoQualifiedWorker {
        /// Domain that was requested.
        domain: String,
        /// Best score among the rejected candidates.
        best_score: f64,
    },
}

/// A worker with its computed selection score.
#[derive(Debug, Clone)]
pub struct ScoredWorker {
    /// Snapshot at scoring time.
    pub snapshot: WorkerSnapshot,
    /// Combined selection score in [0, 1].
    pub score: f64,
}

/// Result of worker selection: a primary worker and optional supporting
/// workers, depending on the collaboration mode.
#[derive(Debug, Clone)]
pub struct Selection {
    /// The primary worker.
    pub primary: ScoredWorker,
    /// Supporting workers, highest score first.
    pub supporting: Vec<ScoredWorker>,
}

impl Selection {
    /// All selected worker ids, primary first.
    #[must_use]
    pub fn worker_ids(&self) -> Vec<String> {
        let mut ids = vec![self.primary.snapshot.id.clone()];
        ids.extend(self.supporting.iter().map(|w| w.snapshot.id.clone()));
        ids
    }
}

/// Worker selector over the registry.
#[derive(Debug)]
pub struct WorkerSelector {
    /// Worker registry for candidate snapshots.
    registry: Arc<WorkerRegistry>,
    /// Scoring weights and thresholds.
    config: SelectorConfig,
}

impl WorkerSelector {
    /// Creates a new worker selector.
    ///
    /// # Arguments
    /// * `registry` - The worker registry
    /// * `config` - Scoring weights and thresholds
    pub fn new(registry: Arc<WorkerRegistry>, config: SelectorConfig) -> Self {
        Self { registry, config }
    }

    /// Selects the best worker(s) for a classification.
    ///
    /// Scoring combines capability-tag overlap, rolling per-domain
    /// performance, and inverse load. Ties break by lowest load, then by
    /// worker id for determinism. In parallel collaboration mode, up to
    /// `max_parallel_workers` workers with pairwise-diverse capability sets
    /// are selected to maximize coverage.
    ///
    /// # Errors
    /// Returns `SelectionError::NoQualifiedWorker` if the best candidate is
    /// below the minimum score threshold.
    pub async fn select(&self, classification: &Classification) -> Result<Selection, SelectionError> {
        let snapshots = self.registry.snapshot().await;
        if snapshots.is_empty() {
            return Err(SelectionError::NoWorkersRegistered);
        }

        let wanted = classification.capability_tags();
        let mut scored: Vec<ScoredWorker> = snapshots
            .into_iter()
            .map(|snapshot| {
                let score = self.score(&snapshot, &wanted, &classification.domain);
                ScoredWorker { snapshot, score }
            })
            .collect();

        // Highest score first; ties by lowest load, then worker id.
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.snapshot.load.cmp(&b.snapshot.load))
                .then_with(|| a.snapshot.id.cmp(&b.snapshot.id))
        });

        let best_score = scored.first().map_or(0.0, |w| w.score);
        if best_score < self.config.min_score {
            warn!(
                domain = %classification.domain,
                best_score,
                min_score = self.config.min_score,
                "No qualified worker"
            );
            return Err(SelectionError::NoQualifiedWorker {
                domain: classification.domain.clone(),
                best_score,
            });
        }

        let mut iter = scored.into_iter();
        let primary = iter.next().expect("non-empty scored list");
        let rest: Vec<ScoredWorker> = iter.collect();

        let supporting = match classification.collaboration_mode {
            CollaborationMode::Single => Vec::new(),
            CollaborationMode::Sequential | CollaborationMode::Collaborative => rest
                .into_iter()
                .filter(|w| w.score >= self.config.min_score)
                .take(self.config.max_parallel_workers.saturating_sub(1))
                .collect(),
            CollaborationMode::Parallel => {
                self.pick_diverse(&primary, rest)
            }
        };

        debug!(
            primary = %primary.snapshot.id,
            primary_score = primary.score,
            supporting = supporting.len(),
            mode = ?classification.collaboration_mode,
            "Workers selected"
        );

        Ok(Selection { primary, supporting })
    }

    /// Greedily picks supporting workers whose capability sets are
    /// non-redundant with everything already selected.
    fn pick_diverse(&self, primary: &ScoredWorker, candidates: Vec<ScoredWorker>) -> Vec<ScoredWorker> {
        let mut selected: Vec<ScoredWorker> = Vec::new();
        for candidate in candidates {
            if selected.len() + 1 >= self.config.max_parallel_workers {
                break;
            }
            if candidate.score < self.config.min_score {
                continue;
            }
            let redundant = std::iter::once(&primary.snapshot)
                .chain(selected.iter().map(|w| &w.snapshot))
                .any(|picked| {
                    jaccard(&picked.capabilities, &candidate.snapshot.capabilities)
                        >= self.config.jaccard_limit
                });
            if !redundant {
                selected.push(candidate);
            }
        }
        selected
    }

    /// Combined selection score for one worker.
    fn score(&self, snapshot: &WorkerSnapshot, wanted: &BTreeSet<String>, domain: &str) -> f64 {
        let overlap = if wanted.is_empty() {
            0.0
        } else {
            snapshot.capabilities.intersection(wanted).count() as f64 / wanted.len() as f64
        };
        let performance = snapshot.performance_for(domain);
        let load_factor = 1.0 / (1.0 + snapshot.load as f64);

        self.config.capability_weight * overlap
            + self.config.performance_weight * performance
            + self.config.load_weight * load_factor
    }
}

/// Jaccard similarity of two capability sets.
fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}
