//! Workflow event model for streaming progress to clients.
//!
//! This is the canonical event stream contract for the orchestration core.
//! CLI/daemon clients and the notification sink consume these events for
//! progress, approval prompts, and final results. Emission is fire-and-forget
//! and never on the critical path of approval or execution.

use quill_abstraction::{ApprovalNotice, MetricEvent, MetricsSink, NotificationSink};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// A unique identifier correlating events within one workflow.
pub type WorkflowId = String;

/// High-level workflow events emitted during orchestration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A task was accepted and a workflow created.
    TaskAccepted {
        workflow_id: WorkflowId,
        task_id: String,
    },

    /// The task was classified.
    TaskClassified {
        workflow_id: WorkflowId,
        domain: String,
        confidence: f64,
    },

    /// Workers were selected for the workflow.
    WorkersSelected {
        workflow_id: WorkflowId,
        primary: String,
        supporting: Vec<String>,
    },

    /// A human approval is required before an invocation may execute.
    ApprovalRequired {
        workflow_id: WorkflowId,
        notice: ApprovalNotice,
    },

    /// An approval request was resolved (approved, denied, or expired).
    ApprovalResolved {
        workflow_id: WorkflowId,
        request_id: String,
        outcome: String,
    },

    /// An invocation attempt started executing against a provider.
    InvocationStarted {
        workflow_id: WorkflowId,
        invocation_id: String,
        attempt: u32,
        worker_id: String,
        provider_id: String,
    },

    /// An invocation attempt failed; a failover attempt may follow.
    AttemptFailed {
        workflow_id: WorkflowId,
        invocation_id: String,
        attempt: u32,
        provider_id: String,
        error: String,
    },

    /// An invocation reached a terminal state.
    InvocationFinished {
        workflow_id: WorkflowId,
        invocation_id: String,
        status: String,
    },

    /// Aggregated output failed validation.
    ValidationFailed {
        workflow_id: WorkflowId,
        checks: Vec<String>,
    },

    /// The workflow reached a terminal status.
    WorkflowDone {
        workflow_id: WorkflowId,
        status: String,
    },
}

/// Broadcast bus for workflow events.
///
/// Slow or absent subscribers never block emission; `broadcast` drops the
/// oldest events for laggards instead.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// Creates a bus with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emits an event. Best effort: an error (no subscribers) is ignored.
    pub fn emit(&self, event: WorkflowEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribes to the event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }

    /// Forwards approval prompts to a notification sink on a background task.
    ///
    /// The forwarder holds only a receiver; dropping the bus ends it.
    pub fn forward_approvals(&self, sink: Arc<dyn NotificationSink>) {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if let WorkflowEvent::ApprovalRequired { notice, .. } = event {
                    sink.notify(notice);
                }
            }
        });
    }

    /// Forwards every event to a telemetry sink on a background task.
    /// Best effort: events that fail to encode are skipped.
    pub fn forward_metrics(&self, sink: Arc<dyn MetricsSink>) {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if let Ok(payload) = serde_json::to_value(&event) {
                    let name = payload
                        .get("type")
                        .and_then(|t| t.as_str())
                        .unwrap_or("workflow_event")
                        .to_string();
                    sink.emit(MetricEvent { name, payload });
                }
            }
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_subscribe() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit(WorkflowEvent::TaskAccepted {
            workflow_id: "wf-1".to_string(),
            task_id: "t-1".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, WorkflowEvent::TaskAccepted { .. }));
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::new(8);
        bus.emit(WorkflowEvent::WorkflowDone {
            workflow_id: "wf-1".to_string(),
            status: "completed".to_string(),
        });
    }

    #[tokio::test]
    async fn test_metrics_forwarding() {
        use quill_abstraction::MetricEvent;
        use std::sync::Mutex;

        struct Capture(Mutex<Vec<MetricEvent>>);
        impl MetricsSink for Capture {
            fn emit(&self, event: MetricEvent) {
                self.0.lock().unwrap().push(event);
            }
        }

        let bus = EventBus::new(8);
        let sink = Arc::new(Capture(Mutex::new(Vec::new())));
        bus.forward_metrics(sink.clone());

        bus.emit(WorkflowEvent::WorkflowDone {
            workflow_id: "wf-1".to_string(),
            status: "completed".to_string(),
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let captured = sink.0.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].name, "workflow_done");
    }

    #[tokio::test]
    async fn test_approval_forwarding() {
        use std::sync::Mutex;

        struct Capture(Mutex<Vec<ApprovalNotice>>);
        impl NotificationSink for Capture {
            fn notify(&self, notice: ApprovalNotice) {
                self.0.lock().unwrap().push(notice);
            }
        }

        let bus = EventBus::new(8);
        let sink = Arc::new(Capture(Mutex::new(Vec::new())));
        bus.forward_approvals(sink.clone());

        bus.emit(WorkflowEvent::ApprovalRequired {
            workflow_id: "wf-1".to_string(),
            notice: ApprovalNotice {
                request_id: "apr-1".to_string(),
                subject: "user-1".to_string(),
                worker_id: "drafter".to_string(),
                capability: "article".to_string(),
                units: 1200,
                estimated_cost: 0.04,
            },
        });
        // Non-approval events are not forwarded
        bus.emit(WorkflowEvent::WorkflowDone {
            workflow_id: "wf-1".to_string(),
            status: "completed".to_string(),
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let captured = sink.0.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].request_id, "apr-1");
    }
}
