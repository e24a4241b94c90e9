//! Workflow planning and execution.

pub mod context;
pub mod engine;
pub mod plan;
pub mod state;
pub mod validation;

pub use context::{ContextEntry, SharedContext};
pub use engine::WorkflowEngine;
pub use plan::{InvocationRole, PlannedInvocation, Stage, WorkflowPlan};
pub use state::{
    InvocationAttempt, InvocationRecord, InvocationStatus, WorkflowState, WorkflowStatus,
    WorkflowStatusReport,
};
pub use validation::{
    AcceptAllValidator, CompositeValidator, MinLengthValidator, PlaceholderValidator,
};
