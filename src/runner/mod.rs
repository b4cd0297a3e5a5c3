//! Plan execution: backoff, retries, single-step execution and group
//! scheduling

mod backoff;
mod context;
mod executor;
mod retry;
mod scheduler;
mod state;

pub use backoff::{calculate_delay, delay_duration, fibonacci};
pub use context::{RetryState, StepContext};
pub use executor::{StepExecutor, StepOutcome};
pub use retry::{AttemptState, RetryPolicy};
pub use scheduler::{publish_review_outcome, PlanScheduler, WorkerMessage};
pub use state::{
    ExecutionMode, ExecutionSummary, PlanState, PlanTracker, StatusReport, StepState, StepSummary,
};
