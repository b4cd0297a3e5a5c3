//! Plan, step and result types plus the plan/step state machines

use crate::config::RetryConfig;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

fn new_plan_id() -> String {
    Uuid::new_v4().to_string()
}

/// A research plan: a DAG of steps submitted for execution
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct Plan {
    /// Generated when the plan file does not carry one
    #[serde(default = "new_plan_id")]
    pub id: String,

    /// The research question this plan answers
    #[serde(alias = "research_question", alias = "question")]
    pub title: String,

    pub steps: Vec<Step>,

    /// Free-form configuration passed through to agents
    #[serde(default)]
    pub veritas_extensions: Map<String, Value>,

    /// Target parallelism for this plan; falls back to `max_workers`
    #[serde(default)]
    pub max_parallel: Option<usize>,
}

impl Plan {
    pub fn new(title: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: new_plan_id(),
            title: title.into(),
            steps,
            veritas_extensions: Map::new(),
            max_parallel: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = Some(max_parallel);
        self
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }
}

/// One unit of work routed to a named agent
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct Step {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(alias = "agent_type", alias = "agent_name")]
    pub agent: String,

    #[serde(default)]
    pub action: String,

    #[serde(default, alias = "params")]
    pub parameters: Map<String, Value>,

    #[serde(default, alias = "depends_on")]
    pub dependencies: Vec<String>,

    /// Overrides `retry.max_retries` from the engine config
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Overrides the quality policy's dimension list
    #[serde(default)]
    pub quality_dimensions: Vec<String>,

    #[serde(default)]
    pub retry: Option<RetryConfig>,

    #[serde(default)]
    pub timeout_sec: Option<u64>,
}

impl Step {
    pub fn new(id: impl Into<String>, agent: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            agent: agent.into(),
            action: String::new(),
            parameters: Map::new(),
            dependencies: Vec::new(),
            max_retries: None,
            quality_dimensions: Vec::new(),
            retry: None,
            timeout_sec: None,
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_dependency(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.push(step_id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_quality_dimensions(mut self, dimensions: &[&str]) -> Self {
        self.quality_dimensions = dimensions.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    #[default]
    Success,
    Failed,
}

/// Output of one agent invocation for a step
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct StepResult {
    #[serde(default)]
    pub status: ResultStatus,

    #[serde(default)]
    pub payload: Map<String, Value>,

    #[serde(default)]
    pub quality_score: f64,

    #[serde(default)]
    pub quality_details: HashMap<String, f64>,

    #[serde(default)]
    pub error: Option<String>,

    /// Attempt number that produced this result, counted from 1
    #[serde(default)]
    pub attempt: u32,

    #[serde(default)]
    pub elapsed_ms: u64,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub retry_successful: bool,
}

impl StepResult {
    pub fn success(quality_score: f64) -> Self {
        Self {
            status: ResultStatus::Success,
            quality_score,
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Failed,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn with_detail(mut self, dimension: impl Into<String>, score: f64) -> Self {
        self.quality_details.insert(dimension.into(), score);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}

/// Plan lifecycle: `pending -> running -> {completed, failed, partial,
/// paused, awaiting_review}`, with `paused -> running` on resume and
/// `awaiting_review` settling once its reviews are resolved. A plan whose
/// reviews clear while dependents sit skipped becomes `paused`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Partial,
    Paused,
    AwaitingReview,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Pending => "pending",
            PlanStatus::Running => "running",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
            PlanStatus::Partial => "partial",
            PlanStatus::Paused => "paused",
            PlanStatus::AwaitingReview => "awaiting_review",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Partial
        )
    }

    pub fn can_transition_to(&self, next: PlanStatus) -> bool {
        use PlanStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Partial)
                | (Running, Paused)
                | (Running, AwaitingReview)
                | (Paused, Running)
                | (AwaitingReview, Completed)
                | (AwaitingReview, Partial)
                | (AwaitingReview, Failed)
                | (AwaitingReview, Paused)
        )
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Step lifecycle: `pending -> running -> {succeeded, failed,
/// review_required}`; `failed -> running` while retries remain; `skipped`
/// when the step never gets to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    ReviewRequired,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::ReviewRequired => "review_required",
            StepStatus::Skipped => "skipped",
        }
    }

    /// Terminal from the scheduler's point of view
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded
                | StepStatus::Failed
                | StepStatus::ReviewRequired
                | StepStatus::Skipped
        )
    }

    /// Whether the step actually ran
    pub fn was_executed(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::ReviewRequired
        )
    }

    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Pending, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, ReviewRequired)
                | (Running, Skipped)
                | (Failed, Running)
                | (ReviewRequired, Succeeded)
                | (ReviewRequired, Failed)
                | (Skipped, Pending)
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
