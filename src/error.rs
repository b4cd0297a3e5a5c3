use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VeritasError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("Step error: {0}")]
    Step(#[from] StepError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid quality policy: {0}")]
    InvalidQualityPolicy(String),

    #[error("Invalid retry config: {0}")]
    InvalidRetry(String),

    #[error("Duplicate agent definition '{0}'")]
    DuplicateAgent(String),

    #[error("max_workers must be at least 1")]
    ZeroWorkers,

    #[error("Process agent '{0}' has no binary")]
    MissingBinary(String),
}

/// A plan that can never start.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Cyclic dependency among steps: {}", steps.join(", "))]
    CyclicDependency { steps: Vec<String> },

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Duplicate step id '{0}'")]
    DuplicateStep(String),

    #[error("Plan has no steps")]
    EmptyPlan,

    #[error("Plan id '{0}' must not contain path separators or '..'")]
    InvalidId(String),

    #[error("Step '{step}' has an invalid retry override: {message}")]
    InvalidRetry { step: String, message: String },

    #[error("Failed to read plan file '{path}': {message}")]
    Read { path: PathBuf, message: String },

    #[error("Failed to parse plan: {0}")]
    Parse(String),
}

/// Why a single step did not succeed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    #[error("No agent registered under '{0}'")]
    AgentNotFound(String),

    #[error("Agent execution failed: {0}")]
    Execution(#[from] AgentError),

    #[error("Step timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Quality gate rejected result (score {score:.2}): {}", reasons.join("; "))]
    QualityRejected { score: f64, reasons: Vec<String> },

    #[error("Awaiting human review ({request_id})")]
    ReviewPending { request_id: String },

    #[error("Step cancelled before it started")]
    Cancelled,
}

impl StepError {
    /// Whether the error came from a parked review rather than a failure
    pub fn is_review_pending(&self) -> bool {
        matches!(self, StepError::ReviewPending { .. })
    }
}

/// Errors raised by an agent while executing a step.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    #[error("{0}")]
    Failed(String),

    #[error("Process failed with exit code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("Failed to spawn agent process: {0}")]
    Spawn(String),

    #[error("Invalid agent output: {0}")]
    InvalidOutput(String),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Unknown plan '{0}'")]
    UnknownPlan(String),

    #[error("Plan '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Plan '{0}' is not paused")]
    NotPaused(String),

    #[error("Plan rejected: {0}")]
    Rejected(#[from] PlanError),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("Review error: {0}")]
    Review(#[from] ReviewError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    #[error("Unknown client '{0}'")]
    UnknownClient(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReviewError {
    #[error("Unknown review request '{0}'")]
    UnknownRequest(String),

    #[error("Review request '{0}' is already resolved")]
    AlreadyResolved(String),
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Failed to create output directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Failed to write summary: {0}")]
    WriteSummary(std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
