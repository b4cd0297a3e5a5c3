use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use super::defaults::*;

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Upper bound on steps executing at once within a group
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Per-invocation agent timeout, separate from retry backoff
    #[serde(default = "default_step_timeout_sec")]
    pub step_timeout_sec: u64,

    /// How long a step waits for a human decision; 0 parks it immediately
    #[serde(default = "default_review_timeout_sec")]
    pub review_timeout_sec: u64,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub quality: QualityPolicy,

    #[serde(default)]
    pub agents: Vec<AgentDefinition>,
}

/// What the scheduler does once a step has failed for good
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Finish the current group, skip everything after it, fail the plan
    #[default]
    Halt,
    /// Skip transitive dependents of the failed step, run the rest
    SkipDependents,
    /// Best effort: run dependents anyway
    Continue,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePolicy::Halt => write!(f, "halt"),
            FailurePolicy::SkipDependents => write!(f, "skip_dependents"),
            FailurePolicy::Continue => write!(f, "continue"),
        }
    }
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "halt" => Ok(FailurePolicy::Halt),
            "skip_dependents" | "skip" => Ok(FailurePolicy::SkipDependents),
            "continue" | "best_effort" => Ok(FailurePolicy::Continue),
            _ => Err(format!("Unknown failure policy: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
    Constant,
    Fibonacci,
}

impl std::fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackoffStrategy::Exponential => write!(f, "exponential"),
            BackoffStrategy::Linear => write!(f, "linear"),
            BackoffStrategy::Constant => write!(f, "constant"),
            BackoffStrategy::Fibonacci => write!(f, "fibonacci"),
        }
    }
}

/// Delays are expressed in seconds.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct RetryConfig {
    #[serde(default)]
    pub strategy: BackoffStrategy,

    #[serde(default = "default_base_delay")]
    pub base_delay: f64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default = "default_max_delay")]
    pub max_delay: f64,

    #[serde(default = "default_true")]
    pub jitter: bool,

    #[serde(default = "default_jitter_range")]
    pub jitter_range: f64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::default(),
            base_delay: default_base_delay(),
            backoff_factor: default_backoff_factor(),
            max_delay: default_max_delay(),
            jitter: default_true(),
            jitter_range: default_jitter_range(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct QualityPolicy {
    #[serde(default = "default_min_quality")]
    pub min_quality: f64,

    #[serde(default = "default_target_quality")]
    pub target_quality: f64,

    #[serde(default = "default_review_threshold_low")]
    pub review_threshold_low: f64,

    #[serde(default = "default_review_threshold_high")]
    pub review_threshold_high: f64,

    #[serde(default)]
    pub require_review: bool,

    #[serde(default = "default_quality_retries")]
    pub max_retries: u32,

    /// Dimensions that must each reach `min_quality` in `quality_details`
    #[serde(default)]
    pub dimensions: Vec<String>,
}

impl Default for QualityPolicy {
    fn default() -> Self {
        Self {
            min_quality: default_min_quality(),
            target_quality: default_target_quality(),
            review_threshold_low: default_review_threshold_low(),
            review_threshold_high: default_review_threshold_high(),
            require_review: false,
            max_retries: default_quality_retries(),
            dimensions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Spawn a command; step JSON on stdin, StepResult JSON on stdout
    Process,
    /// Return the step parameters as payload with a fixed score
    Echo,
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentKind::Process => write!(f, "process"),
            AgentKind::Echo => write!(f, "echo"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct AgentDefinition {
    pub name: String,

    pub kind: AgentKind,

    #[serde(default)]
    pub binary: Option<PathBuf>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Score reported by echo agents
    #[serde(default = "default_echo_score")]
    pub quality_score: f64,
}

impl AgentDefinition {
    pub fn echo(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: AgentKind::Echo,
            binary: None,
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            quality_score: default_echo_score(),
        }
    }
}
