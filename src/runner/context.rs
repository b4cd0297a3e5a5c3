//! Mutable state carried across the attempts of one step

use crate::events::EventBus;
use crate::plan::StepResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// Retry bookkeeping for one step execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryState {
    /// Current attempt, counted from 1 once the first attempt starts
    pub attempt: u32,
    /// Sum of backoff delays slept so far
    pub total_delay_ms: u64,
    pub last_error: Option<String>,
}

/// Context handed to an agent on every attempt.
///
/// The same value is reused across retries, so anything an agent writes into
/// `notes` or `scratch` during a failed attempt is visible to the next one.
/// Agents read the remaining fields and must not rely on changing them.
#[derive(Debug, Clone, Serialize)]
pub struct StepContext {
    pub plan_id: String,
    pub step_id: String,
    pub retry: RetryState,
    /// Results of the steps this step depends on
    pub upstream: HashMap<String, StepResult>,
    /// The plan's `veritas_extensions`
    pub extensions: Map<String, Value>,
    pub notes: Vec<String>,
    pub scratch: Map<String, Value>,
    #[serde(skip)]
    reporter: Option<ProgressReporter>,
}

#[derive(Clone)]
struct ProgressReporter {
    bus: EventBus,
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressReporter")
    }
}

impl StepContext {
    pub fn new(plan_id: impl Into<String>, step_id: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            step_id: step_id.into(),
            retry: RetryState::default(),
            upstream: HashMap::new(),
            extensions: Map::new(),
            notes: Vec::new(),
            scratch: Map::new(),
            reporter: None,
        }
    }

    pub fn with_upstream(mut self, upstream: HashMap<String, StepResult>) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn with_extensions(mut self, extensions: Map<String, Value>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Publish progress and retry events for this step on `bus`
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.reporter = Some(ProgressReporter { bus });
        self
    }

    pub fn events(&self) -> Option<&EventBus> {
        self.reporter.as_ref().map(|r| &r.bus)
    }

    /// Emit a `step_progress` event; a no-op without an event bus
    pub fn report_progress(&self, progress: f64, message: &str) {
        if let Some(bus) = self.events() {
            bus.step_progress(&self.plan_id, &self.step_id, progress, message);
        }
    }
}
