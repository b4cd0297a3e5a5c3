//! Append-only recording of plan, step and event state
//!
//! The engine treats persistence as fire-and-forget: failures are logged and
//! never interrupt execution.

mod jsonl;

pub use jsonl::JsonlPersistence;

use crate::error::PersistenceError;
use crate::events::StreamEvent;
use crate::plan::{Plan, StepStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use tracing::warn;

/// One recorded step state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTransition {
    pub plan_id: String,
    pub step_id: String,
    pub old_state: StepStatus,
    pub new_state: StepStatus,
    pub retry_count: u32,
    #[serde(default)]
    pub quality_score: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

impl StepTransition {
    pub fn new(
        plan_id: &str,
        step_id: &str,
        old_state: StepStatus,
        new_state: StepStatus,
        retry_count: u32,
        quality_score: Option<f64>,
    ) -> Self {
        Self {
            plan_id: plan_id.to_string(),
            step_id: step_id.to_string(),
            old_state,
            new_state,
            retry_count,
            quality_score,
            recorded_at: Utc::now(),
        }
    }
}

pub trait Persistence: Send + Sync {
    fn record_plan(&self, plan: &Plan) -> Result<(), PersistenceError>;

    fn record_step_transition(&self, transition: &StepTransition) -> Result<(), PersistenceError>;

    fn record_event(&self, event: &StreamEvent) -> Result<(), PersistenceError>;
}

/// Record a transition, logging instead of failing
pub fn record_transition_logged(persistence: &dyn Persistence, transition: StepTransition) {
    if let Err(e) = persistence.record_step_transition(&transition) {
        warn!(
            "Failed to persist transition {} -> {} for step {}: {}",
            transition.old_state, transition.new_state, transition.step_id, e
        );
    }
}

/// Discards everything
#[derive(Debug, Default)]
pub struct NullPersistence;

impl Persistence for NullPersistence {
    fn record_plan(&self, _plan: &Plan) -> Result<(), PersistenceError> {
        Ok(())
    }

    fn record_step_transition(&self, _transition: &StepTransition) -> Result<(), PersistenceError> {
        Ok(())
    }

    fn record_event(&self, _event: &StreamEvent) -> Result<(), PersistenceError> {
        Ok(())
    }
}

/// Keeps records in memory; handy for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    plans: Mutex<Vec<Plan>>,
    transitions: Mutex<Vec<StepTransition>>,
    events: Mutex<Vec<StreamEvent>>,
}

impl MemoryPersistence {
    pub fn plans(&self) -> Vec<Plan> {
        self.plans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn transitions(&self) -> Vec<StepTransition> {
        self.transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn events(&self) -> Vec<StreamEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Persistence for MemoryPersistence {
    fn record_plan(&self, plan: &Plan) -> Result<(), PersistenceError> {
        self.plans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(plan.clone());
        Ok(())
    }

    fn record_step_transition(&self, transition: &StepTransition) -> Result<(), PersistenceError> {
        self.transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(transition.clone());
        Ok(())
    }

    fn record_event(&self, event: &StreamEvent) -> Result<(), PersistenceError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}
