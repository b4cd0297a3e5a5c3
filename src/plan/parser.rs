//! Loading plans from JSON or YAML files

use crate::error::PlanError;
use std::path::Path;
use tracing::debug;

use super::resolver::{resolve_execution_groups, ExecutionGroups};
use super::types::Plan;

/// Load a plan from disk; `.yaml`/`.yml` files are read as YAML, anything
/// else as JSON with a YAML fallback.
pub fn load_plan(path: &Path) -> Result<Plan, PlanError> {
    let content = std::fs::read_to_string(path).map_err(|e| PlanError::Read {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );

    if is_yaml {
        serde_yaml::from_str(&content).map_err(|e| PlanError::Parse(e.to_string()))
    } else {
        parse_plan(&content)
    }
}

/// Parse a plan document. Accepts a bare plan or one wrapped in `{"plan": ...}`.
pub fn parse_plan(raw: &str) -> Result<Plan, PlanError> {
    #[derive(serde::Deserialize)]
    struct Wrapped {
        plan: Plan,
    }

    match serde_json::from_str::<Plan>(raw) {
        Ok(plan) => return Ok(plan),
        Err(e) => debug!("Not a bare JSON plan: {}", e),
    }

    if let Ok(wrapped) = serde_json::from_str::<Wrapped>(raw) {
        return Ok(wrapped.plan);
    }

    serde_yaml::from_str::<Plan>(raw).map_err(|e| PlanError::Parse(e.to_string()))
}

/// Check that a plan can run, returning its execution groups
pub fn validate_plan(plan: &Plan) -> Result<ExecutionGroups, PlanError> {
    if !is_path_safe(&plan.id) {
        return Err(PlanError::InvalidId(plan.id.clone()));
    }
    if plan.steps.is_empty() {
        return Err(PlanError::EmptyPlan);
    }
    for step in &plan.steps {
        if let Some(retry) = &step.retry {
            retry.validate().map_err(|e| PlanError::InvalidRetry {
                step: step.id.clone(),
                message: e.to_string(),
            })?;
        }
    }
    resolve_execution_groups(&plan.steps)
}

/// Plan ids name the plan's state and report directories
fn is_path_safe(id: &str) -> bool {
    !id.is_empty() && id != "." && !id.contains("..") && !id.contains(['/', '\\'])
}
