use super::Agent;
use crate::error::AgentError;
use crate::plan::{Step, StepResult};
use crate::runner::StepContext;
use async_trait::async_trait;
use std::time::Duration;

/// Returns the step's action and parameters as payload with a fixed score.
///
/// A numeric `delay_ms` parameter makes the agent sleep first, which is useful
/// for exercising parallel groups and timeouts.
pub struct EchoAgent {
    name: String,
    quality_score: f64,
}

impl EchoAgent {
    pub fn new(name: impl Into<String>, quality_score: f64) -> Self {
        Self {
            name: name.into(),
            quality_score,
        }
    }
}

#[async_trait]
impl Agent for EchoAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute_step(
        &self,
        step: &Step,
        ctx: &mut StepContext,
    ) -> Result<StepResult, AgentError> {
        if let Some(delay) = step.parameters.get("delay_ms").and_then(|v| v.as_u64()) {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        ctx.report_progress(100.0, "echoed");

        let mut upstream: Vec<&String> = ctx.upstream.keys().collect();
        upstream.sort();

        let mut result = StepResult::success(self.quality_score)
            .with_payload("action", step.action.clone())
            .with_payload("parameters", step.parameters.clone())
            .with_payload(
                "upstream",
                upstream.into_iter().cloned().collect::<Vec<String>>(),
            );
        for dimension in &step.quality_dimensions {
            result = result.with_detail(dimension.clone(), self.quality_score);
        }
        Ok(result)
    }
}
