use crate::agent::AgentRegistry;
use crate::config::RetryConfig;
use crate::error::StepError;
use crate::events::EventBus;
use crate::plan::{Step, StepResult, StepStatus};
use crate::quality::{GateDecision, GateResult, QualityGate, ReviewDecision, ReviewStatus};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::context::StepContext;
use super::retry::RetryPolicy;

/// Final word on one step, reported back to the scheduler
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step_id: String,
    pub status: StepStatus,
    pub result: Option<StepResult>,
    pub error: Option<StepError>,
    pub retry_count: u32,
    pub review_id: Option<String>,
    pub elapsed: Duration,
}

impl StepOutcome {
    fn new(step_id: &str, status: StepStatus, elapsed: Duration) -> Self {
        Self {
            step_id: step_id.to_string(),
            status,
            result: None,
            error: None,
            retry_count: 0,
            review_id: None,
            elapsed,
        }
    }

    pub fn skipped(step_id: &str, error: StepError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(step_id, StepStatus::Skipped, Duration::ZERO)
        }
    }

    pub fn quality_score(&self) -> Option<f64> {
        self.result.as_ref().map(|r| r.quality_score)
    }
}

/// Runs single steps: agent lookup, retries, quality gate and review handoff
pub struct StepExecutor {
    pub agents: AgentRegistry,
    pub gate: Arc<QualityGate>,
    pub bus: EventBus,
    pub retry: RetryConfig,
    pub step_timeout: Option<Duration>,
    pub review_timeout: Option<Duration>,
}

impl StepExecutor {
    pub async fn run_step(&self, step: Arc<Step>, mut ctx: StepContext) -> StepOutcome {
        let start = Instant::now();
        let plan_id = ctx.plan_id.clone();
        self.bus.step_started(&plan_id, &step.id, &step.agent);

        let Some(agent) = self.agents.get(&step.agent) else {
            let error = StepError::AgentNotFound(step.agent.clone());
            warn!("Step {} failed: {}", step.id, error);
            self.bus.step_failed(&plan_id, &step.id, &error.to_string(), 0);
            return StepOutcome {
                error: Some(error),
                ..StepOutcome::new(&step.id, StepStatus::Failed, start.elapsed())
            };
        };

        let mut policy = RetryPolicy::new(step.retry.clone().unwrap_or_else(|| self.retry.clone()));
        let attempt_timeout = step
            .timeout_sec
            .map(Duration::from_secs)
            .or(self.step_timeout)
            .filter(|t| !t.is_zero());
        if let Some(limit) = attempt_timeout {
            policy = policy.with_timeout(limit);
        }

        let execution_budget = step.max_retries.unwrap_or(policy.config().max_retries);
        let gate_budget = step
            .max_retries
            .unwrap_or(self.gate.policy().max_retries);
        let mut retries_used = 0u32;

        loop {
            let attempts_before = ctx.retry.attempt;
            let remaining = execution_budget.saturating_sub(retries_used);
            let call_agent = agent.clone();
            let call_step = step.clone();
            let executed = policy
                .execute_with_retry(remaining, &mut ctx, move |ctx| {
                    let agent = call_agent.clone();
                    let step = call_step.clone();
                    Box::pin(async move {
                        agent
                            .execute_step(&step, ctx)
                            .await
                            .map_err(StepError::from)
                    })
                })
                .await;

            let mut result = match executed {
                Ok(result) => result,
                Err(error) => {
                    let attempts = ctx.retry.attempt - attempts_before;
                    retries_used += attempts.saturating_sub(1);
                    self.bus
                        .step_failed(&plan_id, &step.id, &error.to_string(), retries_used);
                    return StepOutcome {
                        error: Some(error),
                        retry_count: retries_used,
                        ..StepOutcome::new(&step.id, StepStatus::Failed, start.elapsed())
                    };
                }
            };

            retries_used += result.retry_count;
            result.retry_count = retries_used;
            result.retry_successful = retries_used > 0;

            let gate = self
                .gate
                .validate_step(&step, gate_budget, &result, retries_used);
            self.bus.quality_check(&plan_id, &step.id, &gate);

            match gate.decision {
                GateDecision::Approved => {
                    return self.succeeded(&plan_id, &step, result, start);
                }
                GateDecision::RetrySuggested => {
                    retries_used += 1;
                    let delay = policy.calculate_delay(retries_used);
                    info!(
                        "Quality gate asked to retry step {} (score {:.2}), retrying in {:?}",
                        step.id, gate.quality_score, delay
                    );
                    self.bus.step_retrying(
                        &plan_id,
                        &step.id,
                        ctx.retry.attempt + 1,
                        delay.as_millis() as u64,
                        &gate.reasons.join("; "),
                    );
                    sleep(delay).await;
                    ctx.retry.total_delay_ms += delay.as_millis() as u64;
                }
                GateDecision::Rejected => {
                    let error = StepError::QualityRejected {
                        score: gate.quality_score,
                        reasons: gate.reasons.clone(),
                    };
                    return self.failed(&plan_id, &step, Some(result), error, start);
                }
                GateDecision::ReviewRequired => {
                    return self.await_review(&ctx, &step, result, gate, start).await;
                }
            }
        }
    }

    /// Hand the result to a reviewer. With a review timeout the step waits
    /// for the decision; otherwise, or when the wait runs out, the step is
    /// parked as `review_required`.
    async fn await_review(
        &self,
        ctx: &StepContext,
        step: &Step,
        result: StepResult,
        gate: GateResult,
        start: Instant,
    ) -> StepOutcome {
        let plan_id = ctx.plan_id.as_str();
        let mut context = Map::new();
        context.insert("agent".to_string(), Value::from(step.agent.clone()));
        context.insert("action".to_string(), Value::from(step.action.clone()));
        context.insert("attempt".to_string(), Value::from(ctx.retry.attempt));
        context.insert("payload".to_string(), Value::Object(result.payload.clone()));

        let mut pending = self.gate.request_review(plan_id, &step.id, gate, context);
        self.bus.review_requested(&pending.request);

        // The inline reviewer may already have answered
        if pending.request.status != ReviewStatus::Pending {
            self.bus.review_resolved(&pending.request);
            let decision = ReviewDecision {
                approved: pending.request.status == ReviewStatus::Approved,
                reviewer: pending.request.reviewer.clone(),
                notes: pending.request.notes.clone(),
            };
            return self.apply_review(plan_id, step, result, decision, start);
        }

        let request_id = pending.request.id.clone();
        let decision = match self.review_timeout {
            Some(limit) => {
                debug!("Step {} waiting up to {:?} for review", step.id, limit);
                match timeout(limit, &mut pending.decision).await {
                    Ok(Ok(decision)) => Some(decision),
                    Ok(Err(_)) => None,
                    Err(_) => match self.gate.reviews().escalate(&request_id) {
                        Ok(_) => {
                            warn!("Review {} for step {} timed out", request_id, step.id);
                            None
                        }
                        // Resolved just as the wait ran out
                        Err(_) => pending.decision.try_recv().ok(),
                    },
                }
            }
            None => pending.decision.try_recv().ok(),
        };

        match decision {
            Some(decision) => self.apply_review(plan_id, step, result, decision, start),
            None => {
                info!("Step {} parked for review {}", step.id, request_id);
                StepOutcome {
                    retry_count: result.retry_count,
                    result: Some(result),
                    error: Some(StepError::ReviewPending {
                        request_id: request_id.clone(),
                    }),
                    review_id: Some(request_id),
                    ..StepOutcome::new(&step.id, StepStatus::ReviewRequired, start.elapsed())
                }
            }
        }
    }

    fn apply_review(
        &self,
        plan_id: &str,
        step: &Step,
        result: StepResult,
        decision: ReviewDecision,
        start: Instant,
    ) -> StepOutcome {
        if decision.approved {
            self.succeeded(plan_id, step, result, start)
        } else {
            let error = StepError::QualityRejected {
                score: result.quality_score,
                reasons: vec![decision.notes.unwrap_or_else(|| {
                    format!(
                        "rejected by {}",
                        decision.reviewer.as_deref().unwrap_or("reviewer")
                    )
                })],
            };
            self.failed(plan_id, step, Some(result), error, start)
        }
    }

    fn succeeded(
        &self,
        plan_id: &str,
        step: &Step,
        result: StepResult,
        start: Instant,
    ) -> StepOutcome {
        let elapsed = start.elapsed();
        self.bus.step_completed(
            plan_id,
            &step.id,
            result.quality_score,
            result.retry_count,
            elapsed.as_millis() as u64,
        );
        StepOutcome {
            retry_count: result.retry_count,
            result: Some(result),
            ..StepOutcome::new(&step.id, StepStatus::Succeeded, elapsed)
        }
    }

    fn failed(
        &self,
        plan_id: &str,
        step: &Step,
        result: Option<StepResult>,
        error: StepError,
        start: Instant,
    ) -> StepOutcome {
        let retry_count = result.as_ref().map(|r| r.retry_count).unwrap_or_default();
        warn!("Step {} failed: {}", step.id, error);
        self.bus
            .step_failed(plan_id, &step.id, &error.to_string(), retry_count);
        StepOutcome {
            result,
            error: Some(error),
            retry_count,
            ..StepOutcome::new(&step.id, StepStatus::Failed, start.elapsed())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::FnAgent;
    use crate::config::QualityPolicy;
    use crate::error::AgentError;
    use crate::events::EventType;
    use crate::quality::{ReviewRequest, ReviewerFn};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn executor(agents: AgentRegistry, policy: QualityPolicy) -> StepExecutor {
        StepExecutor {
            agents,
            gate: Arc::new(QualityGate::new(policy)),
            bus: EventBus::new(),
            retry: RetryConfig {
                base_delay: 0.001,
                max_delay: 0.005,
                jitter: false,
                max_retries: 2,
                ..RetryConfig::default()
            },
            step_timeout: None,
            review_timeout: None,
        }
    }

    fn scoring(score: f64) -> AgentRegistry {
        let mut agents = AgentRegistry::new();
        agents.register(FnAgent::new("scorer", move |_, _| {
            Ok(StepResult::success(score))
        }));
        agents
    }

    fn event_types(bus: &EventBus) -> Vec<EventType> {
        bus.history("p").iter().map(|e| e.event_type).collect()
    }

    #[tokio::test]
    async fn test_unknown_agent_fails_without_retry() {
        let exec = executor(AgentRegistry::new(), QualityPolicy::default());
        let outcome = exec
            .run_step(Arc::new(Step::new("s", "ghost")), StepContext::new("p", "s"))
            .await;
        assert_eq!(outcome.status, StepStatus::Failed);
        assert_eq!(
            outcome.error,
            Some(StepError::AgentNotFound("ghost".to_string()))
        );
        assert_eq!(
            event_types(&exec.bus),
            vec![EventType::StepStarted, EventType::StepFailed]
        );
    }

    #[tokio::test]
    async fn test_high_score_succeeds() {
        let exec = executor(scoring(0.95), QualityPolicy::default());
        let outcome = exec
            .run_step(Arc::new(Step::new("s", "scorer")), StepContext::new("p", "s"))
            .await;
        assert_eq!(outcome.status, StepStatus::Succeeded);
        assert_eq!(outcome.quality_score(), Some(0.95));
        assert_eq!(
            event_types(&exec.bus),
            vec![
                EventType::StepStarted,
                EventType::QualityCheck,
                EventType::StepCompleted
            ]
        );
    }

    #[tokio::test]
    async fn test_low_score_retried_then_rejected() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut agents = AgentRegistry::new();
        agents.register(FnAgent::new("weak", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(StepResult::success(0.3))
        }));
        let exec = executor(agents, QualityPolicy::default());

        let step = Step::new("s", "weak").with_max_retries(2);
        let outcome = exec
            .run_step(Arc::new(step), StepContext::new("p", "s"))
            .await;

        assert_eq!(outcome.status, StepStatus::Failed);
        assert!(matches!(
            outcome.error,
            Some(StepError::QualityRejected { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.retry_count, 2);
    }

    #[tokio::test]
    async fn test_gate_rejection_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut agents = AgentRegistry::new();
        agents.register(FnAgent::new("unsourced", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(StepResult::success(0.95))
        }));
        let exec = executor(agents, QualityPolicy::default());

        let step = Step::new("s", "unsourced")
            .with_quality_dimensions(&["sources"])
            .with_max_retries(2);
        let outcome = exec
            .run_step(Arc::new(step), StepContext::new("p", "s"))
            .await;

        assert_eq!(outcome.status, StepStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.retry_count, 0);
        match outcome.error {
            Some(StepError::QualityRejected { reasons, .. }) => {
                assert!(reasons.iter().any(|r| r.contains("sources (missing)")));
            }
            other => panic!("expected a quality rejection, got {:?}", other),
        }
        assert!(!event_types(&exec.bus).contains(&EventType::StepProgress));
    }

    #[tokio::test]
    async fn test_agent_errors_use_retry_budget() {
        let mut agents = AgentRegistry::new();
        agents.register(FnAgent::new("flaky", |_, ctx| {
            if ctx.retry.attempt < 3 {
                Err(AgentError::Failed("upstream 503".to_string()))
            } else {
                Ok(StepResult::success(0.92))
            }
        }));
        let exec = executor(agents, QualityPolicy::default());
        let outcome = exec
            .run_step(Arc::new(Step::new("s", "flaky")), StepContext::new("p", "s"))
            .await;

        assert_eq!(outcome.status, StepStatus::Succeeded);
        assert_eq!(outcome.retry_count, 2);
        assert!(outcome.result.unwrap().retry_successful);
    }

    #[tokio::test]
    async fn test_ambiguous_score_parks_step() {
        let exec = executor(scoring(0.75), QualityPolicy::default());
        let outcome = exec
            .run_step(Arc::new(Step::new("s", "scorer")), StepContext::new("p", "s"))
            .await;

        assert_eq!(outcome.status, StepStatus::ReviewRequired);
        let review_id = outcome.review_id.unwrap();
        assert!(outcome.error.unwrap().is_review_pending());
        assert_eq!(exec.gate.reviews().pending()[0].id, review_id);
        assert!(event_types(&exec.bus).contains(&EventType::ReviewRequested));
    }

    #[tokio::test]
    async fn test_waits_for_review_decision() {
        let mut exec = executor(scoring(0.75), QualityPolicy::default());
        exec.review_timeout = Some(Duration::from_secs(5));
        let exec = Arc::new(exec);

        let reviewer = {
            let exec = exec.clone();
            tokio::spawn(async move {
                loop {
                    if let Some(request) = exec.gate.reviews().pending().first() {
                        exec.gate
                            .complete_review(&request.id, ReviewDecision::approve("ana"))
                            .unwrap();
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        let outcome = exec
            .run_step(Arc::new(Step::new("s", "scorer")), StepContext::new("p", "s"))
            .await;
        reviewer.await.unwrap();
        assert_eq!(outcome.status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_review_timeout_escalates() {
        let mut exec = executor(scoring(0.75), QualityPolicy::default());
        exec.review_timeout = Some(Duration::from_millis(10));
        let outcome = exec
            .run_step(Arc::new(Step::new("s", "scorer")), StepContext::new("p", "s"))
            .await;

        assert_eq!(outcome.status, StepStatus::ReviewRequired);
        let request = exec.gate.reviews().get(&outcome.review_id.unwrap()).unwrap();
        assert_eq!(request.status, ReviewStatus::Escalated);
    }

    #[tokio::test]
    async fn test_inline_reviewer_rejects() {
        let mut exec = executor(scoring(0.75), QualityPolicy::default());
        let reviewer: ReviewerFn = Arc::new(|_: &ReviewRequest| {
            Some(ReviewDecision::reject("bot", "sources too thin"))
        });
        exec.gate = Arc::new(QualityGate::new(QualityPolicy::default()).with_reviewer(reviewer));
        let outcome = exec
            .run_step(Arc::new(Step::new("s", "scorer")), StepContext::new("p", "s"))
            .await;

        assert_eq!(outcome.status, StepStatus::Failed);
        assert_eq!(
            outcome.error,
            Some(StepError::QualityRejected {
                score: 0.75,
                reasons: vec!["sources too thin".to_string()]
            })
        );
    }
}
