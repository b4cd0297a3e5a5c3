use crate::config::FailurePolicy;
use crate::error::StepError;
use crate::events::EventBus;
use crate::persistence::{record_transition_logged, Persistence, StepTransition};
use crate::plan::{transitive_dependents, Plan, PlanStatus, Step, StepResult, StepStatus};
use crate::quality::ReviewRequest;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use super::context::StepContext;
use super::executor::{StepExecutor, StepOutcome};
use super::state::{ExecutionSummary, PlanTracker, StepState};

/// What a step worker reports back to the scheduler
#[derive(Debug)]
pub enum WorkerMessage {
    Started(String),
    Finished(StepOutcome),
}

/// Drives one plan through its execution groups.
///
/// The scheduler is the only writer of step states during a run. Workers run
/// steps and report over a channel; the scheduler applies each report to its
/// own table and mirrors it into the shared [`PlanTracker`].
pub struct PlanScheduler {
    executor: Arc<StepExecutor>,
    persistence: Arc<dyn Persistence>,
    failure_policy: FailurePolicy,
}

/// Per-run bookkeeping owned by the scheduler task
struct RunState {
    table: HashMap<String, StepStatus>,
    results: HashMap<String, StepResult>,
}

impl PlanScheduler {
    pub fn new(
        executor: Arc<StepExecutor>,
        persistence: Arc<dyn Persistence>,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            executor,
            persistence,
            failure_policy,
        }
    }

    fn bus(&self) -> &EventBus {
        &self.executor.bus
    }

    /// Run every group of `plan` that still has work and settle the plan.
    ///
    /// Steps already succeeded (from an earlier run) are not re-executed.
    /// The caller marks the tracker running before spawning this.
    pub async fn run(&self, plan: Arc<Plan>, tracker: Arc<PlanTracker>) -> ExecutionSummary {
        let start = Instant::now();
        let (groups, workers, mut run) = {
            let mut state = tracker.lock();
            state.status = PlanStatus::Running;
            state.started_at.get_or_insert_with(Utc::now);
            state.finished_at = None;
            let run = RunState {
                table: state
                    .steps
                    .iter()
                    .map(|(id, s)| (id.clone(), s.status))
                    .collect(),
                results: state
                    .steps
                    .iter()
                    .filter(|(_, s)| s.status == StepStatus::Succeeded)
                    .filter_map(|(id, s)| s.result.clone().map(|r| (id.clone(), r)))
                    .collect(),
            };
            (state.groups.clone(), state.max_workers.max(1), run)
        };

        info!(
            "Running plan {} ({} steps in {} groups, {} workers)",
            plan.id,
            plan.steps.len(),
            groups.len(),
            workers
        );
        self.bus()
            .plan_started(&plan.id, &plan.title, plan.steps.len(), groups.len());

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut halted = false;
        let mut cancelled = false;

        for (index, group) in groups.iter().enumerate() {
            if tracker.is_cancelled() {
                cancelled = true;
                break;
            }
            tracker.lock().current_group = index;
            self.sync_reviews(&tracker, &mut run);

            let ready = self.ready_steps(&plan, group, &tracker, &mut run);
            if ready.is_empty() {
                debug!("Group {} of plan {} has nothing to run", index + 1, plan.id);
                continue;
            }
            debug!(
                "Starting group {}/{} of plan {}: {:?}",
                index + 1,
                groups.len(),
                plan.id,
                ready.iter().map(|s| s.id.as_str()).collect::<Vec<_>>()
            );

            self.run_group(&plan, ready, &semaphore, &tracker, &mut run)
                .await;

            for step_id in group {
                if run.table.get(step_id) != Some(&StepStatus::Failed) {
                    continue;
                }
                if self.failure_policy == FailurePolicy::Halt {
                    halted = true;
                }
                if self.failure_policy != FailurePolicy::Continue {
                    let reason = format!("dependency '{}' failed", step_id);
                    for dependent in transitive_dependents(&plan.steps, step_id) {
                        self.skip(&plan.id, &dependent, &reason, &tracker, &mut run);
                    }
                }
            }

            self.publish_metrics(&plan.id, &tracker);

            if halted {
                warn!(
                    "Plan {} halted after group {} due to failed steps",
                    plan.id,
                    index + 1
                );
                break;
            }
        }

        if tracker.is_cancelled() {
            cancelled = true;
        }

        let leftover_reason = if cancelled {
            "cancelled"
        } else if halted {
            "plan halted"
        } else {
            ""
        };
        if !leftover_reason.is_empty() {
            let pending: Vec<String> = plan
                .steps
                .iter()
                .filter(|s| run.table.get(&s.id) == Some(&StepStatus::Pending))
                .map(|s| s.id.clone())
                .collect();
            for step_id in pending {
                self.skip(&plan.id, &step_id, leftover_reason, &tracker, &mut run);
            }
        }

        let summary = {
            let mut state = tracker.lock();
            state.status = if cancelled {
                PlanStatus::Paused
            } else if halted {
                PlanStatus::Failed
            } else {
                state.settled_status()
            };
            state.execution_time_ms += start.elapsed().as_millis() as u64;
            if state.status != PlanStatus::Paused {
                state.finished_at = Some(Utc::now());
            }
            state.summary()
        };

        match summary.status {
            PlanStatus::Failed => {
                error!("Plan {} failed", plan.id);
                self.bus().plan_failed(&plan.id, "halted after step failure");
            }
            PlanStatus::Paused => {
                info!("Plan {} paused", plan.id);
                self.bus().plan_paused(&plan.id, summary.steps_skipped);
            }
            status => {
                info!(
                    "Plan {} finished: {} ({}/{} steps succeeded)",
                    plan.id,
                    status,
                    summary.steps_succeeded,
                    plan.steps.len()
                );
                self.bus()
                    .plan_completed(&plan.id, status.as_str(), summary.execution_time_ms);
            }
        }

        tracker.set_running(false);
        summary
    }

    /// Steps of `group` that should run now. Steps whose dependencies did not
    /// succeed are skipped unless the plan continues past failures.
    fn ready_steps(
        &self,
        plan: &Plan,
        group: &[String],
        tracker: &PlanTracker,
        run: &mut RunState,
    ) -> Vec<Arc<Step>> {
        let mut ready = Vec::new();
        for step_id in group {
            if run.table.get(step_id) != Some(&StepStatus::Pending) {
                continue;
            }
            let Some(step) = plan.step(step_id) else {
                continue;
            };

            if self.failure_policy != FailurePolicy::Continue {
                let blocker = step.dependencies.iter().find_map(|d| {
                    let status = run.table.get(d).copied().unwrap_or_default();
                    (status != StepStatus::Succeeded).then_some((d, status))
                });
                if let Some((dependency, status)) = blocker {
                    let reason = format!("dependency '{}' is {}", dependency, status);
                    self.skip(&plan.id, step_id, &reason, tracker, run);
                    continue;
                }
            }
            ready.push(Arc::new(step.clone()));
        }
        ready
    }

    async fn run_group(
        &self,
        plan: &Plan,
        steps: Vec<Arc<Step>>,
        semaphore: &Arc<Semaphore>,
        tracker: &Arc<PlanTracker>,
        run: &mut RunState,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut workers = FuturesUnordered::new();

        for step in &steps {
            let upstream = step
                .dependencies
                .iter()
                .filter_map(|d| run.results.get(d).map(|r| (d.clone(), r.clone())))
                .collect();
            let ctx = StepContext::new(&plan.id, &step.id)
                .with_upstream(upstream)
                .with_extensions(plan.veritas_extensions.clone())
                .with_events(self.bus().clone());

            let step = step.clone();
            let semaphore = semaphore.clone();
            let executor = self.executor.clone();
            let tracker = tracker.clone();
            let tx = tx.clone();

            workers.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        let _ = tx.send(WorkerMessage::Finished(StepOutcome::skipped(
                            &step.id,
                            StepError::Cancelled,
                        )));
                        return;
                    }
                };
                // Cancellation only stops steps that have not started
                if tracker.is_cancelled() {
                    let _ = tx.send(WorkerMessage::Finished(StepOutcome::skipped(
                        &step.id,
                        StepError::Cancelled,
                    )));
                    return;
                }
                let _ = tx.send(WorkerMessage::Started(step.id.clone()));
                let outcome = executor.run_step(step, ctx).await;
                let _ = tx.send(WorkerMessage::Finished(outcome));
            }));
        }
        drop(tx);

        // Group barrier: the channel closes once every worker is gone
        while let Some(message) = rx.recv().await {
            match message {
                WorkerMessage::Started(step_id) => {
                    self.transition(&plan.id, &step_id, StepStatus::Running, tracker, run, |s| {
                        s.started_at = Some(Utc::now());
                    });
                }
                WorkerMessage::Finished(outcome) => {
                    self.finish_step(&plan.id, outcome, tracker, run);
                }
            }
        }

        while let Some(joined) = workers.next().await {
            if let Err(e) = joined {
                warn!("Step worker panicked: {}", e);
            }
        }

        for step in &steps {
            let status = run.table.get(&step.id).copied().unwrap_or_default();
            if !status.is_terminal() {
                let message = "step worker exited without reporting";
                self.transition(&plan.id, &step.id, StepStatus::Failed, tracker, run, |s| {
                    s.error = Some(message.to_string());
                    s.finished_at = Some(Utc::now());
                });
                self.bus().step_failed(&plan.id, &step.id, message, 0);
            }
        }
    }

    fn finish_step(
        &self,
        plan_id: &str,
        outcome: StepOutcome,
        tracker: &PlanTracker,
        run: &mut RunState,
    ) {
        if outcome.status == StepStatus::Skipped {
            let reason = outcome
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "skipped".to_string());
            self.skip(plan_id, &outcome.step_id, &reason, tracker, run);
            return;
        }

        if let (StepStatus::Succeeded, Some(result)) = (outcome.status, &outcome.result) {
            run.results.insert(outcome.step_id.clone(), result.clone());
        }

        let score = outcome.quality_score();
        let error = outcome
            .error
            .as_ref()
            .filter(|e| !e.is_review_pending())
            .map(|e| e.to_string());
        let review_id = outcome.review_id.clone();
        let result = outcome.result.clone();
        let retry_count = outcome.retry_count;

        self.transition(plan_id, &outcome.step_id, outcome.status, tracker, run, |s| {
            s.retry_count = retry_count;
            s.quality_score = score;
            s.error = error;
            s.review_id = review_id;
            s.result = result;
            s.finished_at = Some(Utc::now());
        });

        // A reviewer may have answered before the parked state was recorded
        if let Some(review_id) = &outcome.review_id {
            if let Some(request) = self.executor.gate.reviews().get(review_id) {
                self.apply_review(plan_id, &request, tracker, run);
            }
        }
    }

    fn apply_review(
        &self,
        plan_id: &str,
        request: &ReviewRequest,
        tracker: &PlanTracker,
        run: &mut RunState,
    ) {
        let Some(transition) = tracker.apply_review(request) else {
            return;
        };
        run.table
            .insert(transition.step_id.clone(), transition.new_state);
        if transition.new_state == StepStatus::Succeeded {
            if let Some(result) = tracker
                .lock()
                .steps
                .get(&transition.step_id)
                .and_then(|s| s.result.clone())
            {
                run.results.insert(transition.step_id.clone(), result);
            }
        }
        publish_review_outcome(self.bus(), plan_id, &transition);
        record_transition_logged(self.persistence.as_ref(), transition);
    }

    /// Pick up reviews resolved elsewhere since the last group
    fn sync_reviews(&self, tracker: &PlanTracker, run: &mut RunState) {
        let state = tracker.lock();
        for (step_id, status) in run.table.iter_mut() {
            if *status != StepStatus::ReviewRequired {
                continue;
            }
            if let Some(step) = state.steps.get(step_id) {
                if step.status != StepStatus::ReviewRequired {
                    *status = step.status;
                    if let Some(result) = step.result.clone() {
                        run.results.insert(step_id.clone(), result);
                    }
                }
            }
        }
    }

    fn skip(
        &self,
        plan_id: &str,
        step_id: &str,
        reason: &str,
        tracker: &PlanTracker,
        run: &mut RunState,
    ) {
        if run.table.get(step_id) != Some(&StepStatus::Pending) {
            return;
        }
        debug!("Skipping step {}: {}", step_id, reason);
        self.transition(plan_id, step_id, StepStatus::Skipped, tracker, run, |s| {
            s.error = Some(reason.to_string());
        });
        self.bus().step_skipped(plan_id, step_id, reason);
    }

    fn transition(
        &self,
        plan_id: &str,
        step_id: &str,
        next: StepStatus,
        tracker: &PlanTracker,
        run: &mut RunState,
        update: impl FnOnce(&mut StepState),
    ) {
        let current = run.table.get(step_id).copied().unwrap_or_default();
        if !current.can_transition_to(next) {
            warn!(
                "Ignoring invalid transition {} -> {} for step {}",
                current, next, step_id
            );
            return;
        }
        run.table.insert(step_id.to_string(), next);

        let transition = {
            let mut state = tracker.lock();
            let step = state.steps.entry(step_id.to_string()).or_default();
            step.status = next;
            update(step);
            StepTransition::new(
                plan_id,
                step_id,
                current,
                next,
                step.retry_count,
                step.quality_score,
            )
        };
        record_transition_logged(self.persistence.as_ref(), transition);
    }

    fn publish_metrics(&self, plan_id: &str, tracker: &PlanTracker) {
        let snapshot = tracker.snapshot();
        let mut metrics = Map::new();
        metrics.insert(
            "progress_percentage".to_string(),
            Value::from(snapshot.progress_percentage()),
        );
        metrics.insert(
            "steps_executed".to_string(),
            Value::from(snapshot.steps_executed()),
        );
        metrics.insert(
            "steps_succeeded".to_string(),
            Value::from(snapshot.count(StepStatus::Succeeded)),
        );
        metrics.insert(
            "steps_failed".to_string(),
            Value::from(snapshot.count(StepStatus::Failed)),
        );
        metrics.insert(
            "mean_quality".to_string(),
            Value::from(snapshot.mean_quality()),
        );
        self.bus().metrics_update(plan_id, metrics);
    }
}

/// Publish the step event matching a review-driven transition
pub fn publish_review_outcome(bus: &EventBus, plan_id: &str, transition: &StepTransition) {
    match transition.new_state {
        StepStatus::Succeeded => bus.step_completed(
            plan_id,
            &transition.step_id,
            transition.quality_score.unwrap_or_default(),
            transition.retry_count,
            0,
        ),
        _ => bus.step_failed(
            plan_id,
            &transition.step_id,
            "rejected in review",
            transition.retry_count,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentRegistry, EchoAgent, FnAgent};
    use crate::config::{QualityPolicy, RetryConfig};
    use crate::error::AgentError;
    use crate::persistence::MemoryPersistence;
    use crate::plan::resolve_execution_groups;
    use crate::quality::QualityGate;
    use crate::runner::state::PlanState;
    use std::time::Duration;

    fn scheduler(agents: AgentRegistry, policy: FailurePolicy) -> (PlanScheduler, Arc<MemoryPersistence>) {
        let executor = StepExecutor {
            agents,
            gate: Arc::new(QualityGate::new(QualityPolicy::default())),
            bus: EventBus::new(),
            retry: RetryConfig {
                base_delay: 0.001,
                max_delay: 0.005,
                jitter: false,
                max_retries: 0,
                ..RetryConfig::default()
            },
            step_timeout: Some(Duration::from_secs(5)),
            review_timeout: None,
        };
        let persistence = Arc::new(MemoryPersistence::default());
        (
            PlanScheduler::new(Arc::new(executor), persistence.clone(), policy),
            persistence,
        )
    }

    fn agents() -> AgentRegistry {
        let mut agents = AgentRegistry::new();
        agents.register(EchoAgent::new("echo", 1.0));
        agents.register(FnAgent::new("broken", |_, _| {
            Err(AgentError::Failed("no data".to_string()))
        }));
        agents
    }

    fn tracker_for(plan: &Plan, workers: usize) -> Arc<PlanTracker> {
        let groups = resolve_execution_groups(&plan.steps).unwrap();
        let tracker = Arc::new(PlanTracker::new(PlanState::new(plan, groups, workers)));
        tracker.set_running(true);
        tracker
    }

    fn chain_plan(failing: &str) -> Plan {
        let agent = |id: &str| if id == failing { "broken" } else { "echo" };
        Plan::new(
            "chain",
            vec![
                Step::new("a", agent("a")),
                Step::new("b", agent("b")).with_dependency("a"),
                Step::new("c", agent("c")).with_dependency("b"),
                Step::new("x", agent("x")),
            ],
        )
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let (scheduler, persistence) = scheduler(agents(), FailurePolicy::Halt);
        let plan = Arc::new(chain_plan(""));
        let tracker = tracker_for(&plan, 2);

        let summary = scheduler.run(plan.clone(), tracker.clone()).await;
        assert_eq!(summary.status, PlanStatus::Completed);
        assert_eq!(summary.steps_executed, 4);
        assert_eq!(summary.total_quality_score, 1.0);
        assert!(!tracker.is_running());

        // pending -> running -> succeeded for every step
        assert_eq!(persistence.transitions().len(), 8);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_and_halts() {
        let (scheduler, _) = scheduler(agents(), FailurePolicy::Halt);
        let plan = Arc::new(chain_plan("a"));
        let summary = scheduler.run(plan.clone(), tracker_for(&plan, 2)).await;

        assert_eq!(summary.status, PlanStatus::Failed);
        assert_eq!(summary.results["a"].status, StepStatus::Failed);
        assert_eq!(summary.results["b"].status, StepStatus::Skipped);
        assert_eq!(summary.results["c"].status, StepStatus::Skipped);
        // Ran in the same group as the failure
        assert_eq!(summary.results["x"].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_skip_dependents_policy_is_partial() {
        let (scheduler, _) = scheduler(agents(), FailurePolicy::SkipDependents);
        let plan = Arc::new(chain_plan("b"));
        let summary = scheduler.run(plan.clone(), tracker_for(&plan, 2)).await;

        assert_eq!(summary.status, PlanStatus::Partial);
        assert_eq!(summary.results["c"].status, StepStatus::Skipped);
        assert_eq!(summary.steps_executed, 3);
    }

    #[tokio::test]
    async fn test_continue_policy_runs_dependents() {
        let (scheduler, _) = scheduler(agents(), FailurePolicy::Continue);
        let plan = Arc::new(chain_plan("a"));
        let summary = scheduler.run(plan.clone(), tracker_for(&plan, 2)).await;

        assert_eq!(summary.status, PlanStatus::Partial);
        assert_eq!(summary.results["b"].status, StepStatus::Succeeded);
        assert_eq!(summary.results["c"].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_upstream_results_reach_dependents() {
        let mut agents = agents();
        agents.register(FnAgent::new("reader", |_, ctx| {
            let upstream = ctx.upstream.get("a").map(|r| r.quality_score);
            Ok(StepResult::success(0.95).with_payload("upstream_score", upstream))
        }));
        let (scheduler, _) = scheduler(agents, FailurePolicy::Halt);
        let plan = Arc::new(Plan::new(
            "upstream",
            vec![
                Step::new("a", "echo"),
                Step::new("b", "reader").with_dependency("a"),
            ],
        ));
        let tracker = tracker_for(&plan, 1);
        scheduler.run(plan.clone(), tracker.clone()).await;

        let state = tracker.snapshot();
        let result = state.steps["b"].result.clone().unwrap();
        assert_eq!(result.payload["upstream_score"], 1.0);
    }

    #[tokio::test]
    async fn test_cancel_before_start_skips_everything() {
        let (scheduler, _) = scheduler(agents(), FailurePolicy::Halt);
        let plan = Arc::new(chain_plan(""));
        let tracker = tracker_for(&plan, 2);
        tracker.request_cancel();

        let summary = scheduler.run(plan.clone(), tracker).await;
        assert_eq!(summary.status, PlanStatus::Paused);
        assert_eq!(summary.steps_skipped, 4);
        assert_eq!(summary.steps_executed, 0);
    }
}
