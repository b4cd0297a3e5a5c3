//! Submission API: submit plans, query and steer them, resolve reviews

use crate::agent::AgentRegistry;
use crate::config::Config;
use crate::error::EngineError;
use crate::events::{EventBus, EventStream};
use crate::persistence::{record_transition_logged, NullPersistence, Persistence, StepTransition};
use crate::plan::{validate_plan, Plan, PlanStatus, StepStatus};
use crate::quality::{QualityGate, ReviewBoard, ReviewDecision, ReviewRequest, ReviewerFn};
use crate::runner::{
    publish_review_outcome, ExecutionSummary, PlanScheduler, PlanState, PlanTracker,
    StatusReport, StepExecutor,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, info, warn};

#[derive(Clone)]
struct PlanEntry {
    plan: Arc<Plan>,
    tracker: Arc<PlanTracker>,
}

pub struct EngineBuilder {
    config: Config,
    agents: AgentRegistry,
    persistence: Arc<dyn Persistence>,
    reviewer: Option<ReviewerFn>,
}

impl EngineBuilder {
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = persistence;
        self
    }

    /// Consult `reviewer` as soon as a review is requested
    pub fn reviewer(mut self, reviewer: ReviewerFn) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    pub fn build(self) -> Engine {
        let bus = EventBus::with_persistence(self.persistence.clone());
        let mut gate = QualityGate::new(self.config.quality.clone());
        if let Some(reviewer) = self.reviewer {
            gate = gate.with_reviewer(reviewer);
        }

        let executor = Arc::new(StepExecutor {
            agents: self.agents,
            gate: Arc::new(gate),
            bus: bus.clone(),
            retry: self.config.retry.clone(),
            step_timeout: Some(self.config.step_timeout()),
            review_timeout: self.config.review_timeout(),
        });
        let scheduler = Arc::new(PlanScheduler::new(
            executor.clone(),
            self.persistence.clone(),
            self.config.failure_policy,
        ));

        Engine {
            config: self.config,
            bus,
            executor,
            scheduler,
            persistence: self.persistence,
            plans: Mutex::new(HashMap::new()),
        }
    }
}

/// Runs submitted plans in the background and answers questions about them
pub struct Engine {
    config: Config,
    bus: EventBus,
    executor: Arc<StepExecutor>,
    scheduler: Arc<PlanScheduler>,
    persistence: Arc<dyn Persistence>,
    plans: Mutex<HashMap<String, PlanEntry>>,
}

impl Engine {
    pub fn builder(config: Config, agents: AgentRegistry) -> EngineBuilder {
        EngineBuilder {
            config,
            agents,
            persistence: Arc::new(NullPersistence),
            reviewer: None,
        }
    }

    pub fn new(config: Config, agents: AgentRegistry) -> Self {
        Self::builder(config, agents).build()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn reviews(&self) -> &ReviewBoard {
        self.executor.gate.reviews()
    }

    fn plans(&self) -> MutexGuard<'_, HashMap<String, PlanEntry>> {
        self.plans.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, plan_id: &str) -> Result<PlanEntry, EngineError> {
        self.plans()
            .get(plan_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownPlan(plan_id.to_string()))
    }

    /// Validate `plan` and start executing it in the background.
    ///
    /// Malformed plans (cycles, unknown dependencies, duplicate ids, no steps)
    /// are rejected here and never start.
    pub fn submit(&self, plan: Plan) -> Result<String, EngineError> {
        let groups = match validate_plan(&plan) {
            Ok(groups) => groups,
            Err(e) => {
                warn!("Rejected plan {}: {}", plan.id, e);
                return Err(e.into());
            }
        };
        let workers = plan
            .max_parallel
            .unwrap_or(self.config.max_workers)
            .max(1);

        let entry = {
            let mut plans = self.plans();
            if plans.contains_key(&plan.id) {
                return Err(EngineError::AlreadyRunning(plan.id.clone()));
            }
            let tracker = Arc::new(PlanTracker::new(PlanState::new(&plan, groups, workers)));
            let entry = PlanEntry {
                plan: Arc::new(plan),
                tracker,
            };
            plans.insert(entry.plan.id.clone(), entry.clone());
            entry
        };

        if let Err(e) = self.persistence.record_plan(&entry.plan) {
            warn!("Failed to persist plan {}: {}", entry.plan.id, e);
        }
        info!("Submitted plan {} ({})", entry.plan.id, entry.plan.title);

        let plan_id = entry.plan.id.clone();
        self.spawn_run(entry);
        Ok(plan_id)
    }

    fn spawn_run(&self, entry: PlanEntry) {
        entry.tracker.set_running(true);
        let scheduler = self.scheduler.clone();
        let bus = self.bus.clone();

        tokio::spawn(async move {
            let PlanEntry { plan, tracker } = entry;
            let plan_id = plan.id.clone();
            let run = tokio::spawn({
                let tracker = tracker.clone();
                async move { scheduler.run(plan, tracker).await }
            });
            if let Err(e) = run.await {
                error!("Scheduler for plan {} died: {}", plan_id, e);
                tracker.lock().status = PlanStatus::Failed;
                bus.plan_failed(&plan_id, &e.to_string());
                tracker.set_running(false);
            }
        });
    }

    /// Latest known state of a plan, including while retries are in flight
    pub fn get_status(&self, plan_id: &str) -> Result<StatusReport, EngineError> {
        Ok(self.entry(plan_id)?.tracker.lock().status_report())
    }

    /// Stop a plan from starting any more steps. Steps already running finish
    /// their current attempt; everything left is skipped and the plan pauses.
    pub fn cancel(&self, plan_id: &str) -> Result<(), EngineError> {
        let entry = self.entry(plan_id)?;
        if entry.tracker.is_running() {
            info!("Cancelling plan {}", plan_id);
            entry.tracker.request_cancel();
        }
        Ok(())
    }

    /// Re-run the skipped steps of a paused plan; succeeded steps are kept
    pub fn resume(&self, plan_id: &str) -> Result<(), EngineError> {
        let entry = self.entry(plan_id)?;
        if entry.tracker.is_running() {
            return Err(EngineError::AlreadyRunning(plan_id.to_string()));
        }

        let transitions = {
            let mut state = entry.tracker.lock();
            if state.status != PlanStatus::Paused {
                return Err(EngineError::NotPaused(plan_id.to_string()));
            }
            let mut transitions = Vec::new();
            for (step_id, step) in state.steps.iter_mut() {
                if step.status == StepStatus::Skipped {
                    step.status = StepStatus::Pending;
                    step.error = None;
                    transitions.push(StepTransition::new(
                        plan_id,
                        step_id,
                        StepStatus::Skipped,
                        StepStatus::Pending,
                        step.retry_count,
                        None,
                    ));
                }
            }
            state.current_group = 0;
            transitions
        };
        for transition in transitions {
            record_transition_logged(self.persistence.as_ref(), transition);
        }

        info!("Resuming plan {}", plan_id);
        entry.tracker.clear_cancel();
        self.spawn_run(entry);
        Ok(())
    }

    /// Register `client_id` and subscribe it to `plan_id`. Events recorded so
    /// far are replayed before live ones.
    pub fn subscribe(&self, plan_id: &str, client_id: &str) -> Result<EventStream, EngineError> {
        self.entry(plan_id)?;
        let stream = self.bus.register_client(client_id);
        self.bus.subscribe(client_id, plan_id)?;
        Ok(stream)
    }

    /// Apply a reviewer's decision to a pending review request.
    ///
    /// A step parked on the request moves to `succeeded` or `failed`; a step
    /// still waiting on the request picks the decision up itself.
    pub fn resolve_review(
        &self,
        request_id: &str,
        decision: ReviewDecision,
    ) -> Result<ReviewRequest, EngineError> {
        let request = self.executor.gate.complete_review(request_id, decision)?;
        self.bus.review_resolved(&request);

        let Ok(entry) = self.entry(&request.plan_id) else {
            return Ok(request);
        };
        if let Some(transition) = entry.tracker.apply_review(&request) {
            publish_review_outcome(&self.bus, &request.plan_id, &transition);
            record_transition_logged(self.persistence.as_ref(), transition);
        }

        if let Some(status) = entry.tracker.settle_after_review() {
            let summary = entry.tracker.lock().summary();
            info!(
                "Plan {} settled as {} after review",
                request.plan_id, status
            );
            match status {
                PlanStatus::Paused => self
                    .bus
                    .plan_paused(&request.plan_id, summary.steps_skipped),
                status => {
                    self.bus
                        .plan_completed(&request.plan_id, status.as_str(), summary.execution_time_ms)
                }
            }
        }
        Ok(request)
    }

    /// Wait for the current run of a plan to finish
    pub async fn wait(&self, plan_id: &str) -> Result<ExecutionSummary, EngineError> {
        let entry = self.entry(plan_id)?;
        entry.tracker.wait_idle().await;
        let summary = entry.tracker.lock().summary();
        Ok(summary)
    }

    /// Submit a plan and wait for it
    pub async fn run(&self, plan: Plan) -> Result<ExecutionSummary, EngineError> {
        let plan_id = self.submit(plan)?;
        self.wait(&plan_id).await
    }

    pub fn plan_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.plans().keys().cloned().collect();
        ids.sort();
        ids
    }
}
