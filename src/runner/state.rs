//! Live plan state shared between the scheduler and status readers

use crate::persistence::StepTransition;
use crate::plan::{ExecutionGroups, Plan, PlanStatus, StepResult, StepStatus};
use crate::quality::{ReviewRequest, ReviewStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<StepResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Parallel,
    Sequential,
}

/// Snapshot of one plan's execution
#[derive(Debug, Clone, Serialize)]
pub struct PlanState {
    pub plan_id: String,
    pub title: String,
    pub status: PlanStatus,
    pub groups: ExecutionGroups,
    /// Index of the group being executed, or the next one to run
    pub current_group: usize,
    pub max_workers: usize,
    pub steps: HashMap<String, StepState>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Accumulated over every run of the plan, resumes included
    pub execution_time_ms: u64,
}

impl PlanState {
    pub fn new(plan: &Plan, groups: ExecutionGroups, max_workers: usize) -> Self {
        Self {
            plan_id: plan.id.clone(),
            title: plan.title.clone(),
            status: PlanStatus::Pending,
            groups,
            current_group: 0,
            max_workers,
            steps: plan
                .steps
                .iter()
                .map(|s| (s.id.clone(), StepState::default()))
                .collect(),
            started_at: None,
            finished_at: None,
            execution_time_ms: 0,
        }
    }

    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.steps.get(step_id).map(|s| s.status)
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.values().filter(|s| s.status == status).count()
    }

    pub fn steps_executed(&self) -> usize {
        self.steps
            .values()
            .filter(|s| s.status.was_executed())
            .count()
    }

    /// Share of steps in a terminal state, 0 to 100
    pub fn progress_percentage(&self) -> f64 {
        if self.steps.is_empty() {
            return 100.0;
        }
        let done = self
            .steps
            .values()
            .filter(|s| s.status.is_terminal())
            .count();
        done as f64 * 100.0 / self.steps.len() as f64
    }

    /// Mean quality score over steps that produced a result
    pub fn mean_quality(&self) -> f64 {
        let scores: Vec<f64> = self
            .steps
            .values()
            .filter(|s| s.status.was_executed())
            .filter_map(|s| s.quality_score)
            .collect();
        if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        }
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        if self.max_workers > 1 && self.groups.iter().any(|g| g.len() > 1) {
            ExecutionMode::Parallel
        } else {
            ExecutionMode::Sequential
        }
    }

    /// Status a finished run settles on when it was neither cancelled nor
    /// halted.
    pub fn settled_status(&self) -> PlanStatus {
        let failed = self.count(StepStatus::Failed);
        let in_review = self.count(StepStatus::ReviewRequired);
        let skipped = self.count(StepStatus::Skipped);

        if self.count(StepStatus::Succeeded) == self.steps.len() {
            PlanStatus::Completed
        } else if in_review > 0 && failed == 0 {
            PlanStatus::AwaitingReview
        } else if failed == 0 && skipped > 0 {
            // Only steps held back by reviews were skipped; resume runs them
            PlanStatus::Paused
        } else {
            PlanStatus::Partial
        }
    }

    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            plan_id: self.plan_id.clone(),
            status: self.status,
            progress_percentage: self.progress_percentage(),
            current_group: self.current_group,
            total_groups: self.groups.len(),
            steps_executed: self.steps_executed(),
            steps_succeeded: self.count(StepStatus::Succeeded),
            steps_failed: self.count(StepStatus::Failed),
            results: self.step_summaries(),
        }
    }

    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            plan_id: self.plan_id.clone(),
            title: self.title.clone(),
            status: self.status,
            execution_mode: self.execution_mode(),
            groups: self.groups.clone(),
            steps_executed: self.steps_executed(),
            steps_succeeded: self.count(StepStatus::Succeeded),
            steps_failed: self.count(StepStatus::Failed),
            steps_skipped: self.count(StepStatus::Skipped),
            steps_awaiting_review: self.count(StepStatus::ReviewRequired),
            total_quality_score: self.mean_quality(),
            execution_time_ms: self.execution_time_ms,
            results: self.step_summaries(),
        }
    }

    fn step_summaries(&self) -> BTreeMap<String, StepSummary> {
        self.steps
            .iter()
            .map(|(id, s)| {
                (
                    id.clone(),
                    StepSummary {
                        status: s.status,
                        quality_score: s.quality_score,
                        retry_count: s.retry_count,
                        error: s.error.clone(),
                    },
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    pub status: StepStatus,
    pub quality_score: Option<f64>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Answer to a status query; always the latest known state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub plan_id: String,
    pub status: PlanStatus,
    pub progress_percentage: f64,
    pub current_group: usize,
    pub total_groups: usize,
    pub steps_executed: usize,
    pub steps_succeeded: usize,
    pub steps_failed: usize,
    pub results: BTreeMap<String, StepSummary>,
}

/// Outcome of a plan run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub plan_id: String,
    pub title: String,
    pub status: PlanStatus,
    pub execution_mode: ExecutionMode,
    pub groups: ExecutionGroups,
    pub steps_executed: usize,
    pub steps_succeeded: usize,
    pub steps_failed: usize,
    pub steps_skipped: usize,
    pub steps_awaiting_review: usize,
    pub total_quality_score: f64,
    pub execution_time_ms: u64,
    pub results: BTreeMap<String, StepSummary>,
}

/// Shared handle on a plan's state.
///
/// Only the scheduler writes step states while the plan runs; review
/// resolution writes the single step it resolves.
pub struct PlanTracker {
    state: Mutex<PlanState>,
    cancel: AtomicBool,
    running: watch::Sender<bool>,
}

impl PlanTracker {
    pub fn new(state: PlanState) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            state: Mutex::new(state),
            cancel: AtomicBool::new(false),
            running,
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, PlanState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> PlanState {
        self.lock().clone()
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn clear_cancel(&self) {
        self.cancel.store(false, Ordering::SeqCst);
    }

    pub fn set_running(&self, running: bool) {
        self.running.send_replace(running);
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Move a parked step to the outcome of its resolved review.
    ///
    /// Returns the transition when the step was still parked on exactly this
    /// request, `None` otherwise.
    pub fn apply_review(&self, request: &ReviewRequest) -> Option<StepTransition> {
        let next = match request.status {
            ReviewStatus::Approved => StepStatus::Succeeded,
            ReviewStatus::Rejected => StepStatus::Failed,
            ReviewStatus::Pending | ReviewStatus::Escalated => return None,
        };

        let mut state = self.lock();
        let plan_id = state.plan_id.clone();
        let step = state.steps.get_mut(&request.step_id)?;
        if step.status != StepStatus::ReviewRequired
            || step.review_id.as_deref() != Some(request.id.as_str())
        {
            return None;
        }

        step.status = next;
        step.finished_at = Some(Utc::now());
        step.error = (next == StepStatus::Failed).then(|| {
            request
                .notes
                .clone()
                .unwrap_or_else(|| "rejected by reviewer".to_string())
        });

        Some(StepTransition::new(
            &plan_id,
            &request.step_id,
            StepStatus::ReviewRequired,
            next,
            step.retry_count,
            step.quality_score,
        ))
    }

    /// Settle a plan left awaiting review once its reviews change. Returns
    /// the new status when it moved.
    pub fn settle_after_review(&self) -> Option<PlanStatus> {
        let mut state = self.lock();
        if state.status != PlanStatus::AwaitingReview {
            return None;
        }
        let next = state.settled_status();
        if next == PlanStatus::AwaitingReview {
            return None;
        }
        state.status = next;
        state.finished_at = Some(Utc::now());
        Some(next)
    }

    /// Wait until no scheduler run is active
    pub async fn wait_idle(&self) {
        let mut rx = self.running.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|running| !running).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Step;

    fn state(statuses: &[(&str, StepStatus)]) -> PlanState {
        let steps = statuses
            .iter()
            .map(|(id, _)| Step::new(*id, "echo"))
            .collect();
        let plan = Plan::new("t", steps);
        let groups = vec![statuses.iter().map(|(id, _)| id.to_string()).collect()];
        let mut state = PlanState::new(&plan, groups, 4);
        for (id, status) in statuses {
            let step = state.steps.get_mut(*id).unwrap();
            step.status = *status;
            step.quality_score = status.was_executed().then_some(0.5);
        }
        state
    }

    #[test]
    fn test_settled_status() {
        use StepStatus::*;
        assert_eq!(
            state(&[("a", Succeeded), ("b", Succeeded)]).settled_status(),
            PlanStatus::Completed
        );
        assert_eq!(
            state(&[("a", Succeeded), ("b", ReviewRequired)]).settled_status(),
            PlanStatus::AwaitingReview
        );
        assert_eq!(
            state(&[("a", Failed), ("b", ReviewRequired)]).settled_status(),
            PlanStatus::Partial
        );
        assert_eq!(
            state(&[("a", Failed), ("b", Skipped)]).settled_status(),
            PlanStatus::Partial
        );

        let mut reviewed = state(&[("a", Succeeded), ("b", Skipped)]);
        reviewed.status = PlanStatus::AwaitingReview;
        assert_eq!(reviewed.settled_status(), PlanStatus::Paused);

        // Review cleared while the run was still going
        let mut running = state(&[("a", Succeeded), ("b", Skipped), ("c", Succeeded)]);
        running.status = PlanStatus::Running;
        assert_eq!(running.settled_status(), PlanStatus::Paused);
    }

    #[test]
    fn test_counts_and_progress() {
        use StepStatus::*;
        let s = state(&[
            ("a", Succeeded),
            ("b", Failed),
            ("c", Skipped),
            ("d", Pending),
        ]);
        assert_eq!(s.steps_executed(), 2);
        assert_eq!(s.progress_percentage(), 75.0);
        assert_eq!(s.mean_quality(), 0.5);

        let report = s.status_report();
        assert_eq!(report.steps_succeeded, 1);
        assert_eq!(report.steps_failed, 1);
        assert_eq!(report.results["c"].status, Skipped);
    }

    #[test]
    fn test_execution_mode() {
        let s = state(&[("a", StepStatus::Pending), ("b", StepStatus::Pending)]);
        assert_eq!(s.execution_mode(), ExecutionMode::Parallel);

        let mut single = s.clone();
        single.max_workers = 1;
        assert_eq!(single.execution_mode(), ExecutionMode::Sequential);
    }

    fn parked_request(state: &mut PlanState, step_id: &str, status: ReviewStatus) -> ReviewRequest {
        let step = state.steps.get_mut(step_id).unwrap();
        step.status = StepStatus::ReviewRequired;
        step.review_id = Some(format!("review-{}", step_id));
        ReviewRequest {
            id: format!("review-{}", step_id),
            plan_id: state.plan_id.clone(),
            step_id: step_id.to_string(),
            gate: crate::quality::GateResult::new(
                crate::quality::GateDecision::ReviewRequired,
                0.75,
                true,
            ),
            context: Default::default(),
            status,
            reviewer: Some("ana".to_string()),
            notes: None,
            created_at: Utc::now(),
            reviewed_at: Some(Utc::now()),
        }
    }

    #[test]
    fn test_apply_review_then_settle() {
        use StepStatus::*;
        let mut s = state(&[("a", Succeeded), ("b", Pending)]);
        let request = parked_request(&mut s, "b", ReviewStatus::Approved);
        s.status = PlanStatus::AwaitingReview;
        let tracker = PlanTracker::new(s);

        let transition = tracker.apply_review(&request).unwrap();
        assert_eq!(transition.old_state, ReviewRequired);
        assert_eq!(transition.new_state, Succeeded);
        // Applying twice is a no-op
        assert!(tracker.apply_review(&request).is_none());

        assert_eq!(tracker.settle_after_review(), Some(PlanStatus::Completed));
        assert!(tracker.settle_after_review().is_none());
    }

    #[test]
    fn test_rejected_review_fails_step() {
        let mut s = state(&[("a", StepStatus::Pending)]);
        let mut request = parked_request(&mut s, "a", ReviewStatus::Rejected);
        request.notes = Some("wrong statute".to_string());
        let tracker = PlanTracker::new(s);

        tracker.apply_review(&request).unwrap();
        let step = tracker.snapshot().steps["a"].clone();
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.error.as_deref(), Some("wrong statute"));
    }

    #[tokio::test]
    async fn test_wait_idle() {
        let tracker = std::sync::Arc::new(PlanTracker::new(state(&[])));
        tracker.set_running(true);

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        tracker.set_running(false);
        waiter.await.unwrap();
    }
}
