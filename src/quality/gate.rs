//! Threshold-based quality gate over step results
//!
//! Rules are evaluated top to bottom and the first match wins:
//! 1. failed result: retry while retries remain, otherwise reject
//! 2. any configured dimension missing or below `min_quality`: reject
//! 3. `require_review`: review
//! 4. score below `review_threshold_low`: retry while retries remain, otherwise reject
//! 5. score at or above `review_threshold_high`: approve
//! 6. score strictly between the review thresholds: review
//! 7. otherwise compare against `min_quality` (only reachable for NaN scores)

use crate::config::QualityPolicy;
use crate::error::ReviewError;
use crate::plan::{Step, StepResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use super::review::{PendingReview, ReviewBoard, ReviewDecision, ReviewRequest, ReviewerFn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Approved,
    Rejected,
    ReviewRequired,
    RetrySuggested,
}

impl GateDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateDecision::Approved => "approved",
            GateDecision::Rejected => "rejected",
            GateDecision::ReviewRequired => "review_required",
            GateDecision::RetrySuggested => "retry_suggested",
        }
    }
}

impl std::fmt::Display for GateDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GateResult {
    pub decision: GateDecision,
    pub quality_score: f64,
    pub meets_threshold: bool,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    pub requires_review: bool,
    pub retry_suggested: bool,
}

impl GateResult {
    pub fn new(decision: GateDecision, quality_score: f64, meets_threshold: bool) -> Self {
        Self {
            decision,
            quality_score,
            meets_threshold,
            reasons: Vec::new(),
            recommendations: Vec::new(),
            requires_review: decision == GateDecision::ReviewRequired,
            retry_suggested: decision == GateDecision::RetrySuggested,
        }
    }

    fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reasons.push(reason.into());
        self
    }

    fn recommend(mut self, recommendation: impl Into<String>) -> Self {
        self.recommendations.push(recommendation.into());
        self
    }
}

/// Running totals across every evaluation made by a gate
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GateStatistics {
    pub evaluated: usize,
    pub approved: usize,
    pub rejected: usize,
    pub review_required: usize,
    pub retry_suggested: usize,
    score_total: f64,
}

impl GateStatistics {
    fn record(&mut self, result: &GateResult) {
        self.evaluated += 1;
        match result.decision {
            GateDecision::Approved => self.approved += 1,
            GateDecision::Rejected => self.rejected += 1,
            GateDecision::ReviewRequired => self.review_required += 1,
            GateDecision::RetrySuggested => self.retry_suggested += 1,
        }
        if result.quality_score.is_finite() {
            self.score_total += result.quality_score;
        }
    }

    pub fn mean_score(&self) -> f64 {
        if self.evaluated == 0 {
            0.0
        } else {
            self.score_total / self.evaluated as f64
        }
    }

    pub fn approval_rate(&self) -> f64 {
        if self.evaluated == 0 {
            0.0
        } else {
            self.approved as f64 / self.evaluated as f64
        }
    }
}

pub struct QualityGate {
    policy: QualityPolicy,
    reviews: ReviewBoard,
    stats: Mutex<GateStatistics>,
}

impl QualityGate {
    pub fn new(policy: QualityPolicy) -> Self {
        Self {
            policy,
            reviews: ReviewBoard::new(),
            stats: Mutex::new(GateStatistics::default()),
        }
    }

    /// Consult `reviewer` synchronously whenever a review is requested
    pub fn with_reviewer(mut self, reviewer: ReviewerFn) -> Self {
        self.reviews = self.reviews.with_reviewer(reviewer);
        self
    }

    pub fn policy(&self) -> &QualityPolicy {
        &self.policy
    }

    pub fn reviews(&self) -> &ReviewBoard {
        &self.reviews
    }

    pub fn statistics(&self) -> GateStatistics {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Evaluate a result under this gate's policy
    pub fn validate(&self, result: &StepResult, retry_count: u32) -> GateResult {
        let gate = evaluate(&self.policy, result, retry_count);
        self.record(&gate);
        gate
    }

    /// Evaluate a result with the step's own dimension list and retry budget
    pub fn validate_step(
        &self,
        step: &Step,
        max_retries: u32,
        result: &StepResult,
        retry_count: u32,
    ) -> GateResult {
        let mut policy = self.policy.clone();
        policy.max_retries = max_retries;
        if !step.quality_dimensions.is_empty() {
            policy.dimensions = step.quality_dimensions.clone();
        }
        let gate = evaluate(&policy, result, retry_count);
        debug!(
            "Quality gate for step {}: {} (score {:.2})",
            step.id, gate.decision, gate.quality_score
        );
        self.record(&gate);
        gate
    }

    fn record(&self, gate: &GateResult) {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(gate);
    }

    /// Open a human review request for a gate outcome
    pub fn request_review(
        &self,
        plan_id: &str,
        step_id: &str,
        gate: GateResult,
        context: Map<String, Value>,
    ) -> PendingReview {
        self.reviews.request(plan_id, step_id, gate, context)
    }

    pub fn complete_review(
        &self,
        request_id: &str,
        decision: ReviewDecision,
    ) -> Result<ReviewRequest, ReviewError> {
        self.reviews.resolve(request_id, decision)
    }
}

fn evaluate(policy: &QualityPolicy, result: &StepResult, retry_count: u32) -> GateResult {
    let score = result.quality_score;
    let meets = score >= policy.min_quality;
    let retries_left = retry_count < policy.max_retries;

    if !result.is_success() {
        let error = result.error.as_deref().unwrap_or("step reported failure");
        return if retries_left {
            GateResult::new(GateDecision::RetrySuggested, score, false)
                .reason(format!("Step failed: {}", error))
                .recommend(format!(
                    "Retry ({} of {} retries used)",
                    retry_count, policy.max_retries
                ))
        } else {
            GateResult::new(GateDecision::Rejected, score, false)
                .reason(format!("Step failed: {}", error))
                .reason("Retry budget exhausted")
        };
    }

    if !policy.dimensions.is_empty() {
        let failing: Vec<String> = policy
            .dimensions
            .iter()
            .filter_map(|dim| match result.quality_details.get(dim) {
                None => Some(format!("{} (missing)", dim)),
                Some(v) if !(*v >= policy.min_quality) => Some(format!("{} ({:.2})", dim, v)),
                Some(_) => None,
            })
            .collect();

        if !failing.is_empty() {
            return GateResult::new(GateDecision::Rejected, score, meets)
                .reason(format!(
                    "Dimensions below {:.2}: {}",
                    policy.min_quality,
                    failing.join(", ")
                ))
                .recommend("Improve the listed dimensions before resubmitting");
        }
    }

    if policy.require_review {
        return GateResult::new(GateDecision::ReviewRequired, score, meets)
            .reason("Policy requires human review");
    }

    if score < policy.review_threshold_low {
        return if retries_left {
            GateResult::new(GateDecision::RetrySuggested, score, meets)
                .reason(format!(
                    "Score {:.2} below review threshold {:.2}",
                    score, policy.review_threshold_low
                ))
                .recommend("Retry with refined parameters")
        } else {
            GateResult::new(GateDecision::Rejected, score, meets)
                .reason(format!(
                    "Score {:.2} below review threshold {:.2}",
                    score, policy.review_threshold_low
                ))
                .reason("Retry budget exhausted")
        };
    }

    if score >= policy.review_threshold_high {
        let gate = GateResult::new(GateDecision::Approved, score, meets);
        return if score >= policy.target_quality {
            gate
        } else {
            gate.recommend(format!("Below target quality {:.2}", policy.target_quality))
        };
    }

    if score > policy.review_threshold_low && score < policy.review_threshold_high {
        return GateResult::new(GateDecision::ReviewRequired, score, meets)
            .reason(format!(
                "Score {:.2} between review thresholds {:.2} and {:.2}",
                score, policy.review_threshold_low, policy.review_threshold_high
            ))
            .recommend("Human reviewer should confirm the result");
    }

    if meets {
        GateResult::new(GateDecision::Approved, score, true)
    } else {
        GateResult::new(GateDecision::Rejected, score, false)
            .reason(format!("Score {:.2} below minimum {:.2}", score, policy.min_quality))
    }
}
