//! Human review handoff
//!
//! A step that needs a human decision registers a request here and awaits a
//! oneshot receiver. An external caller resolves the request by id, which
//! completes the receiver. Requests are never removed so the full review
//! history stays available for audit.

use crate::error::ReviewError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

use super::gate::GateResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
    Escalated,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Rejected => "rejected",
            ReviewStatus::Escalated => "escalated",
        }
    }

    /// Still waiting on a human
    pub fn is_open(&self) -> bool {
        matches!(self, ReviewStatus::Pending | ReviewStatus::Escalated)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReviewRequest {
    pub id: String,
    pub plan_id: String,
    pub step_id: String,
    pub gate: GateResult,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub status: ReviewStatus,
    #[serde(default)]
    pub reviewer: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub reviewed_at: Option<DateTime<Utc>>,
}

/// A reviewer's verdict
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReviewDecision {
    pub approved: bool,
    #[serde(default)]
    pub reviewer: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl ReviewDecision {
    pub fn approve(reviewer: impl Into<String>) -> Self {
        Self {
            approved: true,
            reviewer: Some(reviewer.into()),
            notes: None,
        }
    }

    pub fn reject(reviewer: impl Into<String>, notes: impl Into<String>) -> Self {
        Self {
            approved: false,
            reviewer: Some(reviewer.into()),
            notes: Some(notes.into()),
        }
    }
}

/// Synchronous reviewer consulted when a request is created; returning
/// `Some` resolves the request on the spot.
pub type ReviewerFn = Arc<dyn Fn(&ReviewRequest) -> Option<ReviewDecision> + Send + Sync>;

/// A freshly created request plus the receiver its decision arrives on
pub struct PendingReview {
    pub request: ReviewRequest,
    pub decision: oneshot::Receiver<ReviewDecision>,
}

#[derive(Default)]
struct BoardState {
    requests: Vec<ReviewRequest>,
    waiters: HashMap<String, oneshot::Sender<ReviewDecision>>,
}

#[derive(Clone, Default)]
pub struct ReviewBoard {
    state: Arc<Mutex<BoardState>>,
    reviewer: Option<ReviewerFn>,
}

impl ReviewBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reviewer(mut self, reviewer: ReviewerFn) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    fn state(&self) -> MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a review request for a step
    pub fn request(
        &self,
        plan_id: &str,
        step_id: &str,
        gate: GateResult,
        context: Map<String, Value>,
    ) -> PendingReview {
        let request = ReviewRequest {
            id: Uuid::new_v4().to_string(),
            plan_id: plan_id.to_string(),
            step_id: step_id.to_string(),
            gate,
            context,
            status: ReviewStatus::Pending,
            reviewer: None,
            notes: None,
            created_at: Utc::now(),
            reviewed_at: None,
        };
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.state();
            state.requests.push(request.clone());
            state.waiters.insert(request.id.clone(), tx);
        }
        info!(
            "Review requested for step {} of plan {} ({})",
            step_id, plan_id, request.id
        );

        let mut request = request;
        if let Some(reviewer) = &self.reviewer {
            if let Some(decision) = reviewer(&request) {
                debug!("Review {} resolved by inline reviewer", request.id);
                if let Ok(resolved) = self.resolve(&request.id, decision) {
                    request = resolved;
                }
            }
        }

        PendingReview {
            request,
            decision: rx,
        }
    }

    /// Record a reviewer's decision and wake the waiting step, if any
    pub fn resolve(
        &self,
        request_id: &str,
        decision: ReviewDecision,
    ) -> Result<ReviewRequest, ReviewError> {
        let mut state = self.state();
        let request = state
            .requests
            .iter_mut()
            .find(|r| r.id == request_id)
            .ok_or_else(|| ReviewError::UnknownRequest(request_id.to_string()))?;

        if !request.status.is_open() {
            return Err(ReviewError::AlreadyResolved(request_id.to_string()));
        }

        request.status = if decision.approved {
            ReviewStatus::Approved
        } else {
            ReviewStatus::Rejected
        };
        request.reviewer = decision.reviewer.clone();
        request.notes = decision.notes.clone();
        request.reviewed_at = Some(Utc::now());
        let resolved = request.clone();

        if let Some(waiter) = state.waiters.remove(request_id) {
            // The step may have stopped waiting; the decision is still recorded
            let _ = waiter.send(decision);
        }

        info!("Review {} {}", request_id, resolved.status.as_str());
        Ok(resolved)
    }

    /// Mark a request as escalated after nobody answered in time
    pub fn escalate(&self, request_id: &str) -> Result<ReviewRequest, ReviewError> {
        let mut state = self.state();
        let request = state
            .requests
            .iter_mut()
            .find(|r| r.id == request_id)
            .ok_or_else(|| ReviewError::UnknownRequest(request_id.to_string()))?;

        if request.status != ReviewStatus::Pending {
            return Err(ReviewError::AlreadyResolved(request_id.to_string()));
        }
        request.status = ReviewStatus::Escalated;
        Ok(request.clone())
    }

    pub fn get(&self, request_id: &str) -> Option<ReviewRequest> {
        self.state()
            .requests
            .iter()
            .find(|r| r.id == request_id)
            .cloned()
    }

    /// Every request ever created, oldest first
    pub fn history(&self) -> Vec<ReviewRequest> {
        self.state().requests.clone()
    }

    pub fn pending(&self) -> Vec<ReviewRequest> {
        self.state()
            .requests
            .iter()
            .filter(|r| r.status.is_open())
            .cloned()
            .collect()
    }
}
