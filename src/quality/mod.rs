//! Quality gating and human review of step results

mod gate;
mod review;

pub use gate::{GateDecision, GateResult, GateStatistics, QualityGate};
pub use review::{
    PendingReview, ReviewBoard, ReviewDecision, ReviewRequest, ReviewStatus, ReviewerFn,
};
