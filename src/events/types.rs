use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PlanStarted,
    PlanCompleted,
    PlanFailed,
    PlanPaused,
    StepStarted,
    StepProgress,
    StepCompleted,
    StepFailed,
    StepSkipped,
    QualityCheck,
    ReviewRequested,
    ReviewResolved,
    MetricsUpdate,
    Error,
    Ping,
    Pong,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PlanStarted => "plan_started",
            EventType::PlanCompleted => "plan_completed",
            EventType::PlanFailed => "plan_failed",
            EventType::PlanPaused => "plan_paused",
            EventType::StepStarted => "step_started",
            EventType::StepProgress => "step_progress",
            EventType::StepCompleted => "step_completed",
            EventType::StepFailed => "step_failed",
            EventType::StepSkipped => "step_skipped",
            EventType::QualityCheck => "quality_check",
            EventType::ReviewRequested => "review_requested",
            EventType::ReviewResolved => "review_resolved",
            EventType::MetricsUpdate => "metrics_update",
            EventType::Error => "error",
            EventType::Ping => "ping",
            EventType::Pong => "pong",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An immutable lifecycle event for one plan
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StreamEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub plan_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl StreamEvent {
    pub fn new(event_type: EventType, plan_id: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type,
            plan_id: plan_id.into(),
            step_id: None,
            data: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn for_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Single-line rendering used by the CLI stream
    pub fn summary_line(&self) -> String {
        let mut line = format!("[{}] {}", self.timestamp.format("%H:%M:%S"), self.event_type);
        if let Some(step) = &self.step_id {
            line.push_str(&format!(" {}", step));
        }
        if !self.data.is_empty() {
            let fields = self
                .data
                .iter()
                .map(|(k, v)| match v {
                    Value::String(s) => format!("{}={}", k, s),
                    other => format!("{}={}", k, other),
                })
                .collect::<Vec<_>>()
                .join(" ");
            line.push_str(&format!(" ({})", fields));
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_snake_case() {
        let event = StreamEvent::new(EventType::StepCompleted, "p1")
            .for_step("s1")
            .with("quality_score", 0.9);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "step_completed");
        assert_eq!(json["step_id"], "s1");
        assert_eq!(json["data"]["quality_score"], 0.9);
    }

    #[test]
    fn test_event_ids_unique() {
        let a = StreamEvent::new(EventType::Ping, "p");
        let b = StreamEvent::new(EventType::Ping, "p");
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn test_summary_line() {
        let line = StreamEvent::new(EventType::StepFailed, "p")
            .for_step("fetch")
            .with("error", "boom")
            .summary_line();
        assert!(line.ends_with("step_failed fetch (error=boom)"));
    }
}
