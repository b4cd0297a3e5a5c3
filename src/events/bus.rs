//! In-process publish/subscribe keyed by plan id
//!
//! Every published event is appended to its plan's history before being fanned
//! out, and a new subscriber receives the full history ahead of live events.
//! Each plan's history and subscriber set sit behind one mutex, which is also
//! held while sending so every subscriber observes history order. Client
//! channels are unbounded: publishing never waits on a slow consumer, and a
//! dropped receiver is pruned without affecting other subscribers.

use crate::error::EventBusError;
use crate::persistence::Persistence;
use crate::quality::{GateResult, ReviewRequest};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::types::{EventType, StreamEvent};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct PlanChannel {
    history: Vec<StreamEvent>,
    subscribers: HashSet<String>,
}

struct ClientHandle {
    tx: mpsc::UnboundedSender<StreamEvent>,
    plans: HashSet<String>,
}

#[derive(Default)]
struct BusInner {
    plans: Mutex<HashMap<String, Arc<Mutex<PlanChannel>>>>,
    clients: Mutex<HashMap<String, ClientHandle>>,
    recorders: Vec<Arc<dyn Persistence>>,
}

/// Cheap to clone; all clones share the same state
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

/// Receiving side of a registered client
pub struct EventStream {
    client_id: String,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl EventStream {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Next event; `None` once the client is unregistered and drained
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.rx.try_recv().ok()
    }

    /// Everything currently buffered
    pub fn drain(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror every published event to the given persistence backend
    pub fn with_persistence(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                recorders: vec![persistence],
                ..BusInner::default()
            }),
        }
    }

    fn channel(&self, plan_id: &str) -> Arc<Mutex<PlanChannel>> {
        lock(&self.inner.plans)
            .entry(plan_id.to_string())
            .or_default()
            .clone()
    }

    /// Register a client. Re-registering an id replaces its previous stream.
    pub fn register_client(&self, client_id: impl Into<String>) -> EventStream {
        let client_id = client_id.into();
        let (tx, rx) = mpsc::unbounded_channel();

        let previous = lock(&self.inner.clients).insert(
            client_id.clone(),
            ClientHandle {
                tx,
                plans: HashSet::new(),
            },
        );
        if let Some(previous) = previous {
            self.detach(&client_id, previous.plans);
        }

        debug!("Registered event client {}", client_id);
        EventStream { client_id, rx }
    }

    /// Drop a client and all its subscriptions
    pub fn unregister_client(&self, client_id: &str) -> bool {
        let removed = lock(&self.inner.clients).remove(client_id);
        match removed {
            Some(handle) => {
                self.detach(client_id, handle.plans);
                debug!("Unregistered event client {}", client_id);
                true
            }
            None => false,
        }
    }

    fn detach(&self, client_id: &str, plans: HashSet<String>) {
        for plan_id in plans {
            let channel = self.channel(&plan_id);
            lock(&channel).subscribers.remove(client_id);
        }
    }

    /// Subscribe a registered client to a plan, replaying its history first.
    /// Returns the number of replayed events.
    pub fn subscribe(&self, client_id: &str, plan_id: &str) -> Result<usize, EventBusError> {
        let channel = self.channel(plan_id);
        let mut channel = lock(&channel);
        let mut clients = lock(&self.inner.clients);

        let client = clients
            .get_mut(client_id)
            .ok_or_else(|| EventBusError::UnknownClient(client_id.to_string()))?;

        if !client.plans.insert(plan_id.to_string()) {
            return Ok(0);
        }

        for event in &channel.history {
            if client.tx.send(event.clone()).is_err() {
                break;
            }
        }
        channel.subscribers.insert(client_id.to_string());

        debug!(
            "Client {} subscribed to plan {} ({} replayed)",
            client_id,
            plan_id,
            channel.history.len()
        );
        Ok(channel.history.len())
    }

    pub fn unsubscribe(&self, client_id: &str, plan_id: &str) -> bool {
        let channel = self.channel(plan_id);
        let mut channel = lock(&channel);
        if let Some(client) = lock(&self.inner.clients).get_mut(client_id) {
            client.plans.remove(plan_id);
        }
        channel.subscribers.remove(client_id)
    }

    /// Append to the plan's history and deliver to its current subscribers
    pub fn publish(&self, event: StreamEvent) {
        {
            let channel = self.channel(&event.plan_id);
            let mut channel = lock(&channel);
            channel.history.push(event.clone());

            let mut clients = lock(&self.inner.clients);
            let mut dead = Vec::new();
            for client_id in &channel.subscribers {
                let delivered = clients
                    .get(client_id)
                    .map(|c| c.tx.send(event.clone()).is_ok())
                    .unwrap_or(false);
                if !delivered {
                    dead.push(client_id.clone());
                }
            }

            for client_id in dead {
                debug!("Pruning disconnected client {}", client_id);
                channel.subscribers.remove(&client_id);
                if let Some(client) = clients.get_mut(&client_id) {
                    if client.tx.is_closed() {
                        clients.remove(&client_id);
                    }
                }
            }
        }

        for recorder in &self.inner.recorders {
            if let Err(e) = recorder.record_event(&event) {
                warn!("Failed to persist event {}: {}", event.event_id, e);
            }
        }
    }

    /// All events recorded for a plan, in emission order
    pub fn history(&self, plan_id: &str) -> Vec<StreamEvent> {
        let plans = lock(&self.inner.plans);
        plans
            .get(plan_id)
            .map(|c| lock(c).history.clone())
            .unwrap_or_default()
    }

    /// Forget a plan's history; current subscribers stay attached
    pub fn clear_history(&self, plan_id: &str) {
        let channel = lock(&self.inner.plans).get(plan_id).cloned();
        if let Some(channel) = channel {
            lock(&channel).history.clear();
        }
    }

    pub fn client_count(&self) -> usize {
        lock(&self.inner.clients).len()
    }

    pub fn subscriber_count(&self, plan_id: &str) -> usize {
        let channel = lock(&self.inner.plans).get(plan_id).cloned();
        channel.map(|c| lock(&c).subscribers.len()).unwrap_or(0)
    }

    /// Answer a client's ping directly; pongs are not recorded in history
    pub fn ping(&self, client_id: &str) -> bool {
        let clients = lock(&self.inner.clients);
        match clients.get(client_id) {
            Some(client) => {
                let pong = StreamEvent::new(EventType::Pong, "").with("client_id", client_id);
                client.tx.send(pong).is_ok()
            }
            None => false,
        }
    }

    pub fn plan_started(&self, plan_id: &str, title: &str, total_steps: usize, groups: usize) {
        self.publish(
            StreamEvent::new(EventType::PlanStarted, plan_id)
                .with("title", title)
                .with("total_steps", total_steps)
                .with("execution_groups", groups),
        );
    }

    pub fn step_started(&self, plan_id: &str, step_id: &str, agent: &str) {
        self.publish(
            StreamEvent::new(EventType::StepStarted, plan_id)
                .for_step(step_id)
                .with("agent", agent),
        );
    }

    pub fn step_progress(&self, plan_id: &str, step_id: &str, progress: f64, message: &str) {
        self.publish(
            StreamEvent::new(EventType::StepProgress, plan_id)
                .for_step(step_id)
                .with("progress", progress)
                .with("message", message),
        );
    }

    pub fn step_retrying(
        &self,
        plan_id: &str,
        step_id: &str,
        attempt: u32,
        delay_ms: u64,
        reason: &str,
    ) {
        self.publish(
            StreamEvent::new(EventType::StepProgress, plan_id)
                .for_step(step_id)
                .with("retrying", true)
                .with("attempt", attempt)
                .with("delay_ms", delay_ms)
                .with("message", reason),
        );
    }

    pub fn step_completed(
        &self,
        plan_id: &str,
        step_id: &str,
        quality_score: f64,
        retry_count: u32,
        elapsed_ms: u64,
    ) {
        self.publish(
            StreamEvent::new(EventType::StepCompleted, plan_id)
                .for_step(step_id)
                .with("quality_score", quality_score)
                .with("retry_count", retry_count)
                .with("elapsed_ms", elapsed_ms),
        );
    }

    pub fn step_failed(&self, plan_id: &str, step_id: &str, error: &str, retry_count: u32) {
        self.publish(
            StreamEvent::new(EventType::StepFailed, plan_id)
                .for_step(step_id)
                .with("error", error)
                .with("retry_count", retry_count),
        );
    }

    pub fn step_skipped(&self, plan_id: &str, step_id: &str, reason: &str) {
        self.publish(
            StreamEvent::new(EventType::StepSkipped, plan_id)
                .for_step(step_id)
                .with("reason", reason),
        );
    }

    pub fn quality_check(&self, plan_id: &str, step_id: &str, gate: &GateResult) {
        self.publish(
            StreamEvent::new(EventType::QualityCheck, plan_id)
                .for_step(step_id)
                .with("decision", gate.decision.as_str())
                .with("quality_score", gate.quality_score)
                .with("meets_threshold", gate.meets_threshold)
                .with("reasons", gate.reasons.clone()),
        );
    }

    pub fn review_requested(&self, request: &ReviewRequest) {
        self.publish(
            StreamEvent::new(EventType::ReviewRequested, request.plan_id.as_str())
                .for_step(request.step_id.as_str())
                .with("request_id", request.id.as_str())
                .with("quality_score", request.gate.quality_score),
        );
    }

    pub fn review_resolved(&self, request: &ReviewRequest) {
        let mut event = StreamEvent::new(EventType::ReviewResolved, request.plan_id.as_str())
            .for_step(request.step_id.as_str())
            .with("request_id", request.id.as_str())
            .with("status", request.status.as_str());
        if let Some(reviewer) = &request.reviewer {
            event = event.with("reviewer", reviewer.as_str());
        }
        self.publish(event);
    }

    pub fn metrics_update(&self, plan_id: &str, metrics: Map<String, Value>) {
        let mut event = StreamEvent::new(EventType::MetricsUpdate, plan_id);
        event.data = metrics;
        self.publish(event);
    }

    pub fn plan_completed(&self, plan_id: &str, status: &str, execution_time_ms: u64) {
        self.publish(
            StreamEvent::new(EventType::PlanCompleted, plan_id)
                .with("status", status)
                .with("execution_time_ms", execution_time_ms),
        );
    }

    pub fn plan_failed(&self, plan_id: &str, error: &str) {
        self.publish(StreamEvent::new(EventType::PlanFailed, plan_id).with("error", error));
    }

    pub fn plan_paused(&self, plan_id: &str, skipped_steps: usize) {
        self.publish(
            StreamEvent::new(EventType::PlanPaused, plan_id).with("skipped_steps", skipped_steps),
        );
    }

    pub fn error(&self, plan_id: &str, message: &str) {
        self.publish(StreamEvent::new(EventType::Error, plan_id).with("message", message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;

    #[tokio::test]
    async fn test_subscriber_receives_live_events() {
        let bus = EventBus::new();
        let mut stream = bus.register_client("ui");
        bus.subscribe("ui", "p1").unwrap();

        bus.step_started("p1", "s1", "search");
        bus.step_completed("p1", "s1", 0.9, 0, 12);

        let first = stream.recv().await.unwrap();
        let second = stream.recv().await.unwrap();
        assert_eq!(first.event_type, EventType::StepStarted);
        assert_eq!(second.event_type, EventType::StepCompleted);
        assert_eq!(second.step_id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_late_subscriber_gets_replay_then_live() {
        let bus = EventBus::new();
        bus.plan_started("p1", "Question", 2, 2);
        bus.step_started("p1", "a", "x");

        let mut stream = bus.register_client("late");
        assert_eq!(bus.subscribe("late", "p1").unwrap(), 2);
        bus.step_completed("p1", "a", 1.0, 0, 1);

        let received = stream.drain();
        let history = bus.history("p1");
        assert_eq!(received.len(), 3);
        assert_eq!(received, history);
    }

    #[test]
    fn test_events_isolated_per_plan() {
        let bus = EventBus::new();
        let mut stream = bus.register_client("c");
        bus.subscribe("c", "p1").unwrap();

        bus.plan_started("p2", "other", 1, 1);
        bus.plan_started("p1", "mine", 1, 1);

        let received = stream.drain();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].plan_id, "p1");
        assert_eq!(bus.history("p2").len(), 1);
    }

    #[test]
    fn test_dropped_subscriber_does_not_block_others() {
        let bus = EventBus::new();
        let dropped = bus.register_client("gone");
        let mut alive = bus.register_client("alive");
        bus.subscribe("gone", "p").unwrap();
        bus.subscribe("alive", "p").unwrap();
        drop(dropped);

        bus.step_started("p", "s", "a");
        bus.step_started("p", "t", "a");

        assert_eq!(alive.drain().len(), 2);
        assert_eq!(bus.subscriber_count("p"), 1);
        assert_eq!(bus.client_count(), 1);
    }

    #[test]
    fn test_subscribe_unknown_client() {
        let bus = EventBus::new();
        assert!(matches!(
            bus.subscribe("nobody", "p"),
            Err(EventBusError::UnknownClient(_))
        ));
    }

    #[test]
    fn test_duplicate_subscribe_does_not_replay_twice() {
        let bus = EventBus::new();
        bus.step_started("p", "s", "a");
        let mut stream = bus.register_client("c");
        assert_eq!(bus.subscribe("c", "p").unwrap(), 1);
        assert_eq!(bus.subscribe("c", "p").unwrap(), 0);
        assert_eq!(stream.drain().len(), 1);
    }

    #[test]
    fn test_unsubscribe_and_unregister() {
        let bus = EventBus::new();
        let mut stream = bus.register_client("c");
        bus.subscribe("c", "p").unwrap();
        assert!(bus.unsubscribe("c", "p"));

        bus.step_started("p", "s", "a");
        assert!(stream.try_recv().is_none());

        assert!(bus.unregister_client("c"));
        assert!(!bus.unregister_client("c"));
        assert_eq!(bus.client_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_ends_after_unregister() {
        let bus = EventBus::new();
        let mut stream = bus.register_client("c");
        bus.subscribe("c", "p").unwrap();
        bus.error("p", "something odd");
        bus.unregister_client("c");

        assert_eq!(stream.recv().await.unwrap().event_type, EventType::Error);
        assert!(stream.recv().await.is_none());
    }

    #[test]
    fn test_clear_history() {
        let bus = EventBus::new();
        bus.plan_started("p", "t", 1, 1);
        bus.clear_history("p");
        assert!(bus.history("p").is_empty());
        assert!(bus.history("unknown").is_empty());
    }

    #[test]
    fn test_ping_pong_not_recorded() {
        let bus = EventBus::new();
        let mut stream = bus.register_client("c");
        assert!(bus.ping("c"));
        assert!(!bus.ping("missing"));

        let pong = stream.try_recv().unwrap();
        assert_eq!(pong.event_type, EventType::Pong);
        assert!(bus.history("").is_empty());
    }

    #[test]
    fn test_events_mirrored_to_persistence() {
        let store = Arc::new(MemoryPersistence::default());
        let bus = EventBus::with_persistence(store.clone());
        bus.plan_started("p", "t", 1, 1);
        bus.plan_completed("p", "completed", 5);
        assert_eq!(store.events().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_publishers_keep_history_order_for_subscriber() {
        let bus = EventBus::new();
        let mut stream = bus.register_client("c");
        bus.subscribe("c", "p").unwrap();

        let mut handles = Vec::new();
        for worker in 0..4 {
            let bus = bus.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    bus.step_progress("p", &format!("s{}", worker), i as f64, "tick");
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let received = stream.drain();
        assert_eq!(received.len(), 100);
        assert_eq!(received, bus.history("p"));
    }
}
