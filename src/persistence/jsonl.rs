use super::{Persistence, StepTransition};
use crate::error::PersistenceError;
use crate::events::StreamEvent;
use crate::plan::Plan;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const PLAN_FILE: &str = "plan.json";
const TRANSITIONS_FILE: &str = "transitions.jsonl";
const EVENTS_FILE: &str = "events.jsonl";

/// Writes `<root>/<plan_id>/{plan.json, transitions.jsonl, events.jsonl}`
#[derive(Debug)]
pub struct JsonlPersistence {
    root: PathBuf,
    // Serializes appends so concurrent lines never interleave
    write_lock: Mutex<()>,
}

impl JsonlPersistence {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn plan_dir(&self, plan_id: &str) -> PathBuf {
        self.root.join(plan_id)
    }

    fn append<T: Serialize>(&self, plan_id: &str, file: &str, record: &T) -> Result<(), PersistenceError> {
        let line = serde_json::to_string(record)?;
        let dir = self.plan_dir(plan_id);

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        fs::create_dir_all(&dir)?;
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(file))?;
        writeln!(handle, "{}", line)?;
        Ok(())
    }

    /// Read back recorded transitions for a plan
    pub fn load_transitions(&self, plan_id: &str) -> Result<Vec<StepTransition>, PersistenceError> {
        read_lines(&self.plan_dir(plan_id).join(TRANSITIONS_FILE))
    }

    /// Read back recorded events for a plan
    pub fn load_events(&self, plan_id: &str) -> Result<Vec<StreamEvent>, PersistenceError> {
        read_lines(&self.plan_dir(plan_id).join(EVENTS_FILE))
    }
}

fn read_lines<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, PersistenceError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(PersistenceError::from))
        .collect()
}

impl Persistence for JsonlPersistence {
    fn record_plan(&self, plan: &Plan) -> Result<(), PersistenceError> {
        let dir = self.plan_dir(&plan.id);
        fs::create_dir_all(&dir)?;
        let json = serde_json::to_string_pretty(plan)?;
        fs::write(dir.join(PLAN_FILE), json)?;
        Ok(())
    }

    fn record_step_transition(&self, transition: &StepTransition) -> Result<(), PersistenceError> {
        self.append(&transition.plan_id, TRANSITIONS_FILE, transition)
    }

    fn record_event(&self, event: &StreamEvent) -> Result<(), PersistenceError> {
        self.append(&event.plan_id, EVENTS_FILE, event)
    }
}
