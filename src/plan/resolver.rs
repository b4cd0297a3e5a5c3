//! Dependency resolution: turns a step list into parallel execution groups
//!
//! Groups are built by repeated topological layering. Each pass commits every
//! step whose dependencies all sit in earlier groups, so a step always lands in
//! the earliest group it can, and the number of groups equals the length of
//! the longest dependency chain. Within a group, steps keep plan order.

use crate::error::PlanError;
use std::collections::{HashMap, HashSet, VecDeque};

use super::types::Step;

/// Ordered execution groups; steps inside one group may run concurrently
pub type ExecutionGroups = Vec<Vec<String>>;

/// Resolve execution groups for `steps`.
///
/// Fails without producing any groups when a dependency is unknown, an id is
/// duplicated, or the graph has a cycle.
pub fn resolve_execution_groups(steps: &[Step]) -> Result<ExecutionGroups, PlanError> {
    let mut known = HashSet::new();
    for step in steps {
        if !known.insert(step.id.as_str()) {
            return Err(PlanError::DuplicateStep(step.id.clone()));
        }
    }

    for step in steps {
        if let Some(missing) = step
            .dependencies
            .iter()
            .find(|d| !known.contains(d.as_str()))
        {
            return Err(PlanError::UnknownDependency {
                step: step.id.clone(),
                dependency: missing.clone(),
            });
        }
    }

    let mut committed: HashSet<&str> = HashSet::new();
    let mut remaining: Vec<&Step> = steps.iter().collect();
    let mut groups = Vec::new();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<&Step>, Vec<&Step>) = remaining.into_iter().partition(|s| {
            s.dependencies
                .iter()
                .all(|d| committed.contains(d.as_str()))
        });

        if ready.is_empty() {
            return Err(PlanError::CyclicDependency {
                steps: blocked.iter().map(|s| s.id.clone()).collect(),
            });
        }

        committed.extend(ready.iter().map(|s| s.id.as_str()));
        groups.push(ready.iter().map(|s| s.id.clone()).collect());
        remaining = blocked;
    }

    Ok(groups)
}

/// Every step that depends on `root`, directly or transitively
pub fn transitive_dependents(steps: &[Step], root: &str) -> HashSet<String> {
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in steps {
        for dep in &step.dependencies {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(step.id.as_str());
        }
    }

    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([root]);
    while let Some(current) = queue.pop_front() {
        for &child in dependents.get(current).into_iter().flatten() {
            if seen.insert(child.to_string()) {
                queue.push_back(child);
            }
        }
    }
    seen
}
