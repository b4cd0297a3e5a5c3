//! Plan model: plans, steps, step results and dependency resolution

pub mod parser;
pub mod resolver;
pub mod types;

pub use parser::{load_plan, parse_plan, validate_plan};
pub use resolver::{resolve_execution_groups, transitive_dependents, ExecutionGroups};
pub use types::{Plan, PlanStatus, ResultStatus, Step, StepResult, StepStatus};
