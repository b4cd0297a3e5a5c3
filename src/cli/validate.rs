use anyhow::bail;
use super::{load_config, ValidateArgs};
use veritas_engine::agent::AgentRegistry;
use veritas_engine::plan::{load_plan, validate_plan};

pub fn execute(args: ValidateArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;
    config.validate()?;

    let plan = load_plan(&args.plan)?;
    let groups = validate_plan(&plan)?;

    let agents = AgentRegistry::from_config(&config);
    let missing: Vec<String> = plan
        .steps
        .iter()
        .filter(|s| agents.get(&s.agent).is_none())
        .map(|s| format!("{} -> {}", s.id, s.agent))
        .collect();

    println!("Plan {}: {}", plan.id, plan.title);
    println!("{} steps in {} groups", plan.steps.len(), groups.len());
    for (index, group) in groups.iter().enumerate() {
        println!("  {}. {}", index + 1, group.join(", "));
    }

    if !missing.is_empty() {
        bail!("Steps reference unregistered agents: {}", missing.join("; "));
    }
    Ok(())
}
