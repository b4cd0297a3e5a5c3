use std::sync::Arc;
use super::{load_config, RunArgs};
use tracing::{error, info, warn};
use veritas_engine::agent::AgentRegistry;
use veritas_engine::config::Config;
use veritas_engine::engine::Engine;
use veritas_engine::output::write_summary;
use veritas_engine::persistence::JsonlPersistence;
use veritas_engine::plan::{load_plan, validate_plan, ExecutionGroups, Plan, PlanStatus};
use veritas_engine::quality::{ReviewDecision, ReviewRequest, ReviewerFn};

const CLI_CLIENT: &str = "veritas-cli";

pub async fn execute(args: RunArgs) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_deref())?;

    // Apply CLI overrides
    if let Some(max_workers) = args.max_workers {
        config.max_workers = max_workers;
    }
    if let Some(policy) = args.failure_policy {
        config.failure_policy = policy;
    }
    if let Some(report_dir) = args.report_dir {
        config.report_dir = report_dir;
    }
    if let Some(state_dir) = args.state_dir {
        config.state_dir = state_dir;
    }
    config.validate()?;

    let plan = load_plan(&args.plan)?;
    let groups = validate_plan(&plan)?;

    if args.dry_run {
        info!("DRY RUN - no agents will be called");
        print_execution_plan(&config, &plan, &groups);
        return Ok(());
    }

    let agents = AgentRegistry::from_config(&config);
    let mut builder = Engine::builder(config.clone(), agents);
    if !args.no_persist {
        builder = builder.persistence(Arc::new(JsonlPersistence::new(&config.state_dir)));
    }
    if args.auto_approve {
        let reviewer: ReviewerFn =
            Arc::new(|_: &ReviewRequest| Some(ReviewDecision::approve("auto-approve")));
        builder = builder.reviewer(reviewer);
    }
    let engine = builder.build();

    let plan_id = engine.submit(plan)?;
    let mut stream = engine.subscribe(&plan_id, CLI_CLIENT)?;
    let json_events = args.json_events;
    let printer = tokio::spawn(async move {
        while let Some(event) = stream.recv().await {
            if json_events {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Failed to serialize event: {}", e),
                }
            } else {
                println!("{}", event.summary_line());
            }
        }
    });

    let summary = tokio::select! {
        summary = engine.wait(&plan_id) => summary?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling plan {}", plan_id);
            engine.cancel(&plan_id)?;
            engine.wait(&plan_id).await?
        }
    };

    // Closing the client ends the printer once it has drained
    engine.bus().unregister_client(CLI_CLIENT);
    printer.await?;

    let out_dir = write_summary(&config.report_dir, &summary)?;
    info!("Wrote summary to {:?}", out_dir);

    eprintln!(
        "Plan {} {}: {}/{} steps succeeded, {} failed, {} skipped, mean quality {:.2} ({:.1}s)",
        summary.plan_id,
        summary.status,
        summary.steps_succeeded,
        summary.results.len(),
        summary.steps_failed,
        summary.steps_skipped,
        summary.total_quality_score,
        summary.execution_time_ms as f64 / 1000.0
    );

    if summary.status == PlanStatus::Failed {
        error!("Plan {} failed", summary.plan_id);
        std::process::exit(1);
    }

    Ok(())
}

fn print_execution_plan(config: &Config, plan: &Plan, groups: &ExecutionGroups) {
    println!("\n=== Execution Plan ===\n");
    println!("Plan: {} ({})", plan.title, plan.id);
    println!(
        "Workers: {}",
        plan.max_parallel.unwrap_or(config.max_workers)
    );
    println!("Failure policy: {}", config.failure_policy);
    println!("Report dir: {:?}", config.report_dir);

    println!("\nGroups:");
    for (index, group) in groups.iter().enumerate() {
        println!("  {}.", index + 1);
        for step_id in group {
            if let Some(step) = plan.step(step_id) {
                let deps = if step.dependencies.is_empty() {
                    String::new()
                } else {
                    format!(" after {}", step.dependencies.join(", "))
                };
                println!("    - {} -> {}{}", step.display_name(), step.agent, deps);
            }
        }
    }
    println!();
}
