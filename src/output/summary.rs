use crate::error::OutputError;
use crate::plan::StepStatus;
use crate::runner::ExecutionSummary;
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};

/// Write `summary.json` and `summary.md` for a run into
/// `<report_dir>/<plan_id>/`, returning that directory.
pub fn write_summary(report_dir: &Path, summary: &ExecutionSummary) -> Result<PathBuf, OutputError> {
    let dir = report_dir.join(&summary.plan_id);
    fs::create_dir_all(&dir).map_err(OutputError::CreateDir)?;

    let json = serde_json::to_string_pretty(summary)?;
    fs::write(dir.join("summary.json"), json).map_err(OutputError::WriteSummary)?;

    let md = build_summary_markdown(summary);
    fs::write(dir.join("summary.md"), md).map_err(OutputError::WriteSummary)?;

    Ok(dir)
}

fn status_icon(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Succeeded => "✅",
        StepStatus::Failed => "❌",
        StepStatus::ReviewRequired => "👀",
        StepStatus::Skipped => "⏭️",
        StepStatus::Pending | StepStatus::Running => "⏳",
    }
}

pub fn build_summary_markdown(summary: &ExecutionSummary) -> String {
    let mut md = String::new();

    md.push_str(&format!("# {}\n\n", summary.title));
    md.push_str(&format!("**Plan:** {}\n", summary.plan_id));
    md.push_str(&format!("**Generated:** {}\n", Utc::now().to_rfc3339()));
    md.push_str(&format!("**Status:** {}\n", summary.status));
    md.push_str(&format!(
        "**Execution:** {:?}, {} groups\n",
        summary.execution_mode,
        summary.groups.len()
    ));
    md.push_str(&format!(
        "**Duration:** {:.1}s\n\n",
        summary.execution_time_ms as f64 / 1000.0
    ));

    md.push_str("## Totals\n\n");
    md.push_str("| Metric | Value |\n");
    md.push_str("|--------|-------|\n");
    md.push_str(&format!("| Executed | {} |\n", summary.steps_executed));
    md.push_str(&format!("| Succeeded | {} |\n", summary.steps_succeeded));
    md.push_str(&format!("| Failed | {} |\n", summary.steps_failed));
    md.push_str(&format!("| Skipped | {} |\n", summary.steps_skipped));
    md.push_str(&format!(
        "| Awaiting review | {} |\n",
        summary.steps_awaiting_review
    ));
    md.push_str(&format!(
        "| Mean quality | {:.2} |\n\n",
        summary.total_quality_score
    ));

    md.push_str("## Steps\n\n");
    md.push_str("| Group | Step | Status | Quality | Retries |\n");
    md.push_str("|-------|------|--------|---------|---------|\n");

    for (index, group) in summary.groups.iter().enumerate() {
        for step_id in group {
            let Some(result) = summary.results.get(step_id) else {
                continue;
            };
            let quality = result
                .quality_score
                .map(|q| format!("{:.2}", q))
                .unwrap_or_else(|| "-".to_string());
            let status = match &result.error {
                Some(error) => format!(
                    "{} {} ({})",
                    status_icon(result.status),
                    result.status,
                    error
                ),
                None => format!("{} {}", status_icon(result.status), result.status),
            };
            md.push_str(&format!(
                "| {} | {} | {} | {} | {} |\n",
                index + 1,
                step_id,
                status,
                quality,
                result.retry_count
            ));
        }
    }

    md
}
