use super::Agent;
use crate::error::AgentError;
use crate::plan::{Step, StepResult};
use crate::runner::StepContext;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Runs an external program per step.
///
/// The program receives `{"step": ..., "context": ...}` as JSON on stdin and
/// must print a [`StepResult`] as JSON on stdout. A non-zero exit is a failure.
pub struct ProcessAgent {
    pub name: String,
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
}

impl ProcessAgent {
    fn command(&self) -> Command {
        // Bare names go through PATH lookup
        let binary_str = self.binary.to_string_lossy();
        let mut cmd = if binary_str.contains('/') || binary_str.contains('\\') {
            Command::new(&self.binary)
        } else {
            Command::new(binary_str.as_ref())
        };

        cmd.current_dir(&self.working_dir)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Agent for ProcessAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute_step(
        &self,
        step: &Step,
        ctx: &mut StepContext,
    ) -> Result<StepResult, AgentError> {
        let input = serde_json::to_vec(&json!({ "step": step, "context": ctx }))
            .map_err(|e| AgentError::InvalidOutput(e.to_string()))?;

        debug!(
            "Spawning {} for step {} (attempt {})",
            self.binary.display(),
            step.id,
            ctx.retry.attempt
        );

        let mut child = self
            .command()
            .spawn()
            .map_err(|e| AgentError::Spawn(format!("{}: {}", self.binary.display(), e)))?;

        // Feed stdin while draining stdout/stderr so neither pipe fills up
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&input).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(|e| AgentError::Spawn(e.to_string()))?;
        if let Err(e) = fed {
            debug!("Agent for step {} stopped reading stdin: {}", step.id, e);
        }

        if !output.status.success() {
            return Err(AgentError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let result: StepResult = serde_json::from_str(stdout.trim())
            .map_err(|e| AgentError::InvalidOutput(e.to_string()))?;

        if let Some(error) = result.error.as_ref().filter(|_| !result.is_success()) {
            return Err(AgentError::Failed(error.clone()));
        }
        Ok(result)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn shell_agent(script: &str) -> ProcessAgent {
        ProcessAgent {
            name: "sh".to_string(),
            binary: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: PathBuf::from("."),
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_parses_stdout_result() {
        let agent = shell_agent(r#"cat > /dev/null; echo '{"quality_score": 0.75}'"#);
        let mut ctx = StepContext::new("p", "s");
        let result = agent
            .execute_step(&Step::new("s", "sh"), &mut ctx)
            .await
            .unwrap();
        assert_eq!(result.quality_score, 0.75);
    }

    #[tokio::test]
    async fn test_large_output_before_reading_input() {
        // Writes more than a pipe buffer before touching stdin
        let agent = shell_agent(
            r#"head -c 200000 /dev/zero | tr '\0' ' '; cat > /dev/null; echo '{"quality_score": 0.8}'"#,
        );
        let step = Step::new("s", "sh").with_param("corpus", "x".repeat(200_000));
        let mut ctx = StepContext::new("p", "s");
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            agent.execute_step(&step, &mut ctx),
        )
        .await
        .expect("agent process deadlocked")
        .unwrap();
        assert_eq!(result.quality_score, 0.8);
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let agent = shell_agent("cat > /dev/null; echo boom >&2; exit 3");
        let mut ctx = StepContext::new("p", "s");
        let err = agent
            .execute_step(&Step::new("s", "sh"), &mut ctx)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AgentError::NonZeroExit {
                code: 3,
                stderr: "boom".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_reported_failure_is_an_error() {
        let agent =
            shell_agent(r#"cat > /dev/null; echo '{"status": "failed", "error": "no sources"}'"#);
        let mut ctx = StepContext::new("p", "s");
        let err = agent
            .execute_step(&Step::new("s", "sh"), &mut ctx)
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::Failed("no sources".to_string()));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let mut agent = shell_agent("");
        agent.binary = PathBuf::from("/nonexistent/agent-binary");
        let mut ctx = StepContext::new("p", "s");
        let err = agent
            .execute_step(&Step::new("s", "sh"), &mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Spawn(_)));
    }
}
