//! Agents execute individual plan steps
//!
//! The engine only knows the [`Agent`] trait; what an agent does to produce a
//! result is its own business. Agents must tolerate being called again with the
//! same step and context when a previous attempt failed.

mod echo;
mod process;

pub use echo::EchoAgent;
pub use process::ProcessAgent;

use crate::config::{AgentDefinition, AgentKind, Config};
use crate::error::AgentError;
use crate::plan::{Step, StepResult};
use crate::runner::StepContext;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Name of the echo agent registered when the config does not define one
pub const BUILTIN_ECHO: &str = "echo";

#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    async fn execute_step(
        &self,
        step: &Step,
        ctx: &mut StepContext,
    ) -> Result<StepResult, AgentError>;
}

type StepFn = dyn Fn(&Step, &mut StepContext) -> Result<StepResult, AgentError> + Send + Sync;

/// Adapts a synchronous closure into an agent
pub struct FnAgent {
    name: String,
    func: Box<StepFn>,
}

impl FnAgent {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Step, &mut StepContext) -> Result<StepResult, AgentError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }
}

#[async_trait]
impl Agent for FnAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute_step(
        &self,
        step: &Step,
        ctx: &mut StepContext,
    ) -> Result<StepResult, AgentError> {
        (self.func)(step, ctx)
    }
}

/// Agents by name
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every agent the config defines, plus the built-in echo agent
    /// unless the config already uses that name.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        for definition in &config.agents {
            registry.register_arc(create_agent(definition));
        }
        if registry.get(BUILTIN_ECHO).is_none() {
            registry.register(EchoAgent::new(BUILTIN_ECHO, 1.0));
        }
        registry
    }

    pub fn register(&mut self, agent: impl Agent + 'static) -> &mut Self {
        self.register_arc(Arc::new(agent))
    }

    pub fn register_arc(&mut self, agent: Arc<dyn Agent>) -> &mut Self {
        debug!("Registered agent {}", agent.name());
        self.agents.insert(agent.name().to_string(), agent);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// Create an agent from its config definition
pub fn create_agent(definition: &AgentDefinition) -> Arc<dyn Agent> {
    match definition.kind {
        AgentKind::Echo => Arc::new(EchoAgent::new(
            definition.name.clone(),
            definition.quality_score,
        )),
        AgentKind::Process => Arc::new(ProcessAgent {
            name: definition.name.clone(),
            binary: definition.binary.clone().unwrap_or_default(),
            args: definition.args.clone(),
            working_dir: definition
                .working_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(".")),
            env: definition.env.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_from_config_adds_echo() {
        let mut config = Config::default();
        config.agents.push(AgentDefinition::echo("writer"));
        let registry = AgentRegistry::from_config(&config);
        assert_eq!(registry.names(), vec!["echo", "writer"]);
    }

    #[test]
    fn test_config_echo_not_overridden() {
        let mut config = Config::default();
        let mut custom = AgentDefinition::echo("echo");
        custom.quality_score = 0.42;
        config.agents.push(custom);
        let registry = AgentRegistry::from_config(&config);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_fn_agent_sees_context() {
        let agent = FnAgent::new("counter", |step, ctx| {
            ctx.notes.push(format!("ran {}", step.id));
            Ok(StepResult::success(0.9).with_payload("attempt", ctx.retry.attempt))
        });
        let step = Step::new("s1", "counter");
        let mut ctx = StepContext::new("p", "s1");
        ctx.retry.attempt = 2;

        let result = agent.execute_step(&step, &mut ctx).await.unwrap();
        assert_eq!(result.payload["attempt"], 2);
        assert_eq!(ctx.notes, vec!["ran s1"]);
    }
}
