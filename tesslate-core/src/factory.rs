//! Agent factory (§4.K): turns a persisted agent definition into a runnable
//! agent, dispatching on a name→class table that's open for extension at
//! runtime rather than a closed enum.

use crate::agent::{AgentRunConfig, ModelAdapter};
use crate::tools::ToolRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("system prompt must not be empty or whitespace-only")]
    EmptySystemPrompt,
    #[error("unknown agent_type '{0}'")]
    UnknownAgentType(String),
}

/// A loaded agent, ready to run. `StreamAgent` (plain completion, no tool
/// loop) and `IterativeAgent` (the §4.J state machine) both produce this;
/// the caller drives it the same way regardless of kind.
pub enum Agent {
    Stream { system_prompt: String, model: Arc<dyn ModelAdapter> },
    Iterative { config: AgentRunConfig, model: Arc<dyn ModelAdapter>, tools: ToolRegistry },
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Agent::Stream { .. } => f.debug_struct("Agent::Stream").finish_non_exhaustive(),
            Agent::Iterative { .. } => f.debug_struct("Agent::Iterative").finish_non_exhaustive(),
        }
    }
}

/// Row shape this factory consumes — the fields of the persisted agent
/// definition that matter for instantiation. Anything else (display name,
/// ownership, timestamps) lives in the embedding application's own model
/// and never needs to reach `tesslate-core`.
#[derive(Debug, Clone)]
pub struct AgentModel {
    pub agent_type: String,
    pub system_prompt: String,
    pub specialization_prompt: String,
    pub tools: Option<Vec<String>>,
    pub deployment_mode: String,
    pub container_name: String,
    pub project_path: String,
    pub run_id: String,
}

type Builder = Arc<dyn Fn(AgentModel, Arc<dyn ModelAdapter>, &ToolRegistry) -> Agent + Send + Sync>;

/// Name→class table (§4.K), open for extension at runtime: a deployment
/// can register e.g. a `ReActAgent` builder that reuses the iterative
/// loop's machinery with a different system prompt, without a new enum
/// variant or a fork of this crate.
#[derive(Clone)]
pub struct AgentFactory {
    builders: HashMap<String, Builder>,
}

impl Default for AgentFactory {
    fn default() -> Self {
        let mut factory = Self { builders: HashMap::new() };
        factory.register("StreamAgent", Arc::new(build_stream_agent));
        factory.register("IterativeAgent", Arc::new(build_iterative_agent));
        factory
    }
}

impl AgentFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent_type: impl Into<String>, builder: Builder) {
        self.builders.insert(agent_type.into(), builder);
    }

    /// Build an agent from a persisted definition (§4.K steps 1-4).
    pub fn create_agent_from_db_model(
        &self,
        agent_model: AgentModel,
        model_adapter: Arc<dyn ModelAdapter>,
        global_registry: &ToolRegistry,
    ) -> Result<Agent, FactoryError> {
        if agent_model.system_prompt.trim().is_empty() {
            return Err(FactoryError::EmptySystemPrompt);
        }
        let builder = self
            .builders
            .get(&agent_model.agent_type)
            .ok_or_else(|| FactoryError::UnknownAgentType(agent_model.agent_type.clone()))?
            .clone();
        Ok(builder(agent_model, model_adapter, global_registry))
    }
}

fn build_stream_agent(agent_model: AgentModel, model: Arc<dyn ModelAdapter>, _global_registry: &ToolRegistry) -> Agent {
    Agent::Stream { system_prompt: agent_model.system_prompt, model }
}

fn build_iterative_agent(agent_model: AgentModel, model: Arc<dyn ModelAdapter>, global_registry: &ToolRegistry) -> Agent {
    let tools = match &agent_model.tools {
        Some(whitelist) => global_registry.scoped(whitelist),
        None => global_registry.clone(),
    };
    let config = AgentRunConfig {
        system_prompt: agent_model.system_prompt,
        specialization_prompt: agent_model.specialization_prompt,
        chat_history: Vec::new(),
        user_request: String::new(),
        deployment_mode: agent_model.deployment_mode,
        container_name: agent_model.container_name,
        project_path: agent_model.project_path,
        run_id: agent_model.run_id,
    };
    Agent::Iterative { config, model, tools }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentError;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct NullModel;
    #[async_trait]
    impl ModelAdapter for NullModel {
        async fn stream(&self, _messages: Vec<crate::agent::messages::ChatMessage>, _tx: mpsc::Sender<String>) -> Result<(), AgentError> {
            Ok(())
        }
    }

    fn model(agent_type: &str) -> AgentModel {
        AgentModel {
            agent_type: agent_type.to_string(),
            system_prompt: "You are an agent.".to_string(),
            specialization_prompt: String::new(),
            tools: None,
            deployment_mode: "docker".to_string(),
            container_name: "c".to_string(),
            project_path: "/app".to_string(),
            run_id: "run-1".to_string(),
        }
    }

    #[test]
    fn rejects_empty_system_prompt() {
        let factory = AgentFactory::new();
        let mut m = model("StreamAgent");
        m.system_prompt = "   ".to_string();
        let registry = ToolRegistry::new();
        let err = factory.create_agent_from_db_model(m, Arc::new(NullModel), &registry).unwrap_err();
        assert!(matches!(err, FactoryError::EmptySystemPrompt));
    }

    #[test]
    fn rejects_unknown_agent_type() {
        let factory = AgentFactory::new();
        let registry = ToolRegistry::new();
        let err = factory
            .create_agent_from_db_model(model("NoSuchAgent"), Arc::new(NullModel), &registry)
            .unwrap_err();
        assert!(matches!(err, FactoryError::UnknownAgentType(_)));
    }

    #[test]
    fn iterative_agent_with_no_tools_list_gets_global_registry() {
        let factory = AgentFactory::new();
        let mut registry = ToolRegistry::new();
        crate::tools::builtin::register_builtins(&mut registry);
        let global_len = registry.len();
        let agent = factory
            .create_agent_from_db_model(model("IterativeAgent"), Arc::new(NullModel), &registry)
            .unwrap();
        match agent {
            Agent::Iterative { tools, .. } => assert_eq!(tools.len(), global_len),
            _ => panic!("expected iterative agent"),
        }
    }

    #[test]
    fn iterative_agent_with_tools_list_gets_scoped_registry() {
        let factory = AgentFactory::new();
        let mut registry = ToolRegistry::new();
        crate::tools::builtin::register_builtins(&mut registry);
        let mut m = model("IterativeAgent");
        m.tools = Some(vec!["read_file".to_string()]);
        let agent = factory.create_agent_from_db_model(m, Arc::new(NullModel), &registry).unwrap();
        match agent {
            Agent::Iterative { tools, .. } => assert_eq!(tools.len(), 1),
            _ => panic!("expected iterative agent"),
        }
    }

    #[test]
    fn stream_agent_ignores_tools() {
        let factory = AgentFactory::new();
        let mut registry = ToolRegistry::new();
        crate::tools::builtin::register_builtins(&mut registry);
        let mut m = model("StreamAgent");
        m.tools = Some(vec!["read_file".to_string()]);
        let agent = factory.create_agent_from_db_model(m, Arc::new(NullModel), &registry).unwrap();
        assert!(matches!(agent, Agent::Stream { .. }));
    }
}
