//! Action and source registries
//!
//! Both registries are filled once at startup. The runner resolves every step and
//! the source through them before an execution starts, so a workflow that refers
//! to an unknown action or carries bad parameters is rejected up front.

use imgflow_sdk::{
    ActionSchema, SourceConfig, SourceDescriptor, SourceProvider, Step, StepAction, StepScope,
    Workflow,
};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::sources;
use crate::steps;

/// A workflow step bound to its action implementation
#[derive(Clone)]
pub struct ResolvedStep {
    /// Position in the workflow (0-based)
    pub index: usize,
    pub step: Step,
    pub action: Arc<dyn StepAction>,
    pub scope: StepScope,
}

/// Registry of step actions by id
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: BTreeMap<String, Arc<dyn StepAction>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with all built-in steps
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for action in steps::builtin_actions() {
            registry.register(action);
        }
        registry
    }

    /// Add an action; a later registration with the same id replaces the earlier one
    pub fn register(&mut self, action: Arc<dyn StepAction>) {
        let id = action.schema().metadata.id;
        self.actions.insert(id, action);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn StepAction>> {
        self.actions.get(id).cloned()
    }

    /// Schemas sorted by category, then id
    pub fn list(&self) -> Vec<ActionSchema> {
        let mut schemas: Vec<ActionSchema> = self.actions.values().map(|a| a.schema()).collect();
        schemas.sort_by(|a, b| {
            a.metadata
                .category
                .cmp(&b.metadata.category)
                .then_with(|| a.metadata.id.cmp(&b.metadata.id))
        });
        schemas
    }

    /// Resolve every step of `workflow`, or report every problem found
    pub fn validate_workflow(&self, workflow: &Workflow) -> Result<Vec<ResolvedStep>, Vec<String>> {
        let mut problems = Vec::new();

        if let Err(err) = workflow.check() {
            problems.push(err.to_string());
        }
        if workflow.steps.is_empty() {
            problems.push("workflow has no steps".to_string());
        }

        let mut resolved = Vec::with_capacity(workflow.steps.len());
        for (index, step) in workflow.steps.iter().enumerate() {
            let Some(action) = self.get(&step.action) else {
                problems.push(format!("step {}: unknown action '{}'", index + 1, step.action));
                continue;
            };
            let schema = action.schema();
            for problem in schema.validate(&step.parameters) {
                problems.push(format!("step {} ({}): {}", index + 1, step.action, problem));
            }
            resolved.push(ResolvedStep {
                index,
                step: step.clone(),
                action,
                scope: schema.scope,
            });
        }

        if problems.is_empty() {
            Ok(resolved)
        } else {
            Err(problems)
        }
    }
}

/// Registry of source providers by source type
#[derive(Clone, Default)]
pub struct SourceRegistry {
    providers: BTreeMap<String, Arc<dyn SourceProvider>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local directory plus the remote providers configured in `config`
    pub fn with_builtins(config: &EngineConfig) -> Self {
        let mut registry = Self::new();
        for provider in sources::builtin_providers(config) {
            registry.register(provider);
        }
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn SourceProvider>) {
        let id = provider.descriptor().id;
        self.providers.insert(id, provider);
    }

    pub fn get(&self, source_type: &str) -> Option<Arc<dyn SourceProvider>> {
        self.providers.get(source_type).cloned()
    }

    pub fn list(&self) -> Vec<SourceDescriptor> {
        self.providers.values().map(|p| p.descriptor()).collect()
    }

    /// Provider for `config`, after checking its parameters
    pub fn resolve(&self, config: &SourceConfig) -> Result<Arc<dyn SourceProvider>, Vec<String>> {
        let Some(provider) = self.get(&config.source_type) else {
            return Err(vec![format!("unknown source type '{}'", config.source_type)]);
        };
        let problems: Vec<String> = provider
            .check(&config.parameters)
            .into_iter()
            .map(|p| format!("source ({}): {}", config.source_type, p))
            .collect();
        if problems.is_empty() {
            Ok(provider)
        } else {
            Err(problems)
        }
    }
}
