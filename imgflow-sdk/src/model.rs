//! Workflow, step and source definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use uuid::Uuid;

use crate::error::WorkflowEditError;
use crate::schema::Parameters;

/// Source type id of the built-in local directory provider.
pub const LOCAL_SOURCE: &str = "local";

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// One configured unit of work: an action plus its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Stable across reorders and edits
    #[serde(default = "new_id")]
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub parameters: Parameters,
}

impl Step {
    pub fn new(action: impl Into<String>, parameters: Parameters) -> Self {
        Self {
            id: new_id(),
            action: action.into(),
            parameters,
        }
    }

    /// Convenience for building parameters from a `json!` object literal.
    pub fn with_json(action: impl Into<String>, parameters: Value) -> Self {
        let parameters = match parameters {
            Value::Object(map) => map,
            _ => Parameters::new(),
        };
        Self::new(action, parameters)
    }
}

/// User-defined ordered list of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default = "new_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: name.into(),
            description: description.into(),
            steps: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn position(&self, step_id: &str) -> Result<usize, WorkflowEditError> {
        self.steps
            .iter()
            .position(|s| s.id == step_id)
            .ok_or_else(|| WorkflowEditError::StepNotFound(step_id.to_string()))
    }

    /// Append a step, returning its id
    pub fn add_step(&mut self, step: Step) -> String {
        let id = step.id.clone();
        self.steps.push(step);
        self.touch();
        id
    }

    /// Insert a step at `index` (clamped to the end of the list)
    pub fn insert_step(&mut self, index: usize, step: Step) -> String {
        let id = step.id.clone();
        let index = index.min(self.steps.len());
        self.steps.insert(index, step);
        self.touch();
        id
    }

    pub fn remove_step(&mut self, step_id: &str) -> Result<Step, WorkflowEditError> {
        let idx = self.position(step_id)?;
        let step = self.steps.remove(idx);
        self.touch();
        Ok(step)
    }

    pub fn get_step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Replace a step's action and/or parameters; the id never changes.
    pub fn update_step(
        &mut self,
        step_id: &str,
        action: Option<String>,
        parameters: Option<Parameters>,
    ) -> Result<(), WorkflowEditError> {
        let idx = self.position(step_id)?;
        let step = &mut self.steps[idx];
        if let Some(action) = action {
            step.action = action;
        }
        if let Some(parameters) = parameters {
            step.parameters = parameters;
        }
        self.touch();
        Ok(())
    }

    /// Move a step to `new_index`, clamped into range.
    pub fn move_step(&mut self, step_id: &str, new_index: usize) -> Result<(), WorkflowEditError> {
        let old_index = self.position(step_id)?;
        let new_index = new_index.min(self.steps.len() - 1);
        if old_index != new_index {
            let step = self.steps.remove(old_index);
            self.steps.insert(new_index, step);
            self.touch();
        }
        Ok(())
    }

    /// Reorder all steps at once. `order` must be a permutation of the current step ids;
    /// otherwise the workflow is left untouched.
    pub fn reorder(&mut self, order: &[String]) -> Result<(), WorkflowEditError> {
        let current: HashSet<&str> = self.steps.iter().map(|s| s.id.as_str()).collect();
        let requested: HashSet<&str> = order.iter().map(String::as_str).collect();

        if order.len() != self.steps.len() || requested != current {
            let missing = current
                .difference(&requested)
                .map(|s| s.to_string())
                .collect();
            let unknown = requested
                .difference(&current)
                .map(|s| s.to_string())
                .collect();
            return Err(WorkflowEditError::ReorderMismatch { missing, unknown });
        }

        let mut remaining = std::mem::take(&mut self.steps);
        for id in order {
            if let Some(pos) = remaining.iter().position(|s| &s.id == id) {
                self.steps.push(remaining.swap_remove(pos));
            }
        }
        self.touch();
        Ok(())
    }

    /// Copy this workflow under a new id; every step gets a fresh id too.
    pub fn duplicate(&self, new_name: Option<&str>) -> Workflow {
        let name = new_name
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} (copy)", self.name));
        let mut copy = Workflow::new(name, self.description.clone());
        for step in &self.steps {
            copy.add_step(Step::new(step.action.clone(), step.parameters.clone()));
        }
        copy
    }

    /// Structural checks that do not need an action registry.
    pub fn check(&self) -> Result<(), WorkflowEditError> {
        let mut problems = Vec::new();
        if self.name.trim().is_empty() {
            problems.push("workflow name must not be empty".to_string());
        }
        let mut seen = HashSet::new();
        for (idx, step) in self.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                problems.push(format!("step {} has an empty id", idx + 1));
            } else if !seen.insert(step.id.as_str()) {
                problems.push(format!("duplicate step id '{}'", step.id));
            }
            if step.action.trim().is_empty() {
                problems.push(format!("step {} has no action", idx + 1));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(WorkflowEditError::InvalidWorkflow(problems))
        }
    }

    pub fn to_json(&self) -> Result<String, WorkflowEditError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, WorkflowEditError> {
        let workflow: Workflow = serde_json::from_str(json)?;
        workflow.check()?;
        Ok(workflow)
    }
}

/// Where the images of an execution come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_type: String,
    #[serde(default)]
    pub parameters: Parameters,
}

impl SourceConfig {
    pub fn new(source_type: impl Into<String>, parameters: Parameters) -> Self {
        Self {
            source_type: source_type.into(),
            parameters,
        }
    }

    pub fn local(directory: impl AsRef<Path>) -> Self {
        let mut parameters = Parameters::new();
        parameters.insert(
            "directory".to_string(),
            Value::String(directory.as_ref().to_string_lossy().to_string()),
        );
        Self::new(LOCAL_SOURCE, parameters)
    }

    pub fn remote<S: Into<String>>(
        provider: impl Into<String>,
        tags: impl IntoIterator<Item = S>,
        limit: Option<u64>,
    ) -> Self {
        let mut parameters = Parameters::new();
        let tags: Vec<Value> = tags.into_iter().map(|t| Value::String(t.into())).collect();
        parameters.insert("tags".to_string(), Value::Array(tags));
        if let Some(limit) = limit {
            parameters.insert("limit".to_string(), Value::from(limit));
        }
        Self::new(provider, parameters)
    }

    pub fn is_local(&self) -> bool {
        self.source_type == LOCAL_SOURCE
    }

    /// Tag list of a remote configuration (empty for local sources).
    pub fn tags(&self) -> Vec<String> {
        self.parameters
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A source configuration the user saved under a label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedSource {
    pub label: String,
    pub config: SourceConfig,
    pub created_at: DateTime<Utc>,
}

impl SavedSource {
    pub fn new(label: impl Into<String>, config: SourceConfig) -> Self {
        Self {
            label: label.into(),
            config,
            created_at: Utc::now(),
        }
    }

    pub fn tags(&self) -> Vec<String> {
        self.config.tags()
    }
}
