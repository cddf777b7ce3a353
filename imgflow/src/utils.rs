//! Utility functions for paths and workflow files

use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use imgflow_sdk::Workflow;
use std::path::Path;

pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "imgflow", "imgflow")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowFormat {
    Json,
    Yaml,
}

impl WorkflowFormat {
    /// Pick the format from a file extension (`.json`, `.yaml`, `.yml`)
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("json") => Ok(WorkflowFormat::Json),
            Some("yaml") | Some("yml") => Ok(WorkflowFormat::Yaml),
            _ => Err(anyhow!(
                "Unsupported workflow file '{}': expected .json, .yaml or .yml",
                path.display()
            )),
        }
    }
}

/// Read a workflow definition from a JSON or YAML file
pub fn import_workflow(path: &Path) -> Result<Workflow> {
    let format = WorkflowFormat::from_path(path)?;
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let workflow = match format {
        WorkflowFormat::Json => Workflow::from_json(&content)?,
        WorkflowFormat::Yaml => {
            let workflow: Workflow = serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            workflow.check()?;
            workflow
        }
    };

    Ok(workflow)
}

/// Write a workflow definition, format chosen by extension
pub fn export_workflow(workflow: &Workflow, path: &Path) -> Result<()> {
    let content = match WorkflowFormat::from_path(path)? {
        WorkflowFormat::Json => workflow.to_json()?,
        WorkflowFormat::Yaml => serde_yaml::to_string(workflow)?,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
