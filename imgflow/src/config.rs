//! Engine configuration
//!
//! Settings are read once into an [`EngineConfig`] and handed to the runner as an
//! `Arc` snapshot. A running execution never sees later changes.

use anyhow::{Context, Result};
use imgflow_sdk::Parameters;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::project_dirs;

/// Per-provider settings for remote sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub base_url: String,
    pub default_limit: u64,
    pub user_agent: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            default_limit: 100,
            user_agent: format!("imgflow/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ProviderSettings {
    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            ..Self::default()
        }
    }

    /// Parameter-map form handed to providers through `SourceContext::settings`
    pub fn to_parameters(&self) -> Parameters {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => Parameters::new(),
        }
    }

    /// Inverse of [`to_parameters`](Self::to_parameters); `None` for an empty map
    pub fn from_parameters(params: &Parameters) -> Option<Self> {
        if params.is_empty() {
            return None;
        }
        serde_json::from_value(serde_json::Value::Object(params.clone())).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub output_directory: PathBuf,
    pub temp_directory: PathBuf,
    pub database_path: PathBuf,
    /// Images processed concurrently within one execution
    pub max_workers: usize,
    pub image_timeout_secs: Option<u64>,
    /// Processed images between mid-run record saves (0 disables checkpoints)
    pub checkpoint_interval: u64,
    pub recorder_retries: u32,
    pub recorder_retry_delay_ms: u64,
    pub event_capacity: usize,
    /// Where `<execution id>_log.txt` files go; `None` disables them
    pub log_directory: Option<PathBuf>,
    pub log_level: String,
    pub sources: BTreeMap<String, ProviderSettings>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut sources = BTreeMap::new();
        sources.insert(
            "danbooru".to_string(),
            ProviderSettings::with_base_url("https://danbooru.donmai.us"),
        );
        sources.insert(
            "yandere".to_string(),
            ProviderSettings::with_base_url("https://yande.re"),
        );

        Self {
            output_directory: default_output_directory(),
            temp_directory: std::env::temp_dir(),
            database_path: default_database_path(),
            max_workers: 1,
            image_timeout_secs: None,
            checkpoint_interval: 10,
            recorder_retries: 3,
            recorder_retry_delay_ms: 200,
            event_capacity: 1000,
            log_directory: Some(default_log_directory()),
            log_level: "info".to_string(),
            sources,
        }
    }
}

impl EngineConfig {
    /// Load from the default location; a missing file yields the defaults
    pub fn load() -> Result<Self> {
        Self::load_from(&config_file_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: EngineConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn provider(&self, id: &str) -> ProviderSettings {
        self.sources.get(id).cloned().unwrap_or_default()
    }

    pub fn image_timeout(&self) -> Option<Duration> {
        self.image_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn worker_count(&self) -> usize {
        self.max_workers.max(1)
    }
}

pub fn config_file_path() -> PathBuf {
    match project_dirs() {
        Some(dirs) => dirs.config_dir().join("config.json"),
        None => PathBuf::from(".imgflow-config.json"),
    }
}

fn default_output_directory() -> PathBuf {
    dirs::picture_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ProcessedImages")
}

fn default_log_directory() -> PathBuf {
    match project_dirs() {
        Some(dirs) => dirs.data_dir().join("logs"),
        None => PathBuf::from("logs"),
    }
}

fn default_database_path() -> PathBuf {
    match project_dirs() {
        Some(dirs) => dirs.data_dir().join("executions.db"),
        None => PathBuf::from(".imgflow-executions.db"),
    }
}
