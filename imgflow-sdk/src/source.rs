//! Source provider contract

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::SourceError;
use crate::schema::{validate_parameters, ParamSchema, Parameters};
use crate::step::ImageHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Local,
    /// Tag-based remote provider
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    pub kind: SourceKind,
    pub params: Vec<ParamSchema>,
}

/// A single item the provider could not fetch. Enumeration continues past it.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemFetchError {
    /// Enumeration position of the failed item, when the provider knows it
    pub index: Option<u64>,
    pub item: String,
    pub reason: String,
}

impl ItemFetchError {
    pub fn new(item: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            index: None,
            item: item.into(),
            reason: reason.to_string(),
        }
    }

    pub fn at(mut self, index: u64) -> Self {
        self.index = Some(index);
        self
    }
}

/// Lazy, finite, non-rewindable image sequence.
pub type ImageStream = BoxStream<'static, Result<ImageHandle, ItemFetchError>>;

pub struct OpenedSource {
    pub images: ImageStream,
    /// `None` when the source cannot count cheaply in advance
    pub total_hint: Option<u64>,
}

/// Scope a provider may use while enumerating (downloads land in `scratch_dir`).
#[derive(Debug, Clone)]
pub struct SourceContext {
    pub execution_id: Uuid,
    pub scratch_dir: PathBuf,
    /// Engine-level settings for this provider, read from the configuration
    /// in effect when the execution started
    pub settings: Parameters,
}

impl SourceContext {
    pub fn new(execution_id: Uuid, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            execution_id,
            scratch_dir: scratch_dir.into(),
            settings: Parameters::new(),
        }
    }

    pub fn with_settings(mut self, settings: Parameters) -> Self {
        self.settings = settings;
        self
    }
}

/// Non-blank entries of the `tags` parameter.
pub fn tag_list(params: &Parameters) -> Vec<String> {
    params
        .get("tags")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
pub trait SourceProvider: Send + Sync {
    fn descriptor(&self) -> SourceDescriptor;

    /// Problems with `params` that can be found without touching disk or network.
    fn check(&self, params: &Parameters) -> Vec<String> {
        let descriptor = self.descriptor();
        let mut problems = validate_parameters(&descriptor.params, params);
        if descriptor.kind == SourceKind::Remote
            && tag_list(params).is_empty()
            && !problems.iter().any(|p| p.contains("'tags'"))
        {
            problems.push("at least one tag is required".to_string());
        }
        problems
    }

    /// Fail fast on anything that prevents enumeration from starting.
    async fn open(
        &self,
        params: &Parameters,
        ctx: &SourceContext,
    ) -> Result<OpenedSource, SourceError>;
}
