//! Step executor contract
//!
//! Every action is a [`StepAction`]. The runner treats them uniformly: it hands over
//! an image (or, for batch-scope actions, every successful image), the step's
//! parameters and a [`WorkingContext`], and folds the returned [`StepOutcome`]
//! into the execution record.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::schema::{ActionSchema, Parameters, StepScope};

/// One image flowing through the step chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageHandle {
    /// Position in enumeration order (0-based)
    pub index: u64,
    /// Display name, normally the original file name
    pub name: String,
    /// Current file for this image; replaced by each step's artifact
    pub path: PathBuf,
    #[serde(default)]
    pub meta: Parameters,
}

impl ImageHandle {
    pub fn new(index: u64, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("image_{}", index));
        Self {
            index,
            name,
            path,
            meta: Parameters::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.meta.insert(key.to_string(), value.into());
        self
    }

    /// File stem of the display name
    pub fn stem(&self) -> String {
        Path::new(&self.name)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.name.clone())
    }

    /// Handle for the next step after `artifact` was produced.
    pub fn advance(&self, artifact: &Artifact) -> ImageHandle {
        let mut next = self.clone();
        if let Some(path) = &artifact.path {
            next.path = path.clone();
        }
        for (k, v) in &artifact.meta {
            next.meta.insert(k.clone(), v.clone());
        }
        next
    }
}

/// What a successful step produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// New file for the image; `None` keeps the input file
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub meta: Parameters,
}

impl Artifact {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            meta: Parameters::new(),
        }
    }

    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.meta.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Success(Artifact),
    /// The image leaves the chain without error (e.g. filtered out)
    Skipped(String),
    Failed(String),
}

impl StepOutcome {
    pub fn failed(reason: impl ToString) -> Self {
        StepOutcome::Failed(reason.to_string())
    }

    pub fn skipped(reason: impl ToString) -> Self {
        StepOutcome::Skipped(reason.to_string())
    }
}

/// Input handed to [`StepAction::apply`].
#[derive(Debug, Clone, Copy)]
pub enum StepInput<'a> {
    Image(&'a ImageHandle),
    Batch(&'a [ImageHandle]),
}

/// Per-execution, per-step scope for side effects.
#[derive(Debug, Clone)]
pub struct WorkingContext {
    pub execution_id: Uuid,
    pub output_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub step_id: String,
    pub step_index: usize,
    /// Index of the image being processed; `None` for batch steps
    pub image_index: Option<u64>,
    /// True for the last per-image step and for batch steps: their files are final output
    pub final_stage: bool,
}

impl WorkingContext {
    /// Where a step should write `file_name`.
    ///
    /// Final-stage files go to the output directory under a name claimed by
    /// [`claim_unique_path`], so the returned file already exists (empty) and is the
    /// caller's to overwrite. Intermediate files go to a per-step scratch folder,
    /// prefixed with the image index. Parent directories are created.
    pub fn artifact_path(&self, file_name: &str) -> std::io::Result<PathBuf> {
        if self.final_stage {
            std::fs::create_dir_all(&self.output_dir)?;
            return claim_unique_path(&self.output_dir, file_name);
        }
        let dir = self
            .scratch_dir
            .join(format!("step_{:02}", self.step_index + 1));
        std::fs::create_dir_all(&dir)?;
        Ok(match self.image_index {
            Some(index) => dir.join(format!("{}_{}", index, file_name)),
            None => dir.join(file_name),
        })
    }

    pub fn is_in_output(&self, path: &Path) -> bool {
        path.starts_with(&self.output_dir)
    }
}

/// Attempts before [`claim_unique_path`] gives up
const CLAIM_ATTEMPTS: usize = 16;

/// `dir/<stem>_<8 hex chars>.<ext>`
fn suffixed_path(dir: &Path, file_name: &str) -> PathBuf {
    let name = Path::new(file_name);
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| file_name.to_string());
    let suffix = &Uuid::new_v4().simple().to_string()[..8];
    match name.extension() {
        Some(ext) => dir.join(format!("{}_{}.{}", stem, suffix, ext.to_string_lossy())),
        None => dir.join(format!("{}_{}", stem, suffix)),
    }
}

/// Create and return `dir/file_name`, or `dir/<stem>_<8 hex chars>.<ext>` when that
/// name is taken.
///
/// The file is created with `create_new`, so two concurrent callers never get the
/// same path. It is left empty for the caller to overwrite.
pub fn claim_unique_path(dir: &Path, file_name: &str) -> std::io::Result<PathBuf> {
    let mut candidate = dir.join(file_name);
    for _ in 0..CLAIM_ATTEMPTS {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                candidate = suffixed_path(dir, file_name);
            }
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free name for {} in {}", file_name, dir.display()),
    ))
}

/// Decode a step's parameter map into its typed parameter struct.
pub fn decode_params<T: DeserializeOwned>(params: &Parameters) -> Result<T, String> {
    serde_json::from_value(Value::Object(params.clone()))
        .map_err(|e| format!("invalid parameters: {}", e))
}

/// Implemented by every step action.
#[async_trait]
pub trait StepAction: Send + Sync {
    fn schema(&self) -> ActionSchema;

    fn scope(&self) -> StepScope {
        self.schema().scope
    }

    async fn apply(
        &self,
        input: StepInput<'_>,
        params: &Parameters,
        ctx: &WorkingContext,
    ) -> StepOutcome;
}
