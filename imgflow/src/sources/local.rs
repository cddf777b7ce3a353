//! Local directory source

use futures::stream::{self, StreamExt};
use imgflow_sdk::{
    async_trait, decode_params, ActionDefinition, ActionParams, ImageHandle, ItemFetchError,
    OpenedSource, Parameters, SourceContext, SourceDescriptor, SourceError, SourceKind,
    SourceProvider,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use super::{descriptor_from, has_extension, IMAGE_EXTENSIONS};

#[derive(Debug, Deserialize, ActionParams)]
#[action(
    id = "local",
    name = "Local directory",
    description = "Images from a directory on disk"
)]
pub struct LocalParams {
    #[param(label = "Directory", description = "Folder to read images from")]
    pub directory: PathBuf,
    #[param(label = "Recursive", description = "Include sub-directories")]
    #[serde(default)]
    pub recursive: bool,
    #[param(
        label = "Extensions",
        description = "File extensions to include (default: common image types)"
    )]
    pub extensions: Option<Vec<String>>,
}

pub struct LocalSource;

impl LocalSource {
    /// Sorted image files under `params.directory`, plus entries that could not be read
    fn enumerate(params: &LocalParams) -> Vec<Result<PathBuf, ItemFetchError>> {
        let extensions: Vec<String> = params
            .extensions
            .clone()
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| IMAGE_EXTENSIONS.iter().map(|s| s.to_string()).collect());
        let max_depth = if params.recursive { usize::MAX } else { 1 };

        let mut files = Vec::new();
        let mut errors = Vec::new();
        for entry in WalkDir::new(&params.directory)
            .min_depth(1)
            .max_depth(max_depth)
        {
            match entry {
                Ok(entry) => {
                    let path = entry.path();
                    if entry.file_type().is_file() && has_extension(path, &extensions) {
                        files.push(path.to_path_buf());
                    }
                }
                Err(err) => {
                    let item = err
                        .path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| params.directory.display().to_string());
                    errors.push(ItemFetchError::new(item, err));
                }
            }
        }
        files.sort();

        files
            .into_iter()
            .map(Ok)
            .chain(errors.into_iter().map(Err))
            .collect()
    }
}

fn check_directory(dir: &Path) -> Result<(), SourceError> {
    if !dir.exists() {
        return Err(SourceError::MissingDirectory(dir.to_path_buf()));
    }
    if !dir.is_dir() {
        return Err(SourceError::NotADirectory(dir.to_path_buf()));
    }
    std::fs::read_dir(dir).map_err(|e| SourceError::Unreadable {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(())
}

#[async_trait]
impl SourceProvider for LocalSource {
    fn descriptor(&self) -> SourceDescriptor {
        descriptor_from(LocalParams::schema(), SourceKind::Local)
    }

    async fn open(
        &self,
        params: &Parameters,
        _ctx: &SourceContext,
    ) -> Result<OpenedSource, SourceError> {
        let params: LocalParams = decode_params(params).map_err(SourceError::InvalidParameters)?;
        check_directory(&params.directory)?;

        let entries = tokio::task::spawn_blocking(move || LocalSource::enumerate(&params))
            .await
            .map_err(|e| SourceError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        debug!(count = entries.len(), "Enumerated local directory");
        let total = entries.len() as u64;
        let images = stream::iter(entries.into_iter().enumerate().map(|(index, entry)| {
            let index = index as u64;
            entry
                .map(|path| ImageHandle::new(index, path).with_meta("source", "local"))
                .map_err(|e| e.at(index))
        }))
        .boxed();

        Ok(OpenedSource {
            images,
            total_hint: Some(total),
        })
    }
}
