//! Built-in source providers

pub mod booru;
pub mod local;

use imgflow_sdk::{ActionSchema, SourceConfig, SourceDescriptor, SourceKind, SourceProvider};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use crate::config::EngineConfig;

pub use booru::{BooruFlavor, BooruSource};
pub use local::LocalSource;

/// Extensions the local source picks up by default
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif", "tiff", "webp"];

pub fn builtin_providers(config: &EngineConfig) -> Vec<Arc<dyn SourceProvider>> {
    vec![
        Arc::new(LocalSource),
        Arc::new(BooruSource::new(
            "danbooru",
            "Danbooru",
            BooruFlavor::Danbooru,
            config.provider("danbooru"),
        )),
        Arc::new(BooruSource::new(
            "yandere",
            "yande.re",
            BooruFlavor::Moebooru,
            config.provider("yandere"),
        )),
    ]
}

pub fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            extensions.iter().any(|x| x.trim_start_matches('.').eq_ignore_ascii_case(&e))
        })
        .unwrap_or(false)
}

/// Fill `login` / `api_key` from `IMGFLOW_<SOURCE>_LOGIN` / `IMGFLOW_<SOURCE>_API_KEY`
/// when the configuration does not carry them.
pub fn apply_env_credentials(config: &mut SourceConfig) {
    let prefix = format!("IMGFLOW_{}", config.source_type.to_ascii_uppercase());
    for (param, suffix) in [("login", "LOGIN"), ("api_key", "API_KEY")] {
        if config.parameters.contains_key(param) {
            continue;
        }
        if let Ok(value) = std::env::var(format!("{}_{}", prefix, suffix)) {
            if !value.is_empty() {
                config
                    .parameters
                    .insert(param.to_string(), Value::String(value));
            }
        }
    }
}

/// Source descriptor built from a derived parameter schema
pub(crate) fn descriptor_from(schema: ActionSchema, kind: SourceKind) -> SourceDescriptor {
    SourceDescriptor {
        id: schema.metadata.id,
        name: schema.metadata.name,
        description: schema.metadata.description,
        kind,
        params: schema.params,
    }
}
