//! Tag-search sources for Danbooru-style and Moebooru-style (yande.re) boards

use async_stream::stream;
use futures::StreamExt;
use imgflow_sdk::{
    async_trait, decode_params, tag_list, ActionDefinition, ActionParams, ImageHandle,
    ItemFetchError, OpenedSource, Parameters, SourceContext, SourceDescriptor, SourceError,
    SourceKind, SourceProvider,
};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use super::descriptor_from;
use crate::config::ProviderSettings;

/// Posts requested per page
const PAGE_SIZE: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BooruFlavor {
    /// `/posts.json`, `login` + `api_key`
    Danbooru,
    /// `/post.json`, `login` + `password_hash`
    Moebooru,
}

#[derive(Debug, Deserialize, ActionParams)]
#[action(id = "booru", name = "Booru", description = "Tag search on an image board")]
pub struct BooruParams {
    #[param(label = "Tags", description = "Search tags (at least one)")]
    pub tags: Vec<String>,
    #[param(label = "Limit", description = "Maximum number of images", min = "1")]
    pub limit: Option<u64>,
    #[param(label = "Login")]
    pub login: Option<String>,
    #[param(label = "API key")]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Post {
    id: u64,
    #[serde(default)]
    file_url: Option<String>,
    #[serde(default)]
    file_ext: Option<String>,
}

/// Everything a page fetch needs, cloned into the lazy stream
#[derive(Clone)]
struct Query {
    client: Client,
    endpoint: String,
    flavor: BooruFlavor,
    tags: String,
    per_page: u64,
    login: Option<String>,
    api_key: Option<String>,
}

impl Query {
    async fn fetch_page(&self, page: u64) -> Result<Vec<Post>, SourceError> {
        let mut query: Vec<(&str, String)> = vec![
            ("tags", self.tags.clone()),
            ("limit", self.per_page.to_string()),
            ("page", page.to_string()),
        ];
        if let (Some(login), Some(key)) = (&self.login, &self.api_key) {
            let key_param = match self.flavor {
                BooruFlavor::Danbooru => "api_key",
                BooruFlavor::Moebooru => "password_hash",
            };
            query.push(("login", login.clone()));
            query.push((key_param, key.clone()));
        }

        let response = self
            .client
            .get(&self.endpoint)
            .query(&query)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SourceError::Unauthorized(format!(
                "{} returned {}",
                self.endpoint, status
            )));
        }
        if !status.is_success() {
            return Err(SourceError::Http {
                status: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
            });
        }

        response.json::<Vec<Post>>().await.map_err(|e| SourceError::Http {
            status: status.as_u16(),
            message: format!("invalid response body: {}", e),
        })
    }

    async fn download(&self, post: &Post, dir: &Path) -> Result<PathBuf, String> {
        let url = post
            .file_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| "post has no downloadable file".to_string())?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| e.to_string())?;
        let bytes = response.bytes().await.map_err(|e| e.to_string())?;

        let ext = post
            .file_ext
            .clone()
            .or_else(|| extension_from_url(url))
            .unwrap_or_else(|| "jpg".to_string());
        let path = dir.join(format!("{}.{}", post.id, ext));
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| e.to_string())?;
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| e.to_string())?;
        Ok(path)
    }
}

fn request_error(err: reqwest::Error) -> SourceError {
    if err.is_connect() || err.is_timeout() {
        SourceError::Unreachable(err.to_string())
    } else if let Some(status) = err.status() {
        SourceError::Http {
            status: status.as_u16(),
            message: err.to_string(),
        }
    } else {
        SourceError::Unreachable(err.to_string())
    }
}

fn extension_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let name = path.rsplit('/').next()?;
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 5 {
        None
    } else {
        Some(ext.to_ascii_lowercase())
    }
}

/// Tag-search source. The first page is fetched in `open`; later pages and the
/// downloads themselves happen lazily as the runner pulls images.
pub struct BooruSource {
    id: String,
    name: String,
    flavor: BooruFlavor,
    settings: ProviderSettings,
    client: Client,
}

fn http_client(user_agent: &str) -> Client {
    Client::builder()
        .user_agent(user_agent.to_string())
        .timeout(Duration::from_secs(60))
        .build()
        .unwrap_or_else(|_| Client::new())
}

impl BooruSource {
    pub fn new(id: &str, name: &str, flavor: BooruFlavor, settings: ProviderSettings) -> Self {
        let client = http_client(&settings.user_agent);
        Self {
            id: id.to_string(),
            name: name.to_string(),
            flavor,
            settings,
            client,
        }
    }

    fn endpoint(&self, settings: &ProviderSettings) -> String {
        let base = settings.base_url.trim_end_matches('/');
        match self.flavor {
            BooruFlavor::Danbooru => format!("{}/posts.json", base),
            BooruFlavor::Moebooru => format!("{}/post.json", base),
        }
    }

    /// Settings from the execution's configuration, falling back to the ones given at construction
    fn effective_settings(&self, ctx: &SourceContext) -> ProviderSettings {
        ProviderSettings::from_parameters(&ctx.settings).unwrap_or_else(|| self.settings.clone())
    }
}

#[async_trait]
impl SourceProvider for BooruSource {
    fn descriptor(&self) -> SourceDescriptor {
        let mut descriptor = descriptor_from(BooruParams::schema(), SourceKind::Remote);
        descriptor.id = self.id.clone();
        descriptor.name = self.name.clone();
        descriptor.description = format!("Tag search on {}", self.name);
        descriptor
    }

    async fn open(
        &self,
        params: &Parameters,
        ctx: &SourceContext,
    ) -> Result<OpenedSource, SourceError> {
        let tags = tag_list(params);
        let params: BooruParams = decode_params(params).map_err(SourceError::InvalidParameters)?;
        if tags.is_empty() {
            return Err(SourceError::InvalidParameters(
                "at least one tag is required".to_string(),
            ));
        }
        let settings = self.effective_settings(ctx);
        if settings.base_url.is_empty() {
            return Err(SourceError::InvalidParameters(format!(
                "no base_url configured for '{}'",
                self.id
            )));
        }

        let client = if settings.user_agent == self.settings.user_agent {
            self.client.clone()
        } else {
            http_client(&settings.user_agent)
        };
        let limit = params.limit.unwrap_or(settings.default_limit).max(1);
        let query = Query {
            client,
            endpoint: self.endpoint(&settings),
            flavor: self.flavor,
            tags: tags.join(" "),
            per_page: limit.min(PAGE_SIZE),
            login: params.login,
            api_key: params.api_key,
        };

        // Fail fast: an unreachable or unauthorized provider never reaches the step chain
        let first_page = query.fetch_page(1).await?;
        debug!(
            source = %self.id,
            posts = first_page.len(),
            "Fetched first result page"
        );

        let download_dir = ctx.scratch_dir.join("downloads");
        let images = stream! {
            let mut posts = first_page;
            let mut page = 1u64;
            let mut yielded = 0u64;

            while !posts.is_empty() && yielded < limit {
                let full_page = posts.len() as u64 >= query.per_page;
                for post in posts.drain(..) {
                    if yielded >= limit {
                        break;
                    }
                    let index = yielded;
                    yielded += 1;
                    match query.download(&post, &download_dir).await {
                        Ok(path) => {
                            yield Ok(ImageHandle::new(index, path).with_meta("post_id", post.id));
                        }
                        Err(reason) => {
                            yield Err(ItemFetchError::new(format!("post {}", post.id), reason).at(index));
                        }
                    }
                }

                if yielded >= limit || !full_page {
                    break;
                }
                page += 1;
                match query.fetch_page(page).await {
                    Ok(next) => posts = next,
                    Err(err) => {
                        warn!(page, error = %err, "Failed to fetch result page");
                        yield Err(ItemFetchError::new(format!("page {}", page), err));
                        break;
                    }
                }
            }
        }
        .boxed();

        Ok(OpenedSource {
            images,
            total_hint: None,
        })
    }
}
