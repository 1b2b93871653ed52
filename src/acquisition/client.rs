//! Annotation platform access.
//!
//! [`AnnotationPlatform`] is the seam acquisition is written against.
//! [`PlatformClient`] talks to the platform's HTTP API; [`CachedPlatform`]
//! keeps fetched payloads on disk so a re-run does not hit the network.

use std::future::Future;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use snafu::prelude::*;
use tracing::debug;

/// Annotation type the acquisition keeps.
pub const SEGMENTATION: &str = "segmentation";

#[derive(Debug, Snafu)]
pub enum ClientError {
    #[snafu(display("Request to {} failed", url))]
    Request { url: String, source: reqwest::Error },

    #[snafu(display("{} returned HTTP {}: {}", url, status, body))]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[snafu(display("Could not decode response of {}", url))]
    DecodeBody { url: String, source: reqwest::Error },

    #[snafu(display("Cache access failed at {}", path.display()))]
    Cache {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Resource {
    pub id: String,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Annotation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub is_model: bool,
}

impl Annotation {
    pub fn is_segmentation(&self) -> bool {
        self.kind == SEGMENTATION
    }
}

#[async_trait]
pub trait AnnotationPlatform: Send + Sync {
    /// Project with exactly this name, if any.
    async fn project_by_name(&self, name: &str) -> Result<Option<Project>, ClientError>;

    async fn project_resources(&self, project: &Project) -> Result<Vec<Resource>, ClientError>;

    /// Raw file bytes of a resource.
    async fn resource_bytes(&self, resource: &Resource) -> Result<Vec<u8>, ClientError>;

    /// Annotations attached to a resource, optionally including model output.
    async fn annotations(
        &self,
        resource: &Resource,
        load_ai_segmentations: bool,
    ) -> Result<Vec<Annotation>, ClientError>;

    async fn annotation_bytes(&self, annotation: &Annotation) -> Result<Vec<u8>, ClientError>;
}

/// List responses come either bare or wrapped in a `data` field.
#[derive(Deserialize)]
#[serde(untagged)]
enum Listing<T> {
    Plain(Vec<T>),
    Wrapped { data: Vec<T> },
}

impl<T> Listing<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Listing::Plain(items) => items,
            Listing::Wrapped { data } => data,
        }
    }
}

/// HTTP client of the annotation platform API.
#[derive(Debug, Clone)]
pub struct PlatformClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl PlatformClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn send(&self, url: &str, query: &[(&str, String)]) -> Result<reqwest::Response, ClientError> {
        debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .header("apikey", &self.api_key)
            .query(query)
            .send()
            .await
            .context(RequestSnafu { url })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return StatusSnafu {
                url,
                status: status.as_u16(),
                body,
            }
            .fail();
        }
        Ok(response)
    }

    async fn get_list<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<Vec<T>, ClientError> {
        let url = self.url(path);
        let listing: Listing<T> = self
            .send(&url, query)
            .await?
            .json()
            .await
            .context(DecodeBodySnafu { url: &url })?;
        Ok(listing.into_vec())
    }

    async fn get_bytes(&self, path: &str) -> Result<Vec<u8>, ClientError> {
        let url = self.url(path);
        let bytes = self
            .send(&url, &[])
            .await?
            .bytes()
            .await
            .context(DecodeBodySnafu { url: &url })?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl AnnotationPlatform for PlatformClient {
    async fn project_by_name(&self, name: &str) -> Result<Option<Project>, ClientError> {
        let projects: Vec<Project> = self.get_list("projects", &[]).await?;
        Ok(projects.into_iter().find(|p| p.name == name))
    }

    async fn project_resources(&self, project: &Project) -> Result<Vec<Resource>, ClientError> {
        self.get_list(&format!("projects/{}/resources", project.id), &[])
            .await
    }

    async fn resource_bytes(&self, resource: &Resource) -> Result<Vec<u8>, ClientError> {
        self.get_bytes(&format!("resources/{}/file", resource.id)).await
    }

    async fn annotations(
        &self,
        resource: &Resource,
        load_ai_segmentations: bool,
    ) -> Result<Vec<Annotation>, ClientError> {
        let query = [
            ("resource_id", resource.id.clone()),
            ("load_ai_segmentations", load_ai_segmentations.to_string()),
        ];
        self.get_list("annotations", &query).await
    }

    async fn annotation_bytes(&self, annotation: &Annotation) -> Result<Vec<u8>, ClientError> {
        self.get_bytes(&format!("annotations/{}/file", annotation.id)).await
    }
}

/// Stores payload bytes under `<cache_dir>/{resources,annotations}/<id>`
/// and serves later requests for the same id from disk. Listings always go
/// to the wrapped platform.
#[derive(Debug, Clone)]
pub struct CachedPlatform<P> {
    inner: P,
    cache_dir: PathBuf,
}

impl<P: AnnotationPlatform> CachedPlatform<P> {
    pub fn new(inner: P, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            cache_dir: cache_dir.into(),
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn entry(&self, kind: &str, id: &str) -> PathBuf {
        self.cache_dir.join(kind).join(escape_id(id))
    }

    async fn cached<F>(&self, path: PathBuf, fetch: F) -> Result<Vec<u8>, ClientError>
    where
        F: Future<Output = Result<Vec<u8>, ClientError>> + Send,
    {
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!("Cache hit {}", path.display());
            return tokio::fs::read(&path).await.context(CacheSnafu { path: &path });
        }

        let bytes = fetch.await?;
        let dir = path.parent().unwrap_or(self.cache_dir.as_path());
        tokio::fs::create_dir_all(dir)
            .await
            .context(CacheSnafu { path: dir })?;

        // the rename must stay on one filesystem
        let staged = tempfile::Builder::new()
            .prefix(".partial")
            .tempfile_in(dir)
            .context(CacheSnafu { path: dir })?
            .into_temp_path();
        tokio::fs::write(&staged, &bytes)
            .await
            .context(CacheSnafu { path: &path })?;
        staged
            .persist(&path)
            .map_err(|e| e.error)
            .context(CacheSnafu { path: &path })?;
        Ok(bytes)
    }
}

/// File name for a platform id: `%`, path separators and a leading `.` are
/// percent-escaped, so distinct ids never share an entry.
fn escape_id(id: &str) -> String {
    let mut escaped = String::with_capacity(id.len());
    for (i, c) in id.chars().enumerate() {
        match c {
            '%' => escaped.push_str("%25"),
            '/' => escaped.push_str("%2F"),
            '\\' => escaped.push_str("%5C"),
            '.' if i == 0 => escaped.push_str("%2E"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[async_trait]
impl<P: AnnotationPlatform> AnnotationPlatform for CachedPlatform<P> {
    async fn project_by_name(&self, name: &str) -> Result<Option<Project>, ClientError> {
        self.inner.project_by_name(name).await
    }

    async fn project_resources(&self, project: &Project) -> Result<Vec<Resource>, ClientError> {
        self.inner.project_resources(project).await
    }

    async fn resource_bytes(&self, resource: &Resource) -> Result<Vec<u8>, ClientError> {
        let path = self.entry("resources", &resource.id);
        self.cached(path, self.inner.resource_bytes(resource)).await
    }

    async fn annotations(
        &self,
        resource: &Resource,
        load_ai_segmentations: bool,
    ) -> Result<Vec<Annotation>, ClientError> {
        self.inner.annotations(resource, load_ai_segmentations).await
    }

    async fn annotation_bytes(&self, annotation: &Annotation) -> Result<Vec<u8>, ClientError> {
        let path = self.entry("annotations", &annotation.id);
        self.cached(path, self.inner.annotation_bytes(annotation)).await
    }
}
