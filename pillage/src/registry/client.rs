use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt, stream};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, LINK, WWW_AUTHENTICATE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, instrument};

use super::auth::{Challenge, Credentials, DockerConfig};
use super::progress::{NoopProgress, ProgressTracker};
use super::{Blob, LayerFile, PulledImage, Registry};
use crate::cache::{self, CacheError, LayerCache};
use crate::config::{RegistryOptions, get_concurrent_downloads};
use crate::image::ImageRef;
use crate::manifest::{self, Descriptor, ImageManifest, Manifest};

const PAGE_SIZE: &str = "100";
/// Ceiling for blobs whose descriptor does not state a size.
const MAX_UNSIZED_BLOB: u64 = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Header not found: {0}")]
    HeaderNotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Token fetch failed with status code {0}")]
    TokenFetchFailed(u16),

    #[error("Token not found")]
    TokenNotFound,

    #[error("Manifest not found")]
    ManifestNotFound,

    #[error("Config not found for {0} (it may be embedded in the manifest)")]
    ConfigNotFound(String),

    #[error("Manifest parse error: {0}")]
    ManifestParseError(#[from] serde_json::Error),

    #[error("Request to {url} failed with status code {status}")]
    UnexpectedStatus { url: String, status: u16 },

    #[error("Download error with status code {0}")]
    DownloadError(u16),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Blob {digest} is larger than {limit} bytes")]
    BlobTooLarge { digest: String, limit: u64 },

    #[error("Layer cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CatalogPage {
    #[serde(default)]
    repositories: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TagsPage {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// OCI distribution API client.
///
/// Cloning is cheap and clones share the token cache, so one client can
/// serve every task of a scan.
#[derive(Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    options: RegistryOptions,
    credentials: Arc<DockerConfig>,
    // "<registry>|<scope>" -> bearer token
    tokens: Arc<Mutex<HashMap<String, String>>>,
    progress: Arc<dyn ProgressTracker>,
}

impl RegistryClient {
    pub fn new(options: RegistryOptions) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .read_timeout(options.read_timeout)
            .user_agent(&options.user_agent)
            .danger_accept_invalid_certs(options.skip_tls_verify)
            .build()?;

        Ok(Self {
            http,
            options,
            credentials: Arc::new(DockerConfig::load_default()),
            tokens: Arc::new(Mutex::new(HashMap::new())),
            progress: Arc::new(NoopProgress),
        })
    }

    pub fn with_docker_config(mut self, config: DockerConfig) -> Self {
        self.credentials = Arc::new(config);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressTracker>) -> Self {
        self.progress = progress;
        self
    }

    #[cfg(feature = "progress")]
    pub fn enable_progress(self, multi: indicatif::MultiProgress) -> Self {
        self.with_progress(Arc::new(super::progress::IndicatifProgress::new(multi)))
    }

    fn base_url(&self, registry: &str) -> String {
        format!("{}://{}", self.options.scheme(), api_host(registry))
    }

    fn cached_token(&self, key: &str) -> Option<String> {
        self.tokens.lock().ok()?.get(key).cloned()
    }

    fn store_token(&self, key: String, token: String) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(key, token);
        }
    }

    fn get(&self, url: &str, accept: Option<&str>) -> RequestBuilder {
        let request = self.http.get(url);
        match accept {
            Some(accept) => request.header(ACCEPT, accept),
            None => request,
        }
    }

    /// Sends a GET, answering one authentication challenge if the registry
    /// raises it. The returned response may still carry an error status.
    async fn send(
        &self,
        registry: &str,
        scope: &str,
        url: &str,
        accept: Option<&str>,
    ) -> Result<Response> {
        let key = format!("{registry}|{scope}");
        let mut request = self.get(url, accept);
        if let Some(token) = self.cached_token(&key) {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let header = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .ok_or_else(|| RegistryError::HeaderNotFound(WWW_AUTHENTICATE.to_string()))?
            .to_str()
            .map_err(|_| RegistryError::HeaderNotFound(WWW_AUTHENTICATE.to_string()))?
            .to_string();
        let challenge =
            Challenge::parse(&header).ok_or_else(|| RegistryError::Unauthorized(header))?;
        let credentials = self.credentials.credentials(registry);

        let request = match challenge {
            Challenge::Bearer { realm, service, .. } => {
                let token = self
                    .fetch_token(&realm, service.as_deref(), scope, credentials.as_ref())
                    .await?;
                self.store_token(key, token.clone());
                self.get(url, accept).bearer_auth(token)
            }
            Challenge::Basic => {
                let Credentials { username, password } =
                    credentials.ok_or_else(|| RegistryError::Unauthorized(registry.to_string()))?;
                self.get(url, accept).basic_auth(username, Some(password))
            }
        };

        Ok(request.send().await?)
    }

    async fn fetch_token(
        &self,
        realm: &str,
        service: Option<&str>,
        scope: &str,
        credentials: Option<&Credentials>,
    ) -> Result<String> {
        let mut query = vec![("scope", scope)];
        if let Some(service) = service {
            query.push(("service", service));
        }

        let mut request = self.http.get(realm).query(&query);
        if let Some(credentials) = credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::TokenFetchFailed(response.status().as_u16()));
        }

        let token: TokenResponse = response.json().await?;
        token
            .token
            .or(token.access_token)
            .ok_or(RegistryError::TokenNotFound)
    }

    async fn send_ok(
        &self,
        registry: &str,
        scope: &str,
        url: &str,
        accept: Option<&str>,
    ) -> Result<Response> {
        let response = self.send(registry, scope, url, accept).await?;
        if !response.status().is_success() {
            return Err(RegistryError::UnexpectedStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }

    /// Walks every page of a listing endpoint, following `Link: rel="next"`.
    async fn list_paginated<P, F>(
        &self,
        registry: &str,
        scope: &str,
        first: String,
        items: F,
    ) -> Result<Vec<String>>
    where
        P: DeserializeOwned,
        F: Fn(P) -> Option<Vec<String>>,
    {
        let base = self.base_url(registry);
        let mut collected = Vec::new();
        let mut visited = HashSet::new();
        let mut next = Some(first);

        while let Some(url) = next.take() {
            let response = self.send_ok(registry, scope, &url, None).await?;
            visited.insert(url);
            next = next_link(response.headers())
                .map(|link| resolve_link(&base, &link))
                .filter(|link| !visited.contains(link));

            let page: P = response.json().await?;
            collected.extend(items(page).unwrap_or_default());
        }

        Ok(collected)
    }

    async fn fetch_manifest(
        &self,
        image: &ImageRef,
        reference: &str,
    ) -> Result<(Option<String>, Vec<u8>)> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(&image.registry),
            repository_path(&image.registry, &image.repository),
            reference
        );
        let response = self
            .send_ok(
                &image.registry,
                &pull_scope(&image.registry, &image.repository),
                &url,
                Some(manifest::ACCEPT_ALL),
            )
            .await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;
        Ok((content_type, body.to_vec()))
    }

    /// Resolves the tag to a single image manifest, descending into an
    /// index when the tag points at one.
    async fn resolve_image_manifest(&self, image: &ImageRef) -> Result<ImageManifest> {
        let (content_type, body) = self.fetch_manifest(image, &image.tag).await?;

        match Manifest::from_slice(content_type.as_deref(), &body)? {
            Manifest::Image(manifest) => Ok(manifest),
            Manifest::Index(list) => {
                let target = list
                    .default_platform()
                    .ok_or(RegistryError::ManifestNotFound)?;
                debug!(image = %image, digest = %target.digest, "resolved index entry");

                let (content_type, body) = self.fetch_manifest(image, &target.digest).await?;
                match Manifest::from_slice(content_type.as_deref(), &body)? {
                    Manifest::Image(manifest) => Ok(manifest),
                    Manifest::Index(_) => Err(RegistryError::ManifestNotFound),
                }
            }
        }
    }

    /// Opens a blob download, refusing it up front when the announced
    /// length already exceeds what the descriptor allows.
    async fn open_blob(&self, image: &ImageRef, descriptor: &Descriptor) -> Result<Response> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.base_url(&image.registry),
            repository_path(&image.registry, &image.repository),
            descriptor.digest
        );
        let response = self
            .send(
                &image.registry,
                &pull_scope(&image.registry, &image.repository),
                &url,
                None,
            )
            .await?;
        if !response.status().is_success() {
            return Err(RegistryError::DownloadError(response.status().as_u16()));
        }

        if let Some(length) = response.content_length() {
            check_blob_size(descriptor, length)?;
        }
        Ok(response)
    }

    /// Downloads a small blob, such as an image config, into memory.
    async fn fetch_blob(&self, image: &ImageRef, descriptor: &Descriptor) -> Result<Vec<u8>> {
        let response = self.open_blob(image, descriptor).await?;

        let mut data = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            check_blob_size(descriptor, (data.len() + chunk.len()) as u64)?;
            data.extend_from_slice(&chunk);
        }

        verify_digest(&descriptor.digest, &data)?;
        Ok(data)
    }

    /// Streams a layer into `cache` unless it is already there.
    async fn fetch_layer(
        &self,
        image: &ImageRef,
        descriptor: &Descriptor,
        cache: &LayerCache,
    ) -> Result<LayerFile> {
        if let Some(path) = cache.lookup(&descriptor.digest).await? {
            return Ok(LayerFile {
                descriptor: descriptor.clone(),
                path,
            });
        }

        let response = self.open_blob(image, descriptor).await?;
        let reference = image.to_string();
        let total = response.content_length().unwrap_or(descriptor.size);
        self.progress
            .start_download(&reference, &descriptor.digest, total);

        let mut writer = cache.begin(&descriptor.digest).await?;
        let mut stream = response.bytes_stream();
        let streamed: Result<()> = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                check_blob_size(descriptor, writer.written() + chunk.len() as u64)?;
                writer.write(&chunk).await?;
                self.progress
                    .update(&reference, &descriptor.digest, chunk.len() as u64);
            }
            Ok(())
        }
        .await;
        self.progress.finish(&reference, &descriptor.digest);
        streamed?;

        let path = writer.commit().await.map_err(|e| match e {
            CacheError::Corrupted { expected, actual } => {
                RegistryError::DigestMismatch { expected, actual }
            }
            other => RegistryError::Cache(other),
        })?;

        Ok(LayerFile {
            descriptor: descriptor.clone(),
            path,
        })
    }
}

#[async_trait]
impl Registry for RegistryClient {
    #[instrument(skip(self))]
    async fn list_catalog(&self, registry: &str) -> Result<Vec<String>> {
        let url = format!("{}/v2/_catalog?n={PAGE_SIZE}", self.base_url(registry));
        self.list_paginated(registry, "registry:catalog:*", url, |page: CatalogPage| {
            page.repositories
        })
        .await
    }

    #[instrument(skip(self))]
    async fn list_tags(&self, registry: &str, repository: &str) -> Result<Vec<String>> {
        let url = format!(
            "{}/v2/{}/tags/list?n={PAGE_SIZE}",
            self.base_url(registry),
            repository_path(registry, repository)
        );
        self.list_paginated(registry, &pull_scope(registry, repository), url, |page: TagsPage| {
            page.tags
        })
        .await
    }

    #[instrument(skip(self, image), fields(image = %image))]
    async fn get_manifest(&self, image: &ImageRef) -> Result<Vec<u8>> {
        let (_, body) = self.fetch_manifest(image, &image.tag).await?;
        Ok(body)
    }

    #[instrument(skip(self, image), fields(image = %image))]
    async fn get_config(&self, image: &ImageRef) -> Result<Vec<u8>> {
        let manifest = self.resolve_image_manifest(image).await?;
        let config = manifest
            .config
            .ok_or_else(|| RegistryError::ConfigNotFound(image.to_string()))?;
        self.fetch_blob(image, &config).await
    }

    #[instrument(skip(self, image, cache), fields(image = %image))]
    async fn pull_image(&self, image: &ImageRef, cache: &LayerCache) -> Result<PulledImage> {
        let manifest = self.resolve_image_manifest(image).await?;
        let config = manifest
            .config
            .ok_or_else(|| RegistryError::ConfigNotFound(image.to_string()))?;
        let config = Blob {
            data: self.fetch_blob(image, &config).await?,
            descriptor: config,
        };

        let pending: Vec<_> = manifest
            .layers
            .iter()
            .map(|layer| self.fetch_layer(image, layer, cache))
            .collect();
        // layer order matters for the archive, so keep it while downloading
        let layers = stream::iter(pending)
            .buffered(get_concurrent_downloads())
            .try_collect::<Vec<_>>()
            .await?;

        debug!(layers = layers.len(), "pulled image");
        Ok(PulledImage { config, layers })
    }
}

fn verify_digest(expected: &str, data: &[u8]) -> Result<()> {
    // only sha256 is checked; other algorithms are passed through
    if !expected.starts_with("sha256:") {
        return Ok(());
    }
    let actual = cache::compute_digest(data);
    if actual != expected {
        return Err(RegistryError::DigestMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

fn check_blob_size(descriptor: &Descriptor, received: u64) -> Result<()> {
    let limit = if descriptor.size > 0 {
        descriptor.size
    } else {
        MAX_UNSIZED_BLOB
    };
    if received > limit {
        return Err(RegistryError::BlobTooLarge {
            digest: descriptor.digest.clone(),
            limit,
        });
    }
    Ok(())
}

fn pull_scope(registry: &str, repository: &str) -> String {
    format!("repository:{}:pull", repository_path(registry, repository))
}

fn is_docker_hub(registry: &str) -> bool {
    matches!(
        registry,
        "docker.io" | "index.docker.io" | "registry-1.docker.io"
    )
}

/// Host serving the distribution API for `registry`.
pub fn api_host(registry: &str) -> &str {
    if is_docker_hub(registry) {
        "registry-1.docker.io"
    } else {
        registry
    }
}

/// Official Docker Hub images live under `library/`.
pub fn repository_path(registry: &str, repository: &str) -> String {
    if is_docker_hub(registry) && !repository.contains('/') {
        format!("library/{repository}")
    } else {
        repository.to_string()
    }
}

/// Target of the `rel="next"` entry of a `Link` header.
pub fn next_link(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(LINK)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .find(|entry| {
            entry
                .split(';')
                .skip(1)
                .any(|param| matches!(param.trim(), "rel=\"next\"" | "rel=next"))
        })
        .and_then(|entry| {
            let entry = entry.trim();
            let start = entry.find('<')?;
            let end = entry.find('>')?;
            (start < end).then(|| entry[start + 1..end].to_string())
        })
}

/// Registries usually send a path relative to their own root.
pub fn resolve_link(base: &str, link: &str) -> String {
    if link.starts_with("http://") || link.starts_with("https://") {
        link.to_string()
    } else if link.starts_with('/') {
        format!("{base}{link}")
    } else {
        format!("{base}/{link}")
    }
}
