//! Scripted in-memory [`Registry`] for exercising the scanner and the
//! storage pipeline without a network.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{Blob, LayerFile, PulledImage, Registry, RegistryError, Result};
use crate::cache::{LayerCache, compute_digest};
use crate::image::ImageRef;
use crate::manifest::Descriptor;

#[derive(Default)]
pub struct MockRegistry {
    catalogs: HashMap<String, Vec<String>>,
    tags: HashMap<(String, String), Vec<String>>,
    missing_manifests: HashSet<String>,
    missing_configs: HashSet<String>,
    failing_pulls: HashSet<String>,
    pub catalog_calls: AtomicUsize,
    pub tag_calls: AtomicUsize,
    pub manifest_calls: AtomicUsize,
    pub pull_calls: AtomicUsize,
    active_pulls: AtomicUsize,
    pub max_active_pulls: AtomicUsize,
    pub pulled: Mutex<Vec<String>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_catalog(mut self, registry: &str, repositories: &[&str]) -> Self {
        self.catalogs.insert(
            registry.to_string(),
            repositories.iter().map(|r| r.to_string()).collect(),
        );
        self
    }

    pub fn with_tags(mut self, registry: &str, repository: &str, tags: &[&str]) -> Self {
        self.tags.insert(
            (registry.to_string(), repository.to_string()),
            tags.iter().map(|t| t.to_string()).collect(),
        );
        self
    }

    pub fn without_manifest(mut self, reference: &str) -> Self {
        self.missing_manifests.insert(reference.to_string());
        self
    }

    pub fn without_config(mut self, reference: &str) -> Self {
        self.missing_configs.insert(reference.to_string());
        self
    }

    pub fn failing_pull(mut self, reference: &str) -> Self {
        self.failing_pulls.insert(reference.to_string());
        self
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn manifest_for(image: &ImageRef) -> String {
        format!("{{\"manifest\":\"{image}\"}}")
    }

    pub fn config_for(image: &ImageRef) -> String {
        format!("{{\"config\":\"{image}\"}}")
    }
}

fn blob(data: Vec<u8>, media_type: &str) -> Blob {
    Blob {
        descriptor: Descriptor {
            digest: compute_digest(&data),
            media_type: media_type.to_string(),
            size: data.len() as u64,
            annotations: None,
        },
        data,
    }
}

#[async_trait]
impl Registry for MockRegistry {
    async fn list_catalog(&self, registry: &str) -> Result<Vec<String>> {
        self.catalog_calls.fetch_add(1, Ordering::SeqCst);
        self.catalogs
            .get(registry)
            .cloned()
            .ok_or_else(|| RegistryError::UnexpectedStatus {
                url: format!("https://{registry}/v2/_catalog"),
                status: 404,
            })
    }

    async fn list_tags(&self, registry: &str, repository: &str) -> Result<Vec<String>> {
        self.tag_calls.fetch_add(1, Ordering::SeqCst);
        self.tags
            .get(&(registry.to_string(), repository.to_string()))
            .cloned()
            .ok_or_else(|| RegistryError::UnexpectedStatus {
                url: format!("https://{registry}/v2/{repository}/tags/list"),
                status: 404,
            })
    }

    async fn get_manifest(&self, image: &ImageRef) -> Result<Vec<u8>> {
        self.manifest_calls.fetch_add(1, Ordering::SeqCst);
        // yield so sibling fetches interleave
        tokio::task::yield_now().await;
        if self.missing_manifests.contains(&image.to_string()) {
            return Err(RegistryError::ManifestNotFound);
        }
        Ok(Self::manifest_for(image).into_bytes())
    }

    async fn get_config(&self, image: &ImageRef) -> Result<Vec<u8>> {
        if self.missing_configs.contains(&image.to_string()) {
            return Err(RegistryError::ConfigNotFound(image.to_string()));
        }
        Ok(Self::config_for(image).into_bytes())
    }

    async fn pull_image(&self, image: &ImageRef, cache: &LayerCache) -> Result<PulledImage> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_pulls.contains(&image.to_string()) {
            return Err(RegistryError::DownloadError(500));
        }

        let active = self.active_pulls.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_pulls.fetch_max(active, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        self.active_pulls.fetch_sub(1, Ordering::SeqCst);

        if let Ok(mut pulled) = self.pulled.lock() {
            pulled.push(image.to_string());
        }

        let layer = blob(
            format!("layer of {image}").into_bytes(),
            "application/vnd.oci.image.layer.v1.tar+gzip",
        );
        let path = match cache.lookup(&layer.descriptor.digest).await? {
            Some(path) => path,
            None => cache.put(&layer.descriptor.digest, &layer.data).await?,
        };

        Ok(PulledImage {
            config: blob(
                Self::config_for(image).into_bytes(),
                "application/vnd.oci.image.config.v1+json",
            ),
            layers: vec![LayerFile {
                descriptor: layer.descriptor,
                path,
            }],
        })
    }
}
