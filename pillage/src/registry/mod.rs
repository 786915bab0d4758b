//! Registry access: the capability the scanner depends on, and an OCI
//! distribution client implementing it.

pub mod auth;
pub mod client;
#[cfg(test)]
pub(crate) mod mock;
pub mod progress;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::archive;
use crate::cache::LayerCache;
use crate::image::ImageRef;
use crate::manifest::Descriptor;

/// Re-export of the high level registry client.
pub use client::{RegistryClient, RegistryError, Result};

/// A blob fetched from a registry together with the descriptor that named it.
#[derive(Debug, Clone)]
pub struct Blob {
    pub descriptor: Descriptor,
    pub data: Vec<u8>,
}

/// A layer that has been downloaded to disk.
#[derive(Debug, Clone)]
pub struct LayerFile {
    pub descriptor: Descriptor,
    pub path: PathBuf,
}

/// Everything needed to write an image filesystem archive.
///
/// Only the config is held in memory; layers stay on disk until the archive
/// is written.
#[derive(Debug, Clone)]
pub struct PulledImage {
    pub config: Blob,
    /// Layers bottom to top, in manifest order.
    pub layers: Vec<LayerFile>,
}

/// Operations the scanner and the storage pipeline need from a registry.
///
/// Implementations are shared across every enumeration task, so they must
/// be cheap to call concurrently.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Lists every repository the registry's catalog exposes.
    async fn list_catalog(&self, registry: &str) -> Result<Vec<String>>;

    /// Lists every tag of `repository`.
    async fn list_tags(&self, registry: &str, repository: &str) -> Result<Vec<String>>;

    /// Raw manifest document served for the image's tag.
    async fn get_manifest(&self, image: &ImageRef) -> Result<Vec<u8>>;

    /// Raw configuration document of the image.
    async fn get_config(&self, image: &ImageRef) -> Result<Vec<u8>>;

    /// Fetches the config and downloads every layer into `cache`, reusing
    /// layers that are already there.
    async fn pull_image(&self, image: &ImageRef, cache: &LayerCache) -> Result<PulledImage>;

    /// Writes a pulled image to `dest` as a `docker save` style tarball.
    async fn save_archive(&self, pulled: PulledImage, image: &ImageRef, dest: &Path) -> Result<()> {
        archive::save(pulled, image, dest).await
    }
}
