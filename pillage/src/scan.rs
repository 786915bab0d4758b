//! Concurrent enumeration of registries → repositories → tags → images.
//!
//! Every level spawns one task per child and waits for all of them through a
//! [`JoinSet`]. All tasks share clones of a single channel sender, so the
//! receiver returned by an `enum_*` call closes exactly when the last task
//! of that tree has finished. Results arrive in no particular order.
//!
//! Failures never cross task boundaries: a listing failure becomes one error
//! record in place of the subtree, a manifest failure is recorded on the
//! image's record.

use std::sync::Arc;

use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::image::{ImageData, ImageError, ImageRef};
use crate::registry::Registry;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct Scanner {
    registry: Arc<dyn Registry>,
}

impl Scanner {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }

    /// Scans every registry in `registries`. Empty `repositories` or `tags`
    /// are discovered through the catalog and tag listing APIs.
    pub fn enum_registries(
        &self,
        registries: Vec<String>,
        repositories: Vec<String>,
        tags: Vec<String>,
    ) -> Receiver<ImageData> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let scanner = self.clone();
        tokio::spawn(async move {
            scanner
                .registries_into(registries, repositories.into(), tags.into(), tx)
                .await
        });
        rx
    }

    pub fn enum_registry(
        &self,
        registry: String,
        repositories: Vec<String>,
        tags: Vec<String>,
    ) -> Receiver<ImageData> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let scanner = self.clone();
        tokio::spawn(async move {
            scanner
                .registry_into(registry, repositories.into(), tags.into(), tx)
                .await
        });
        rx
    }

    pub fn enum_repository(
        &self,
        registry: String,
        repository: String,
        tags: Vec<String>,
    ) -> Receiver<ImageData> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let scanner = self.clone();
        tokio::spawn(async move {
            scanner
                .repository_into(registry, repository, tags.into(), tx)
                .await
        });
        rx
    }

    pub fn enum_image(&self, image: ImageRef) -> Receiver<ImageData> {
        let (tx, rx) = mpsc::channel(1);
        let scanner = self.clone();
        tokio::spawn(async move { scanner.image_into(image, tx).await });
        rx
    }

    async fn registries_into(
        &self,
        registries: Vec<String>,
        repositories: Arc<[String]>,
        tags: Arc<[String]>,
        tx: Sender<ImageData>,
    ) {
        if registries.is_empty() {
            warn!("no registries supplied");
            emit(&tx, ImageData::failed("", "", ImageError::NoRegistries)).await;
            return;
        }

        let mut tasks = JoinSet::new();
        for registry in registries {
            let scanner = self.clone();
            let repositories = repositories.clone();
            let tags = tags.clone();
            let tx = tx.clone();
            tasks.spawn(async move {
                scanner
                    .registry_into(registry, repositories, tags, tx)
                    .await
            });
        }
        drain(tasks).await;
    }

    async fn registry_into(
        &self,
        registry: String,
        repositories: Arc<[String]>,
        tags: Arc<[String]>,
        tx: Sender<ImageData>,
    ) {
        info!(registry = %registry, "scanning registry");

        let repositories: Arc<[String]> = if repositories.is_empty() {
            match self.registry.list_catalog(&registry).await {
                Ok(found) => {
                    info!(registry = %registry, count = found.len(), "listed repositories");
                    Arc::from(found)
                }
                Err(e) => {
                    warn!(registry = %registry, error = %e, "error listing repositories");
                    let error = ImageError::Catalog {
                        registry: registry.clone(),
                        source: Arc::new(e),
                    };
                    emit(&tx, ImageData::failed(&registry, "", error)).await;
                    return;
                }
            }
        } else {
            repositories
        };

        let mut tasks = JoinSet::new();
        for repository in repositories.iter() {
            let scanner = self.clone();
            let registry = registry.clone();
            let repository = repository.clone();
            let tags = tags.clone();
            let tx = tx.clone();
            tasks.spawn(async move {
                scanner
                    .repository_into(registry, repository, tags, tx)
                    .await
            });
        }
        drain(tasks).await;
    }

    async fn repository_into(
        &self,
        registry: String,
        repository: String,
        tags: Arc<[String]>,
        tx: Sender<ImageData>,
    ) {
        debug!(registry = %registry, repository = %repository, "scanning repository");

        let tags: Arc<[String]> = if tags.is_empty() {
            match self.registry.list_tags(&registry, &repository).await {
                Ok(found) => {
                    debug!(
                        registry = %registry,
                        repository = %repository,
                        count = found.len(),
                        "listed tags"
                    );
                    Arc::from(found)
                }
                Err(e) => {
                    warn!(
                        registry = %registry,
                        repository = %repository,
                        error = %e,
                        "error listing tags"
                    );
                    let error = ImageError::Tags {
                        registry: registry.clone(),
                        repository: repository.clone(),
                        source: Arc::new(e),
                    };
                    emit(&tx, ImageData::failed(&registry, &repository, error)).await;
                    return;
                }
            }
        } else {
            tags
        };

        let mut tasks = JoinSet::new();
        for tag in tags.iter() {
            let scanner = self.clone();
            let image = ImageRef::new(&registry, &repository, tag);
            let tx = tx.clone();
            tasks.spawn(async move { scanner.image_into(image, tx).await });
        }
        drain(tasks).await;
    }

    async fn image_into(&self, image: ImageRef, tx: Sender<ImageData>) {
        let data = self.fetch_image(&image).await;
        emit(&tx, data).await;
    }

    /// Fetches manifest and config of one image.
    ///
    /// A manifest failure marks the record as failed. A config failure is
    /// only logged: schema 1 images and some artifacts have no separately
    /// retrievable config, so its absence is not treated as an error.
    #[instrument(skip(self, image), fields(image = %image))]
    pub async fn fetch_image(&self, image: &ImageRef) -> ImageData {
        let mut data = ImageData::for_image(image);

        match self.registry.get_manifest(image).await {
            Ok(manifest) => data.manifest = String::from_utf8_lossy(&manifest).into_owned(),
            Err(e) => {
                warn!(error = %e, "error fetching manifest");
                data.error = Some(ImageError::Manifest(Arc::new(e)));
            }
        }

        match self.registry.get_config(image).await {
            Ok(config) => data.config = String::from_utf8_lossy(&config).into_owned(),
            Err(e) => {
                warn!(error = %e, "error fetching config (it may be embedded in the manifest)")
            }
        }

        data
    }
}

/// Buffers every record of a scan, in arrival order.
pub async fn collect(mut images: Receiver<ImageData>) -> Vec<ImageData> {
    let mut results = Vec::new();
    while let Some(image) = images.recv().await {
        results.push(image);
    }
    results
}

async fn emit(tx: &Sender<ImageData>, data: ImageData) {
    if tx.send(data).await.is_err() {
        debug!("result receiver dropped");
    }
}

async fn drain(mut tasks: JoinSet<()>) {
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "enumeration task failed");
        }
    }
}
