//! Persisting scan results to disk.
//!
//! Each record gets its own directory under the results root:
//!
//! ```text
//! <results>/<registry>/<repository>/<tag>/
//! |-- manifest.json
//! |-- config.json
//! |-- filesystem.tar   # only when images are stored
//! |-- errors.log       # only when the record failed
//! ```
//!
//! Storing is the expensive end of a scan, so [`store_all`] runs it on a
//! fixed number of workers no matter how fast records are produced.

use std::ffi::OsStr;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::sync::mpsc::Receiver;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::cache::LayerCache;
use crate::image::{ImageData, ImageError};
use crate::registry::Registry;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const CONFIG_FILE: &str = "config.json";
pub const ERRORS_FILE: &str = "errors.log";
pub const FILESYSTEM_FILE: &str = "filesystem.tar";
const STAGING_DIR: &str = ".layers";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Error making storage path {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Image(#[from] ImageError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Where and how records are stored. Shared read-only by every worker.
pub struct StorageOptions {
    pub results_path: PathBuf,
    pub cache: Option<LayerCache>,
    /// Pull each image and save its filesystem next to the metadata.
    pub store_images: bool,
    pub registry: Arc<dyn Registry>,
}

impl StorageOptions {
    pub fn new<P: AsRef<Path>>(results_path: P, registry: Arc<dyn Registry>) -> Self {
        Self {
            results_path: results_path.as_ref().to_path_buf(),
            cache: None,
            store_images: false,
            registry,
        }
    }

    pub fn store_images(mut self, store_images: bool) -> Self {
        self.store_images = store_images;
        self
    }

    pub fn cache_path<P: AsRef<Path>>(mut self, cache_path: Option<P>) -> Self {
        self.cache = cache_path.map(LayerCache::new);
        self
    }

    /// Output directory of `image`, always inside `results_path`.
    pub fn image_path(&self, image: &ImageData) -> PathBuf {
        self.results_path
            .join(secure_join(&[&image.registry, &image.repository, &image.tag]))
    }
}

/// Joins path segments so that none of them can climb out of the result.
///
/// Each segment is cleaned as if it were rooted, so `..` can at most reach
/// the start of its own segment.
pub fn secure_join(segments: &[&str]) -> PathBuf {
    segments
        .iter()
        .flat_map(|segment| clean_rooted(segment))
        .collect()
}

fn clean_rooted(segment: &str) -> Vec<&OsStr> {
    let mut parts = Vec::new();
    for component in Path::new(segment).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::ParentDir => {
                parts.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    parts
}

impl ImageData {
    /// Writes this record's files and, when enabled, its filesystem archive.
    ///
    /// Pull or save failures are appended to the record's error. Any error
    /// the record ends up with is written to `errors.log` and returned.
    pub async fn store(&mut self, options: &StorageOptions) -> Result<()> {
        let image_path = options.image_path(self);
        info!(image = %self.label(), "storing results");

        fs::create_dir_all(&image_path)
            .await
            .map_err(|source| StoreError::CreateDir {
                path: image_path.clone(),
                source,
            })?;

        if !self.manifest.is_empty() {
            write_file(&image_path.join(MANIFEST_FILE), self.manifest.as_bytes()).await;
        }

        if !self.config.is_empty() {
            write_file(&image_path.join(CONFIG_FILE), self.config.as_bytes()).await;
        }

        if options.store_images && self.error.is_none() {
            if let Err(e) = self.export(options, &image_path.join(FILESYSTEM_FILE)).await {
                warn!(image = %self.label(), error = %e, "error exporting image");
                self.append_error(e);
            }
        }

        match &self.error {
            Some(error) => {
                write_file(&image_path.join(ERRORS_FILE), error.to_string().as_bytes()).await;
                Err(StoreError::Image(error.clone()))
            }
            None => Ok(()),
        }
    }

    /// Pulls the image and writes its archive to `dest`. Without a shared
    /// cache, layers are staged next to `dest` and removed afterwards.
    async fn export(
        &self,
        options: &StorageOptions,
        dest: &Path,
    ) -> std::result::Result<(), ImageError> {
        let image = self.image_ref();
        let staged = options.cache.is_none();
        let cache = options
            .cache
            .clone()
            .unwrap_or_else(|| LayerCache::new(dest.with_file_name(STAGING_DIR)));

        let result = async {
            let pulled = options
                .registry
                .pull_image(&image, &cache)
                .await
                .map_err(|e| ImageError::Pull(Arc::new(e)))?;

            options
                .registry
                .save_archive(pulled, &image, dest)
                .await
                .map_err(|e| ImageError::Save(Arc::new(e)))
        }
        .await;

        if staged {
            if let Err(e) = fs::remove_dir_all(cache.root()).await {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %cache.root().display(), error = %e, "error removing staged layers");
                }
            }
        }

        result
    }

    /// The reference, or whatever part of the identity is known.
    pub fn label(&self) -> String {
        if !self.reference.is_empty() {
            return self.reference.clone();
        }
        [self.registry.as_str(), self.repository.as_str()]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("/")
    }
}

async fn write_file(path: &Path, contents: &[u8]) {
    if let Err(e) = fs::write(path, contents).await {
        warn!(path = %path.display(), error = %e, "error writing file");
    }
}

/// Result of storing one record.
#[derive(Debug, Clone)]
pub struct StoreOutcome {
    pub image: String,
    pub error: Option<String>,
}

/// Stores every record from `images` using at most `workers` concurrent
/// stores. `on_stored` runs on the calling task once per finished record.
pub async fn store_all<F>(
    mut images: Receiver<ImageData>,
    options: Arc<StorageOptions>,
    workers: usize,
    on_stored: F,
) -> Vec<StoreOutcome>
where
    F: Fn(&StoreOutcome),
{
    let permits = Arc::new(Semaphore::new(workers.max(1)));
    let mut tasks = JoinSet::new();
    let mut outcomes = Vec::new();

    let mut record = |joined: std::result::Result<StoreOutcome, tokio::task::JoinError>| {
        match joined {
            Ok(outcome) => {
                on_stored(&outcome);
                outcomes.push(outcome);
            }
            Err(e) => error!(error = %e, "storage worker failed"),
        }
    };

    while let Some(mut image) = images.recv().await {
        // waiting here keeps at most `workers` stores in flight
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let options = options.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let result = image.store(&options).await;
            StoreOutcome {
                image: image.label(),
                error: result.err().map(|e| e.to_string()),
            }
        });

        while let Some(joined) = tasks.try_join_next() {
            record(joined);
        }
    }

    while let Some(joined) = tasks.join_next().await {
        record(joined);
    }

    outcomes
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use tokio::sync::mpsc;

    use super::*;
    use crate::image::ImageRef;
    use crate::registry::RegistryError;
    use crate::registry::mock::MockRegistry;

    fn record(registry: &str, repository: &str, tag: &str) -> ImageData {
        let image = ImageRef::new(registry, repository, tag);
        let mut data = ImageData::for_image(&image);
        data.manifest = MockRegistry::manifest_for(&image);
        data.config = MockRegistry::config_for(&image);
        data
    }

    #[test]
    fn test_secure_join_neutralises_traversal() {
        assert_eq!(
            secure_join(&["reg1", "../../etc", "../passwd"]),
            PathBuf::from("reg1/etc/passwd")
        );
        assert_eq!(
            secure_join(&["reg1", "library/nginx", "latest"]),
            PathBuf::from("reg1/library/nginx/latest")
        );
        assert_eq!(secure_join(&["reg1", "", ""]), PathBuf::from("reg1"));
        assert_eq!(secure_join(&["/abs", "./a/./b", "c/../d"]), PathBuf::from("abs/a/b/d"));
    }

    #[tokio::test]
    async fn test_store_writes_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let options = StorageOptions::new(dir.path(), Arc::new(MockRegistry::new()));
        let mut data = record("reg1", "app", "v1");

        data.store(&options).await.unwrap();

        let image_path = dir.path().join("reg1/app/v1");
        assert_eq!(
            std::fs::read_to_string(image_path.join(MANIFEST_FILE)).unwrap(),
            data.manifest
        );
        assert_eq!(
            std::fs::read_to_string(image_path.join(CONFIG_FILE)).unwrap(),
            data.config
        );
        assert!(!image_path.join(ERRORS_FILE).exists());
        assert!(!image_path.join(FILESYSTEM_FILE).exists());
    }

    #[tokio::test]
    async fn test_store_records_existing_error_without_pulling() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(MockRegistry::new());
        let options = StorageOptions::new(dir.path(), registry.clone()).store_images(true);
        let mut data = record("reg1", "app", "v1");
        data.manifest.clear();
        data.error = Some(ImageError::Manifest(Arc::new(RegistryError::ManifestNotFound)));

        let err = data.store(&options).await.unwrap_err();

        assert!(matches!(err, StoreError::Image(ImageError::Manifest(_))));
        let image_path = dir.path().join("reg1/app/v1");
        assert!(!image_path.join(MANIFEST_FILE).exists());
        assert!(image_path.join(CONFIG_FILE).exists());
        let log = std::fs::read_to_string(image_path.join(ERRORS_FILE)).unwrap();
        assert!(log.contains("Manifest not found"));
        assert_eq!(registry.pull_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_store_exports_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(MockRegistry::new());
        let options = StorageOptions::new(dir.path(), registry.clone())
            .store_images(true)
            .cache_path(Some(cache_dir.path()));
        let mut data = record("reg1", "app", "v1");

        data.store(&options).await.unwrap();

        assert!(dir.path().join("reg1/app/v1").join(FILESYSTEM_FILE).exists());
        assert!(cache_dir.path().join("sha256").is_dir());
        assert_eq!(registry.pull_calls.load(Ordering::SeqCst), 1);
        assert_eq!(*registry.pulled.lock().unwrap(), vec!["reg1/app:v1".to_string()]);
    }

    #[tokio::test]
    async fn test_export_failure_is_appended_and_logged() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(MockRegistry::new().failing_pull("reg1/app:v1"));
        let options = StorageOptions::new(dir.path(), registry).store_images(true);
        let mut data = record("reg1", "app", "v1");

        let err = data.store(&options).await.unwrap_err();

        assert!(matches!(err, StoreError::Image(ImageError::Pull(_))));
        assert!(matches!(data.error, Some(ImageError::Pull(_))));
        let image_path = dir.path().join("reg1/app/v1");
        assert!(image_path.join(MANIFEST_FILE).exists());
        assert!(!image_path.join(FILESYSTEM_FILE).exists());
        let log = std::fs::read_to_string(image_path.join(ERRORS_FILE)).unwrap();
        assert!(log.starts_with("pulling image"));
    }

    #[tokio::test]
    async fn test_store_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let options =
            StorageOptions::new(dir.path(), Arc::new(MockRegistry::new())).store_images(true);
        let image_path = dir.path().join("reg1/app/v1");

        let mut first = record("reg1", "app", "v1");
        first.store(&options).await.unwrap();
        let snapshot: Vec<Vec<u8>> = [MANIFEST_FILE, CONFIG_FILE, FILESYSTEM_FILE]
            .iter()
            .map(|name| std::fs::read(image_path.join(name)).unwrap())
            .collect();

        let mut second = record("reg1", "app", "v1");
        second.store(&options).await.unwrap();
        for (name, before) in [MANIFEST_FILE, CONFIG_FILE, FILESYSTEM_FILE]
            .iter()
            .zip(snapshot)
        {
            assert_eq!(std::fs::read(image_path.join(name)).unwrap(), before);
        }
    }

    #[tokio::test]
    async fn test_export_without_cache_removes_staged_layers() {
        let dir = tempfile::tempdir().unwrap();
        let options =
            StorageOptions::new(dir.path(), Arc::new(MockRegistry::new())).store_images(true);
        let image = ImageRef::new("reg1", "app", "v1");
        let mut data = record("reg1", "app", "v1");

        data.store(&options).await.unwrap();

        let image_path = dir.path().join("reg1/app/v1");
        assert!(!image_path.join(STAGING_DIR).exists());

        let tarball = std::fs::File::open(image_path.join(FILESYSTEM_FILE)).unwrap();
        let mut archive = tar::Archive::new(tarball);
        let layer = format!("layer of {image}");
        let found = archive.entries().unwrap().any(|entry| {
            let mut entry = entry.unwrap();
            let mut contents = String::new();
            std::io::Read::read_to_string(&mut entry, &mut contents).unwrap();
            contents == layer
        });
        assert!(found);
    }

    #[tokio::test]
    async fn test_store_stays_inside_results_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("results");
        let options = StorageOptions::new(&root, Arc::new(MockRegistry::new()));
        let mut data = record("reg1", "../../escape", "../../../v1");

        data.store(&options).await.unwrap();

        assert!(root.join("reg1/escape/v1").join(MANIFEST_FILE).exists());
        assert!(!dir.path().join("escape").exists());
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_listing_record_is_stored_under_registry() {
        let dir = tempfile::tempdir().unwrap();
        let options = StorageOptions::new(dir.path(), Arc::new(MockRegistry::new()));
        let mut data = ImageData::failed(
            "reg1",
            "",
            ImageError::Catalog {
                registry: "reg1".to_string(),
                source: Arc::new(RegistryError::DownloadError(401)),
            },
        );

        assert!(data.store(&options).await.is_err());
        assert!(dir.path().join("reg1").join(ERRORS_FILE).exists());
        assert_eq!(data.label(), "reg1");
    }

    #[tokio::test]
    async fn test_store_all_bounds_concurrent_exports() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(MockRegistry::new());
        let options = Arc::new(
            StorageOptions::new(dir.path(), registry.clone()).store_images(true),
        );

        let (tx, rx) = mpsc::channel(100);
        for i in 0..12 {
            tx.send(record("reg1", "app", &format!("v{i}"))).await.unwrap();
        }
        drop(tx);

        let seen = std::sync::atomic::AtomicUsize::new(0);
        let outcomes = store_all(rx, options, 3, |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        assert_eq!(outcomes.len(), 12);
        assert_eq!(seen.load(Ordering::SeqCst), 12);
        assert!(outcomes.iter().all(|o| o.error.is_none()));
        assert_eq!(registry.pull_calls.load(Ordering::SeqCst), 12);
        let max = registry.max_active_pulls.load(Ordering::SeqCst);
        assert!(max >= 1 && max <= 3, "max concurrent pulls was {max}");
    }
}
