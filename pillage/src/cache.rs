//! Content addressed on-disk cache for layer blobs.
//!
//! Blobs live at `<root>/sha256/<hex>`. Several storage workers may pull
//! images sharing base layers at the same time, so inserts write to a
//! private temporary file and rename it into place.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    Corrupted { expected: String, actual: String },

    #[error("Cache IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Clone)]
pub struct LayerCache {
    root: PathBuf,
}

impl LayerCache {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the blob named `digest` lives, whether or not it is stored yet.
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let hex = validate_digest(digest)?;
        Ok(self.root.join("sha256").join(hex))
    }

    /// Path of the cached blob, or `None` when it was never stored.
    pub async fn lookup(&self, digest: &str) -> Result<Option<PathBuf>> {
        let path = self.blob_path(digest)?;
        match fs::metadata(&path).await {
            Ok(_) => {
                debug!(digest, "layer cache hit");
                Ok(Some(path))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CacheError::Io { path, source }),
        }
    }

    /// Starts streaming a blob into the cache. Nothing becomes visible
    /// under `digest` until [`CacheWriter::commit`] has checked the content.
    pub async fn begin(&self, digest: &str) -> Result<CacheWriter> {
        let dest = self.blob_path(digest)?;

        let dir = self.root.join("sha256");
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| CacheError::Io {
                path: dir.clone(),
                source,
            })?;

        let temp = dir.join(format!(
            ".{}.{}.{}",
            &digest[7..],
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let file = fs::File::create(&temp)
            .await
            .map_err(|source| CacheError::Io {
                path: temp.clone(),
                source,
            })?;

        Ok(CacheWriter {
            file: Some(file),
            temp,
            dest,
            digest: digest.to_string(),
            hasher: Sha256::new(),
            written: 0,
            committed: false,
        })
    }

    /// Stores `data` under `digest` after checking that they match.
    pub async fn put(&self, digest: &str, data: &[u8]) -> Result<PathBuf> {
        let mut writer = self.begin(digest).await?;
        writer.write(data).await?;
        writer.commit().await
    }
}

/// A blob being written into a [`LayerCache`].
///
/// Dropping it without committing removes the partial file.
pub struct CacheWriter {
    file: Option<fs::File>,
    temp: PathBuf,
    dest: PathBuf,
    digest: String,
    hasher: Sha256,
    written: u64,
    committed: bool,
}

impl CacheWriter {
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        file.write_all(chunk)
            .await
            .map_err(|source| CacheError::Io {
                path: self.temp.clone(),
                source,
            })?;
        self.hasher.update(chunk);
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Verifies the digest and moves the blob into place.
    pub async fn commit(mut self) -> Result<PathBuf> {
        if let Some(mut file) = self.file.take() {
            file.flush().await.map_err(|source| CacheError::Io {
                path: self.temp.clone(),
                source,
            })?;
        }

        let actual = format!("sha256:{:x}", std::mem::take(&mut self.hasher).finalize());
        if actual != self.digest {
            return Err(CacheError::Corrupted {
                expected: self.digest.clone(),
                actual,
            });
        }

        fs::rename(&self.temp, &self.dest)
            .await
            .map_err(|source| CacheError::Io {
                path: self.dest.clone(),
                source,
            })?;
        self.committed = true;
        Ok(self.dest.clone())
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.temp);
        }
    }
}

/// `sha256:<hex>` digest of `data`.
pub fn compute_digest(data: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(data))
}

/// Checks the `sha256:<64 hex>` shape and returns the hex part.
pub fn validate_digest(digest: &str) -> Result<&str> {
    let hex = digest
        .strip_prefix("sha256:")
        .ok_or_else(|| CacheError::InvalidDigest(digest.to_string()))?;

    if hex.len() != 64 || !hex.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
        return Err(CacheError::InvalidDigest(digest.to_string()));
    }

    Ok(hex)
}
