use std::fmt;
use std::sync::Arc;

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::registry::RegistryError;

/// A fully qualified `registry/repository:tag` triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(
        registry: impl Into<String>,
        repository: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            registry: registry.into(),
            repository: repository.into(),
            tag: tag.into(),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

/// Why a record carries an error.
///
/// Registry failures are shared behind an `Arc` so a record can be cloned,
/// persisted and returned without losing the source chain.
#[derive(Error, Debug, Clone)]
pub enum ImageError {
    #[error("no registries supplied")]
    NoRegistries,

    #[error("listing repositories on {registry}: {source}")]
    Catalog {
        registry: String,
        #[source]
        source: Arc<RegistryError>,
    },

    #[error("listing tags for {registry}/{repository}: {source}")]
    Tags {
        registry: String,
        repository: String,
        #[source]
        source: Arc<RegistryError>,
    },

    #[error("fetching manifest: {0}")]
    Manifest(#[source] Arc<RegistryError>),

    #[error("pulling image: {0}")]
    Pull(#[source] Arc<RegistryError>),

    #[error("saving image archive: {0}")]
    Save(#[source] Arc<RegistryError>),

    #[error("{first}; {then}")]
    Chained {
        first: Box<ImageError>,
        then: Box<ImageError>,
    },
}

/// One image scan outcome, or the error that stopped a subtree of the scan.
///
/// Field names serialize in the `Reference`/`Registry`/... form consumers of
/// the JSON output expect. `error` is rendered as its message or `null`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageData {
    pub reference: String,
    pub registry: String,
    pub repository: String,
    pub tag: String,
    pub manifest: String,
    pub config: String,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<ImageError>,
}

impl ImageData {
    /// An empty record for a known image, ready to be filled by a fetch.
    pub fn for_image(image: &ImageRef) -> Self {
        Self {
            reference: image.to_string(),
            registry: image.registry.clone(),
            repository: image.repository.clone(),
            tag: image.tag.clone(),
            ..Default::default()
        }
    }

    /// A record standing in for a subtree that could not be enumerated.
    pub fn failed(registry: &str, repository: &str, error: ImageError) -> Self {
        Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn image_ref(&self) -> ImageRef {
        ImageRef::new(&self.registry, &self.repository, &self.tag)
    }

    /// Adds `error` after any error already recorded.
    pub fn append_error(&mut self, error: ImageError) {
        self.error = Some(match self.error.take() {
            Some(first) => ImageError::Chained {
                first: Box::new(first),
                then: Box::new(error),
            },
            None => error,
        });
    }
}

fn serialize_error<S: Serializer>(
    error: &Option<ImageError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(error) => serializer.serialize_str(&error.to_string()),
        None => serializer.serialize_none(),
    }
}
