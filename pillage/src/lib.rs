//! Core library for pillaging container registries. The crate enumerates
//! every repository and tag a registry exposes, fetches manifests and
//! configuration documents for each image, and optionally pulls and stores
//! image filesystems to disk for offline inspection.

/// `docker save` style tarballs written from pulled images.
pub mod archive;
/// Content addressed on-disk cache of layer blobs.
pub mod cache;
/// Environment driven defaults and transport options.
pub mod config;
/// Image identities and the per-image result record.
pub mod image;
/// Types that model OCI and Docker image manifests.
pub mod manifest;
/// Clients for talking to OCI compatible registries.
pub mod registry;
/// Concurrent enumeration of registries, repositories and tags.
pub mod scan;
/// Writing result records and image filesystems to disk.
pub mod store;

pub use image::{ImageData, ImageError, ImageRef};
pub use registry::{Registry, RegistryClient, RegistryError};
pub use scan::Scanner;
pub use store::{StorageOptions, StoreError, StoreOutcome, store_all};
