//! `docker save` compatible tarballs of pulled images.
//!
//! ```text
//! filesystem.tar
//! |-- sha256:<config hex>     # image config
//! |-- <layer hex>.tar.gz      # one entry per distinct layer
//! |-- manifest.json           # [{"Config", "RepoTags", "Layers"}]
//! ```

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tar::{Builder, Header};

use crate::image::ImageRef;
use crate::manifest::layer_extension;
use crate::registry::{PulledImage, Result};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TarballManifest {
    pub config: String,
    pub repo_tags: Vec<String>,
    pub layers: Vec<String>,
}

/// Writes `pulled` to `dest`, replacing any existing file.
pub async fn save(pulled: PulledImage, image: &ImageRef, dest: &Path) -> Result<()> {
    let reference = image.to_string();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || write_tarball(&pulled, &reference, &dest)).await??;
    Ok(())
}

fn write_tarball(pulled: &PulledImage, reference: &str, dest: &Path) -> io::Result<()> {
    let file = File::create(dest)?;
    let mut builder = Builder::new(BufWriter::new(file));

    let config_name = pulled.config.descriptor.digest.clone();
    let config = &pulled.config.data;
    append(&mut builder, &config_name, config.len() as u64, config.as_slice())?;

    let mut layer_names: Vec<String> = Vec::with_capacity(pulled.layers.len());
    for layer in &pulled.layers {
        let digest = &layer.descriptor.digest;
        let hex = digest.split_once(':').map_or(digest.as_str(), |(_, hex)| hex);
        let name = format!("{hex}.{}", layer_extension(&layer.descriptor.media_type));

        // the same blob can appear more than once in a manifest
        if !layer_names.contains(&name) {
            let file = File::open(&layer.path)?;
            let size = file.metadata()?.len();
            append(&mut builder, &name, size, file)?;
        }
        layer_names.push(name);
    }

    let manifest = vec![TarballManifest {
        config: config_name,
        repo_tags: vec![reference.to_string()],
        layers: layer_names,
    }];
    let manifest = serde_json::to_vec(&manifest)?;
    append(&mut builder, "manifest.json", manifest.len() as u64, manifest.as_slice())?;

    builder.into_inner()?.flush()
}

fn append<W: Write, R: Read>(
    builder: &mut Builder<W>,
    name: &str,
    size: u64,
    data: R,
) -> io::Result<()> {
    let mut header = Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    builder.append_data(&mut header, name, data)
}
