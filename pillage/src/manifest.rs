use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";

/// Every manifest flavour we are willing to receive, for the `Accept` header.
pub const ACCEPT_ALL: &str = "application/vnd.oci.image.manifest.v1+json,\
application/vnd.oci.image.index.v1+json,\
application/vnd.docker.distribution.manifest.v2+json,\
application/vnd.docker.distribution.manifest.list.v2+json,\
application/vnd.docker.distribution.manifest.v1+prettyjws";

#[derive(Debug)]
pub enum Manifest {
    Image(ImageManifest),
    Index(ManifestList),
}

impl Manifest {
    /// Parses a manifest body, using the response content type when the
    /// registry sent one and falling back to the document shape otherwise.
    pub fn from_slice(content_type: Option<&str>, body: &[u8]) -> serde_json::Result<Self> {
        let is_index = match content_type.map(media_type_essence) {
            Some(OCI_INDEX) | Some(DOCKER_MANIFEST_LIST) => true,
            Some(OCI_MANIFEST) | Some(DOCKER_MANIFEST) | Some(DOCKER_MANIFEST_V1) => false,
            _ => {
                let value: serde_json::Value = serde_json::from_slice(body)?;
                value.get("manifests").is_some()
            }
        };

        if is_index {
            Ok(Manifest::Index(serde_json::from_slice(body)?))
        } else {
            Ok(Manifest::Image(serde_json::from_slice(body)?))
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    // schema 1 manifests inline their config in the history instead
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Descriptor>,
    #[serde(default)]
    pub layers: Vec<Descriptor>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Descriptor {
    pub digest: String,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub size: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ManifestList {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<PlatformManifest>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PlatformManifest {
    pub digest: String,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    // attestation entries carry no platform
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(rename = "os.version", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(rename = "os.features", skip_serializing_if = "Option::is_none")]
    pub os_features: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl ManifestList {
    /// Picks the `linux/amd64` entry, or the first entry that names a
    /// platform when there is none.
    pub fn default_platform(&self) -> Option<&PlatformManifest> {
        self.manifests
            .iter()
            .find(|m| {
                m.platform
                    .as_ref()
                    .is_some_and(|p| p.os == "linux" && p.architecture == "amd64")
            })
            .or_else(|| self.manifests.iter().find(|m| m.platform.is_some()))
            .or_else(|| self.manifests.first())
    }
}

/// Strips parameters such as `; charset=utf-8` from a media type.
pub fn media_type_essence(media_type: &str) -> &str {
    media_type.split(';').next().unwrap_or(media_type).trim()
}

/// File extension used for a layer blob inside a saved tarball.
pub fn layer_extension(media_type: &str) -> &'static str {
    let compression = match media_type.rsplit_once('+') {
        Some((_, ext)) => ext,
        None => match media_type.rsplit_once('.') {
            Some((_, ext)) => ext,
            None => "tar",
        },
    };

    match compression {
        "gzip" => "tar.gz",
        "zstd" => "tar.zst",
        _ => "tar",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.index.v1+json",
        "manifests": [
            {
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": "sha256:arm",
                "size": 10,
                "platform": {"architecture": "arm64", "os": "linux"}
            },
            {
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": "sha256:amd",
                "size": 10,
                "platform": {"architecture": "amd64", "os": "linux"}
            }
        ]
    }"#;

    #[test]
    fn test_parse_index_by_content_type() {
        let manifest = Manifest::from_slice(Some(OCI_INDEX), INDEX.as_bytes()).unwrap();
        match manifest {
            Manifest::Index(list) => {
                assert_eq!(list.default_platform().unwrap().digest, "sha256:amd");
            }
            Manifest::Image(_) => panic!("expected an index"),
        }
    }

    #[test]
    fn test_parse_index_without_content_type() {
        let manifest = Manifest::from_slice(None, INDEX.as_bytes()).unwrap();
        assert!(matches!(manifest, Manifest::Index(_)));
    }

    #[test]
    fn test_parse_docker_manifest_with_charset() {
        let body = r#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "digest": "sha256:cfg",
                "size": 7
            },
            "layers": []
        }"#;
        let manifest = Manifest::from_slice(
            Some("application/vnd.docker.distribution.manifest.v2+json; charset=utf-8"),
            body.as_bytes(),
        )
        .unwrap();
        match manifest {
            Manifest::Image(image) => assert_eq!(image.config.unwrap().digest, "sha256:cfg"),
            Manifest::Index(_) => panic!("expected an image manifest"),
        }
    }

    #[test]
    fn test_schema1_manifest_has_no_config() {
        let body = r#"{"schemaVersion": 1, "name": "app", "tag": "v1", "fsLayers": []}"#;
        let manifest = Manifest::from_slice(Some(DOCKER_MANIFEST_V1), body.as_bytes()).unwrap();
        match manifest {
            Manifest::Image(image) => assert!(image.config.is_none()),
            Manifest::Index(_) => panic!("expected an image manifest"),
        }
    }

    #[test]
    fn test_layer_extension() {
        assert_eq!(
            layer_extension("application/vnd.oci.image.layer.v1.tar+gzip"),
            "tar.gz"
        );
        assert_eq!(
            layer_extension("application/vnd.oci.image.layer.v1.tar+zstd"),
            "tar.zst"
        );
        assert_eq!(
            layer_extension("application/vnd.docker.image.rootfs.diff.tar.gzip"),
            "tar.gz"
        );
        assert_eq!(layer_extension("application/vnd.oci.image.layer.v1.tar"), "tar");
    }
}
