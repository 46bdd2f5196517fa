//! Media types for OCI and Docker manifests, configs and layers, plus the
//! component-model specific types used for component descriptors.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CtaError;

pub const OCI_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
pub const OCI_LAYER_TAR_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_LAYER_TAR: &str = "application/vnd.docker.image.rootfs.diff.tar";
pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Config blob of a component version artifact
pub const COMPONENT_CONFIG: &str = "application/vnd.ocm.software.component.config.v1+json";
/// Tar holding `component-descriptor.yaml`
pub const COMPONENT_DESCRIPTOR_TAR: &str =
    "application/vnd.ocm.software.component-descriptor.v2+yaml+tar";
/// Descriptor layer written by older producers; accepted when reading
pub const LEGACY_COMPONENT_DESCRIPTOR_TAR: &str =
    "application/vnd.gardener.cloud.cnudie.component-descriptor.v2+yaml+tar";
/// An OCI artifact serialized as a tar.gz artifact set (local blob of an image or chart)
pub const ARTIFACT_SET: &str = "application/vnd.oci.image.manifest.v1+tar+gzip";
pub const ARTIFACT_SET_LEGACY: &str = "application/vnd.oci.image.manifest.v1+tar";

pub const OCTET_STREAM: &str = "application/octet-stream";
pub const TAR: &str = "application/x-tar";
pub const TAR_GZIP: &str = "application/x-tgz";

/// Manifest media types accepted when the caller prefers an index over a single image.
pub const PREFER_MULTIARCH: &[&str] = &[
    OCI_IMAGE_INDEX,
    DOCKER_MANIFEST_LIST,
    OCI_IMAGE_MANIFEST,
    DOCKER_MANIFEST,
];

pub fn is_index(media_type: &str) -> bool {
    matches!(media_type, OCI_IMAGE_INDEX | DOCKER_MANIFEST_LIST)
}

pub fn is_manifest(media_type: &str) -> bool {
    matches!(media_type, OCI_IMAGE_MANIFEST | DOCKER_MANIFEST)
}

pub fn is_artifact_set(media_type: &str) -> bool {
    matches!(media_type, ARTIFACT_SET | ARTIFACT_SET_LEGACY)
}

/// The full set of media types used by one manifest style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaTypes {
    pub manifest: &'static str,
    pub index: &'static str,
    pub config: &'static str,
    pub layer: &'static str,
    pub layer_gzip: &'static str,
}

impl MediaTypes {
    pub fn layer(&self, compressed: bool) -> &'static str {
        if compressed {
            self.layer_gzip
        } else {
            self.layer
        }
    }
}

const OCI_TYPES: MediaTypes = MediaTypes {
    manifest: OCI_IMAGE_MANIFEST,
    index: OCI_IMAGE_INDEX,
    config: OCI_IMAGE_CONFIG,
    layer: OCI_LAYER_TAR,
    layer_gzip: OCI_LAYER_TAR_GZIP,
};

const DOCKER_TYPES: MediaTypes = MediaTypes {
    manifest: DOCKER_MANIFEST,
    index: DOCKER_MANIFEST_LIST,
    config: DOCKER_CONFIG,
    layer: DOCKER_LAYER_TAR,
    layer_gzip: DOCKER_LAYER_GZIP,
};

/// Media type vocabulary of an image. Chosen once per image; every level of the
/// manifest reads from the same table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestStyle {
    #[default]
    Oci,
    Docker,
}

impl ManifestStyle {
    pub fn media_types(&self) -> &'static MediaTypes {
        match self {
            ManifestStyle::Oci => &OCI_TYPES,
            ManifestStyle::Docker => &DOCKER_TYPES,
        }
    }

    /// Detect the style a manifest or index media type belongs to.
    pub fn of_media_type(media_type: &str) -> Option<Self> {
        [ManifestStyle::Oci, ManifestStyle::Docker]
            .into_iter()
            .find(|style| {
                let t = style.media_types();
                media_type == t.manifest || media_type == t.index
            })
    }
}

impl fmt::Display for ManifestStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestStyle::Oci => f.write_str("oci"),
            ManifestStyle::Docker => f.write_str("docker"),
        }
    }
}

impl FromStr for ManifestStyle {
    type Err = CtaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "oci" => Ok(ManifestStyle::Oci),
            "docker" => Ok(ManifestStyle::Docker),
            other => Err(CtaError::Config(format!(
                "unknown manifest style '{}' (expected 'oci' or 'docker')",
                other
            ))),
        }
    }
}
