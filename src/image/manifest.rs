use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::media_types::{self, ManifestStyle};
use crate::digest::{BlobRef, Digest};
use crate::error::{CtaError, Result};

const SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: BlobRef,
    #[serde(default)]
    pub layers: Vec<BlobRef>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageManifest {
    pub fn new(style: ManifestStyle, config: BlobRef, layers: Vec<BlobRef>) -> Self {
        Self::with_media_type(style.media_types().manifest, config, layers)
    }

    pub fn with_media_type(media_type: &str, config: BlobRef, layers: Vec<BlobRef>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            media_type: Some(media_type.to_string()),
            config,
            layers,
            annotations: BTreeMap::new(),
        }
    }

    pub fn media_type(&self) -> &str {
        self.media_type
            .as_deref()
            .unwrap_or(media_types::OCI_IMAGE_MANIFEST)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| CtaError::malformed(format!("invalid image manifest: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: &str, architecture: &str) -> Self {
        Self {
            architecture: architecture.to_string(),
            os: os.to_string(),
            variant: None,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl IndexEntry {
    pub fn new(descriptor: &BlobRef, platform: Platform) -> Self {
        Self {
            media_type: descriptor.media_type.clone(),
            digest: descriptor.digest.clone(),
            size: descriptor.size,
            platform: Some(platform),
        }
    }

    pub fn descriptor(&self) -> BlobRef {
        BlobRef::new(self.media_type.clone(), self.digest.clone(), self.size)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<IndexEntry>,
}

impl ImageIndex {
    pub fn new(style: ManifestStyle, manifests: Vec<IndexEntry>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            media_type: Some(style.media_types().index.to_string()),
            manifests,
        }
    }

    pub fn media_type(&self) -> &str {
        self.media_type.as_deref().unwrap_or(media_types::OCI_IMAGE_INDEX)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| CtaError::malformed(format!("invalid image index: {}", e)))
    }
}

/// A fetched manifest document of either kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Manifest {
    Image(ImageManifest),
    Index(ImageIndex),
}

impl Manifest {
    /// Parse `bytes` according to `media_type`, falling back to the document shape for
    /// types that are neither (e.g. artifacts with custom manifest media types).
    pub fn parse(media_type: &str, bytes: &[u8]) -> Result<Self> {
        if media_types::is_index(media_type) {
            return Ok(Self::Index(ImageIndex::from_bytes(bytes)?));
        }
        if media_types::is_manifest(media_type) {
            return Ok(Self::Image(ImageManifest::from_bytes(bytes)?));
        }
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| CtaError::malformed(format!("manifest is not JSON: {}", e)))?;
        if value.get("manifests").is_some() {
            Ok(Self::Index(ImageIndex::from_bytes(bytes)?))
        } else {
            Ok(Self::Image(ImageManifest::from_bytes(bytes)?))
        }
    }
}
