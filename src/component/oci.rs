//! Component versions as OCI artifacts.
//!
//! A component version lives in `component-descriptors/<name>` tagged with its version.
//! Its manifest references a small JSON config naming the descriptor layer; layer 0 is
//! a tar holding `component-descriptor.yaml`, the remaining layers are the component's
//! local blobs.

use serde::{Deserialize, Serialize};

use super::descriptor::ComponentDescriptor;
use crate::archive::{extract_single_member, tar_single_file};
use crate::constants::{COMPONENT_DESCRIPTOR_FILE, COMPONENT_DESCRIPTOR_REPOSITORY};
use crate::digest::BlobRef;
use crate::error::{CtaError, Result};
use crate::image::manifest::ImageManifest;
use crate::image::media_types::{
    COMPONENT_CONFIG, COMPONENT_DESCRIPTOR_TAR, LEGACY_COMPONENT_DESCRIPTOR_TAR, OCI_IMAGE_MANIFEST,
};
use crate::reference::RepositorySpec;
use crate::store::{put_bytes, read_blob, ArtifactStore};

/// Repository of a component below a repository spec's prefix.
pub fn component_repository(location: &RepositorySpec, name: &str) -> String {
    location.repository(&format!("{}/{}", COMPONENT_DESCRIPTOR_REPOSITORY, name))
}

/// OCI tags cannot carry `+`, so build metadata is spelled `.build-`.
pub fn version_tag(version: &str) -> String {
    version.replace('+', ".build-")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentConfig {
    pub component_descriptor_layer: BlobRef,
}

#[derive(Debug, Clone)]
pub struct PackedComponent {
    pub repository: String,
    pub tag: String,
    pub manifest: BlobRef,
    pub descriptor_layer: BlobRef,
}

#[derive(Debug, Clone)]
pub struct UnpackedComponent {
    pub repository: String,
    pub descriptor: ComponentDescriptor,
    pub manifest: ImageManifest,
    pub manifest_descriptor: BlobRef,
}

/// Store `descriptor` as a component version at `location`.
///
/// Local blobs the descriptor references must already be present in the component
/// repository; they become layers after the descriptor layer.
pub fn pack(
    store: &dyn ArtifactStore,
    location: &RepositorySpec,
    descriptor: &ComponentDescriptor,
) -> Result<PackedComponent> {
    descriptor.validate()?;
    let repository = component_repository(location, descriptor.name());
    let tag = version_tag(descriptor.version());

    let yaml = descriptor.to_yaml()?;
    let layer_tar = tar_single_file(COMPONENT_DESCRIPTOR_FILE, yaml.as_bytes())?;
    let (descriptor_layer, _) = put_bytes(store, &repository, COMPONENT_DESCRIPTOR_TAR, &layer_tar)?;

    let config = serde_json::to_vec(&ComponentConfig {
        component_descriptor_layer: descriptor_layer.clone(),
    })?;
    let (config_blob, _) = put_bytes(store, &repository, COMPONENT_CONFIG, &config)?;

    let mut layers = vec![descriptor_layer.clone()];
    for (digest, media_type) in descriptor.local_blobs()? {
        let size = store.stat_blob(&repository, &digest)?.ok_or_else(|| {
            CtaError::not_found(format!("local blob {} in {}", digest, repository))
        })?;
        layers.push(BlobRef::new(media_type, digest, size));
    }

    let manifest = ImageManifest::with_media_type(OCI_IMAGE_MANIFEST, config_blob, layers);
    let pushed = store.push_manifest(&repository, &tag, OCI_IMAGE_MANIFEST, &manifest.to_bytes()?)?;
    tracing::info!(
        component = %descriptor.name(),
        version = %descriptor.version(),
        repository = %repository,
        digest = %pushed.digest,
        "Component version packed"
    );
    Ok(PackedComponent {
        repository,
        tag,
        manifest: pushed,
        descriptor_layer,
    })
}

/// Whether a component version exists at `location`.
pub fn exists(
    store: &dyn ArtifactStore,
    location: &RepositorySpec,
    name: &str,
    version: &str,
) -> Result<bool> {
    Ok(store
        .head_manifest(
            &component_repository(location, name),
            &version_tag(version),
            &[OCI_IMAGE_MANIFEST],
        )?
        .is_some())
}

/// Read a component version back. Any deviation from the expected media types or a
/// descriptor tar without exactly one member is a `MalformedArchive`.
pub fn unpack(
    store: &dyn ArtifactStore,
    location: &RepositorySpec,
    name: &str,
    version: &str,
) -> Result<UnpackedComponent> {
    let repository = component_repository(location, name);
    let (manifest_descriptor, bytes) =
        store.fetch_manifest(&repository, &version_tag(version), &[OCI_IMAGE_MANIFEST])?;
    if manifest_descriptor.media_type != OCI_IMAGE_MANIFEST {
        return Err(CtaError::malformed(format!(
            "component manifest has media type {}",
            manifest_descriptor.media_type
        )));
    }
    let manifest = ImageManifest::from_bytes(&bytes)?;
    if manifest.config.media_type != COMPONENT_CONFIG {
        return Err(CtaError::malformed(format!(
            "component config has media type {}",
            manifest.config.media_type
        )));
    }
    let layer = manifest
        .layers
        .first()
        .ok_or_else(|| CtaError::malformed("component manifest has no layers"))?;
    if layer.media_type != COMPONENT_DESCRIPTOR_TAR && layer.media_type != LEGACY_COMPONENT_DESCRIPTOR_TAR {
        return Err(CtaError::malformed(format!(
            "descriptor layer has media type {}",
            layer.media_type
        )));
    }

    let config: ComponentConfig = serde_json::from_slice(&read_blob(store, &repository, &manifest.config.digest)?)
        .map_err(|e| CtaError::malformed(format!("invalid component config: {}", e)))?;
    if config.component_descriptor_layer.digest != layer.digest {
        return Err(CtaError::malformed(format!(
            "config names descriptor layer {}, manifest has {}",
            config.component_descriptor_layer.digest, layer.digest
        )));
    }

    let tar = read_blob(store, &repository, &layer.digest)?;
    let (member, yaml) = extract_single_member(tar.as_slice())?;
    if member != COMPONENT_DESCRIPTOR_FILE {
        tracing::warn!(member = %member, "Descriptor tar member has an unexpected name");
    }
    let yaml = String::from_utf8(yaml)
        .map_err(|_| CtaError::malformed("component descriptor is not UTF-8"))?;
    let descriptor = ComponentDescriptor::from_yaml(&yaml)?;
    if descriptor.name() != name || descriptor.version() != version {
        return Err(CtaError::malformed(format!(
            "descriptor at {}:{} describes {}:{}",
            repository,
            version,
            descriptor.name(),
            descriptor.version()
        )));
    }

    Ok(UnpackedComponent {
        repository,
        descriptor,
        manifest,
        manifest_descriptor,
    })
}
