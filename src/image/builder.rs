//! Image assembly.
//!
//! [`ImageBuilder`] is a small state machine:
//! `Init → LayerAdded* → ConfigAdded → ManifestPushed`.
//! Layers are uploaded as they are added, the config captures every diff_id seen so far,
//! and the manifest is pushed last so it never references a missing blob.
//! [`MultiArchBuilder`] then groups pushed single-platform manifests into an index.

use std::io::BufReader;
use std::path::Path;

use super::config::{ImageConfig, ImageSettings};
use super::manifest::{ImageIndex, ImageManifest, IndexEntry, Platform};
use super::media_types::ManifestStyle;
use crate::archive::build_layer;
use crate::constants::DEFAULT_CHUNK_SIZE;
use crate::digest::{BlobRef, Digest};
use crate::error::{CtaError, Result};
use crate::logging::TransportMetrics;
use crate::store::{put_bytes, ArtifactStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Init,
    LayerAdded,
    ConfigAdded,
    ManifestPushed,
}

/// Result of a successful manifest push.
#[derive(Debug, Clone)]
pub struct PushedImage {
    pub repository: String,
    /// Tag or digest the manifest was pushed under
    pub reference: String,
    pub descriptor: BlobRef,
    pub platform: Platform,
    pub style: ManifestStyle,
    pub manifest: ImageManifest,
}

pub struct ImageBuilder<'a> {
    store: &'a dyn ArtifactStore,
    repository: String,
    style: ManifestStyle,
    chunk_size: usize,
    compress: bool,
    state: BuildState,
    layers: Vec<BlobRef>,
    diff_ids: Vec<Digest>,
    config: Option<(BlobRef, ImageConfig)>,
    metrics: TransportMetrics,
}

impl<'a> ImageBuilder<'a> {
    pub fn new(store: &'a dyn ArtifactStore, repository: &str, style: ManifestStyle) -> Self {
        Self {
            store,
            repository: repository.to_string(),
            style,
            chunk_size: DEFAULT_CHUNK_SIZE,
            compress: true,
            state: BuildState::Init,
            layers: Vec::new(),
            diff_ids: Vec::new(),
            config: None,
            metrics: TransportMetrics::new(),
        }
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Store layers gzip-compressed (default) or as plain tar.
    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn diff_ids(&self) -> &[Digest] {
        &self.diff_ids
    }

    pub fn metrics(&self) -> &TransportMetrics {
        &self.metrics
    }

    fn ensure_state(&self, allowed: &[BuildState], action: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        let reason = match self.state {
            BuildState::ManifestPushed => "the manifest was already pushed",
            BuildState::ConfigAdded => "the config was already added",
            BuildState::Init | BuildState::LayerAdded => "no config was added",
        };
        Err(CtaError::InvalidState(format!(
            "cannot {} for {}: {}",
            action, self.repository, reason
        )))
    }

    /// Build a layer from `dir` and upload it. Returns the stored blob and its diff_id.
    pub fn add_layer_dir(&mut self, dir: &Path) -> Result<(BlobRef, Digest)> {
        self.ensure_state(&[BuildState::Init, BuildState::LayerAdded], "add a layer")?;

        let layer = build_layer(dir, self.compress)?;
        let blob = layer.blob_ref(self.style.media_types().layer(layer.compressed));
        let mut reader = BufReader::new(layer.open()?);
        if self
            .store
            .ensure_blob(&self.repository, &blob, &mut reader, self.chunk_size)?
        {
            self.metrics.blobs_uploaded += 1;
            self.metrics.bytes_uploaded += blob.size;
        } else {
            self.metrics.blobs_skipped += 1;
        }

        tracing::info!(
            repository = %self.repository,
            dir = %dir.display(),
            digest = %blob.digest,
            diff_id = %layer.diff_id,
            "Layer added"
        );
        self.layers.push(blob.clone());
        self.diff_ids.push(layer.diff_id.clone());
        self.state = BuildState::LayerAdded;
        Ok((blob, layer.diff_id))
    }

    /// Create and upload the image config from all layers added so far.
    pub fn add_config(&mut self, settings: &ImageSettings) -> Result<BlobRef> {
        self.ensure_state(&[BuildState::Init, BuildState::LayerAdded], "add the config")?;

        let config = ImageConfig::new(settings, &self.diff_ids)?;
        let bytes = config.to_bytes()?;
        let (blob, uploaded) = put_bytes(
            self.store,
            &self.repository,
            self.style.media_types().config,
            &bytes,
        )?;
        if uploaded {
            self.metrics.blobs_uploaded += 1;
            self.metrics.bytes_uploaded += blob.size;
        } else {
            self.metrics.blobs_skipped += 1;
        }

        tracing::debug!(repository = %self.repository, digest = %blob.digest, "Config added");
        self.config = Some((blob.clone(), config));
        self.state = BuildState::ConfigAdded;
        Ok(blob)
    }

    /// Push the manifest under `tag`.
    pub fn push_manifest(&mut self, tag: &str) -> Result<PushedImage> {
        self.push(Some(tag))
    }

    /// Push the manifest under its own digest only (for index children).
    pub fn push_untagged(&mut self) -> Result<PushedImage> {
        self.push(None)
    }

    fn push(&mut self, tag: Option<&str>) -> Result<PushedImage> {
        self.ensure_state(&[BuildState::ConfigAdded], "push the manifest")?;
        let (config_blob, config) = self
            .config
            .clone()
            .ok_or_else(|| CtaError::InvalidState("config missing".into()))?;

        let manifest = ImageManifest::new(self.style, config_blob, self.layers.clone());
        let bytes = manifest.to_bytes()?;
        let reference = match tag {
            Some(tag) => tag.to_string(),
            None => BlobRef::for_bytes(manifest.media_type(), &bytes).digest.to_string(),
        };
        let descriptor =
            self.store
                .push_manifest(&self.repository, &reference, manifest.media_type(), &bytes)?;
        self.metrics.manifests_pushed += 1;
        self.state = BuildState::ManifestPushed;

        let platform = Platform::new(&config.os, &config.architecture);
        tracing::info!(
            repository = %self.repository,
            reference = %reference,
            digest = %descriptor.digest,
            platform = %platform,
            style = %self.style,
            "Image pushed"
        );
        Ok(PushedImage {
            repository: self.repository.clone(),
            reference,
            descriptor,
            platform,
            style: self.style,
            manifest,
        })
    }
}

/// Groups single-platform manifests of one repository into an index.
pub struct MultiArchBuilder<'a> {
    store: &'a dyn ArtifactStore,
    repository: String,
    style: ManifestStyle,
    entries: Vec<IndexEntry>,
}

impl<'a> MultiArchBuilder<'a> {
    pub fn new(store: &'a dyn ArtifactStore, repository: &str, style: ManifestStyle) -> Self {
        Self {
            store,
            repository: repository.to_string(),
            style,
            entries: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Add a pushed image. Fails when the platform is already present.
    pub fn add_image(&mut self, image: &PushedImage) -> Result<()> {
        if image.repository != self.repository {
            return Err(CtaError::InvalidState(format!(
                "image in {} cannot be part of an index in {}",
                image.repository, self.repository
            )));
        }
        if image.style != self.style {
            return Err(CtaError::InvalidState(format!(
                "{} image cannot be part of a {} index",
                image.style, self.style
            )));
        }
        self.add_manifest(&image.descriptor, image.platform.clone())
    }

    /// Add a manifest already present in the repository.
    pub fn add_manifest(&mut self, descriptor: &BlobRef, platform: Platform) -> Result<()> {
        if self
            .entries
            .iter()
            .any(|e| e.platform.as_ref() == Some(&platform))
        {
            return Err(CtaError::InvalidState(format!(
                "platform {} already present in index for {}",
                platform, self.repository
            )));
        }
        self.entries.push(IndexEntry::new(descriptor, platform));
        Ok(())
    }

    /// Push the index under `tag`, entries in insertion order.
    pub fn push(&self, tag: &str) -> Result<BlobRef> {
        if self.entries.is_empty() {
            return Err(CtaError::InvalidState(format!(
                "index for {} has no manifests",
                self.repository
            )));
        }
        let index = ImageIndex::new(self.style, self.entries.clone());
        let bytes = index.to_bytes()?;
        let descriptor = self
            .store
            .push_manifest(&self.repository, tag, index.media_type(), &bytes)?;
        tracing::info!(
            repository = %self.repository,
            tag,
            digest = %descriptor.digest,
            platforms = self.entries.len(),
            "Index pushed"
        );
        Ok(descriptor)
    }
}
