//! OCI artifacts carried as local blobs.
//!
//! An artifact set is a gzip-compressed tar of a transport-archive directory holding one
//! artifact (plus, for an index, its untagged child manifests). Helm charts added from a
//! chart directory are wrapped the same way.

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use tempfile::{NamedTempFile, TempDir};

use crate::archive::{build_layer, extract_tar_gz, tar_gz_dir};
use crate::digest::BlobRef;
use crate::error::{CtaError, Result};
use crate::image::copy::{copy_artifact, CopyOptions, Location};
use crate::image::manifest::ImageManifest;
use crate::image::media_types;
use crate::logging::TransportMetrics;
use crate::store::ctf::ArtifactEntry;
use crate::store::{put_bytes, ArtifactStore, CtfArchive};

pub const HELM_CONFIG: &str = "application/vnd.cncf.helm.config.v1+json";
pub const HELM_CHART_CONTENT: &str = "application/vnd.cncf.helm.chart.content.v1.tar+gzip";

/// The artifact a set was built from, as `repository:tag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSetInfo {
    pub repository: String,
    pub tag: Option<String>,
    pub descriptor: BlobRef,
}

impl ArtifactSetInfo {
    /// `repository:tag`, or `repository@digest` for untagged artifacts.
    pub fn reference_name(&self) -> String {
        match &self.tag {
            Some(tag) => format!("{}:{}", self.repository, tag),
            None => format!("{}@{}", self.repository, self.descriptor.digest),
        }
    }
}

/// A packed artifact set waiting to be stored as a blob.
pub struct PackedArtifactSet {
    pub info: ArtifactSetInfo,
    pub file: NamedTempFile,
}

/// Export `reference` from `store` into an artifact set.
pub fn export(
    store: &dyn ArtifactStore,
    repository: &str,
    reference: &str,
    options: &CopyOptions,
) -> Result<PackedArtifactSet> {
    let staging = TempDir::new()?;
    let ctf = CtfArchive::create(staging.path(), false)?;
    let mut metrics = TransportMetrics::new();
    let descriptor = copy_artifact(
        Location::new(store, repository),
        reference,
        Location::new(&ctf, repository),
        reference,
        options,
        &mut metrics,
    )?;
    let tag = (!reference.starts_with("sha256:")).then(|| reference.to_string());
    Ok(PackedArtifactSet {
        info: ArtifactSetInfo {
            repository: repository.to_string(),
            tag,
            descriptor,
        },
        file: tar_gz_dir(staging.path())?,
    })
}

/// Pack a transport-archive directory holding one artifact.
pub fn from_dir(dir: &Path) -> Result<PackedArtifactSet> {
    let ctf = CtfArchive::open(dir)?;
    let entry = main_artifact(&ctf.entries())?;
    let (descriptor, _) = ctf.fetch_manifest(&entry.repository, entry.digest.as_str(), &[])?;
    Ok(PackedArtifactSet {
        info: ArtifactSetInfo {
            repository: entry.repository,
            tag: entry.tag,
            descriptor,
        },
        file: tar_gz_dir(dir)?,
    })
}

#[derive(Debug, Deserialize)]
struct ChartMetadata {
    name: String,
    version: String,
}

/// Package a Helm chart directory as an OCI artifact set. The artifact is named after
/// the chart and tagged with the chart version.
pub fn from_helm_chart(chart_dir: &Path) -> Result<PackedArtifactSet> {
    let chart_file = chart_dir.join("Chart.yaml");
    let chart_yaml = fs::read_to_string(&chart_file).map_err(|e| {
        CtaError::Config(format!("cannot read {}: {}", chart_file.display(), e))
    })?;
    let chart: ChartMetadata = serde_yaml::from_str(&chart_yaml)?;
    let config = serde_json::to_vec(&serde_yaml::from_str::<serde_json::Value>(&chart_yaml)?)?;

    let staging = TempDir::new()?;
    let ctf = CtfArchive::create(staging.path(), false)?;
    let (config_blob, _) = put_bytes(&ctf, &chart.name, HELM_CONFIG, &config)?;

    let layer = build_layer(chart_dir, true)?;
    let layer_blob = layer.blob_ref(HELM_CHART_CONTENT);
    ctf.ensure_blob(
        &chart.name,
        &layer_blob,
        &mut std::io::BufReader::new(layer.open()?),
        crate::constants::DEFAULT_CHUNK_SIZE,
    )?;

    let manifest =
        ImageManifest::with_media_type(media_types::OCI_IMAGE_MANIFEST, config_blob, vec![layer_blob]);
    let descriptor = ctf.push_manifest(
        &chart.name,
        &chart.version,
        media_types::OCI_IMAGE_MANIFEST,
        &manifest.to_bytes()?,
    )?;
    tracing::debug!(chart = %chart.name, version = %chart.version, digest = %descriptor.digest, "Packaged helm chart");

    Ok(PackedArtifactSet {
        info: ArtifactSetInfo {
            repository: chart.name,
            tag: Some(chart.version),
            descriptor,
        },
        file: tar_gz_dir(staging.path())?,
    })
}

/// Unpack an artifact set read from `reader` and push its artifact to
/// `target`/`repository` under `reference`.
pub fn import<R: Read>(
    reader: R,
    target: &dyn ArtifactStore,
    repository: &str,
    reference: &str,
    options: &CopyOptions,
    metrics: &mut TransportMetrics,
) -> Result<BlobRef> {
    let staging = TempDir::new()?;
    extract_tar_gz(reader, staging.path())?;
    let ctf = CtfArchive::open(staging.path())
        .map_err(|e| CtaError::malformed(format!("artifact set is not a transport archive: {}", e)))?;
    let entry = main_artifact(&ctf.entries())?;
    copy_artifact(
        Location::new(&ctf, &entry.repository),
        entry.digest.as_str(),
        Location::new(target, repository),
        reference,
        options,
        metrics,
    )
}

/// The single tagged artifact, or the only entry of an untagged set.
fn main_artifact(entries: &[ArtifactEntry]) -> Result<ArtifactEntry> {
    let tagged: Vec<&ArtifactEntry> = entries.iter().filter(|e| e.tag.is_some()).collect();
    match (tagged.as_slice(), entries) {
        ([entry], _) => Ok((*entry).clone()),
        ([], [entry]) => Ok(entry.clone()),
        _ => Err(CtaError::malformed(format!(
            "artifact set must hold exactly one artifact, found {}",
            if tagged.is_empty() { entries.len() } else { tagged.len() }
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::builder::ImageBuilder;
    use crate::image::config::ImageSettings;
    use crate::image::media_types::ManifestStyle;
    use crate::store::MemoryStore;
    use std::fs::File;

    fn write_chart(root: &Path) -> std::path::PathBuf {
        let chart = root.join("echoserver-helmchart");
        fs::create_dir_all(chart.join("templates")).unwrap();
        fs::write(
            chart.join("Chart.yaml"),
            "apiVersion: v2\nname: echoserver\nversion: 0.1.0\n",
        )
        .unwrap();
        fs::write(chart.join("templates/deployment.yaml"), "kind: Deployment\n").unwrap();
        chart
    }

    #[test]
    fn test_helm_chart_set_imports_into_registry() {
        let tmp = TempDir::new().unwrap();
        let set = from_helm_chart(&write_chart(tmp.path())).unwrap();
        assert_eq!(set.info.reference_name(), "echoserver:0.1.0");

        let registry = MemoryStore::new();
        let mut metrics = TransportMetrics::new();
        let pushed = import(
            File::open(set.file.path()).unwrap(),
            &registry,
            "charts/echoserver",
            "0.1.0",
            &CopyOptions::default(),
            &mut metrics,
        )
        .unwrap();
        assert_eq!(pushed.digest, set.info.descriptor.digest);
        assert_eq!(metrics.blobs_uploaded, 2);

        let (_, bytes) = registry
            .fetch_manifest("charts/echoserver", "0.1.0", &[])
            .unwrap();
        let manifest = ImageManifest::from_bytes(&bytes).unwrap();
        assert_eq!(manifest.config.media_type, HELM_CONFIG);
        assert_eq!(manifest.layers[0].media_type, HELM_CHART_CONTENT);
    }

    #[test]
    fn test_export_then_import_keeps_digest() {
        let tmp = TempDir::new().unwrap();
        let layer_dir = tmp.path().join("app");
        fs::create_dir_all(&layer_dir).unwrap();
        fs::write(layer_dir.join("run"), "x").unwrap();

        let source = MemoryStore::new();
        let mut builder = ImageBuilder::new(&source, "app", ManifestStyle::Oci);
        builder.add_layer_dir(&layer_dir).unwrap();
        builder
            .add_config(&ImageSettings::new("linux", "amd64", "/app/run"))
            .unwrap();
        let image = builder.push_manifest("1.0").unwrap();

        let set = export(&source, "app", "1.0", &CopyOptions::default()).unwrap();
        assert_eq!(set.info.reference_name(), "app:1.0");

        let target = MemoryStore::new();
        let pushed = import(
            File::open(set.file.path()).unwrap(),
            &target,
            "mirror/app",
            "1.0",
            &CopyOptions::default(),
            &mut TransportMetrics::new(),
        )
        .unwrap();
        assert_eq!(pushed.digest, image.descriptor.digest);
    }

    #[test]
    fn test_dir_with_two_artifacts_rejected() {
        let tmp = TempDir::new().unwrap();
        let ctf = CtfArchive::create(tmp.path(), false).unwrap();
        for tag in ["a", "b"] {
            let config = format!("{{\"tag\":\"{}\"}}", tag);
            let (config, _) = put_bytes(&ctf, "x", media_types::OCI_IMAGE_CONFIG, config.as_bytes()).unwrap();
            let manifest = ImageManifest::new(ManifestStyle::Oci, config, Vec::new());
            ctf.push_manifest("x", tag, media_types::OCI_IMAGE_MANIFEST, &manifest.to_bytes().unwrap())
                .unwrap();
        }
        assert!(matches!(
            from_dir(tmp.path()),
            Err(CtaError::MalformedArchive(_))
        ));
    }
}
