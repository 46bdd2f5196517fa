use chrono::{DateTime, Utc};
use cta::error::CtaError;
use cta::image::config::ImageConfig;
use cta::image::media_types::{
    DOCKER_CONFIG, DOCKER_LAYER_GZIP, DOCKER_MANIFEST, DOCKER_MANIFEST_LIST, OCI_IMAGE_MANIFEST,
    OCI_LAYER_TAR,
};
use cta::image::{
    copy_artifact, CopyOptions, ImageBuilder, ImageIndex, ImageManifest, ImageSettings, Location,
    ManifestStyle, MultiArchBuilder, PushedImage,
};
use cta::logging::TransportMetrics;
use cta::store::{read_blob, ArtifactStore, MemoryStore};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn layer_dir(root: &Path, name: &str, content: &str) -> PathBuf {
    let dir = root.join(name);
    fs::create_dir_all(dir.join("bin")).unwrap();
    fs::write(dir.join("bin").join(name), content).unwrap();
    dir
}

fn settings(arch: &str) -> ImageSettings {
    let created: DateTime<Utc> = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc);
    ImageSettings {
        created: Some(created),
        ..ImageSettings::new("linux", arch, "/app/bin/app")
    }
}

fn build(store: &MemoryStore, root: &Path, repository: &str, style: ManifestStyle, arch: &str) -> (PushedImage, u64) {
    let mut builder = ImageBuilder::new(store, repository, style);
    builder.add_layer_dir(&layer_dir(root, "base", "base layer")).unwrap();
    builder
        .add_layer_dir(&layer_dir(root, "app", &format!("app for {}", arch)))
        .unwrap();
    builder.add_config(&settings(arch)).unwrap();
    let pushed = builder.push_untagged().unwrap();
    (pushed, builder.metrics().blobs_uploaded)
}

#[test]
fn test_docker_image_with_two_layers() {
    let store = MemoryStore::new();
    let tmp = tempdir().unwrap();

    let mut builder = ImageBuilder::new(&store, "hello", ManifestStyle::Docker);
    let (first, first_diff) = builder.add_layer_dir(&layer_dir(tmp.path(), "base", "base layer")).unwrap();
    let (second, second_diff) = builder.add_layer_dir(&layer_dir(tmp.path(), "app", "app")).unwrap();
    assert_eq!(builder.diff_ids(), &[first_diff.clone(), second_diff.clone()]);
    let config_blob = builder.add_config(&settings("amd64")).unwrap();
    let pushed = builder.push_manifest("0.1.0").unwrap();

    // 1. Manifest in Docker media types, layers in insertion order
    assert_eq!(pushed.descriptor.media_type, DOCKER_MANIFEST);
    let (_, bytes) = store.fetch_manifest("hello", "0.1.0", &[DOCKER_MANIFEST]).unwrap();
    let manifest = ImageManifest::from_bytes(&bytes).unwrap();
    assert_eq!(manifest.config.media_type, DOCKER_CONFIG);
    assert_eq!(manifest.config.digest, config_blob.digest);
    assert_eq!(manifest.layers, vec![first.clone(), second.clone()]);
    assert!(manifest.layers.iter().all(|l| l.media_type == DOCKER_LAYER_GZIP));

    // 2. Config records the uncompressed digests in the same order
    let config = ImageConfig::from_bytes(&read_blob(&store, "hello", &config_blob.digest).unwrap()).unwrap();
    assert_eq!(config.rootfs.diff_ids, vec![first_diff.clone(), second_diff]);
    assert_eq!(config.architecture, "amd64");
    assert_eq!(config.config.entrypoint, vec!["/app/bin/app"]);

    // Compressed layers are stored under their compressed digest
    assert_ne!(first.digest, first_diff);
}

#[test]
fn test_uncompressed_layer_digest_is_diff_id() {
    let store = MemoryStore::new();
    let tmp = tempdir().unwrap();
    let mut builder = ImageBuilder::new(&store, "plain", ManifestStyle::Oci).compress(false);
    let (blob, diff_id) = builder.add_layer_dir(&layer_dir(tmp.path(), "base", "x")).unwrap();
    assert_eq!(blob.digest, diff_id);
    assert_eq!(blob.media_type, OCI_LAYER_TAR);
}

#[test]
fn test_rebuilding_an_image_uploads_nothing() {
    let store = MemoryStore::new();
    let tmp = tempdir().unwrap();

    let (first, uploaded) = build(&store, tmp.path(), "hello", ManifestStyle::Oci, "amd64");
    assert_eq!(uploaded, 3);
    let uploads = store.upload_count();

    let (second, uploaded) = build(&store, tmp.path(), "hello", ManifestStyle::Oci, "amd64");
    assert_eq!(uploaded, 0);
    assert_eq!(store.upload_count(), uploads);
    assert_eq!(first.descriptor.digest, second.descriptor.digest);
}

#[test]
fn test_multi_arch_index_copy() {
    let source = MemoryStore::new();
    let target = MemoryStore::new();
    let tmp = tempdir().unwrap();

    // 1. Two platforms in one Docker manifest list
    let mut index = MultiArchBuilder::new(&source, "echo", ManifestStyle::Docker);
    for arch in ["amd64", "arm64"] {
        let (image, _) = build(&source, tmp.path(), "echo", ManifestStyle::Docker, arch);
        index.add_image(&image).unwrap();
    }
    let (duplicate, _) = build(&source, tmp.path(), "echo", ManifestStyle::Docker, "arm64");
    assert!(matches!(index.add_image(&duplicate), Err(CtaError::InvalidState(_))));
    let pushed = index.push("1.0").unwrap();
    assert_eq!(pushed.media_type, DOCKER_MANIFEST_LIST);

    // 2. Copy the index: children first, then the list itself
    let mut metrics = TransportMetrics::new();
    let copied = copy_artifact(
        Location::new(&source, "echo"),
        "1.0",
        Location::new(&target, "mirror/echo"),
        "1.0",
        &CopyOptions::default(),
        &mut metrics,
    )
    .unwrap();
    assert_eq!(copied.digest, pushed.digest);
    assert_eq!(metrics.manifests_pushed, 3);

    let (_, bytes) = target.fetch_manifest("mirror/echo", "1.0", &[DOCKER_MANIFEST_LIST]).unwrap();
    let list = ImageIndex::from_bytes(&bytes).unwrap();
    assert_eq!(list.manifests.len(), 2);
    for entry in &list.manifests {
        assert!(target
            .head_manifest("mirror/echo", entry.digest.as_str(), &[DOCKER_MANIFEST])
            .unwrap()
            .is_some());
    }

    // 3. A second copy finds everything in place
    let mut again = TransportMetrics::new();
    copy_artifact(
        Location::new(&source, "echo"),
        "1.0",
        Location::new(&target, "mirror/echo"),
        "1.0",
        &CopyOptions::default(),
        &mut again,
    )
    .unwrap();
    assert_eq!(again.blobs_uploaded, 0);
    assert!(target
        .head_manifest("mirror/echo", "1.0", &[OCI_IMAGE_MANIFEST, DOCKER_MANIFEST_LIST])
        .unwrap()
        .is_some());
}
