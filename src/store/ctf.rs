//! Component transport archive (CTF) on disk.
//!
//! Layout:
//! ```text
//! <root>/artifact-index.json   {"schemaVersion":1,"artifacts":[{repository,tag,digest}]}
//! <root>/blobs/sha256.<hex>    every blob and manifest, shared by all repositories
//! ```
//! The index is rewritten after every manifest push. A single process owns an archive
//! at a time; the in-process writer is serialized by a mutex.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::ArtifactStore;
use crate::constants::{ARTIFACT_INDEX_FILE, BLOBS_DIR};
use crate::digest::{digest_bytes, verify, BlobRef, Digest, HashingWriter};
use crate::error::{CtaError, Result};

const INDEX_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub digest: Digest,
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(default)]
    pub artifacts: Vec<ArtifactEntry>,
}

impl Default for ArtifactIndex {
    fn default() -> Self {
        Self {
            schema_version: INDEX_SCHEMA_VERSION,
            artifacts: Vec::new(),
        }
    }
}

impl ArtifactIndex {
    fn find(&self, repository: &str, reference: &str) -> Option<&ArtifactEntry> {
        self.artifacts.iter().find(|e| {
            e.repository == repository
                && (e.tag.as_deref() == Some(reference) || e.digest.as_str() == reference)
        })
    }

    /// Record a manifest; a tag moves to the new digest, a digest push adds an
    /// untagged entry unless one already exists.
    fn record(&mut self, repository: &str, reference: &str, descriptor: &BlobRef) {
        let tag = (!reference.starts_with("sha256:")).then(|| reference.to_string());
        let entry = ArtifactEntry {
            repository: repository.to_string(),
            tag: tag.clone(),
            digest: descriptor.digest.clone(),
            media_type: Some(descriptor.media_type.clone()),
        };
        match &tag {
            Some(tag) => {
                self.artifacts.retain(|e| {
                    !(e.repository == repository
                        && (e.tag.as_deref() == Some(tag.as_str())
                            || (e.tag.is_none() && e.digest == descriptor.digest)))
                });
                self.artifacts.push(entry);
            }
            None => {
                if !self
                    .artifacts
                    .iter()
                    .any(|e| e.repository == repository && e.digest == descriptor.digest)
                {
                    self.artifacts.push(entry);
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct CtfArchive {
    root: PathBuf,
    index: Mutex<ArtifactIndex>,
}

impl CtfArchive {
    /// Create an empty archive. An existing archive is replaced only with `force`.
    pub fn create(root: &Path, force: bool) -> Result<Self> {
        if root.join(ARTIFACT_INDEX_FILE).exists() {
            if !force {
                return Err(CtaError::AlreadyExists {
                    what: format!("transport archive {}", root.display()),
                });
            }
            fs::remove_dir_all(root)?;
        }
        fs::create_dir_all(root.join(BLOBS_DIR))?;
        let archive = Self {
            root: root.to_path_buf(),
            index: Mutex::new(ArtifactIndex::default()),
        };
        archive.persist(&archive.index.lock())?;
        tracing::debug!(path = %root.display(), "Created transport archive");
        Ok(archive)
    }

    pub fn open(root: &Path) -> Result<Self> {
        let index_path = root.join(ARTIFACT_INDEX_FILE);
        if !index_path.exists() {
            return Err(CtaError::not_found(format!(
                "transport archive index {}",
                index_path.display()
            )));
        }
        let index: ArtifactIndex = serde_json::from_reader(BufReader::new(File::open(&index_path)?))
            .map_err(|e| CtaError::malformed(format!("{}: {}", index_path.display(), e)))?;
        if index.schema_version != INDEX_SCHEMA_VERSION {
            return Err(CtaError::malformed(format!(
                "unsupported artifact index schema version {}",
                index.schema_version
            )));
        }
        fs::create_dir_all(root.join(BLOBS_DIR))?;
        Ok(Self {
            root: root.to_path_buf(),
            index: Mutex::new(index),
        })
    }

    pub fn open_or_create(root: &Path) -> Result<Self> {
        if root.join(ARTIFACT_INDEX_FILE).exists() {
            Self::open(root)
        } else {
            Self::create(root, false)
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entries(&self) -> Vec<ArtifactEntry> {
        self.index.lock().artifacts.clone()
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join(BLOBS_DIR).join(digest.file_name())
    }

    fn persist(&self, index: &ArtifactIndex) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer_pretty(&mut writer, index)?;
            writer.flush()?;
        }
        tmp.persist(self.root.join(ARTIFACT_INDEX_FILE))
            .map_err(|e| CtaError::Io(e.error))?;
        Ok(())
    }

    fn write_blob(&self, expected: &Digest, reader: &mut dyn Read) -> Result<u64> {
        let tmp = NamedTempFile::new_in(self.root.join(BLOBS_DIR))?;
        let mut writer = HashingWriter::new(BufWriter::new(tmp.reopen()?));
        io::copy(reader, &mut writer)?;
        writer.flush()?;
        let (_, actual, size) = writer.finish();
        verify(expected, &actual)?;
        tmp.persist(self.blob_path(expected))
            .map_err(|e| CtaError::Io(e.error))?;
        Ok(size)
    }

    fn manifest_descriptor(&self, repository: &str, reference: &str) -> Result<Option<BlobRef>> {
        let index = self.index.lock();
        if let Some(entry) = index.find(repository, reference) {
            let size = fs::metadata(self.blob_path(&entry.digest))?.len();
            let media_type = match &entry.media_type {
                Some(media_type) => media_type.clone(),
                None => manifest_media_type(&fs::read(self.blob_path(&entry.digest))?),
            };
            return Ok(Some(BlobRef::new(media_type, entry.digest.clone(), size)));
        }
        drop(index);

        // Child manifests of an index may live only as blobs.
        if reference.starts_with("sha256:") {
            let digest = Digest::parse(reference)?;
            let path = self.blob_path(&digest);
            if path.exists() {
                let bytes = fs::read(&path)?;
                return Ok(Some(BlobRef::new(
                    manifest_media_type(&bytes),
                    digest,
                    bytes.len() as u64,
                )));
            }
        }
        Ok(None)
    }
}

fn manifest_media_type(bytes: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(bytes)
        .ok()
        .and_then(|v| v.get("mediaType").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| crate::image::media_types::OCI_IMAGE_MANIFEST.to_string())
}

impl ArtifactStore for CtfArchive {
    fn stat_blob(&self, _repository: &str, digest: &Digest) -> Result<Option<u64>> {
        match fs::metadata(self.blob_path(digest)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn upload_blob(
        &self,
        _repository: &str,
        blob: &BlobRef,
        reader: &mut dyn Read,
        _chunk_size: usize,
    ) -> Result<()> {
        let size = self.write_blob(&blob.digest, reader)?;
        tracing::debug!(digest = %blob.digest, size_bytes = size, "Blob written to archive");
        Ok(())
    }

    fn fetch_blob(&self, repository: &str, digest: &Digest) -> Result<Box<dyn Read + Send + '_>> {
        match File::open(self.blob_path(digest)) {
            Ok(file) => Ok(Box::new(BufReader::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CtaError::not_found(format!(
                "blob {} in {} ({})",
                digest,
                repository,
                self.root.display()
            ))),
            Err(e) => Err(e.into()),
        }
    }

    fn head_manifest(
        &self,
        repository: &str,
        reference: &str,
        _accept: &[&str],
    ) -> Result<Option<BlobRef>> {
        self.manifest_descriptor(repository, reference)
    }

    fn fetch_manifest(
        &self,
        repository: &str,
        reference: &str,
        _accept: &[&str],
    ) -> Result<(BlobRef, Vec<u8>)> {
        let descriptor = self
            .manifest_descriptor(repository, reference)?
            .ok_or_else(|| CtaError::not_found(format!("manifest {}:{}", repository, reference)))?;
        let bytes = fs::read(self.blob_path(&descriptor.digest))?;
        verify(&descriptor.digest, &digest_bytes(&bytes))?;
        Ok((descriptor, bytes))
    }

    fn push_manifest(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        bytes: &[u8],
    ) -> Result<BlobRef> {
        let descriptor = BlobRef::for_bytes(media_type, bytes);
        super::verify_manifest_reference(reference, &descriptor)?;
        if !self.blob_exists(repository, &descriptor.digest)? {
            self.write_blob(&descriptor.digest, &mut &bytes[..])?;
        }

        let mut index = self.index.lock();
        index.record(repository, reference, &descriptor);
        self.persist(&index)?;
        tracing::info!(
            archive = %self.root.display(),
            repository,
            reference,
            digest = %descriptor.digest,
            "Manifest stored in transport archive"
        );
        Ok(descriptor)
    }

    fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        Ok(self
            .index
            .lock()
            .artifacts
            .iter()
            .filter(|e| e.repository == repository)
            .filter_map(|e| e.tag.clone())
            .collect())
    }
}
