//! In-process registry.
//!
//! Behaves like a registry for everything the engine relies on: blobs are scoped per
//! repository, digests are verified on upload, and a manifest is only accepted once
//! every blob (or child manifest) it references is present in the repository.

use std::collections::{BTreeSet, HashMap};
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{verify_manifest_reference, ArtifactStore};
use crate::digest::{digest_bytes, verify, BlobRef, Digest};
use crate::error::{CtaError, Result};

type BlobKey = (String, Digest);
type ManifestKey = (String, String);

#[derive(Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<BlobKey, Arc<Vec<u8>>>>,
    manifests: RwLock<HashMap<ManifestKey, (BlobRef, Arc<Vec<u8>>)>>,
    uploads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `upload_blob` calls that stored bytes.
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.read().len()
    }

    /// Repositories holding at least one manifest, sorted.
    pub fn repositories(&self) -> Vec<String> {
        self.manifests
            .read()
            .keys()
            .map(|(repo, _)| repo.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn check_references(&self, repository: &str, bytes: &[u8]) -> Result<()> {
        let document: serde_json::Value = serde_json::from_slice(bytes)?;
        let digests_at = |pointer: &str| -> Vec<String> {
            match document.pointer(pointer) {
                Some(serde_json::Value::Array(items)) => items
                    .iter()
                    .filter_map(|i| i.get("digest").and_then(|d| d.as_str()).map(str::to_string))
                    .collect(),
                Some(item) => item
                    .get("digest")
                    .and_then(|d| d.as_str())
                    .map(|d| vec![d.to_string()])
                    .unwrap_or_default(),
                None => Vec::new(),
            }
        };

        let blobs = self.blobs.read();
        for digest in digests_at("/config").into_iter().chain(digests_at("/layers")) {
            let digest = Digest::parse(&digest)?;
            if !blobs.contains_key(&(repository.to_string(), digest.clone())) {
                return Err(CtaError::not_found(format!(
                    "blob {} referenced by manifest in {}",
                    digest, repository
                )));
            }
        }
        let manifests = self.manifests.read();
        for digest in digests_at("/manifests") {
            if !manifests.contains_key(&(repository.to_string(), digest.clone())) {
                return Err(CtaError::not_found(format!(
                    "manifest {} referenced by index in {}",
                    digest, repository
                )));
            }
        }
        Ok(())
    }
}

impl ArtifactStore for MemoryStore {
    fn stat_blob(&self, repository: &str, digest: &Digest) -> Result<Option<u64>> {
        Ok(self
            .blobs
            .read()
            .get(&(repository.to_string(), digest.clone()))
            .map(|data| data.len() as u64))
    }

    fn upload_blob(
        &self,
        repository: &str,
        blob: &BlobRef,
        reader: &mut dyn Read,
        _chunk_size: usize,
    ) -> Result<()> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        verify(&blob.digest, &digest_bytes(&data))?;
        self.blobs
            .write()
            .insert((repository.to_string(), blob.digest.clone()), Arc::new(data));
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn fetch_blob(&self, repository: &str, digest: &Digest) -> Result<Box<dyn Read + Send + '_>> {
        let data = self
            .blobs
            .read()
            .get(&(repository.to_string(), digest.clone()))
            .cloned()
            .ok_or_else(|| CtaError::not_found(format!("blob {} in {}", digest, repository)))?;
        Ok(Box::new(Cursor::new(data.as_ref().clone())))
    }

    fn head_manifest(
        &self,
        repository: &str,
        reference: &str,
        _accept: &[&str],
    ) -> Result<Option<BlobRef>> {
        Ok(self
            .manifests
            .read()
            .get(&(repository.to_string(), reference.to_string()))
            .map(|(descriptor, _)| descriptor.clone()))
    }

    fn fetch_manifest(
        &self,
        repository: &str,
        reference: &str,
        _accept: &[&str],
    ) -> Result<(BlobRef, Vec<u8>)> {
        let (descriptor, bytes) = self
            .manifests
            .read()
            .get(&(repository.to_string(), reference.to_string()))
            .cloned()
            .ok_or_else(|| {
                CtaError::not_found(format!("manifest {}:{}", repository, reference))
            })?;
        verify_manifest_reference(reference, &descriptor)?;
        Ok((descriptor, bytes.as_ref().clone()))
    }

    fn push_manifest(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        bytes: &[u8],
    ) -> Result<BlobRef> {
        let descriptor = BlobRef::for_bytes(media_type, bytes);
        verify_manifest_reference(reference, &descriptor)?;
        self.check_references(repository, bytes)?;

        let stored = (descriptor.clone(), Arc::new(bytes.to_vec()));
        let mut manifests = self.manifests.write();
        manifests.insert(
            (repository.to_string(), descriptor.digest.to_string()),
            stored.clone(),
        );
        manifests.insert((repository.to_string(), reference.to_string()), stored);
        Ok(descriptor)
    }

    fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let mut tags: Vec<String> = self
            .manifests
            .read()
            .keys()
            .filter(|(repo, reference)| repo == repository && !reference.starts_with("sha256:"))
            .map(|(_, reference)| reference.clone())
            .collect();
        tags.sort();
        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::put_bytes;

    #[test]
    fn test_upload_rejects_wrong_digest() {
        let store = MemoryStore::new();
        let blob = BlobRef::for_bytes("application/octet-stream", b"expected");
        let err = store
            .upload_blob("repo", &blob, &mut &b"tampered"[..], 1024)
            .unwrap_err();
        assert!(matches!(err, CtaError::DigestMismatch { .. }));
        assert!(!store.blob_exists("repo", &blob.digest).unwrap());
    }

    #[test]
    fn test_blobs_are_scoped_per_repository() {
        let store = MemoryStore::new();
        let (blob, _) = put_bytes(&store, "a", "application/octet-stream", b"x").unwrap();
        assert!(store.blob_exists("a", &blob.digest).unwrap());
        assert!(!store.blob_exists("b", &blob.digest).unwrap());
    }

    #[test]
    fn test_manifest_requires_referenced_blobs() {
        let store = MemoryStore::new();
        let config = BlobRef::for_bytes("application/vnd.oci.image.config.v1+json", b"{}");
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": config,
            "layers": []
        });
        let bytes = serde_json::to_vec(&manifest).unwrap();
        let media_type = "application/vnd.oci.image.manifest.v1+json";
        assert!(store.push_manifest("repo", "v1", media_type, &bytes).is_err());

        put_bytes(&store, "repo", &config.media_type, b"{}").unwrap();
        let pushed = store.push_manifest("repo", "v1", media_type, &bytes).unwrap();
        assert_eq!(
            store.head_manifest("repo", pushed.digest.as_str(), &[]).unwrap(),
            Some(pushed.clone())
        );
        assert_eq!(store.list_tags("repo").unwrap(), vec!["v1".to_string()]);
        assert_eq!(store.fetch_manifest("repo", "v1", &[]).unwrap().1, bytes);
    }
}
