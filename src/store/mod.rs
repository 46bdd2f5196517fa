//! Content-addressed artifact stores.
//!
//! An [`ArtifactStore`] holds blobs and manifests keyed by repository. The registry
//! client, the on-disk transport archive and the in-memory store all implement it, so
//! image building, component packing and transport never care where bytes live.

pub mod ctf;
pub mod memory;
pub mod registry;

use std::collections::HashMap;
use std::io::{self, BufReader, Read, Seek, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::NamedTempFile;

use crate::config::RegistryConfig;
use crate::digest::{copy_verified, BlobRef, Digest};
use crate::error::{CtaError, Result};
use crate::reference::RepositorySpec;

pub use ctf::CtfArchive;
pub use memory::MemoryStore;
pub use registry::RegistryClient;

/// Storage backend for blobs and manifests.
pub trait ArtifactStore: Send + Sync {
    /// Size of the blob if present.
    fn stat_blob(&self, repository: &str, digest: &Digest) -> Result<Option<u64>>;

    fn blob_exists(&self, repository: &str, digest: &Digest) -> Result<bool> {
        Ok(self.stat_blob(repository, digest)?.is_some())
    }

    /// Store `blob` read from `reader`. The content must hash to `blob.digest`.
    fn upload_blob(
        &self,
        repository: &str,
        blob: &BlobRef,
        reader: &mut dyn Read,
        chunk_size: usize,
    ) -> Result<()>;

    /// Upload unless the blob is already present. Returns whether bytes were sent.
    fn ensure_blob(
        &self,
        repository: &str,
        blob: &BlobRef,
        reader: &mut dyn Read,
        chunk_size: usize,
    ) -> Result<bool> {
        if self.blob_exists(repository, &blob.digest)? {
            crate::log_blob_skip!(repository, blob.digest);
            return Ok(false);
        }
        crate::log_blob_upload!(repository, blob.digest, blob.size);
        self.upload_blob(repository, blob, reader, chunk_size)?;
        Ok(true)
    }

    /// Stream a blob. Callers that need integrity use [`ArtifactStore::fetch_blob_to`].
    fn fetch_blob(&self, repository: &str, digest: &Digest) -> Result<Box<dyn Read + Send + '_>>;

    /// Copy a blob into `writer`, verifying its digest on the way.
    fn fetch_blob_to(&self, repository: &str, digest: &Digest, writer: &mut dyn Write) -> Result<u64> {
        let reader = self.fetch_blob(repository, digest)?;
        copy_verified(reader, writer, digest)
    }

    /// Descriptor of a manifest, `None` when absent.
    fn head_manifest(
        &self,
        repository: &str,
        reference: &str,
        accept: &[&str],
    ) -> Result<Option<BlobRef>>;

    /// Manifest bytes and descriptor. Verifies the digest when `reference` is one.
    fn fetch_manifest(
        &self,
        repository: &str,
        reference: &str,
        accept: &[&str],
    ) -> Result<(BlobRef, Vec<u8>)>;

    /// Store a manifest under `reference` (tag or digest).
    fn push_manifest(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        bytes: &[u8],
    ) -> Result<BlobRef>;

    fn list_tags(&self, repository: &str) -> Result<Vec<String>>;
}

/// Check fetched manifest bytes against a digest reference.
pub(crate) fn verify_manifest_reference(reference: &str, descriptor: &BlobRef) -> Result<()> {
    if reference.starts_with("sha256:") {
        let expected = Digest::parse(reference)?;
        crate::digest::verify(&expected, &descriptor.digest)?;
    }
    Ok(())
}

/// Copy one blob between stores. A no-op when the target already has it.
///
/// The blob is spooled through a temp file and verified before upload so a corrupt
/// source never lands at the target. Returns whether bytes were uploaded.
pub fn copy_blob(
    source: &dyn ArtifactStore,
    source_repository: &str,
    target: &dyn ArtifactStore,
    target_repository: &str,
    blob: &BlobRef,
    chunk_size: usize,
) -> Result<bool> {
    if target.blob_exists(target_repository, &blob.digest)? {
        crate::log_blob_skip!(target_repository, blob.digest);
        return Ok(false);
    }

    let mut spool = NamedTempFile::new()?;
    let size = source.fetch_blob_to(source_repository, &blob.digest, spool.as_file_mut())?;
    spool.as_file_mut().flush()?;
    spool.as_file_mut().rewind()?;

    let blob = BlobRef::new(blob.media_type.clone(), blob.digest.clone(), size);
    crate::log_blob_upload!(target_repository, blob.digest, size);
    let mut reader = BufReader::new(spool.as_file_mut());
    target.upload_blob(target_repository, &blob, &mut reader, chunk_size)?;
    Ok(true)
}

/// Read a whole blob into memory, verified. Only for small blobs (configs, descriptors).
pub fn read_blob(store: &dyn ArtifactStore, repository: &str, digest: &Digest) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    store.fetch_blob_to(repository, digest, &mut data)?;
    Ok(data)
}

/// Upload an in-memory blob unless present.
pub fn put_bytes(
    store: &dyn ArtifactStore,
    repository: &str,
    media_type: &str,
    data: &[u8],
) -> Result<(BlobRef, bool)> {
    let blob = BlobRef::for_bytes(media_type, data);
    let uploaded = store.ensure_blob(repository, &blob, &mut io::Cursor::new(data), data.len().max(1))?;
    Ok((blob, uploaded))
}

/// Opens stores for repository specs.
pub trait StoreFactory: Send + Sync {
    fn open(&self, spec: &RepositorySpec) -> Result<Arc<dyn ArtifactStore>>;
}

/// Opens registry clients from a [`RegistryConfig`] and transport archives from disk.
/// Stores are cached per location.
pub struct StoreConnector {
    config: RegistryConfig,
    opened: Mutex<HashMap<String, Arc<dyn ArtifactStore>>>,
}

impl StoreConnector {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            opened: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }
}

impl StoreFactory for StoreConnector {
    fn open(&self, spec: &RepositorySpec) -> Result<Arc<dyn ArtifactStore>> {
        let key = spec.store_key();
        let mut opened = self.opened.lock();
        if let Some(store) = opened.get(&key) {
            return Ok(store.clone());
        }
        let store: Arc<dyn ArtifactStore> = match spec {
            RepositorySpec::Oci { host, .. } => Arc::new(RegistryClient::new(
                host,
                &self.config,
                Box::new(self.config.credential_chain()),
            )?),
            RepositorySpec::Ctf { path } => Arc::new(CtfArchive::open_or_create(path)?),
        };
        opened.insert(key, store.clone());
        Ok(store)
    }
}

/// Fixed set of stores keyed by [`RepositorySpec::store_key`]; unknown hosts are
/// unreachable. Transport archives that were not registered are opened from disk.
/// Used for dry runs and tests.
#[derive(Default)]
pub struct StaticStores {
    stores: Mutex<HashMap<String, Arc<dyn ArtifactStore>>>,
}

impl StaticStores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: impl Into<String>, store: Arc<dyn ArtifactStore>) -> Self {
        self.stores.lock().insert(key.into(), store);
        self
    }
}

impl StoreFactory for StaticStores {
    fn open(&self, spec: &RepositorySpec) -> Result<Arc<dyn ArtifactStore>> {
        let key = spec.store_key();
        let mut stores = self.stores.lock();
        if let Some(store) = stores.get(&key) {
            return Ok(store.clone());
        }
        match spec {
            RepositorySpec::Ctf { path } => {
                let store: Arc<dyn ArtifactStore> = Arc::new(CtfArchive::open_or_create(path)?);
                stores.insert(key, store.clone());
                Ok(store)
            }
            RepositorySpec::Oci { .. } => Err(CtaError::transport(
                format!("no store configured for {}", spec),
                false,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::digest_bytes;

    #[test]
    fn test_copy_blob_skips_present_blob() {
        let source = MemoryStore::new();
        let target = MemoryStore::new();
        let (blob, uploaded) = put_bytes(&source, "src", "application/octet-stream", b"layer").unwrap();
        assert!(uploaded);

        assert!(copy_blob(&source, "src", &target, "dst", &blob, 2).unwrap());
        assert!(!copy_blob(&source, "src", &target, "dst", &blob, 2).unwrap());
        assert_eq!(read_blob(&target, "dst", &blob.digest).unwrap(), b"layer");
    }

    #[test]
    fn test_put_bytes_is_idempotent() {
        let store = MemoryStore::new();
        let (_, first) = put_bytes(&store, "repo", "application/octet-stream", b"abc").unwrap();
        let (_, second) = put_bytes(&store, "repo", "application/octet-stream", b"abc").unwrap();
        assert!(first);
        assert!(!second);
        assert_eq!(store.blob_count(), 1);
    }

    #[test]
    fn test_copy_missing_blob_is_not_found() {
        let source = MemoryStore::new();
        let target = MemoryStore::new();
        let blob = BlobRef::new("application/octet-stream", digest_bytes(b"nope"), 4);
        let err = copy_blob(&source, "src", &target, "dst", &blob, 1024).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_static_stores_rejects_unknown_host() {
        let stores = StaticStores::new().with("localhost:5000", Arc::new(MemoryStore::new()));
        assert!(stores.open(&RepositorySpec::oci("localhost:5000", None)).is_ok());
        assert!(stores.open(&RepositorySpec::oci("gcr.io", None)).is_err());
    }
}
