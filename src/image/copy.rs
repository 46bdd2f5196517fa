//! Artifact copy between stores.
//!
//! Manifests are copied byte for byte so digests survive the move. Blobs of one
//! manifest are copied on a bounded rayon pool; a manifest is pushed only after all of
//! its blobs (or, for an index, all of its child manifests) are present at the target.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use rayon::prelude::*;

use super::manifest::Manifest;
use super::media_types::PREFER_MULTIARCH;
use crate::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_CONCURRENCY};
use crate::digest::BlobRef;
use crate::error::{CtaError, Result};
use crate::logging::TransportMetrics;
use crate::store::{copy_blob, ArtifactStore};

#[derive(Debug, Clone, Copy)]
pub struct CopyOptions {
    pub chunk_size: usize,
    pub concurrency: usize,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// One side of a copy.
#[derive(Clone, Copy)]
pub struct Location<'a> {
    pub store: &'a dyn ArtifactStore,
    pub repository: &'a str,
}

impl<'a> Location<'a> {
    pub fn new(store: &'a dyn ArtifactStore, repository: &'a str) -> Self {
        Self { store, repository }
    }
}

/// Copy the manifest (or index) `reference` from `source` to `target`, pushing it under
/// `target_reference`. Returns the pushed descriptor.
pub fn copy_artifact(
    source: Location<'_>,
    reference: &str,
    target: Location<'_>,
    target_reference: &str,
    options: &CopyOptions,
    metrics: &mut TransportMetrics,
) -> Result<BlobRef> {
    let pool = copy_pool(options.concurrency.max(1))?;

    let (descriptor, bytes) =
        source
            .store
            .fetch_manifest(source.repository, reference, PREFER_MULTIARCH)?;
    copy_referenced(&pool, source, target, &descriptor, &bytes, options, metrics)?;

    let pushed = target.store.push_manifest(
        target.repository,
        target_reference,
        &descriptor.media_type,
        &bytes,
    )?;
    metrics.manifests_pushed += 1;
    tracing::info!(
        source = %format!("{}:{}", source.repository, reference),
        target = %format!("{}:{}", target.repository, target_reference),
        digest = %pushed.digest,
        "Artifact copied"
    );
    Ok(pushed)
}

/// Blob copy pool for `threads`, built on first use and shared by later copies.
fn copy_pool(threads: usize) -> Result<Arc<rayon::ThreadPool>> {
    static POOLS: OnceLock<Mutex<HashMap<usize, Arc<rayon::ThreadPool>>>> = OnceLock::new();
    let mut pools = POOLS.get_or_init(Default::default).lock();
    if let Some(pool) = pools.get(&threads) {
        return Ok(pool.clone());
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("cta-copy-{}", i))
        .build()
        .map(Arc::new)
        .map_err(|e| CtaError::Config(format!("cannot build copy thread pool: {}", e)))?;
    pools.insert(threads, pool.clone());
    Ok(pool)
}

fn copy_referenced(
    pool: &rayon::ThreadPool,
    source: Location<'_>,
    target: Location<'_>,
    descriptor: &BlobRef,
    bytes: &[u8],
    options: &CopyOptions,
    metrics: &mut TransportMetrics,
) -> Result<()> {
    match Manifest::parse(&descriptor.media_type, bytes)? {
        Manifest::Index(index) => {
            for entry in &index.manifests {
                let child_ref = entry.digest.to_string();
                if target
                    .store
                    .head_manifest(target.repository, &child_ref, &[entry.media_type.as_str()])?
                    .is_some()
                {
                    continue;
                }
                let (child, child_bytes) = source.store.fetch_manifest(
                    source.repository,
                    &child_ref,
                    &[entry.media_type.as_str()],
                )?;
                copy_referenced(pool, source, target, &child, &child_bytes, options, metrics)?;
                target.store.push_manifest(
                    target.repository,
                    &child_ref,
                    &child.media_type,
                    &child_bytes,
                )?;
                metrics.manifests_pushed += 1;
            }
        }
        Manifest::Image(manifest) => {
            let blobs: Vec<&BlobRef> = std::iter::once(&manifest.config)
                .chain(manifest.layers.iter())
                .collect();
            let results: Vec<Result<(bool, u64)>> = pool.install(|| {
                blobs
                    .par_iter()
                    .map(|blob| {
                        copy_blob(
                            source.store,
                            source.repository,
                            target.store,
                            target.repository,
                            blob,
                            options.chunk_size,
                        )
                        .map(|uploaded| (uploaded, blob.size))
                    })
                    .collect()
            });
            for result in results {
                let (uploaded, size) = result?;
                if uploaded {
                    metrics.blobs_uploaded += 1;
                    metrics.bytes_uploaded += size;
                } else {
                    metrics.blobs_skipped += 1;
                }
            }
        }
    }
    Ok(())
}
