//! Component transport between repositories.
//!
//! A transport runs in two phases. Planning reads the source descriptors (following
//! component references when recursive) and checks what already exists at the target;
//! nothing is written. Execution then copies components children first, resources
//! before descriptors, so a descriptor never becomes visible before its content.

use std::collections::HashSet;

use crate::component::artifact_set;
use crate::component::descriptor::{Access, ComponentDescriptor, RepositoryContext};
use crate::component::oci::{self, PackedComponent, UnpackedComponent};
use crate::digest::BlobRef;
use crate::error::{CtaError, Result};
use crate::image::copy::{copy_artifact, CopyOptions, Location};
use crate::image::media_types::is_artifact_set;
use crate::logging::TransportMetrics;
use crate::reference::{ComponentRef, ImageReference, RepositorySpec};
use crate::store::{copy_blob, ArtifactStore, CtfArchive, StoreFactory};

#[derive(Debug, Clone, Copy, Default)]
pub struct TransportOptions {
    /// Copy external OCI resources and re-host artifact sets instead of keeping pointers
    pub by_value: bool,
    /// Follow component references
    pub recursive: bool,
    /// Overwrite the component version at the target
    pub force: bool,
    pub copy: CopyOptions,
}

#[derive(Debug, Clone, Default)]
pub struct TransportReport {
    /// `name:version` of every component pushed to the target
    pub transported: Vec<String>,
    /// Referenced components left alone because the target already had them
    pub skipped: Vec<String>,
    pub metrics: TransportMetrics,
}

struct Planned {
    source: ComponentRef,
    unpacked: UnpackedComponent,
    root: bool,
    present: bool,
}

impl Planned {
    fn id(&self) -> String {
        format!("{}:{}", self.source.name, self.source.version)
    }
}

pub struct Transporter<'a> {
    stores: &'a dyn StoreFactory,
}

impl<'a> Transporter<'a> {
    pub fn new(stores: &'a dyn StoreFactory) -> Self {
        Self { stores }
    }

    /// Read a component descriptor.
    pub fn get_component(&self, component: &ComponentRef) -> Result<ComponentDescriptor> {
        let store = self.stores.open(&component.repository)?;
        Ok(oci::unpack(
            store.as_ref(),
            &component.repository,
            &component.name,
            &component.version,
        )?
        .descriptor)
    }

    /// Transport one component version to `target`.
    pub fn transport(
        &self,
        source: &ComponentRef,
        target: &RepositorySpec,
        options: &TransportOptions,
    ) -> Result<TransportReport> {
        self.transport_all(std::slice::from_ref(source), target, options)
    }

    /// Transport every component version stored in the transport archive at `ctf`.
    pub fn transfer_ctf(
        &self,
        ctf: &std::path::Path,
        target: &RepositorySpec,
        options: &TransportOptions,
    ) -> Result<TransportReport> {
        let location = RepositorySpec::Ctf {
            path: ctf.to_path_buf(),
        };
        let archive = CtfArchive::open(ctf)?;
        let prefix = format!("{}/", crate::constants::COMPONENT_DESCRIPTOR_REPOSITORY);
        let roots: Vec<ComponentRef> = archive
            .entries()
            .into_iter()
            .filter_map(|entry| {
                let name = entry.repository.strip_prefix(&prefix)?.to_string();
                let version = entry.tag?.replace(".build-", "+");
                Some(ComponentRef::new(location.clone(), &name, &version))
            })
            .collect();
        if roots.is_empty() {
            return Err(CtaError::not_found(format!(
                "component versions in {}",
                ctf.display()
            )));
        }
        self.transport_all(&roots, target, options)
    }

    /// Copy a single image or index between registries.
    pub fn transfer_artifact(
        &self,
        source: &str,
        target: &str,
        options: &CopyOptions,
    ) -> Result<(BlobRef, TransportMetrics)> {
        let source = ImageReference::parse(source)?;
        let target = ImageReference::parse(target)?;
        let source_store = self.stores.open(&RepositorySpec::oci(&source.registry, None))?;
        let target_store = self.stores.open(&RepositorySpec::oci(&target.registry, None))?;
        let mut metrics = TransportMetrics::new();
        let pushed = copy_artifact(
            Location::new(source_store.as_ref(), &source.repository),
            &source.reference(),
            Location::new(target_store.as_ref(), &target.repository),
            &push_reference(&target),
            options,
            &mut metrics,
        )?;
        Ok((pushed, metrics))
    }

    fn transport_all(
        &self,
        roots: &[ComponentRef],
        target: &RepositorySpec,
        options: &TransportOptions,
    ) -> Result<TransportReport> {
        if options.by_value && !target.is_registry() {
            return Err(CtaError::Config(format!(
                "transport by value requires a registry target, got {}",
                target
            )));
        }
        let target_store = self.stores.open(target)?;
        let plan = self.plan(roots, target_store.as_ref(), target, options)?;

        let mut report = TransportReport::default();
        for planned in &plan {
            if planned.present && !planned.root {
                tracing::info!(component = %planned.id(), target = %target, "Component present at target, skipping");
                report.metrics.components_skipped += 1;
                report.skipped.push(planned.id());
                continue;
            }
            self.transport_one(planned, target_store.as_ref(), target, options, &mut report.metrics)?;
            report.metrics.components_transported += 1;
            report.transported.push(planned.id());
        }

        tracing::info!(
            target = %target,
            transported = report.transported.len(),
            skipped = report.skipped.len(),
            blobs_uploaded = report.metrics.blobs_uploaded,
            bytes_uploaded = report.metrics.bytes_uploaded,
            dedup_rate = report.metrics.dedup_rate(),
            "Transport finished"
        );
        Ok(report)
    }

    /// Resolve the component closure in post-order and check the target. Fails before
    /// anything is written when a requested version exists and `force` is unset.
    fn plan(
        &self,
        roots: &[ComponentRef],
        target_store: &dyn ArtifactStore,
        target: &RepositorySpec,
        options: &TransportOptions,
    ) -> Result<Vec<Planned>> {
        let mut visited = HashSet::new();
        let mut plan = Vec::new();
        for root in roots {
            self.visit(root, true, options.recursive, &mut visited, &mut plan)?;
        }
        for planned in plan.iter_mut() {
            planned.present =
                oci::exists(target_store, target, &planned.source.name, &planned.source.version)?;
            if planned.present && planned.root && !options.force {
                return Err(CtaError::AlreadyExists {
                    what: format!("component {} in {}", planned.id(), target),
                });
            }
        }
        tracing::debug!(components = plan.len(), target = %target, "Transport planned");
        Ok(plan)
    }

    fn visit(
        &self,
        component: &ComponentRef,
        root: bool,
        recursive: bool,
        visited: &mut HashSet<(String, String)>,
        plan: &mut Vec<Planned>,
    ) -> Result<()> {
        let key = (component.name.clone(), component.version.clone());
        if !visited.insert(key) {
            if root {
                if let Some(existing) = plan.iter_mut().find(|p| {
                    p.source.name == component.name && p.source.version == component.version
                }) {
                    existing.root = true;
                }
            }
            return Ok(());
        }

        let store = self.stores.open(&component.repository)?;
        let unpacked = oci::unpack(
            store.as_ref(),
            &component.repository,
            &component.name,
            &component.version,
        )?;
        if recursive {
            for reference in &unpacked.descriptor.component.component_references {
                let child = ComponentRef::new(
                    component.repository.clone(),
                    &reference.component_name,
                    &reference.version,
                );
                self.visit(&child, false, recursive, visited, plan)?;
            }
        }
        plan.push(Planned {
            source: component.clone(),
            unpacked,
            root,
            present: false,
        });
        Ok(())
    }

    fn transport_one(
        &self,
        planned: &Planned,
        target_store: &dyn ArtifactStore,
        target: &RepositorySpec,
        options: &TransportOptions,
        metrics: &mut TransportMetrics,
    ) -> Result<PackedComponent> {
        let source_spec = &planned.source.repository;
        let source_store = self.stores.open(source_spec)?;
        let source_repo = planned.unpacked.repository.as_str();
        let mut descriptor = planned.unpacked.descriptor.clone();
        let target_repo = oci::component_repository(target, descriptor.name());
        tracing::info!(component = %planned.id(), source = %source_spec, target = %target, by_value = options.by_value, "Transporting component");

        let component_path = component_path(&descriptor);
        for resource in descriptor.component.resources.iter_mut() {
            let rewritten = match &resource.access {
                Access::OciArtifact(access) if options.by_value => Some(self.rehost_image(
                    &access.image_reference,
                    source_spec,
                    source_store.as_ref(),
                    target,
                    target_store,
                    options,
                    metrics,
                )?),
                Access::LocalBlob(local)
                    if options.by_value && target.is_registry() && is_artifact_set(&local.media_type) =>
                {
                    let path = local.reference_name.clone().unwrap_or_else(|| {
                        format!("{}/{}:{}", component_path, resource.name, resource.version)
                    });
                    let digest = crate::digest::Digest::parse(&local.local_reference)?;
                    let (repository, reference) = split_reference_name(&path);
                    let repository = target.repository(repository);
                    let reader = source_store.fetch_blob(source_repo, &digest)?;
                    let pushed = artifact_set::import(
                        reader,
                        target_store,
                        &repository,
                        reference,
                        &options.copy,
                        metrics,
                    )?;
                    let host = target_host(target)?;
                    tracing::debug!(resource = %resource.name, repository = %repository, digest = %pushed.digest, "Re-hosted artifact set");
                    if reference.starts_with("sha256:") {
                        Some(format!("{}/{}@{}", host, repository, pushed.digest))
                    } else {
                        Some(format!("{}/{}:{}", host, repository, reference))
                    }
                }
                Access::LocalBlob(local) => {
                    let digest = crate::digest::Digest::parse(&local.local_reference)?;
                    copy_local_blob(
                        source_store.as_ref(),
                        source_repo,
                        target_store,
                        &target_repo,
                        &digest,
                        &local.media_type,
                        options,
                        metrics,
                    )?;
                    None
                }
                _ => None,
            };
            if let Some(image_reference) = rewritten {
                tracing::debug!(resource = %resource.name, image = %image_reference, "Rewrote resource access");
                resource.access = Access::oci(image_reference);
            }
        }

        for source in &descriptor.component.sources {
            if let Access::LocalBlob(local) = &source.access {
                let digest = crate::digest::Digest::parse(&local.local_reference)?;
                copy_local_blob(
                    source_store.as_ref(),
                    source_repo,
                    target_store,
                    &target_repo,
                    &digest,
                    &local.media_type,
                    options,
                    metrics,
                )?;
            }
        }

        descriptor.push_repository_context(RepositoryContext::for_spec(target));
        let packed = oci::pack(target_store, target, &descriptor)?;
        metrics.manifests_pushed += 1;
        Ok(packed)
    }

    /// Copy an external image below `target` and return its new reference. Images under
    /// the source repository's prefix keep their path relative to it; other images keep
    /// their full repository path.
    #[allow(clippy::too_many_arguments)]
    fn rehost_image(
        &self,
        image_reference: &str,
        source_spec: &RepositorySpec,
        source_store: &dyn ArtifactStore,
        target: &RepositorySpec,
        target_store: &dyn ArtifactStore,
        options: &TransportOptions,
        metrics: &mut TransportMetrics,
    ) -> Result<String> {
        let image = ImageReference::parse(image_reference)?;
        let suffix = relative_path(&image, source_spec);
        let relocated = image.relocate(&target_host(target)?, &target.repository(suffix));

        let opened;
        let image_store: &dyn ArtifactStore = match source_spec {
            RepositorySpec::Oci { host, .. } if *host == image.registry => source_store,
            _ => {
                opened = self.stores.open(&RepositorySpec::oci(&image.registry, None))?;
                opened.as_ref()
            }
        };

        copy_artifact(
            Location::new(image_store, &image.repository),
            &image.reference(),
            Location::new(target_store, &relocated.repository),
            &push_reference(&relocated),
            &options.copy,
            metrics,
        )?;
        Ok(relocated.to_string())
    }
}

#[allow(clippy::too_many_arguments)]
fn copy_local_blob(
    source: &dyn ArtifactStore,
    source_repo: &str,
    target: &dyn ArtifactStore,
    target_repo: &str,
    digest: &crate::digest::Digest,
    media_type: &str,
    options: &TransportOptions,
    metrics: &mut TransportMetrics,
) -> Result<()> {
    let size = source
        .stat_blob(source_repo, digest)?
        .ok_or_else(|| CtaError::not_found(format!("local blob {} in {}", digest, source_repo)))?;
    let blob = BlobRef::new(media_type, digest.clone(), size);
    if copy_blob(source, source_repo, target, target_repo, &blob, options.copy.chunk_size)? {
        metrics.blobs_uploaded += 1;
        metrics.bytes_uploaded += size;
    } else {
        metrics.blobs_skipped += 1;
    }
    Ok(())
}

/// Repository path of `image` relative to the source repository prefix, or its full
/// repository path when it lives elsewhere.
fn relative_path<'r>(image: &'r ImageReference, source: &RepositorySpec) -> &'r str {
    if let RepositorySpec::Oci {
        host,
        prefix: Some(prefix),
    } = source
    {
        if *host == image.registry {
            if let Some(rest) = image
                .repository
                .strip_prefix(prefix.as_str())
                .and_then(|r| r.strip_prefix('/'))
            {
                return rest;
            }
        }
    }
    &image.repository
}

/// Component name used for default artifact paths, prefixed with the provider unless
/// it already starts with it.
fn component_path(descriptor: &ComponentDescriptor) -> String {
    let provider = &descriptor.component.provider.0;
    let name = descriptor.name();
    if provider.is_empty() || name.starts_with(provider.as_str()) {
        name.to_string()
    } else {
        format!("{}/{}", provider, name)
    }
}

/// Split `repo/path:tag` at the tag colon (after the last slash), or
/// `repo/path@sha256:<hex>` at the `@`. The second part is the reference to push under.
fn split_reference_name(reference_name: &str) -> (&str, &str) {
    if let Some((repository, digest)) = reference_name.split_once('@') {
        return (repository, digest);
    }
    let last_slash = reference_name.rfind('/').map(|p| p + 1).unwrap_or(0);
    match reference_name[last_slash..].rfind(':') {
        Some(colon) => (
            &reference_name[..last_slash + colon],
            &reference_name[last_slash + colon + 1..],
        ),
        None => (reference_name, "latest"),
    }
}

fn target_host(target: &RepositorySpec) -> Result<String> {
    match target {
        RepositorySpec::Oci { host, .. } => Ok(host.clone()),
        RepositorySpec::Ctf { path } => Err(CtaError::Config(format!(
            "cannot host OCI artifacts in transport archive {}",
            path.display()
        ))),
    }
}

/// Tag when the reference has one, digest otherwise.
fn push_reference(image: &ImageReference) -> String {
    match (&image.tag, &image.digest) {
        (Some(tag), _) => tag.clone(),
        _ => image.reference(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path_strips_source_prefix() {
        let source = RepositorySpec::oci("localhost:5000", Some("ocm"));
        let inside = ImageReference::parse("localhost:5000/ocm/google_containers/pause:3.2").unwrap();
        assert_eq!(relative_path(&inside, &source), "google_containers/pause");

        let outside = ImageReference::parse("gcr.io/google_containers/echoserver:1.10").unwrap();
        assert_eq!(relative_path(&outside, &source), "google_containers/echoserver");
    }

    #[test]
    fn test_split_reference_name() {
        assert_eq!(
            split_reference_name("ocm.integrationtest/echo/echoserver:0.1.0"),
            ("ocm.integrationtest/echo/echoserver", "0.1.0")
        );
        assert_eq!(split_reference_name("localhost:5000/x"), ("localhost:5000/x", "latest"));
        let digest = format!("sha256:{}", "0123456789abcdef".repeat(4));
        let pinned = format!("acme.org/app/img@{}", digest);
        assert_eq!(split_reference_name(&pinned), ("acme.org/app/img", digest.as_str()));
    }

    #[test]
    fn test_component_path_prefixes_provider() {
        let cd = ComponentDescriptor::new("echo", "1.0.0", "acme.org");
        assert_eq!(component_path(&cd), "acme.org/echo");
        let cd = ComponentDescriptor::new("acme.org/echo", "1.0.0", "acme.org");
        assert_eq!(component_path(&cd), "acme.org/echo");
    }

    #[test]
    fn test_push_reference_prefers_tag() {
        let image = ImageReference::parse("gcr.io/x/y:1.0").unwrap();
        assert_eq!(push_reference(&image), "1.0");
    }
}
