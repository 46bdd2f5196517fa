//! Component archives (CA): one component version on disk.
//!
//! ```text
//! <ca>/component-descriptor.yaml
//! <ca>/blobs/sha256.<hex>
//! ```

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use super::descriptor::{Access, ComponentDescriptor, ComponentReference, Resource, Source};
use super::input::{parse_documents, ComponentVersionSpec, ComponentsFile, ElementSpec};
use super::oci::{self, PackedComponent};
use crate::constants::{BLOBS_DIR, COMPONENT_DESCRIPTOR_FILE, DEFAULT_CHUNK_SIZE};
use crate::digest::{digest_file, BlobRef, Digest};
use crate::error::{CtaError, Result};
use crate::reference::RepositorySpec;
use crate::store::{ArtifactStore, CtfArchive};

#[derive(Debug)]
pub struct ComponentArchive {
    root: PathBuf,
    descriptor: ComponentDescriptor,
}

impl ComponentArchive {
    /// Create an archive for a new component version. An existing archive is replaced
    /// only with `force`.
    pub fn create(root: &Path, name: &str, version: &str, provider: &str, force: bool) -> Result<Self> {
        if root.join(COMPONENT_DESCRIPTOR_FILE).exists() {
            if !force {
                return Err(CtaError::AlreadyExists {
                    what: format!("component archive {}", root.display()),
                });
            }
            fs::remove_dir_all(root)?;
        }
        fs::create_dir_all(root.join(BLOBS_DIR))?;
        let archive = Self {
            root: root.to_path_buf(),
            descriptor: ComponentDescriptor::new(name, version, provider),
        };
        archive.save()?;
        tracing::info!(path = %root.display(), component = %name, version = %version, "Created component archive");
        Ok(archive)
    }

    pub fn open(root: &Path) -> Result<Self> {
        let path = root.join(COMPONENT_DESCRIPTOR_FILE);
        let contents = fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                CtaError::not_found(format!("component archive descriptor {}", path.display()))
            }
            _ => e.into(),
        })?;
        Ok(Self {
            root: root.to_path_buf(),
            descriptor: ComponentDescriptor::from_yaml(&contents)?,
        })
    }

    /// Build a complete archive from a component version spec.
    pub fn from_spec(root: &Path, spec: &ComponentVersionSpec, base: &Path, force: bool) -> Result<Self> {
        let mut archive = Self::create(root, &spec.name, &spec.version, &spec.provider.0, force)?;
        archive.descriptor.component.labels = spec.labels.clone();
        for source in &spec.sources {
            archive.add_source(source, base)?;
        }
        for resource in &spec.resources {
            archive.add_resource(resource, base)?;
        }
        for reference in &spec.component_references {
            archive.add_reference(reference.clone())?;
        }
        archive.save()?;
        Ok(archive)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn descriptor(&self) -> &ComponentDescriptor {
        &self.descriptor
    }

    pub fn save(&self) -> Result<()> {
        self.descriptor.validate()?;
        fs::write(self.root.join(COMPONENT_DESCRIPTOR_FILE), self.descriptor.to_yaml()?)?;
        Ok(())
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join(BLOBS_DIR).join(digest.file_name())
    }

    /// Copy a file into the blob directory under its digest.
    pub fn add_blob_file(&self, path: &Path) -> Result<(Digest, u64)> {
        let (digest, size) = digest_file(path)?;
        let target = self.blob_path(&digest);
        if !target.exists() {
            fs::copy(path, &target)?;
        }
        Ok((digest, size))
    }

    fn resolve_access(&self, spec: &ElementSpec, base: &Path) -> Result<Access> {
        spec.validate()?;
        if let Some(access) = &spec.access {
            return Ok(access.clone());
        }
        let input = spec
            .input
            .as_ref()
            .ok_or_else(|| CtaError::Config(format!("element '{}' has no input", spec.name)))?;
        let blob = input.materialize(base, self.descriptor.name())?;
        let (digest, size) = self.add_blob_file(blob.file.path())?;
        tracing::debug!(element = %spec.name, digest = %digest, size, "Added local blob");
        Ok(Access::local_blob(&digest, &blob.media_type, blob.reference_name))
    }

    pub fn add_resource(&mut self, spec: &ElementSpec, base: &Path) -> Result<()> {
        if self.descriptor.resource(&spec.name).is_some() {
            return Err(CtaError::AlreadyExists {
                what: format!("resource '{}'", spec.name),
            });
        }
        let access = self.resolve_access(spec, base)?;
        self.descriptor.add_resource(Resource {
            name: spec.name.clone(),
            resource_type: spec.element_type.clone(),
            version: spec
                .version
                .clone()
                .unwrap_or_else(|| self.descriptor.version().to_string()),
            relation: spec.relation(),
            access,
            labels: spec.labels.clone(),
        })
    }

    pub fn add_source(&mut self, spec: &ElementSpec, base: &Path) -> Result<()> {
        if self.descriptor.source(&spec.name).is_some() {
            return Err(CtaError::AlreadyExists {
                what: format!("source '{}'", spec.name),
            });
        }
        let access = self.resolve_access(spec, base)?;
        self.descriptor.add_source(Source {
            name: spec.name.clone(),
            source_type: spec.element_type.clone(),
            version: spec
                .version
                .clone()
                .unwrap_or_else(|| self.descriptor.version().to_string()),
            access,
            labels: spec.labels.clone(),
        })
    }

    pub fn add_reference(&mut self, reference: ComponentReference) -> Result<()> {
        self.descriptor.add_reference(reference)
    }

    /// Add every resource of a multi-document YAML file. Relative input paths resolve
    /// against the file's directory.
    pub fn add_resources_from_file(&mut self, path: &Path) -> Result<usize> {
        let (specs, base) = read_documents::<ElementSpec>(path)?;
        for spec in &specs {
            self.add_resource(spec, &base)?;
        }
        self.save()?;
        Ok(specs.len())
    }

    pub fn add_sources_from_file(&mut self, path: &Path) -> Result<usize> {
        let (specs, base) = read_documents::<ElementSpec>(path)?;
        for spec in &specs {
            self.add_source(spec, &base)?;
        }
        self.save()?;
        Ok(specs.len())
    }

    pub fn add_references_from_file(&mut self, path: &Path) -> Result<usize> {
        let (references, _) = read_documents::<ComponentReference>(path)?;
        for reference in &references {
            self.add_reference(reference.clone())?;
        }
        self.save()?;
        Ok(references.len())
    }

    /// Store this component version in the transport archive at `ctf_path`, creating
    /// the archive if needed. An existing version is replaced only with `force`.
    pub fn transfer_to_ctf(&self, ctf_path: &Path, force: bool) -> Result<PackedComponent> {
        let ctf = CtfArchive::open_or_create(ctf_path)?;
        let location = RepositorySpec::Ctf {
            path: ctf_path.to_path_buf(),
        };
        self.push_to(&ctf, &location, force)
    }

    /// Store this component version in any store.
    pub fn push_to(
        &self,
        store: &dyn ArtifactStore,
        location: &RepositorySpec,
        force: bool,
    ) -> Result<PackedComponent> {
        let name = self.descriptor.name();
        let version = self.descriptor.version();
        if !force && oci::exists(store, location, name, version)? {
            return Err(CtaError::AlreadyExists {
                what: format!("component {}:{} in {}", name, version, location),
            });
        }
        let repository = oci::component_repository(location, name);
        for (digest, media_type) in self.descriptor.local_blobs()? {
            let path = self.blob_path(&digest);
            let size = fs::metadata(&path)
                .map_err(|_| CtaError::not_found(format!("local blob {}", path.display())))?
                .len();
            let blob = BlobRef::new(media_type, digest, size);
            store.ensure_blob(
                &repository,
                &blob,
                &mut BufReader::new(File::open(&path)?),
                DEFAULT_CHUNK_SIZE,
            )?;
        }
        oci::pack(store, location, &self.descriptor)
    }
}

fn read_documents<T: serde::de::DeserializeOwned>(path: &Path) -> Result<(Vec<T>, PathBuf)> {
    let contents = fs::read_to_string(path)
        .map_err(|e| CtaError::Config(format!("cannot read {}: {}", path.display(), e)))?;
    let base = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok((parse_documents(&contents)?, base))
}

/// Add every component version of a components file to the transport archive at
/// `ctf_path`. Each version is staged as a component archive first.
pub fn add_component_versions(ctf_path: &Path, components_file: &Path, force: bool) -> Result<Vec<PackedComponent>> {
    let contents = fs::read_to_string(components_file).map_err(|e| {
        CtaError::Config(format!("cannot read {}: {}", components_file.display(), e))
    })?;
    let file = ComponentsFile::from_yaml(&contents)?;
    let base = components_file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut packed = Vec::with_capacity(file.components.len());
    for spec in &file.components {
        let staging = tempfile::TempDir::new()?;
        let archive = ComponentArchive::from_spec(staging.path(), spec, &base, true)?;
        packed.push(archive.transfer_to_ctf(ctf_path, force)?);
    }
    Ok(packed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::descriptor::{AccessType, Relation};
    use crate::component::input::Input;
    use tempfile::TempDir;

    fn file_resource(name: &str) -> ElementSpec {
        ElementSpec {
            name: name.into(),
            element_type: "blob".into(),
            version: None,
            relation: None,
            labels: Vec::new(),
            input: Some(Input::File {
                path: "someresource.txt".into(),
                media_type: Some("text/plain".into()),
                compress: false,
            }),
            access: None,
        }
    }

    #[test]
    fn test_create_requires_force_to_overwrite() {
        let tmp = TempDir::new().unwrap();
        let ca = tmp.path().join("ca");
        ComponentArchive::create(&ca, "acme.org/app", "1.0.0", "acme.org", false).unwrap();
        assert!(matches!(
            ComponentArchive::create(&ca, "acme.org/app", "1.0.0", "acme.org", false),
            Err(CtaError::AlreadyExists { .. })
        ));
        ComponentArchive::create(&ca, "acme.org/app", "2.0.0", "acme.org", true).unwrap();
        assert_eq!(ComponentArchive::open(&ca).unwrap().descriptor().version(), "2.0.0");
    }

    #[test]
    fn test_add_file_resource() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("someresource.txt"), "some resource\n").unwrap();
        let ca = tmp.path().join("ca");
        let mut archive =
            ComponentArchive::create(&ca, "acme.org/app", "1.0.0", "acme.org", false).unwrap();
        archive.add_resource(&file_resource("myfile"), tmp.path()).unwrap();
        archive.save().unwrap();

        let reopened = ComponentArchive::open(&ca).unwrap();
        let resource = reopened.descriptor().resource("myfile").unwrap();
        assert_eq!(resource.version, "1.0.0");
        assert_eq!(resource.relation, Relation::Local);
        assert_eq!(resource.access.access_type(), AccessType::LocalBlob);
        let digest = resource.access.local_digest().unwrap().unwrap();
        assert!(reopened.blob_path(&digest).exists());

        assert!(matches!(
            archive.add_resource(&file_resource("myfile"), tmp.path()),
            Err(CtaError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_open_missing_archive() {
        let tmp = TempDir::new().unwrap();
        assert!(ComponentArchive::open(tmp.path()).unwrap_err().is_not_found());
    }

    #[test]
    fn test_transfer_to_ctf_twice_needs_force() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("someresource.txt"), "some resource\n").unwrap();
        let mut archive = ComponentArchive::create(
            &tmp.path().join("ca"),
            "acme.org/app",
            "1.0.0",
            "acme.org",
            false,
        )
        .unwrap();
        archive.add_resource(&file_resource("myfile"), tmp.path()).unwrap();

        let ctf = tmp.path().join("ctf");
        let packed = archive.transfer_to_ctf(&ctf, false).unwrap();
        assert_eq!(packed.repository, "component-descriptors/acme.org/app");
        assert!(matches!(
            archive.transfer_to_ctf(&ctf, false),
            Err(CtaError::AlreadyExists { .. })
        ));
        let again = archive.transfer_to_ctf(&ctf, true).unwrap();
        assert_eq!(again.manifest.digest, packed.manifest.digest);
        assert_eq!(CtfArchive::open(&ctf).unwrap().entries().len(), 1);
    }
}
