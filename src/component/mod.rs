//! Component descriptors, component archives and their OCI representation.

pub mod archive;
pub mod artifact_set;
pub mod descriptor;
pub mod input;
pub mod oci;

pub use archive::{add_component_versions, ComponentArchive};
pub use descriptor::{
    Access, AccessType, ComponentDescriptor, ComponentReference, Label, Relation,
    RepositoryContext, Resource, Source,
};
pub use input::{ComponentsFile, ElementSpec, Input};
pub use oci::{component_repository, pack, unpack, version_tag, PackedComponent, UnpackedComponent};
