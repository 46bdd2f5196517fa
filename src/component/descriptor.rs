//! Component descriptor model (schema `v2`).
//!
//! Descriptors are YAML documents. Serialization goes through `serde_yaml` with fixed
//! field order, so a descriptor rendered twice yields identical bytes and therefore an
//! identical descriptor digest.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::digest::Digest;
use crate::error::{CtaError, Result};
use crate::reference::RepositorySpec;

pub const SCHEMA_VERSION: &str = "v2";

/// Repository context type for registries.
pub const OCI_REGISTRY_CONTEXT: &str = "OCIRegistry";
/// Repository context type for transport archives.
pub const CTF_CONTEXT: &str = "CommonTransportFormat";
/// Component names map onto repository paths one to one.
pub const URL_PATH_MAPPING: &str = "urlPath";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(rename = "schemaVersion")]
    pub schema_version: String,
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    #[serde(default)]
    pub meta: Meta,
    pub component: Component,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub name: String,
    pub version: String,
    pub provider: Provider,
    #[serde(default)]
    pub repository_contexts: Vec<RepositoryContext>,
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub component_references: Vec<ComponentReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

/// Component provider. Written as a plain string; `{name: ...}` is accepted on input.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Provider(pub String);

impl Serialize for Provider {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Provider {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Name(String),
            Object { name: String },
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Name(name) | Raw::Object { name } => Provider(name),
        })
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryContext {
    #[serde(rename = "type")]
    pub context_type: String,
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_name_mapping: Option<String>,
}

impl RepositoryContext {
    pub fn for_spec(spec: &RepositorySpec) -> Self {
        match spec {
            RepositorySpec::Oci { host, prefix } => Self {
                context_type: OCI_REGISTRY_CONTEXT.to_string(),
                base_url: host.clone(),
                sub_path: prefix.clone(),
                component_name_mapping: Some(URL_PATH_MAPPING.to_string()),
            },
            RepositorySpec::Ctf { path } => Self {
                context_type: CTF_CONTEXT.to_string(),
                base_url: path.display().to_string(),
                sub_path: None,
                component_name_mapping: None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    #[default]
    Local,
    External,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: serde_json::Value,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub version: String,
    #[serde(default)]
    pub relation: Relation,
    pub access: Access,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: String,
    pub version: String,
    pub access: Access,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentReference {
    pub name: String,
    pub component_name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

/// Where a resource's content can be found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Access {
    #[serde(rename = "localBlob")]
    LocalBlob(LocalBlobAccess),
    #[serde(rename = "ociArtifact", alias = "ociRegistry", alias = "OCIRegistry")]
    OciArtifact(OciAccess),
    #[serde(rename = "github", alias = "gitHub")]
    Github(GithubAccess),
    /// Any other access type, kept verbatim (including its `type` field).
    #[serde(untagged)]
    Other(serde_json::Map<String, serde_json::Value>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalBlobAccess {
    pub local_reference: String,
    pub media_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciAccess {
    pub image_reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubAccess {
    pub repo_url: String,
    pub commit: String,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    LocalBlob,
    OciRegistry,
    Github,
    Other,
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LocalBlob => "localBlob",
            Self::OciRegistry => "ociArtifact",
            Self::Github => "github",
            Self::Other => "other",
        })
    }
}

impl Access {
    pub fn local_blob(digest: &Digest, media_type: &str, reference_name: Option<String>) -> Self {
        Self::LocalBlob(LocalBlobAccess {
            local_reference: digest.to_string(),
            media_type: media_type.to_string(),
            reference_name,
        })
    }

    pub fn oci(image_reference: impl Into<String>) -> Self {
        Self::OciArtifact(OciAccess {
            image_reference: image_reference.into(),
        })
    }

    pub fn access_type(&self) -> AccessType {
        match self {
            Self::LocalBlob(_) => AccessType::LocalBlob,
            Self::OciArtifact(_) => AccessType::OciRegistry,
            Self::Github(_) => AccessType::Github,
            Self::Other(_) => AccessType::Other,
        }
    }

    /// The `type` field as written in the descriptor.
    pub fn type_name(&self) -> &str {
        match self {
            Self::LocalBlob(_) => "localBlob",
            Self::OciArtifact(_) => "ociArtifact",
            Self::Github(_) => "github",
            Self::Other(fields) => fields
                .get("type")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default(),
        }
    }

    /// Digest of a local blob access.
    pub fn local_digest(&self) -> Result<Option<Digest>> {
        match self {
            Self::LocalBlob(local) => Digest::parse(&local.local_reference).map(Some),
            _ => Ok(None),
        }
    }
}

impl ComponentDescriptor {
    pub fn new(name: &str, version: &str, provider: &str) -> Self {
        Self {
            meta: Meta::default(),
            component: Component {
                name: name.to_string(),
                version: version.to_string(),
                provider: Provider(provider.to_string()),
                repository_contexts: Vec::new(),
                resources: Vec::new(),
                sources: Vec::new(),
                component_references: Vec::new(),
                labels: Vec::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.component.name
    }

    pub fn version(&self) -> &str {
        &self.component.version
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let descriptor: Self = serde_yaml::from_str(contents)
            .map_err(|e| CtaError::malformed(format!("invalid component descriptor: {}", e)))?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Structural checks: schema version, identity, unique element names and
    /// resolvable local references.
    pub fn validate(&self) -> Result<()> {
        if self.meta.schema_version != SCHEMA_VERSION {
            return Err(CtaError::malformed(format!(
                "unsupported descriptor schema version '{}'",
                self.meta.schema_version
            )));
        }
        if self.component.name.is_empty() || self.component.version.is_empty() {
            return Err(CtaError::malformed("component name and version are required"));
        }
        unique_names("resource", self.component.resources.iter().map(|r| r.name.as_str()))?;
        unique_names("source", self.component.sources.iter().map(|s| s.name.as_str()))?;
        unique_names(
            "component reference",
            self.component.component_references.iter().map(|r| r.name.as_str()),
        )?;
        for access in self.accesses() {
            match access {
                Access::LocalBlob(local) if !local.local_reference.starts_with("sha256:") => {
                    return Err(CtaError::malformed(format!(
                        "local reference '{}' is not a sha256 digest",
                        local.local_reference
                    )));
                }
                Access::Other(_) => check_other_access(access.type_name())?,
                _ => {}
            }
        }
        Ok(())
    }

    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.component.resources.iter().find(|r| r.name == name)
    }

    pub fn source(&self, name: &str) -> Option<&Source> {
        self.component.sources.iter().find(|s| s.name == name)
    }

    pub fn add_resource(&mut self, resource: Resource) -> Result<()> {
        if self.resource(&resource.name).is_some() {
            return Err(CtaError::AlreadyExists {
                what: format!("resource '{}'", resource.name),
            });
        }
        self.component.resources.push(resource);
        Ok(())
    }

    pub fn add_source(&mut self, source: Source) -> Result<()> {
        if self.source(&source.name).is_some() {
            return Err(CtaError::AlreadyExists {
                what: format!("source '{}'", source.name),
            });
        }
        self.component.sources.push(source);
        Ok(())
    }

    pub fn add_reference(&mut self, reference: ComponentReference) -> Result<()> {
        if self
            .component
            .component_references
            .iter()
            .any(|r| r.name == reference.name)
        {
            return Err(CtaError::AlreadyExists {
                what: format!("component reference '{}'", reference.name),
            });
        }
        self.component.component_references.push(reference);
        Ok(())
    }

    /// Record a new location of this component. Repeated pushes to the same location
    /// do not grow the list.
    pub fn push_repository_context(&mut self, context: RepositoryContext) {
        if self.component.repository_contexts.last() != Some(&context) {
            self.component.repository_contexts.push(context);
        }
    }

    pub fn accesses(&self) -> impl Iterator<Item = &Access> {
        self.component
            .resources
            .iter()
            .map(|r| &r.access)
            .chain(self.component.sources.iter().map(|s| &s.access))
    }

    /// Digests of all local blobs, in descriptor order and without repeats.
    pub fn local_blobs(&self) -> Result<Vec<(Digest, String)>> {
        let mut seen = HashSet::new();
        let mut blobs = Vec::new();
        for access in self.accesses() {
            if let Access::LocalBlob(local) = access {
                let digest = Digest::parse(&local.local_reference)?;
                if seen.insert(digest.clone()) {
                    blobs.push((digest, local.media_type.clone()));
                }
            }
        }
        Ok(blobs)
    }
}

/// Fallback accesses need a type, and a known type that landed here is missing fields.
fn check_other_access(type_name: &str) -> Result<()> {
    const KNOWN: &[&str] = &["localBlob", "ociArtifact", "ociRegistry", "OCIRegistry", "github", "gitHub"];
    if type_name.is_empty() {
        return Err(CtaError::malformed("access without a type"));
    }
    if KNOWN.contains(&type_name) {
        return Err(CtaError::malformed(format!("incomplete {} access", type_name)));
    }
    Ok(())
}

fn unique_names<'a>(kind: &str, names: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(CtaError::malformed(format!("duplicate {} '{}'", kind, name)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::digest_bytes;

    const DESCRIPTOR: &str = r#"
meta:
  schemaVersion: v2
component:
  name: ocm.integrationtest/echo
  version: 1.0.0
  provider: ocm.integrationtest
  repositoryContexts: []
  resources:
  - name: chart
    type: helmChart
    version: 1.0.0
    relation: local
    access:
      type: localBlob
      localReference: sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824
      mediaType: application/vnd.oci.image.manifest.v1+tar+gzip
      referenceName: ocm.integrationtest/echo/echoserver:0.1.0
  - name: image
    type: ociImage
    version: "1.10"
    relation: external
    labels:
    - name: mylabel
      value: Hello Label
    access:
      type: OCIRegistry
      imageReference: gcr.io/google_containers/echoserver:1.10
  sources:
  - name: source
    type: filesystem
    version: 1.0.0
    access:
      type: github
      repoUrl: github.com/open-component-model/ocm
      commit: e39625d6e919d33267da4778a1842670ce2bbf77
  componentReferences: []
"#;

    #[test]
    fn test_parse_descriptor() {
        let cd = ComponentDescriptor::from_yaml(DESCRIPTOR).unwrap();
        assert_eq!(cd.name(), "ocm.integrationtest/echo");
        assert_eq!(cd.component.provider.0, "ocm.integrationtest");

        let chart = cd.resource("chart").unwrap();
        assert_eq!(chart.relation, Relation::Local);
        assert_eq!(chart.access.access_type(), AccessType::LocalBlob);

        let image = cd.resource("image").unwrap();
        assert_eq!(image.relation, Relation::External);
        assert_eq!(image.access.access_type(), AccessType::OciRegistry);
        assert_eq!(image.labels[0].value, "Hello Label");

        let source = cd.source("source").unwrap();
        assert_eq!(source.access.access_type(), AccessType::Github);
    }

    #[test]
    fn test_oci_alias_written_canonically() {
        let cd = ComponentDescriptor::from_yaml(DESCRIPTOR).unwrap();
        let yaml = cd.to_yaml().unwrap();
        assert!(yaml.contains("type: ociArtifact"));
        assert!(!yaml.contains("OCIRegistry"));
        assert_eq!(ComponentDescriptor::from_yaml(&yaml).unwrap(), cd);
    }

    #[test]
    fn test_rendering_is_stable() {
        let cd = ComponentDescriptor::from_yaml(DESCRIPTOR).unwrap();
        assert_eq!(cd.to_yaml().unwrap(), cd.clone().to_yaml().unwrap());
    }

    #[test]
    fn test_provider_object_form() {
        let yaml = DESCRIPTOR.replace(
            "provider: ocm.integrationtest",
            "provider:\n    name: ocm.integrationtest",
        );
        let cd = ComponentDescriptor::from_yaml(&yaml).unwrap();
        assert_eq!(cd.component.provider.to_string(), "ocm.integrationtest");
    }

    #[test]
    fn test_unknown_access_kept_verbatim() {
        let yaml = DESCRIPTOR.replace(
            "      type: github\n      repoUrl: github.com/open-component-model/ocm\n",
            "      type: s3\n      bucket: charts\n      region: eu-west-1\n      repoUrl: github.com/open-component-model/ocm\n",
        );
        let cd = ComponentDescriptor::from_yaml(&yaml).unwrap();
        let access = &cd.source("source").unwrap().access;
        assert_eq!(access.access_type(), AccessType::Other);
        assert_eq!(access.type_name(), "s3");

        let rendered = cd.to_yaml().unwrap();
        assert!(rendered.contains("type: s3"));
        assert!(rendered.contains("bucket: charts"));
        assert_eq!(ComponentDescriptor::from_yaml(&rendered).unwrap(), cd);
    }

    #[test]
    fn test_incomplete_known_access_rejected() {
        let yaml = DESCRIPTOR.replace("      imageReference: gcr.io/google_containers/echoserver:1.10\n", "");
        assert!(matches!(
            ComponentDescriptor::from_yaml(&yaml),
            Err(CtaError::MalformedArchive(_))
        ));
    }

    #[test]
    fn test_local_reference_must_be_digest() {
        let yaml = DESCRIPTOR.replace(
            "localReference: sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
            "localReference: chart.tgz",
        );
        assert!(matches!(
            ComponentDescriptor::from_yaml(&yaml),
            Err(CtaError::MalformedArchive(_))
        ));
    }

    #[test]
    fn test_duplicate_resource_rejected() {
        let mut cd = ComponentDescriptor::new("acme.org/app", "1.0.0", "acme.org");
        let resource = Resource {
            name: "blob".into(),
            resource_type: "blob".into(),
            version: "1.0.0".into(),
            relation: Relation::Local,
            access: Access::local_blob(&digest_bytes(b"x"), "text/plain", None),
            labels: Vec::new(),
        };
        cd.add_resource(resource.clone()).unwrap();
        assert!(matches!(
            cd.add_resource(resource),
            Err(CtaError::AlreadyExists { .. })
        ));
        assert_eq!(cd.local_blobs().unwrap().len(), 1);
    }

    #[test]
    fn test_repository_context_not_repeated() {
        let mut cd = ComponentDescriptor::new("acme.org/app", "1.0.0", "acme.org");
        let ctx = RepositoryContext::for_spec(&RepositorySpec::oci("localhost:5000", Some("ocm")));
        cd.push_repository_context(ctx.clone());
        cd.push_repository_context(ctx);
        assert_eq!(cd.component.repository_contexts.len(), 1);
        assert_eq!(cd.component.repository_contexts[0].sub_path.as_deref(), Some("ocm"));
        assert_eq!(
            cd.component.repository_contexts[0].component_name_mapping.as_deref(),
            Some(URL_PATH_MAPPING)
        );
    }
}
