//! Reference parsing.
//!
//! Three kinds of references are understood:
//! - image references: `ghcr.io/org/image:tag` or `ghcr.io/org/image@sha256:...`
//! - repository specs: `host[:port][/prefix]` for registries, `ctf::<path>` (or any path
//!   starting with `/` or `.`) for transport archives
//! - component references: `<repository-spec>//<component-name>:<version>`

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::digest::Digest;
use crate::error::{CtaError, Result};

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";
const CTF_PREFIX: &str = "ctf::";

fn invalid(reference: &str, reason: impl Into<String>) -> CtaError {
    CtaError::InvalidReference {
        reference: reference.to_string(),
        reason: reason.into(),
    }
}

fn strip_scheme(value: &str) -> &str {
    value
        .strip_prefix("https://")
        .or_else(|| value.strip_prefix("http://"))
        .unwrap_or(value)
}

/// Parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry host, with port if any (e.g. "gcr.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g. "google_containers/echoserver")
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<Digest>,
}

impl ImageReference {
    /// Parse an image reference.
    ///
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `gcr.io/google_containers/pause:3.2`
    /// - `localhost:5000/echo@sha256:...`
    pub fn parse(reference: &str) -> Result<Self> {
        let trimmed = strip_scheme(reference.trim());
        if trimmed.is_empty() {
            return Err(invalid(reference, "empty image reference"));
        }

        let (name_tag, digest) = match trimmed.rfind('@') {
            Some(at) => (&trimmed[..at], Some(Digest::parse(&trimmed[at + 1..])?)),
            None => (trimmed, None),
        };

        // A tag colon is only one that follows the last slash; earlier colons are ports.
        let last_slash = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_slash..].rfind(':') {
            Some(colon) => {
                let split = last_slash + colon;
                let tag = &name_tag[split + 1..];
                if last_slash == 0 && tag.chars().all(|c| c.is_ascii_digit()) {
                    (name_tag, None)
                } else {
                    (&name_tag[..split], Some(tag.to_string()))
                }
            }
            None => (name_tag, None),
        };

        if tag.as_deref() == Some("") {
            return Err(invalid(reference, "empty tag"));
        }

        let (registry, repository) = split_registry_repository(reference, name)?;
        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The reference used in manifest URLs: the digest when pinned, the tag otherwise.
    pub fn reference(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => tag.clone(),
            (None, None) => DEFAULT_TAG.to_string(),
        }
    }

    /// Move this reference to another registry/repository, keeping tag and digest.
    pub fn relocate(&self, registry: &str, repository: &str) -> Self {
        Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag: self.tag.clone(),
            digest: self.digest.clone(),
        }
    }
}

fn split_registry_repository(reference: &str, name: &str) -> Result<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(invalid(reference, "empty repository"));
            }
            return Ok((first.to_string(), rest.to_string()));
        }
    }
    if name.is_empty() {
        return Err(invalid(reference, "empty repository"));
    }
    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };
    Ok((DEFAULT_REGISTRY.to_string(), repository))
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl FromStr for ImageReference {
    type Err = CtaError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Where components and artifacts live: a registry (with optional repository prefix)
/// or a local transport archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RepositorySpec {
    Oci { host: String, prefix: Option<String> },
    Ctf { path: PathBuf },
}

impl RepositorySpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(invalid(spec, "empty repository spec"));
        }
        if let Some(path) = spec.strip_prefix(CTF_PREFIX) {
            if path.is_empty() {
                return Err(invalid(spec, "missing archive path"));
            }
            return Ok(Self::Ctf {
                path: PathBuf::from(path),
            });
        }
        if spec.starts_with('/') || spec.starts_with('.') {
            return Ok(Self::Ctf {
                path: PathBuf::from(spec),
            });
        }

        let spec = strip_scheme(spec).trim_end_matches('/');
        let (host, prefix) = match spec.split_once('/') {
            Some((host, prefix)) => (host, Some(prefix.trim_matches('/').to_string())),
            None => (spec, None),
        };
        if host.is_empty() {
            return Err(invalid(spec, "missing registry host"));
        }
        Ok(Self::Oci {
            host: host.to_string(),
            prefix: prefix.filter(|p| !p.is_empty()),
        })
    }

    pub fn oci(host: impl Into<String>, prefix: Option<&str>) -> Self {
        Self::Oci {
            host: host.into(),
            prefix: prefix.map(str::to_string),
        }
    }

    /// Key used to open a store for this location.
    pub fn store_key(&self) -> String {
        match self {
            Self::Oci { host, .. } => host.clone(),
            Self::Ctf { path } => format!("{}{}", CTF_PREFIX, path.display()),
        }
    }

    pub fn is_registry(&self) -> bool {
        matches!(self, Self::Oci { .. })
    }

    /// Repository path for `name` below this spec's prefix.
    pub fn repository(&self, name: &str) -> String {
        match self {
            Self::Oci {
                prefix: Some(prefix),
                ..
            } => format!("{}/{}", prefix, name.trim_start_matches('/')),
            _ => name.trim_start_matches('/').to_string(),
        }
    }

    /// Base URL recorded in a descriptor's repository contexts.
    pub fn base_url(&self) -> String {
        match self {
            Self::Oci { host, prefix: None } => host.clone(),
            Self::Oci {
                host,
                prefix: Some(prefix),
            } => format!("{}/{}", host, prefix),
            Self::Ctf { path } => path.display().to_string(),
        }
    }
}

impl fmt::Display for RepositorySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oci { .. } => f.write_str(&self.base_url()),
            Self::Ctf { path } => write!(f, "{}{}", CTF_PREFIX, path.display()),
        }
    }
}

impl FromStr for RepositorySpec {
    type Err = CtaError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// A component version at a location.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComponentRef {
    pub repository: RepositorySpec,
    pub name: String,
    pub version: String,
}

impl ComponentRef {
    pub fn new(repository: RepositorySpec, name: &str, version: &str) -> Self {
        Self {
            repository,
            name: name.to_string(),
            version: version.to_string(),
        }
    }

    /// Parse `<repository-spec>//<component-name>:<version>`.
    pub fn parse(reference: &str) -> Result<Self> {
        let (repo, component) = reference
            .rsplit_once("//")
            .ok_or_else(|| invalid(reference, "expected '<repository>//<name>:<version>'"))?;
        let (name, version) = component
            .rsplit_once(':')
            .ok_or_else(|| invalid(reference, "missing component version"))?;
        if name.is_empty() || version.is_empty() {
            return Err(invalid(reference, "empty component name or version"));
        }
        Ok(Self {
            repository: RepositorySpec::parse(repo)?,
            name: name.to_string(),
            version: version.to_string(),
        })
    }

    /// The same component version at another location.
    pub fn at(&self, repository: &RepositorySpec) -> Self {
        Self {
            repository: repository.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }
}

impl fmt::Display for ComponentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}//{}:{}", self.repository, self.name, self.version)
    }
}

impl FromStr for ComponentRef {
    type Err = CtaError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAUSE_DIGEST: &str =
        "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_parse_full_image_reference() {
        let r = ImageReference::parse("gcr.io/google_containers/echoserver:1.10").unwrap();
        assert_eq!(r.registry, "gcr.io");
        assert_eq!(r.repository, "google_containers/echoserver");
        assert_eq!(r.tag.as_deref(), Some("1.10"));
        assert_eq!(r.reference(), "1.10");
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("localhost:5000/echo").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "echo");
        assert_eq!(r.tag.as_deref(), Some("latest"));
    }

    #[test]
    fn test_parse_digest_reference() {
        let r = ImageReference::parse(&format!("gcr.io/pause@{}", PAUSE_DIGEST)).unwrap();
        assert_eq!(r.tag, None);
        assert_eq!(r.reference(), PAUSE_DIGEST);
        assert_eq!(r.to_string(), format!("gcr.io/pause@{}", PAUSE_DIGEST));
    }

    #[test]
    fn test_parse_docker_hub_short_name() {
        let r = ImageReference::parse("nginx:1.25").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/nginx");
    }

    #[test]
    fn test_relocate_keeps_tag() {
        let r = ImageReference::parse("gcr.io/google_containers/pause:3.2").unwrap();
        let moved = r.relocate("localhost:5000", "prefix/google_containers/pause");
        assert_eq!(
            moved.to_string(),
            "localhost:5000/prefix/google_containers/pause:3.2"
        );
    }

    #[test]
    fn test_repository_spec_kinds() {
        assert_eq!(
            RepositorySpec::parse("ctf::/tmp/ctf").unwrap(),
            RepositorySpec::Ctf {
                path: PathBuf::from("/tmp/ctf")
            }
        );
        assert!(matches!(
            RepositorySpec::parse("./out/ctf").unwrap(),
            RepositorySpec::Ctf { .. }
        ));
        let spec = RepositorySpec::parse("localhost:5000/ocm/test").unwrap();
        assert_eq!(spec, RepositorySpec::oci("localhost:5000", Some("ocm/test")));
        assert_eq!(spec.repository("component-descriptors/x"), "ocm/test/component-descriptors/x");
        assert_eq!(spec.base_url(), "localhost:5000/ocm/test");
    }

    #[test]
    fn test_parse_component_reference() {
        let r = ComponentRef::parse("localhost:5000/ocm//ocm.integrationtest/echo:1.0.0+abc")
            .unwrap();
        assert_eq!(r.repository, RepositorySpec::oci("localhost:5000", Some("ocm")));
        assert_eq!(r.name, "ocm.integrationtest/echo");
        assert_eq!(r.version, "1.0.0+abc");
        assert_eq!(ComponentRef::parse(&r.to_string()).unwrap(), r);
    }

    #[test]
    fn test_component_reference_requires_version() {
        assert!(ComponentRef::parse("localhost:5000//echo").is_err());
        assert!(ComponentRef::parse("echo:1.0").is_err());
    }
}
