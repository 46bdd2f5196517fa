//! Credential lookup for registry access.
//!
//! Resolvers are consulted in order by a [`ResolverChain`]; the first one that knows the
//! host wins. `lookup` mirrors the classic `(image_reference, privileges, absent_ok)`
//! lookup function shape used by callers that only hold an image reference.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CtaError, Result};
use crate::reference::ImageReference;

pub const USERNAME_ENV: &str = "CTA_REGISTRY_USERNAME";
pub const PASSWORD_ENV: &str = "CTA_REGISTRY_PASSWORD";
pub const HOST_ENV: &str = "CTA_REGISTRY_HOST";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privileges {
    #[serde(alias = "readonly")]
    ReadOnly,
    #[default]
    #[serde(alias = "readwrite")]
    ReadWrite,
}

impl Privileges {
    /// Whether credentials granted `self` are good enough for a `wanted` request.
    pub fn covers(&self, wanted: Privileges) -> bool {
        matches!(
            (self, wanted),
            (Privileges::ReadWrite, _) | (Privileges::ReadOnly, Privileges::ReadOnly)
        )
    }
}

pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, host: &str, privileges: Privileges) -> Option<Credentials>;
}

/// Credentials from `CTA_REGISTRY_USERNAME` / `CTA_REGISTRY_PASSWORD`, optionally
/// restricted to the host named in `CTA_REGISTRY_HOST`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvResolver;

impl CredentialResolver for EnvResolver {
    fn resolve(&self, host: &str, _privileges: Privileges) -> Option<Credentials> {
        if let Ok(only) = std::env::var(HOST_ENV) {
            if !host.contains(&only) {
                return None;
            }
        }
        let username = std::env::var(USERNAME_ENV).ok()?;
        let password = std::env::var(PASSWORD_ENV).ok()?;
        Some(Credentials::new(username, password))
    }
}

/// One configured credential entry, matched when `host` is a substring of the
/// requested host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCredentials {
    pub host: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub privileges: Privileges,
}

#[derive(Debug, Clone, Default)]
pub struct HostResolver {
    entries: Vec<HostCredentials>,
}

impl HostResolver {
    pub fn new(entries: Vec<HostCredentials>) -> Self {
        Self { entries }
    }
}

impl CredentialResolver for HostResolver {
    fn resolve(&self, host: &str, privileges: Privileges) -> Option<Credentials> {
        self.entries
            .iter()
            .filter(|e| host.contains(&e.host) && e.privileges.covers(privileges))
            // most specific entry first
            .max_by_key(|e| e.host.len())
            .map(|e| Credentials::new(&e.username, &e.password))
    }
}

/// The same credentials for every host.
#[derive(Debug, Clone)]
pub struct StaticResolver(pub Credentials);

impl CredentialResolver for StaticResolver {
    fn resolve(&self, _host: &str, _privileges: Privileges) -> Option<Credentials> {
        Some(self.0.clone())
    }
}

#[derive(Default)]
pub struct ResolverChain {
    resolvers: Vec<Box<dyn CredentialResolver>>,
}

impl ResolverChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, resolver: impl CredentialResolver + 'static) -> Self {
        self.resolvers.push(Box::new(resolver));
        self
    }

    pub fn push(&mut self, resolver: Box<dyn CredentialResolver>) {
        self.resolvers.push(resolver);
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

impl CredentialResolver for ResolverChain {
    fn resolve(&self, host: &str, privileges: Privileges) -> Option<Credentials> {
        self.resolvers
            .iter()
            .find_map(|r| r.resolve(host, privileges))
    }
}

/// Look up credentials for the registry of `image_reference`.
///
/// Returns `Ok(None)` when nothing is configured and `absent_ok` is set; otherwise a
/// missing entry is reported as `Unauthorized` for that host.
pub fn lookup(
    resolver: &dyn CredentialResolver,
    image_reference: &str,
    privileges: Privileges,
    absent_ok: bool,
) -> Result<Option<Credentials>> {
    let reference = ImageReference::parse(image_reference)?;
    match resolver.resolve(&reference.registry, privileges) {
        Some(creds) => Ok(Some(creds)),
        None if absent_ok => Ok(None),
        None => Err(CtaError::Unauthorized {
            host: reference.registry,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<HostCredentials> {
        vec![
            HostCredentials {
                host: "localhost".into(),
                username: "admin".into(),
                password: "secret".into(),
                privileges: Privileges::ReadWrite,
            },
            HostCredentials {
                host: "gcr.io".into(),
                username: "reader".into(),
                password: "pull".into(),
                privileges: Privileges::ReadOnly,
            },
        ]
    }

    #[test]
    fn test_host_resolver_matches_substring() {
        let resolver = HostResolver::new(entries());
        let creds = resolver
            .resolve("localhost:5000", Privileges::ReadWrite)
            .unwrap();
        assert_eq!(creds.username, "admin");
        assert!(resolver.resolve("ghcr.io", Privileges::ReadOnly).is_none());
    }

    #[test]
    fn test_read_only_entry_not_used_for_push() {
        let resolver = HostResolver::new(entries());
        assert!(resolver.resolve("gcr.io", Privileges::ReadOnly).is_some());
        assert!(resolver.resolve("gcr.io", Privileges::ReadWrite).is_none());
    }

    #[test]
    fn test_chain_uses_first_match() {
        let chain = ResolverChain::new()
            .with(HostResolver::new(entries()))
            .with(StaticResolver(Credentials::new("fallback", "pw")));
        assert_eq!(
            chain.resolve("localhost:5000", Privileges::ReadWrite).unwrap().username,
            "admin"
        );
        assert_eq!(
            chain.resolve("quay.io", Privileges::ReadOnly).unwrap().username,
            "fallback"
        );
    }

    #[test]
    fn test_lookup_absent() {
        let empty = ResolverChain::new();
        assert_eq!(
            lookup(&empty, "gcr.io/google_containers/pause:3.2", Privileges::ReadOnly, true)
                .unwrap(),
            None
        );
        let err = lookup(&empty, "gcr.io/google_containers/pause:3.2", Privileges::ReadOnly, false)
            .unwrap_err();
        assert!(matches!(err, CtaError::Unauthorized { ref host } if host == "gcr.io"));
    }

    #[test]
    fn test_debug_hides_password() {
        let creds = Credentials::new("admin", "hunter2");
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }
}
