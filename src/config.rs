//! Registry configuration.
//!
//! Loaded from an explicit path, `$CTA_CONFIG`, or `$HOME/.ctaconfig`, in that order.
//! A missing file means defaults. `CTA_CHUNK_SIZE` and `CTA_CONCURRENCY` override the
//! file values.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_CONCURRENCY, DEFAULT_CONFIG_FILE};
use crate::credentials::{EnvResolver, HostCredentials, HostResolver, ResolverChain};
use crate::error::{CtaError, Result};
use crate::image::media_types::ManifestStyle;

pub const CONFIG_ENV: &str = "CTA_CONFIG";
pub const CHUNK_SIZE_ENV: &str = "CTA_CHUNK_SIZE";
pub const CONCURRENCY_ENV: &str = "CTA_CONCURRENCY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Size of PATCH chunks for blob uploads
    pub chunk_size: usize,
    /// Parallel blob copies per artifact
    pub concurrency: usize,
    /// Hosts spoken to over plain HTTP (localhost always is)
    pub plain_http: Vec<String>,
    pub credentials: Vec<HostCredentials>,
    /// Default manifest style for built images
    pub style: ManifestStyle,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            plain_http: Vec::new(),
            credentials: Vec::new(),
            style: ManifestStyle::Oci,
            timeout_secs: 300,
        }
    }
}

impl RegistryConfig {
    /// Resolve the config file location and load it, applying env overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .or_else(default_config_path);

        let mut config = match path {
            Some(path) if path.exists() => {
                tracing::debug!(path = %path.display(), "Loading registry config");
                Self::from_yaml(&fs::read_to_string(&path)?)?
            }
            Some(path) if explicit.is_some() => {
                return Err(CtaError::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            _ => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(value) = env_number(CHUNK_SIZE_ENV)? {
            self.chunk_size = value;
        }
        if let Some(value) = env_number(CONCURRENCY_ENV)? {
            self.concurrency = value;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(CtaError::Config("chunkSize must be greater than 0".into()));
        }
        if self.concurrency == 0 {
            return Err(CtaError::Config("concurrency must be greater than 0".into()));
        }
        Ok(())
    }

    /// Whether requests to `host` go over plain HTTP.
    pub fn is_plain_http(&self, host: &str) -> bool {
        let bare = host.split(':').next().unwrap_or(host);
        matches!(bare, "localhost" | "127.0.0.1") || self.plain_http.iter().any(|h| h == host)
    }

    /// Environment credentials first, then the configured host entries.
    pub fn credential_chain(&self) -> ResolverChain {
        ResolverChain::new()
            .with(EnvResolver)
            .with(HostResolver::new(self.credentials.clone()))
    }
}

fn default_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(DEFAULT_CONFIG_FILE))
}

fn env_number(name: &str) -> Result<Option<usize>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CtaError::Config(format!("{} must be a number, got '{}'", name, value))),
        Err(_) => Ok(None),
    }
}

/// Installs a config file for the lifetime of the guard; the previous file (if any) is
/// moved to `<path>.bak` and put back on drop.
pub struct ConfigFileGuard {
    path: PathBuf,
    backup: Option<PathBuf>,
}

impl ConfigFileGuard {
    pub fn install(path: &Path, contents: &str) -> Result<Self> {
        let backup = if path.exists() {
            let mut name = path.as_os_str().to_owned();
            name.push(".bak");
            let backup = PathBuf::from(name);
            fs::rename(path, &backup)?;
            Some(backup)
        } else {
            None
        };
        fs::write(path, contents)?;
        Ok(Self {
            path: path.to_path_buf(),
            backup,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ConfigFileGuard {
    fn drop(&mut self) {
        let restored = match &self.backup {
            Some(backup) => fs::rename(backup, &self.path),
            None => fs::remove_file(&self.path),
        };
        if let Err(e) = restored {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to restore config file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialResolver, Privileges};
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
chunkSize: 1024
concurrency: 2
plainHttp: ["registry.internal:5000"]
style: docker
credentials:
  - host: registry.internal
    username: admin
    password: secret
"#;

    #[test]
    fn test_defaults() {
        let config = RegistryConfig::default();
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.style, ManifestStyle::Oci);
    }

    #[test]
    fn test_parse_yaml() {
        let config = RegistryConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.style, ManifestStyle::Docker);
        assert!(config.is_plain_http("registry.internal:5000"));
        assert!(config.is_plain_http("localhost:5000"));
        assert!(!config.is_plain_http("gcr.io"));

        let chain = HostResolver::new(config.credentials.clone());
        assert!(chain
            .resolve("registry.internal:5000", Privileges::ReadWrite)
            .is_some());
    }

    #[test]
    fn test_empty_file_means_defaults() {
        assert_eq!(RegistryConfig::from_yaml("  \n").unwrap(), RegistryConfig::default());
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(matches!(
            RegistryConfig::from_yaml("chunkSize: 0"),
            Err(CtaError::Config(_))
        ));
    }

    #[test]
    fn test_load_explicit_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "concurrency: 8\n").unwrap();
        let config = RegistryConfig::load(Some(&path)).unwrap();
        assert_eq!(config.concurrency, 8);

        assert!(RegistryConfig::load(Some(&dir.path().join("missing.yaml"))).is_err());
    }

    #[test]
    fn test_guard_restores_previous_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".ctaconfig");
        fs::write(&path, "concurrency: 1\n").unwrap();
        {
            let guard = ConfigFileGuard::install(&path, "concurrency: 9\n").unwrap();
            assert_eq!(fs::read_to_string(guard.path()).unwrap(), "concurrency: 9\n");
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), "concurrency: 1\n");
        assert!(!dir.path().join(".ctaconfig.bak").exists());
    }

    #[test]
    fn test_guard_removes_installed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".ctaconfig");
        drop(ConfigFileGuard::install(&path, "style: oci\n").unwrap());
        assert!(!path.exists());
    }
}
