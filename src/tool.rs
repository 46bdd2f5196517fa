//! Descriptor tool clients.
//!
//! [`DescriptorToolClient`] is the operation set of the component CLI. [`OcmCliClient`]
//! drives an external `ocm` binary; [`EngineClient`] performs the same operations with
//! this crate, so callers can switch between them.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::component::{add_component_versions, ComponentArchive};
use crate::error::{CtaError, Result};
use crate::image::copy::CopyOptions;
use crate::reference::{ComponentRef, RepositorySpec};
use crate::store::StoreFactory;
use crate::transport::{TransportOptions, Transporter};

/// Operations of the component command line tool. Each returns the tool's output.
pub trait DescriptorToolClient {
    fn create_component_archive(
        &self,
        ca: &Path,
        name: &str,
        version: &str,
        provider: &str,
        force: bool,
    ) -> Result<String>;

    fn add_sources(&self, ca: &Path, file: &Path) -> Result<String>;

    fn add_resources(&self, ca: &Path, file: &Path) -> Result<String>;

    fn add_references(&self, ca: &Path, file: &Path) -> Result<String>;

    fn add_component_versions(&self, ctf: &Path, components_file: &Path) -> Result<String>;

    fn transfer_component_archive(&self, ca: &Path, ctf: &Path, force: bool) -> Result<String>;

    /// Descriptor YAML of a component version.
    fn get_component(&self, component: &ComponentRef) -> Result<String>;

    fn transfer_ctf(&self, ctf: &Path, target: &RepositorySpec, options: &TransportOptions) -> Result<String>;

    fn transfer_artifacts(&self, source: &str, target: &str) -> Result<String>;
}

/// Runs the `ocm` command line tool.
#[derive(Debug, Clone)]
pub struct OcmCliClient {
    binary: PathBuf,
    envs: Vec<(String, String)>,
}

impl Default for OcmCliClient {
    fn default() -> Self {
        Self::new("ocm")
    }
}

impl OcmCliClient {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            envs: Vec::new(),
        }
    }

    /// Extra environment for every invocation (e.g. `OCM_CONFIG`).
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.envs.push((key.to_string(), value.to_string()));
        self
    }

    fn run(&self, args: Vec<OsString>) -> Result<String> {
        let command = std::iter::once(self.binary.as_os_str().to_string_lossy().into_owned())
            .chain(args.iter().map(|a| a.to_string_lossy().into_owned()))
            .collect::<Vec<_>>()
            .join(" ");
        tracing::debug!(command = %command, "Running descriptor tool");

        let output = Command::new(&self.binary)
            .args(&args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .output()
            .map_err(|e| CtaError::Tool {
                command: command.clone(),
                code: None,
                stderr: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(CtaError::Tool {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn args<I, S>(items: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    items.into_iter().map(Into::into).collect()
}

impl DescriptorToolClient for OcmCliClient {
    fn create_component_archive(
        &self,
        ca: &Path,
        name: &str,
        version: &str,
        provider: &str,
        force: bool,
    ) -> Result<String> {
        let mut a = args(["create", "componentarchive"]);
        if force {
            a.push("-f".into());
        }
        a.extend(args([name, version, "--provider", provider, "--file"]));
        a.push(ca.as_os_str().to_owned());
        self.run(a)
    }

    fn add_sources(&self, ca: &Path, file: &Path) -> Result<String> {
        self.run(args([OsString::from("add"), "sources".into(), ca.into(), file.into()]))
    }

    fn add_resources(&self, ca: &Path, file: &Path) -> Result<String> {
        self.run(args([OsString::from("add"), "resources".into(), ca.into(), file.into()]))
    }

    fn add_references(&self, ca: &Path, file: &Path) -> Result<String> {
        self.run(args([OsString::from("add"), "references".into(), ca.into(), file.into()]))
    }

    fn add_component_versions(&self, ctf: &Path, components_file: &Path) -> Result<String> {
        self.run(args([
            OsString::from("add"),
            "componentversions".into(),
            "--create".into(),
            "--file".into(),
            ctf.into(),
            components_file.into(),
        ]))
    }

    fn transfer_component_archive(&self, ca: &Path, ctf: &Path, force: bool) -> Result<String> {
        let mut a = args(["transfer", "componentarchive"]);
        if force {
            a.push("--overwrite".into());
        }
        a.extend(args([ca, ctf]));
        self.run(a)
    }

    fn get_component(&self, component: &ComponentRef) -> Result<String> {
        self.run(args([
            "get".to_string(),
            "component".to_string(),
            "-o".to_string(),
            "yaml".to_string(),
            component.to_string(),
        ]))
    }

    fn transfer_ctf(&self, ctf: &Path, target: &RepositorySpec, options: &TransportOptions) -> Result<String> {
        let mut a = args(["transfer", "ctf"]);
        if options.by_value {
            a.push("--copy-resources".into());
        }
        if options.recursive {
            a.push("--recursive".into());
        }
        if options.force {
            a.push("--overwrite".into());
        }
        a.push(ctf.as_os_str().to_owned());
        a.push(target.to_string().into());
        self.run(a)
    }

    fn transfer_artifacts(&self, source: &str, target: &str) -> Result<String> {
        self.run(args(["transfer", "artifacts", source, target]))
    }
}

/// Performs the tool operations in-process.
pub struct EngineClient<'a> {
    stores: &'a dyn StoreFactory,
    copy: CopyOptions,
}

impl<'a> EngineClient<'a> {
    pub fn new(stores: &'a dyn StoreFactory, copy: CopyOptions) -> Self {
        Self { stores, copy }
    }
}

impl DescriptorToolClient for EngineClient<'_> {
    fn create_component_archive(
        &self,
        ca: &Path,
        name: &str,
        version: &str,
        provider: &str,
        force: bool,
    ) -> Result<String> {
        ComponentArchive::create(ca, name, version, provider, force)?;
        Ok(format!("created component archive {}\n", ca.display()))
    }

    fn add_sources(&self, ca: &Path, file: &Path) -> Result<String> {
        let added = ComponentArchive::open(ca)?.add_sources_from_file(file)?;
        Ok(format!("added {} source(s)\n", added))
    }

    fn add_resources(&self, ca: &Path, file: &Path) -> Result<String> {
        let added = ComponentArchive::open(ca)?.add_resources_from_file(file)?;
        Ok(format!("added {} resource(s)\n", added))
    }

    fn add_references(&self, ca: &Path, file: &Path) -> Result<String> {
        let added = ComponentArchive::open(ca)?.add_references_from_file(file)?;
        Ok(format!("added {} reference(s)\n", added))
    }

    fn add_component_versions(&self, ctf: &Path, components_file: &Path) -> Result<String> {
        let packed = add_component_versions(ctf, components_file, false)?;
        Ok(packed
            .iter()
            .map(|p| format!("{}:{} {}\n", p.repository, p.tag, p.manifest.digest))
            .collect())
    }

    fn transfer_component_archive(&self, ca: &Path, ctf: &Path, force: bool) -> Result<String> {
        let packed = ComponentArchive::open(ca)?.transfer_to_ctf(ctf, force)?;
        Ok(format!("{}:{} {}\n", packed.repository, packed.tag, packed.manifest.digest))
    }

    fn get_component(&self, component: &ComponentRef) -> Result<String> {
        Transporter::new(self.stores).get_component(component)?.to_yaml()
    }

    fn transfer_ctf(&self, ctf: &Path, target: &RepositorySpec, options: &TransportOptions) -> Result<String> {
        let options = TransportOptions {
            copy: self.copy,
            ..*options
        };
        let report = Transporter::new(self.stores).transfer_ctf(ctf, target, &options)?;
        Ok(report
            .transported
            .iter()
            .map(|c| format!("transported {}\n", c))
            .chain(report.skipped.iter().map(|c| format!("skipped {}\n", c)))
            .collect())
    }

    fn transfer_artifacts(&self, source: &str, target: &str) -> Result<String> {
        let (pushed, _) = Transporter::new(self.stores).transfer_artifact(source, target, &self.copy)?;
        Ok(format!("{} {}\n", target, pushed.digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StaticStores};
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[cfg(unix)]
    #[test]
    fn test_cli_client_passes_arguments() {
        let client = OcmCliClient::new("echo");
        let out = client
            .transfer_ctf(
                Path::new("/tmp/ctf"),
                &RepositorySpec::oci("localhost:5000", Some("ocm")),
                &TransportOptions {
                    by_value: true,
                    ..TransportOptions::default()
                },
            )
            .unwrap();
        assert_eq!(out.trim(), "transfer ctf --copy-resources /tmp/ctf localhost:5000/ocm");
    }

    #[cfg(unix)]
    #[test]
    fn test_cli_client_reports_failure() {
        let client = OcmCliClient::new("false");
        match client.transfer_artifacts("a", "b") {
            Err(CtaError::Tool { code, command, .. }) => {
                assert_eq!(code, Some(1));
                assert!(command.starts_with("false transfer artifacts"));
            }
            other => panic!("expected tool error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_missing_binary() {
        let client = OcmCliClient::new("/nonexistent/ocm-binary");
        assert!(matches!(
            client.transfer_artifacts("a", "b"),
            Err(CtaError::Tool { code: None, .. })
        ));
    }

    #[test]
    fn test_engine_client_builds_ctf() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("someresource.txt"), "some resource\n").unwrap();
        fs::write(
            tmp.path().join("resources.yaml"),
            "name: myfile\ntype: blob\ninput:\n  type: file\n  path: someresource.txt\n",
        )
        .unwrap();

        let stores = StaticStores::new().with("localhost:5000", Arc::new(MemoryStore::new()));
        let client = EngineClient::new(&stores, CopyOptions::default());
        let ca = tmp.path().join("ca");
        let ctf = tmp.path().join("ctf");
        client
            .create_component_archive(&ca, "acme.org/helper", "1.0.0", "acme.org", false)
            .unwrap();
        let out = client
            .add_resources(&ca, &tmp.path().join("resources.yaml"))
            .unwrap();
        assert_eq!(out, "added 1 resource(s)\n");
        let out = client.transfer_component_archive(&ca, &ctf, false).unwrap();
        assert!(out.starts_with("component-descriptors/acme.org/helper:1.0.0 sha256:"));
    }
}
