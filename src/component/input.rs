//! User-authored resource, source and component specifications.
//!
//! An element either points at existing content (`access`) or names local content to be
//! archived (`input`). Inputs are materialized into blobs when they are added to a
//! component archive.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tempfile::NamedTempFile;

use super::artifact_set;
use super::descriptor::{Access, ComponentReference, Label, Provider, Relation};
use crate::archive::build_layer;
use crate::error::{CtaError, Result};
use crate::image::media_types::{ARTIFACT_SET, OCTET_STREAM, TAR, TAR_GZIP};

/// Local content that becomes a local blob.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Input {
    /// A single file, optionally gzip-compressed
    File {
        path: PathBuf,
        #[serde(rename = "mediaType", default)]
        media_type: Option<String>,
        #[serde(default)]
        compress: bool,
    },
    /// A directory archived as a tar
    Dir {
        path: PathBuf,
        #[serde(rename = "mediaType", default)]
        media_type: Option<String>,
        #[serde(default)]
        compress: bool,
    },
    /// A Helm chart directory, stored as an OCI artifact set
    Helm { path: PathBuf },
    /// A transport-archive directory holding one OCI artifact
    #[serde(alias = "ociArtifactSet")]
    ArtifactSet { path: PathBuf },
}

/// A resource or source as written by a user.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ElementSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub element_type: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub relation: Option<Relation>,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub input: Option<Input>,
    #[serde(default)]
    pub access: Option<Access>,
}

/// Content of an input, ready to be stored.
pub struct MaterializedInput {
    pub file: NamedTempFile,
    pub media_type: String,
    pub reference_name: Option<String>,
}

impl ElementSpec {
    /// Exactly one of `input` and `access` must be set.
    pub fn validate(&self) -> Result<()> {
        match (&self.input, &self.access) {
            (Some(_), Some(_)) => Err(CtaError::Config(format!(
                "element '{}' sets both input and access",
                self.name
            ))),
            (None, None) => Err(CtaError::Config(format!(
                "element '{}' needs an input or an access",
                self.name
            ))),
            _ => Ok(()),
        }
    }

    /// Declared relation, else local for inputs and external for accesses.
    pub fn relation(&self) -> Relation {
        self.relation.unwrap_or(if self.input.is_some() {
            Relation::Local
        } else {
            Relation::External
        })
    }
}

impl Input {
    /// Build the blob for this input. Relative paths resolve against `base`;
    /// `component` names the owning component and prefixes artifact reference names.
    pub fn materialize(&self, base: &Path, component: &str) -> Result<MaterializedInput> {
        match self {
            Input::File {
                path,
                media_type,
                compress,
            } => {
                let path = resolve(base, path);
                let media_type = media_type.clone().unwrap_or_else(|| OCTET_STREAM.to_string());
                let file = NamedTempFile::new()?;
                let mut source = BufReader::new(File::open(&path).map_err(|e| input_error(&path, e))?);
                if *compress {
                    let mut encoder =
                        GzEncoder::new(BufWriter::new(file.reopen()?), Compression::default());
                    io::copy(&mut source, &mut encoder)?;
                    encoder.finish()?.flush()?;
                } else {
                    let mut writer = BufWriter::new(file.reopen()?);
                    io::copy(&mut source, &mut writer)?;
                    writer.flush()?;
                }
                Ok(MaterializedInput {
                    file,
                    media_type: if *compress {
                        format!("{}+gzip", media_type)
                    } else {
                        media_type
                    },
                    reference_name: None,
                })
            }
            Input::Dir {
                path,
                media_type,
                compress,
            } => {
                let path = resolve(base, path);
                if !path.is_dir() {
                    return Err(input_error(
                        &path,
                        io::Error::new(io::ErrorKind::NotFound, "not a directory"),
                    ));
                }
                let layer = build_layer(&path, *compress)?;
                let default_type = if *compress { TAR_GZIP } else { TAR };
                let file = NamedTempFile::new()?;
                let mut writer = BufWriter::new(file.reopen()?);
                io::copy(&mut layer.open()?, &mut writer)?;
                writer.flush()?;
                Ok(MaterializedInput {
                    file,
                    media_type: media_type.clone().unwrap_or_else(|| default_type.to_string()),
                    reference_name: None,
                })
            }
            Input::Helm { path } => {
                let set = artifact_set::from_helm_chart(&resolve(base, path))?;
                Ok(MaterializedInput {
                    reference_name: Some(format!("{}/{}", component, set.info.reference_name())),
                    file: set.file,
                    media_type: ARTIFACT_SET.to_string(),
                })
            }
            Input::ArtifactSet { path } => {
                let set = artifact_set::from_dir(&resolve(base, path))?;
                Ok(MaterializedInput {
                    reference_name: Some(format!("{}/{}", component, set.info.reference_name())),
                    file: set.file,
                    media_type: ARTIFACT_SET.to_string(),
                })
            }
        }
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn input_error(path: &Path, err: io::Error) -> CtaError {
    CtaError::Config(format!("cannot read input {}: {}", path.display(), err))
}

/// One component version in a components file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentVersionSpec {
    pub name: String,
    pub version: String,
    pub provider: Provider,
    #[serde(default)]
    pub resources: Vec<ElementSpec>,
    #[serde(default)]
    pub sources: Vec<ElementSpec>,
    #[serde(default)]
    pub component_references: Vec<ComponentReference>,
    #[serde(default)]
    pub labels: Vec<Label>,
}

/// `components: [...]` document describing several component versions.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ComponentsFile {
    pub components: Vec<ComponentVersionSpec>,
}

impl ComponentsFile {
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| CtaError::Config(format!("invalid components file: {}", e)))
    }
}

/// Parse a stream of YAML documents (`---` separated), skipping empty ones.
pub fn parse_documents<T: DeserializeOwned>(contents: &str) -> Result<Vec<T>> {
    let mut items = Vec::new();
    for document in serde_yaml::Deserializer::from_str(contents) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        items.push(serde_yaml::from_value(value)?);
    }
    Ok(items)
}
