use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_IMAGE_PATH_ENV;
use crate::digest::Digest;
use crate::error::{CtaError, Result};

/// Caller-provided parts of an image config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageSettings {
    pub architecture: String,
    pub os: String,
    pub entrypoint: Vec<String>,
    pub cmd: Option<Vec<String>>,
    /// Extra `KEY=value` entries; `PATH` is always present
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    /// Fixed creation time for reproducible configs; now when unset
    pub created: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub comment: Option<String>,
}

impl ImageSettings {
    pub fn new(os: &str, architecture: &str, entrypoint: &str) -> Self {
        Self {
            architecture: architecture.to_string(),
            os: os.to_string(),
            entrypoint: vec![entrypoint.to_string()],
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        let missing = [
            ("architecture", self.architecture.trim().is_empty()),
            ("os", self.os.trim().is_empty()),
            ("entrypoint", self.entrypoint.is_empty()),
        ]
        .into_iter()
        .filter(|(_, empty)| *empty)
        .map(|(name, _)| name)
        .collect::<Vec<_>>();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(CtaError::InvalidState(format!(
                "image config requires {}",
                missing.join(", ")
            )))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Env", default)]
    pub env: Vec<String>,
    #[serde(rename = "Entrypoint", default)]
    pub entrypoint: Vec<String>,
    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", default)]
    pub working_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    pub created: String,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    pub diff_ids: Vec<Digest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub architecture: String,
    pub os: String,
    pub config: ContainerConfig,
    pub created: String,
    #[serde(default)]
    pub history: Vec<History>,
    pub rootfs: RootFs,
}

impl ImageConfig {
    /// Config for an image whose layers have the given uncompressed digests, in order.
    pub fn new(settings: &ImageSettings, diff_ids: &[Digest]) -> Result<Self> {
        settings.validate()?;
        let created = settings
            .created
            .unwrap_or_else(Utc::now)
            .to_rfc3339_opts(SecondsFormat::Secs, true);

        let mut env = vec![DEFAULT_IMAGE_PATH_ENV.to_string()];
        env.extend(
            settings
                .env
                .iter()
                .filter(|e| !e.starts_with("PATH="))
                .cloned(),
        );

        Ok(Self {
            architecture: settings.architecture.clone(),
            os: settings.os.clone(),
            config: ContainerConfig {
                env,
                entrypoint: settings.entrypoint.clone(),
                cmd: settings.cmd.clone(),
                working_dir: settings
                    .working_dir
                    .clone()
                    .unwrap_or_else(|| "/".to_string()),
            },
            history: vec![History {
                created: created.clone(),
                created_by: settings
                    .created_by
                    .clone()
                    .unwrap_or_else(|| concat!("cta ", env!("CARGO_PKG_VERSION")).to_string()),
                comment: settings.comment.clone(),
            }],
            created,
            rootfs: RootFs {
                fs_type: "layers".to_string(),
                diff_ids: diff_ids.to_vec(),
            },
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| CtaError::malformed(format!("invalid image config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::digest_bytes;
    use chrono::TimeZone;

    fn fixed_settings() -> ImageSettings {
        ImageSettings {
            created: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).single(),
            env: vec!["GREETING=hello".into(), "PATH=/ignored".into()],
            ..ImageSettings::new("linux", "amd64", "/hello/hello")
        }
    }

    #[test]
    fn test_config_json_shape() {
        let diff_ids = vec![digest_bytes(b"a"), digest_bytes(b"b")];
        let config = ImageConfig::new(&fixed_settings(), &diff_ids).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&config.to_bytes().unwrap()).unwrap();

        assert_eq!(json["architecture"], "amd64");
        assert_eq!(json["os"], "linux");
        assert_eq!(json["config"]["Entrypoint"][0], "/hello/hello");
        assert_eq!(json["config"]["WorkingDir"], "/");
        assert_eq!(json["config"]["Env"][0], DEFAULT_IMAGE_PATH_ENV);
        assert_eq!(json["config"]["Env"].as_array().unwrap().len(), 2);
        assert_eq!(json["created"], "2024-01-02T03:04:05Z");
        assert_eq!(json["rootfs"]["type"], "layers");
        assert_eq!(json["rootfs"]["diff_ids"][1], diff_ids[1].as_str());
        assert_eq!(json["history"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_fixed_created_is_reproducible() {
        let a = ImageConfig::new(&fixed_settings(), &[]).unwrap();
        let b = ImageConfig::new(&fixed_settings(), &[]).unwrap();
        assert_eq!(a.to_bytes().unwrap(), b.to_bytes().unwrap());
    }

    #[test]
    fn test_missing_fields_rejected() {
        let settings = ImageSettings {
            entrypoint: Vec::new(),
            ..ImageSettings::new("linux", "", "/x")
        };
        let err = ImageConfig::new(&settings, &[]).unwrap_err().to_string();
        assert!(err.contains("architecture"));
        assert!(err.contains("entrypoint"));
    }
}
