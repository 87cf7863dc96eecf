//! Bridge configuration, loaded from YAML.
//!
//! ```yaml
//! http_port: 8124
//! upb:
//!   url: loopback://pim
//!   file_path: ""
//!   flags: "no_sync"
//!   lights:
//!     - { index: 7, name: Kitchen }
//!   links:
//!     - { index: 1, name: Evening, members: [ { light: 7, level: 40 } ] }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::pim::{Flags, Inventory, LightSpec, LinkSpec, PimConfig, MAX_LEVEL};

pub const DEFAULT_CONFIG_PATH: &str = "upb.yaml";
pub const DEFAULT_HTTP_PORT: u16 = 8124;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML in {}: {source}", path.display())]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    pub upb: UpbConfig,
}

fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpbConfig {
    pub url: String,
    /// UPStart export file; empty means none.
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub flags: String,
    #[serde(default)]
    pub lights: Vec<LightSpec>,
    #[serde(default)]
    pub links: Vec<LinkSpec>,
}

impl Config {
    /// Load from `$UPB_CONFIG`, falling back to `upb.yaml`. `$UPB_HTTP_PORT`
    /// overrides the configured port.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var("UPB_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::load(Path::new(&path))?;
        if let Some(port) = std::env::var("UPB_HTTP_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            config.http_port = port;
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents, path)
    }

    pub fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(contents).map_err(|source| ConfigError::ParseYaml {
                path: path.to_path_buf(),
                source,
            })?;
        config.upb.validate()?;
        Ok(config)
    }
}

impl UpbConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.url.split_once("://") {
            Some((scheme, _)) if !scheme.trim().is_empty() => {}
            _ => {
                return Err(invalid(
                    "upb.url",
                    format!("{:?} is not of the form <scheme>://<address>", self.url),
                ))
            }
        }

        self.pim_flags()?;

        let mut lights = HashSet::new();
        for light in &self.lights {
            if !lights.insert(light.index) {
                return Err(invalid("upb.lights", format!("duplicate index {}", light.index)));
            }
            if light.status.is_some_and(|s| s > MAX_LEVEL) {
                return Err(invalid(
                    "upb.lights",
                    format!("status of light {} must be 0-{}", light.index, MAX_LEVEL),
                ));
            }
        }

        let mut links = HashSet::new();
        for link in &self.links {
            if !links.insert(link.index) {
                return Err(invalid("upb.links", format!("duplicate index {}", link.index)));
            }
            for member in &link.members {
                if !lights.contains(&member.light) {
                    return Err(invalid(
                        "upb.links",
                        format!("link {} references unknown light {}", link.index, member.light),
                    ));
                }
                if member.level > MAX_LEVEL {
                    return Err(invalid(
                        "upb.links",
                        format!("level of light {} in link {} must be 0-{}", member.light, link.index, MAX_LEVEL),
                    ));
                }
            }
        }
        Ok(())
    }

    fn pim_flags(&self) -> Result<Flags, ConfigError> {
        self.flags
            .parse()
            .map_err(|e: crate::pim::DriverError| invalid("upb.flags", e.to_string()))
    }

    pub fn pim_config(&self) -> Result<PimConfig, ConfigError> {
        let export_file = match self.file_path.trim() {
            "" => None,
            p => Some(PathBuf::from(p)),
        };
        Ok(PimConfig {
            url: self.url.clone(),
            export_file,
            flags: self.pim_flags()?,
        })
    }

    pub fn inventory(&self) -> Inventory {
        Inventory {
            lights: self.lights.clone(),
            links: self.links.clone(),
        }
    }
}

fn invalid(key: &str, reason: String) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason,
    }
}
