//! OCI image configuration and merging of spec-declared overrides.

use crate::RuntimeError;
use kiln_schema::ImageSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            os: "linux".to_owned(),
            architecture: "amd64".to_owned(),
            variant: None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(v) = &self.variant {
            write!(f, "/{v}")?;
        }
        Ok(())
    }
}

impl FromStr for Platform {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Self {
                os: (*os).to_owned(),
                architecture: (*arch).to_owned(),
                variant: None,
            }),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => {
                Ok(Self {
                    os: (*os).to_owned(),
                    architecture: (*arch).to_owned(),
                    variant: Some((*variant).to_owned()),
                })
            }
            _ => Err(RuntimeError::InvalidPlatform(s.to_owned())),
        }
    }
}

/// Runtime part of an OCI image config. Field names follow the OCI JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Env", default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    #[serde(rename = "User", default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(rename = "Labels", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default)]
    pub config: ContainerConfig,
}

impl ImageConfig {
    pub fn from_json(reference: &str, bytes: &[u8]) -> Result<Self, RuntimeError> {
        serde_json::from_slice(bytes).map_err(|e| RuntimeError::ImageConfig {
            reference: reference.to_owned(),
            reason: e.to_string(),
        })
    }

    pub fn platform(&self) -> Platform {
        Platform {
            os: self.os.clone(),
            architecture: self.architecture.clone(),
            variant: self.variant.clone(),
        }
    }

    pub fn set_platform(&mut self, platform: &Platform) {
        self.os.clone_from(&platform.os);
        self.architecture.clone_from(&platform.architecture);
        self.variant.clone_from(&platform.variant);
    }

    /// Value of `key` in the env list.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.config.env.iter().find_map(|kv| {
            kv.split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }

    /// Layer spec image declarations over this config. Env and labels merge
    /// by key. A new entrypoint clears an inherited cmd unless the spec sets
    /// one too.
    pub fn merge_spec(&mut self, image: &ImageSpec) {
        for (key, value) in &image.env {
            let entry = format!("{key}={value}");
            match self
                .config
                .env
                .iter_mut()
                .find(|kv| kv.split_once('=').map_or(kv.as_str(), |(k, _)| k) == key)
            {
                Some(existing) => *existing = entry,
                None => self.config.env.push(entry),
            }
        }

        self.config
            .labels
            .extend(image.labels.iter().map(|(k, v)| (k.clone(), v.clone())));

        if let Some(entrypoint) = &image.entrypoint {
            self.config.entrypoint = Some(entrypoint.clone());
            self.config.cmd = None;
        }
        if let Some(cmd) = &image.cmd {
            self.config.cmd = Some(cmd.clone());
        }
        if let Some(dir) = &image.working_dir {
            self.config.working_dir.clone_from(dir);
        }
        if let Some(user) = &image.user {
            self.config.user.clone_from(user);
        }
    }

    pub fn to_json(&self) -> Result<String, RuntimeError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
