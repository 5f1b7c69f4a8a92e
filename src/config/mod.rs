//! Node configuration: identity, known devices and shared folders.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::index::FolderSharing;
use crate::types::{DeviceId, FolderId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// This node's identity
    pub device_id: DeviceId,

    /// Address to accept peer connections on
    #[serde(default)]
    pub listen: Option<SocketAddr>,

    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    #[serde(default)]
    pub folders: Vec<FolderConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: DeviceId,

    #[serde(default)]
    pub name: Option<String>,

    /// Dialled at startup when set
    #[serde(default)]
    pub address: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderConfig {
    pub id: FolderId,
    pub path: PathBuf,

    /// Devices this folder is shared with
    #[serde(default)]
    pub devices: Vec<DeviceId>,
}

/// Expand tilde (~) in paths to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            home.join(rest)
        } else {
            path.to_path_buf()
        }
    } else {
        path.to_path_buf()
    }
}

impl Config {
    /// Load and validate a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        text.parse()
    }

    pub fn validate(&self) -> Result<()> {
        let known: HashSet<&DeviceId> = self.devices.iter().map(|d| &d.id).collect();
        let mut seen = HashSet::new();

        for folder in &self.folders {
            if folder.id.is_empty() {
                return Err(Error::Config("folder with empty id".into()));
            }
            if !seen.insert(folder.id.as_str()) {
                return Err(Error::Config(format!("duplicate folder id {:?}", folder.id)));
            }
            if let Some(device) = folder.devices.iter().find(|d| !known.contains(d)) {
                return Err(Error::Config(format!(
                    "folder {:?} is shared with undeclared device {}",
                    folder.id, device
                )));
            }
        }
        Ok(())
    }

    pub fn folder(&self, id: &str) -> Option<&FolderConfig> {
        self.folders.iter().find(|f| f.id == id)
    }

    pub fn device(&self, id: &DeviceId) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.id == *id)
    }

    /// Root directory of every folder
    pub fn folder_roots(&self) -> HashMap<FolderId, PathBuf> {
        self.folders
            .iter()
            .map(|f| (f.id.clone(), f.path.clone()))
            .collect()
    }
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(s)?;
        for folder in &mut config.folders {
            folder.path = expand_tilde(&folder.path);
        }
        config.validate()?;
        Ok(config)
    }
}

/// Live configuration shared between components.
///
/// Every sharing query reads the current configuration; nothing is cached.
#[derive(Debug)]
pub struct ConfigWrapper {
    cfg: RwLock<Config>,
}

impl ConfigWrapper {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg: RwLock::new(cfg),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self::new(Config::load(path)?))
    }

    /// Snapshot of the current configuration
    pub fn get(&self) -> Config {
        self.cfg.read().clone()
    }

    /// Validate and swap in a new configuration.
    pub fn replace(&self, cfg: Config) -> Result<()> {
        cfg.validate()?;
        *self.cfg.write() = cfg;
        tracing::info!("configuration replaced");
        Ok(())
    }
}

impl FolderSharing for ConfigWrapper {
    fn is_shared(&self, device: &DeviceId, folder: &str) -> bool {
        self.cfg
            .read()
            .folder(folder)
            .is_some_and(|f| f.devices.contains(device))
    }

    fn shared_folders(&self, device: &DeviceId) -> Vec<String> {
        let mut folders: Vec<String> = self
            .cfg
            .read()
            .folders
            .iter()
            .filter(|f| f.devices.contains(device))
            .map(|f| f.id.clone())
            .collect();
        folders.sort();
        folders
    }
}
