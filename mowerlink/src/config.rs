//! Configuration file handling.
//!
//! Configuration is a single JSON document. Every section and field has a
//! default, so an empty object (or no file at all) is a valid config.
//!
//! Default location: `<config dir>/mowerlink/config.json`, e.g.
//! `~/.config/mowerlink/config.json` on Linux.

use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use mowerlink_core::analyzer::ClassifierConfig;
use mowerlink_core::lidar::ClusterSettings;
use mowerlink_core::DeviceFilter;

use crate::error::LinkError;

pub fn get_project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "mowerlink", "mowerlink")
}

/// Default config file path, if the platform has a config directory.
pub fn default_config_path() -> Option<PathBuf> {
    get_project_dirs().map(|dirs| dirs.config_dir().join("config.json"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceConfig {
    #[serde(flatten)]
    pub filter: DeviceFilter,
    /// How long to wait for a matching advertisement
    pub scan_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            filter: DeviceFilter::default(),
            scan_timeout_ms: 30_000,
        }
    }
}

impl DeviceConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveryConfig {
    /// Time to watch for a response after each probe
    pub observation_window_ms: u64,
    /// Pause between probes
    pub cooldown_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            observation_window_ms: 2000,
            cooldown_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutomationConfig {
    /// Rule evaluation period
    pub interval_ms: u64,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        AutomationConfig { interval_ms: 5000 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub device: DeviceConfig,
    pub discovery: DiscoveryConfig,
    pub classifier: ClassifierConfig,
    pub lidar: ClusterSettings,
    pub automation: AutomationConfig,
}

impl Config {
    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing file yields the defaults. A file that exists but cannot
    /// be parsed is an error.
    pub fn load(path: Option<&Path>) -> Result<Config, LinkError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match default_config_path() {
                Some(p) => p,
                None => {
                    debug!("No config directory on this platform, using defaults");
                    return Ok(Config::default());
                }
            },
        };

        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Config::default());
        }

        let file = fs::File::open(&path)?;
        let config: Config = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            warn!("Failed to parse config {}: {}", path.display(), e);
            LinkError::Config(format!("{}: {}", path.display(), e))
        })?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Write as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), LinkError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = fs::File::create(path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)
            .map_err(|e| LinkError::Config(e.to_string()))?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}
