use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::InstallerError;
use crate::port_check::{
    CheckerOptions, DEFAULT_JOIN_TIMEOUT, DEFAULT_READY_TIMEOUT, DEFAULT_TEST_MODE_PORT_THRESHOLD,
};
use crate::process::{DEFAULT_EXIT_TIMEOUT, DEFAULT_SUCCESS_EXIT_TIMEOUT};
use crate::seed::{DEFAULT_REQUEST_TIMEOUT, DEFAULT_SEED_NODES};

const APP_DIR: &str = "iop-installer";
const CONFIG_FILE: &str = "installer.toml";

/// Top-level installer configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    /// Where the installation plan is stored. Defaults to the user data dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// Root of the servers' data directories. Defaults to the home dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub components_dir: Option<PathBuf>,
    pub process: ProcessConfig,
    pub port_check: PortCheckConfig,
    pub seed: SeedConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub exit_timeout_ms: u64,
    pub success_exit_timeout_ms: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            exit_timeout_ms: DEFAULT_EXIT_TIMEOUT.as_millis() as u64,
            success_exit_timeout_ms: DEFAULT_SUCCESS_EXIT_TIMEOUT.as_millis() as u64,
        }
    }
}

impl ProcessConfig {
    pub fn exit_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_timeout_ms)
    }

    pub fn success_exit_timeout(&self) -> Duration {
        Duration::from_millis(self.success_exit_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortCheckConfig {
    pub ready_timeout_ms: u64,
    pub join_timeout_ms: u64,
    /// Report ports above `test_mode_port_threshold` open without checking.
    pub test_mode: bool,
    pub test_mode_port_threshold: u16,
}

impl Default for PortCheckConfig {
    fn default() -> Self {
        Self {
            ready_timeout_ms: DEFAULT_READY_TIMEOUT.as_millis() as u64,
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT.as_millis() as u64,
            test_mode: false,
            test_mode_port_threshold: DEFAULT_TEST_MODE_PORT_THRESHOLD,
        }
    }
}

impl PortCheckConfig {
    pub fn checker_options(&self) -> CheckerOptions {
        CheckerOptions {
            ready_timeout: Duration::from_millis(self.ready_timeout_ms),
            join_timeout: Duration::from_millis(self.join_timeout_ms),
            test_mode: self.test_mode,
            test_mode_port_threshold: self.test_mode_port_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedConfig {
    pub nodes: Vec<String>,
    pub request_timeout_ms: u64,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            nodes: DEFAULT_SEED_NODES.iter().map(|s| s.to_string()).collect(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
        }
    }
}

impl SeedConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl InstallerConfig {
    /// `<config dir>/iop-installer/installer.toml`
    pub fn default_path() -> Result<PathBuf, InstallerError> {
        let config_dir = dirs::config_dir().ok_or_else(|| {
            InstallerError::Config("Could not determine config directory".to_string())
        })?;
        Ok(config_dir.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Directory for the installation plan.
    pub fn data_dir(&self) -> Result<PathBuf, InstallerError> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .map(|dir| dir.join(APP_DIR))
            .ok_or_else(|| InstallerError::Config("Could not determine data directory".to_string()))
    }

    /// Root of the servers' data directories.
    pub fn components_dir(&self) -> Result<PathBuf, InstallerError> {
        if let Some(dir) = &self.components_dir {
            return Ok(dir.clone());
        }
        dirs::home_dir()
            .ok_or_else(|| InstallerError::Config("Could not determine home directory".to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, InstallerError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load `path`, writing the default configuration there first if missing.
    pub fn load_or_create(path: &Path) -> Result<Self, InstallerError> {
        if !path.exists() {
            info!(
                "Config not found at {}, creating default configuration",
                path.display()
            );

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }

            let default_toml = toml::to_string_pretty(&Self::default())?;
            fs::write(path, default_toml)?;

            info!("Created default configuration at {}", path.display());
        }

        let config = Self::load(path)?;
        info!("Using config from: {}", path.display());
        Ok(config)
    }
}
