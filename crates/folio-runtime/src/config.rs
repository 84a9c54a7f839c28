//! Runtime configuration
//!
//! Loaded from an optional TOML file layered with `FOLIO_RUNTIME_*`
//! environment variables. Every field has a default so an empty file (or no
//! file) yields a working configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::{error::RuntimeError, Result};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "FOLIO_RUNTIME";

/// Application directory name under the platform data/config dirs
const APP_DIR: &str = "folio-mapper";

/// Configuration for the model runtime manager
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory holding downloaded model files
    pub models_dir: PathBuf,

    /// Directory holding persisted runtime state
    pub data_dir: PathBuf,

    /// Path or name of the llamafile executable
    pub llamafile_path: PathBuf,

    /// Interface the inference server binds to
    pub host: String,

    /// Fixed port for the inference server (None = pick a free port)
    pub port: Option<u16>,

    /// Context window passed to the inference server
    pub context_size: Option<u32>,

    /// GPU layers to offload (None = let llamafile decide)
    pub gpu_layers: Option<u32>,

    /// Extra arguments appended to the server command line
    pub extra_args: Vec<String>,

    /// How long to wait for a started server to report healthy
    pub startup_timeout_secs: u64,

    /// Timeout for a single health probe
    pub health_timeout_ms: u64,

    /// Connect timeout for model downloads
    pub download_connect_timeout_secs: u64,

    /// Abort a download when no bytes arrive for this long
    pub download_idle_timeout_secs: u64,

    /// Restore the last active model on startup
    pub restore_active_model: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            models_dir: data_dir.join("models"),
            data_dir,
            llamafile_path: PathBuf::from("llamafile"),
            host: "127.0.0.1".to_string(),
            port: None,
            context_size: Some(4096),
            gpu_layers: None,
            extra_args: Vec::new(),
            startup_timeout_secs: 120,
            health_timeout_ms: 2000,
            download_connect_timeout_secs: 30,
            download_idle_timeout_secs: 60,
            restore_active_model: true,
        }
    }
}

impl RuntimeConfig {
    /// Configuration rooted at a single directory, used by tests and portable installs
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            models_dir: root.join("models"),
            data_dir: root.to_path_buf(),
            ..Self::default()
        }
    }

    /// Load from the default config file location plus environment
    pub fn load() -> Result<Self> {
        Self::load_from(&default_config_path())
    }

    /// Load from a specific file (missing file is allowed) plus environment
    pub fn load_from(path: &Path) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from(path.to_path_buf()).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(" ")
                    .with_list_parse_key("extra_args"),
            )
            .build()?;

        let config: RuntimeConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that would otherwise fail late
    pub fn validate(&self) -> Result<()> {
        if self.llamafile_path.as_os_str().is_empty() {
            return Err(RuntimeError::Config(
                "llamafile_path cannot be empty".to_string(),
            ));
        }
        if self.host.trim().is_empty() {
            return Err(RuntimeError::Config("host cannot be empty".to_string()));
        }
        if self.port == Some(0) {
            return Err(RuntimeError::Config(
                "port must be greater than 0 (omit it to pick a free port)".to_string(),
            ));
        }
        if self.startup_timeout_secs == 0 {
            return Err(RuntimeError::Config(
                "startup_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.download_connect_timeout_secs == 0 {
            return Err(RuntimeError::Config(
                "download_connect_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.download_idle_timeout_secs == 0 {
            return Err(RuntimeError::Config(
                "download_idle_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.health_timeout_ms == 0 {
            return Err(RuntimeError::Config(
                "health_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn download_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.download_connect_timeout_secs)
    }

    pub fn download_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.download_idle_timeout_secs)
    }

    /// File recording the last active model
    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join("runtime-state.json")
    }
}

/// Default data directory (`<data dir>/folio-mapper`)
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Default config file (`<config dir>/folio-mapper/runtime.toml`)
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("runtime.toml")
}
