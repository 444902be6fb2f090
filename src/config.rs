// SPDX-License-Identifier: GPL-3.0-only

use crate::backends::camera::DeviceParams;
use crate::constants::{app, pool, timing};
use crate::errors::ConfigError;
use crate::pipeline::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Persisted application settings
///
/// Missing fields take their default, so older files keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Last used device (position, plus id for external devices)
    pub device: DeviceParams,
    /// Preview buffers in flight
    pub preview_buffers: usize,
    /// Deliver unfiltered frames while rendering is disabled
    pub raw_passthrough: bool,
    /// Mirror front camera previews (selfie mode)
    pub mirroring: bool,
    /// Start with the GPU filter path enabled
    pub rendering_enabled: bool,
    /// Teardown deadline for stopping the pipeline, in milliseconds
    pub teardown_timeout_ms: u64,
    /// Accept a software GPU adapter when no hardware one is available
    pub allow_software_gpu: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceParams::default(),
            preview_buffers: pool::DEFAULT_PREVIEW_BUFFERS,
            raw_passthrough: true,
            mirroring: true,
            rendering_enabled: true,
            teardown_timeout_ms: timing::STOP_TIMEOUT.as_millis() as u64,
            allow_software_gpu: true,
        }
    }
}

impl Config {
    /// Location of the config file under the user's config dir
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(dir.join(app::CONFIG_DIR_NAME).join(app::CONFIG_FILE_NAME))
    }

    /// Load from the default location; a missing file gives the defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::default_path()?)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let config = serde_json::from_str(&contents)?;
                debug!(path = %path.display(), "Loaded config");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(Self::default_path()?)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!(path = %path.display(), "Saved config");
        Ok(())
    }

    /// Pipeline settings derived from this config
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            pool_size: self.preview_buffers.max(1),
            raw_passthrough: self.raw_passthrough,
            rendering_enabled: self.rendering_enabled,
            teardown_timeout: Duration::from_millis(self.teardown_timeout_ms),
            ..PipelineConfig::default()
        }
    }
}
