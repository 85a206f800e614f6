//! Configuration loading using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/edt_pdv.toml` by default)
//! 2. environment variables prefixed with `EDT_PDV_`, nested with `__`
//!    (e.g. `EDT_PDV_LOGGING__LEVEL=debug`, `EDT_PDV_POOL__MAX_BUFFERS=64`)
//!
//! # Example
//! ```no_run
//! use edt_pdv::config::AppConfig;
//!
//! let config = AppConfig::load_from("config/edt_pdv.toml")?;
//! for camera in &config.cameras {
//!     println!("{} on unit {} channel {}", camera.name, camera.unit, camera.channel);
//! }
//! # Ok::<(), figment::Error>(())
//! ```

use crate::acquisition::{ImageMode, SyncPolicy};
use crate::error::{PdvError, Result};
use crate::geometry::{Binning, Region, TriggerMode};
use crate::pipeline::LineLayout;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Shared buffer pool limits.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Cameras to create.
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// pretty, compact or json
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Shared buffer pool limits. 0 means unlimited.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of buffers alive at once.
    #[serde(default)]
    pub max_buffers: usize,
    /// Maximum bytes allocated at once.
    #[serde(default)]
    pub max_memory: usize,
}

/// One camera on one frame-grabber channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Unique camera name.
    pub name: String,
    /// Frame-grabber board index.
    #[serde(default)]
    pub unit: u32,
    /// Channel on the board.
    #[serde(default)]
    pub channel: u32,
    /// Camera model; the vendor config file is `<model><f|t|p>.cfg`.
    pub model: String,
    /// Directory holding the vendor config files.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
    /// DMA ring depth.
    #[serde(default = "default_num_buffers")]
    pub num_buffers: u32,
    /// Bound on every wait for work and wait for a frame.
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// Debounce before each reconfigure attempt.
    #[serde(default = "default_reconfigure_delay", with = "humantime_serde")]
    pub reconfigure_delay: Duration,
    /// Settle time between aborting stale transfers and starting a run.
    #[serde(default = "default_camera_start_delay", with = "humantime_serde")]
    pub camera_start_delay: Duration,
    #[serde(default)]
    pub trigger_mode: TriggerMode,
    #[serde(default)]
    pub image_mode: ImageMode,
    /// Frames per run in `multiple` mode.
    #[serde(default = "default_num_images")]
    pub num_images: u32,
    #[serde(default)]
    pub sync_policy: SyncPolicy,
    /// Timing event the frames are correlated with.
    #[serde(default)]
    pub timestamp_event: u32,
    #[serde(default)]
    pub line_layout: LineLayout,
    /// Program the region's row offset on the grabber instead of the camera.
    #[serde(default)]
    pub vertical_skip: bool,
    /// Initial region; full frame when absent.
    #[serde(default)]
    pub region: Option<Region>,
    #[serde(default)]
    pub binning: Binning,
    /// Initial gain.
    #[serde(default)]
    pub gain: Option<f64>,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("db")
}

fn default_num_buffers() -> u32 {
    4
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_reconfigure_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_camera_start_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_num_images() -> u32 {
    1
}

impl CameraConfig {
    /// Config with defaults for everything but name and model.
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: 0,
            channel: 0,
            model: model.into(),
            config_dir: default_config_dir(),
            num_buffers: default_num_buffers(),
            acquire_timeout: default_acquire_timeout(),
            reconfigure_delay: default_reconfigure_delay(),
            camera_start_delay: default_camera_start_delay(),
            trigger_mode: TriggerMode::default(),
            image_mode: ImageMode::default(),
            num_images: default_num_images(),
            sync_policy: SyncPolicy::default(),
            timestamp_event: 0,
            line_layout: LineLayout::default(),
            vertical_skip: false,
            region: None,
            binning: Binning::default(),
            gain: None,
        }
    }

    /// Vendor config file for `trigger`.
    #[must_use]
    pub fn config_file(&self, trigger: TriggerMode) -> PathBuf {
        self.config_dir
            .join(format!("{}{}.cfg", self.model, trigger.config_suffix()))
    }

    /// Check one camera entry.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Camera name must not be empty".to_string());
        }
        if self.model.trim().is_empty() {
            return Err(format!("Camera '{}' has no model", self.name));
        }
        if self.num_buffers == 0 {
            return Err(format!("Camera '{}': num_buffers must be > 0", self.name));
        }
        if self.acquire_timeout.is_zero() {
            return Err(format!("Camera '{}': acquire_timeout must be > 0", self.name));
        }
        if self.image_mode == ImageMode::Multiple && self.num_images == 0 {
            return Err(format!(
                "Camera '{}': num_images must be > 0 in multiple mode",
                self.name
            ));
        }
        if self.binning.x == 0 || self.binning.y == 0 {
            return Err(format!("Camera '{}': binning must be > 0", self.name));
        }
        Ok(())
    }
}

impl AppConfig {
    /// Load configuration from a specific file path
    ///
    /// Environment variables override file values, e.g.
    /// `EDT_PDV_LOGGING__LEVEL=debug`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> std::result::Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("EDT_PDV_").split("__"))
            .extract()
    }

    /// Load and validate in one step.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Self::load_from(path)?;
        config.validate().map_err(PdvError::Configuration)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> std::result::Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            ));
        }

        let mut names = HashSet::new();
        let mut channels = HashSet::new();
        for camera in &self.cameras {
            camera.validate()?;
            if !names.insert(camera.name.as_str()) {
                return Err(format!("Duplicate camera name: {}", camera.name));
            }
            if !channels.insert((camera.unit, camera.channel)) {
                return Err(format!(
                    "Camera '{}': unit {} channel {} already in use",
                    camera.name, camera.unit, camera.channel
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config_with(cameras: Vec<CameraConfig>) -> AppConfig {
        AppConfig {
            logging: LoggingConfig::default(),
            pool: PoolConfig::default(),
            cameras,
        }
    }

    #[test]
    fn test_camera_defaults() {
        let cam = CameraConfig::new("CAM1", "opal1000");
        assert_eq!(cam.acquire_timeout, Duration::from_secs(1));
        assert_eq!(cam.reconfigure_delay, Duration::from_secs(2));
        assert_eq!(cam.camera_start_delay, Duration::from_millis(100));
        assert_eq!(cam.sync_policy, SyncPolicy::Accept);
        assert!(cam.validate().is_ok());
    }

    #[test]
    fn test_config_file_naming() {
        let cam = CameraConfig::new("CAM1", "opal1000");
        assert_eq!(
            cam.config_file(TriggerMode::FreeRun),
            PathBuf::from("db/opal1000f.cfg")
        );
        assert_eq!(
            cam.config_file(TriggerMode::ExternalTrigger),
            PathBuf::from("db/opal1000t.cfg")
        );
        assert_eq!(
            cam.config_file(TriggerMode::Pulse),
            PathBuf::from("db/opal1000p.cfg")
        );
    }

    #[test]
    fn test_duplicate_camera_names() {
        let mut b = CameraConfig::new("CAM1", "opal1000");
        b.channel = 1;
        let config = config_with(vec![CameraConfig::new("CAM1", "opal1000"), b]);
        assert!(config.validate().unwrap_err().contains("Duplicate"));
    }

    #[test]
    fn test_duplicate_unit_channel() {
        let config = config_with(vec![
            CameraConfig::new("CAM1", "opal1000"),
            CameraConfig::new("CAM2", "opal1000"),
        ]);
        assert!(config.validate().unwrap_err().contains("already in use"));
    }

    #[test]
    fn test_invalid_entries() {
        assert!(CameraConfig::new("", "opal1000").validate().is_err());
        assert!(CameraConfig::new("CAM1", " ").validate().is_err());

        let mut cam = CameraConfig::new("CAM1", "opal1000");
        cam.num_buffers = 0;
        assert!(cam.validate().is_err());

        let mut config = config_with(vec![]);
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[logging]
level = "debug"

[pool]
max_buffers = 32

[[cameras]]
name = "YAG1"
unit = 1
model = "opal1000"
acquire_timeout = "250ms"
reconfigure_delay = "5s"
trigger_mode = "external_trigger"
image_mode = "multiple"
num_images = 10
sync_policy = "skip"
line_layout = "mid_top_interleaved"

[cameras.region]
min_x = 0
min_y = 0
size_x = 512
size_y = 512
"#
        )
        .unwrap();

        let config = AppConfig::load_validated(file.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.pool.max_buffers, 32);
        let cam = &config.cameras[0];
        assert_eq!(cam.unit, 1);
        assert_eq!(cam.acquire_timeout, Duration::from_millis(250));
        assert_eq!(cam.reconfigure_delay, Duration::from_secs(5));
        assert_eq!(cam.trigger_mode, TriggerMode::ExternalTrigger);
        assert_eq!(cam.image_mode, ImageMode::Multiple);
        assert_eq!(cam.sync_policy, SyncPolicy::Skip);
        assert_eq!(cam.line_layout, LineLayout::MidTopInterleaved);
        assert_eq!(cam.region.map(|r| r.size_x), Some(512));
        assert_eq!(cam.num_buffers, 4);
    }
}
