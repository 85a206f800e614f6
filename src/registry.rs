//! Process-wide set of cameras.
//!
//! Names and unit/channel pairs are unique. Registration checks both and
//! inserts under one lock, so two concurrent registrations of the same
//! channel cannot both succeed.

use crate::camera::EdtCamera;
use crate::config::CameraConfig;
use crate::device::PdvDriver;
use crate::error::{PdvError, Result};
use crate::pool::BufferPool;
use crate::sink::FrameSink;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{error, info};

/// Registered cameras by name.
#[derive(Debug, Default)]
pub struct CameraRegistry {
    cameras: Mutex<BTreeMap<String, Arc<EdtCamera>>>,
}

impl CameraRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an already built camera.
    pub fn register(&self, camera: Arc<EdtCamera>) -> Result<()> {
        let name = camera.name().to_string();
        if name.trim().is_empty() {
            return Err(PdvError::Registry("camera name must not be empty".to_string()));
        }
        if camera.config().model.trim().is_empty() {
            return Err(PdvError::Registry(format!("camera '{name}' has no model")));
        }

        let mut cameras = self.cameras.lock();
        if cameras.contains_key(&name) {
            return Err(PdvError::Registry(format!("camera '{name}' already exists")));
        }
        if let Some(other) = cameras
            .values()
            .find(|c| c.unit() == camera.unit() && c.channel() == camera.channel())
        {
            return Err(PdvError::Registry(format!(
                "unit {} channel {} already used by '{}'",
                camera.unit(),
                camera.channel(),
                other.name()
            )));
        }
        cameras.insert(name, camera);
        Ok(())
    }

    /// Build, register and connect a camera.
    ///
    /// A failed first connect is logged and the camera is still returned;
    /// its worker keeps retrying.
    pub fn create(
        &self,
        config: CameraConfig,
        driver: Arc<dyn PdvDriver>,
        pool: BufferPool,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Arc<EdtCamera>> {
        let camera = Arc::new(
            EdtCamera::builder(config, driver)
                .pool(pool)
                .shared_sink(sink)
                .build()?,
        );
        self.register(Arc::clone(&camera))?;

        if let Err(e) = camera.connect() {
            error!(camera = %camera.name(), error = %e, "Camera created but not connected");
        }
        info!(
            camera = %camera.name(),
            unit = camera.unit(),
            channel = camera.channel(),
            "Camera registered"
        );
        Ok(camera)
    }

    /// Camera called `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<EdtCamera>> {
        self.cameras.lock().get(name).cloned()
    }

    /// Remove and disconnect the camera called `name`.
    pub fn remove(&self, name: &str) -> Option<Arc<EdtCamera>> {
        let camera = self.cameras.lock().remove(name)?;
        camera.disconnect();
        Some(camera)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.cameras.lock().keys().cloned().collect()
    }

    /// Number of cameras.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cameras.lock().len()
    }

    /// True when no camera is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cameras.lock().is_empty()
    }

    /// One line per camera; level 1 adds identity and resolution, level 2
    /// and above append each camera's full report.
    #[must_use]
    pub fn show_all(&self, level: u32) -> String {
        let cameras: Vec<Arc<EdtCamera>> = self.cameras.lock().values().cloned().collect();
        let mut out = String::new();
        for camera in cameras {
            let _ = writeln!(
                out,
                "{}: unit {} channel {} [{}]",
                camera.name(),
                camera.unit(),
                camera.channel(),
                camera.status()
            );
            if level >= 1 {
                let info = camera.device_info();
                let geometry = camera.geometry();
                let config_file = camera
                    .config()
                    .config_file(camera.trigger_mode())
                    .display()
                    .to_string();
                let _ = writeln!(
                    out,
                    "    {} {} ({}), {} x {} x {} bits",
                    info.camera_class,
                    info.camera_model,
                    config_file,
                    geometry.width,
                    geometry.height,
                    geometry.bit_depth
                );
            }
            if level >= 2 {
                out.push_str(&camera.report(level - 1));
            }
        }
        out
    }

    /// Disconnect every camera and empty the registry.
    pub fn shutdown_all(&self) {
        let cameras: Vec<Arc<EdtCamera>> = {
            let mut map = self.cameras.lock();
            std::mem::take(&mut *map).into_values().collect()
        };
        for camera in &cameras {
            camera.disconnect();
        }
        info!(count = cameras.len(), "All cameras shut down");
    }
}
