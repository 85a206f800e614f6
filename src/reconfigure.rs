//! Device (re)initialization against a reconfigure-pending flag.
//!
//! The manager owns the open channel. Its mutex is the reconfigure lock:
//! reconfiguration and every use of the channel by the acquire worker happen
//! while holding it, so a fresh handle is never swapped in under a transfer.
//!
//! Control-plane setters never take that lock. They edit the requested
//! geometry under a separate `RwLock` and raise the pending flag; the worker
//! picks the change up at its next checkpoint.

use crate::config::CameraConfig;
use crate::device::{DeviceInfo, PdvChannel, PdvDriver, TransferTimeout, VendorConfig};
use crate::error::Result;
use crate::geometry::{Geometry, TriggerMode};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Configuration the current handle was built from.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceConfig {
    pub unit: u32,
    pub channel: u32,
    pub model: String,
    pub trigger_mode: TriggerMode,
    /// Vendor file loaded for `model` and `trigger_mode`.
    pub config_file: PathBuf,
}

/// Outcome of [`ReconfigurationManager::reconfigure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconfigured {
    /// Nothing was pending; no device I/O happened.
    Unchanged,
    /// A new handle is installed.
    Rebuilt,
}

/// Exclusive access to the open channel.
pub type DeviceGuard<'a> = MutexGuard<'a, Option<Box<dyn PdvChannel>>>;

/// Owns the channel and the reconfigure-pending flag.
pub struct ReconfigurationManager {
    config: CameraConfig,
    driver: Arc<dyn PdvDriver>,
    pending: AtomicBool,
    connected: AtomicBool,
    device: Mutex<Option<Box<dyn PdvChannel>>>,
    geometry: RwLock<Geometry>,
    trigger_mode: RwLock<TriggerMode>,
    device_config: RwLock<Option<DeviceConfig>>,
    info: RwLock<DeviceInfo>,
}

impl ReconfigurationManager {
    /// Manager for `config`. Nothing is opened until the first reconfigure.
    pub fn new(config: CameraConfig, driver: Arc<dyn PdvDriver>) -> Self {
        let geometry = Geometry::requested(config.region, config.binning);
        let trigger_mode = config.trigger_mode;
        Self {
            config,
            driver,
            pending: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            device: Mutex::new(None),
            geometry: RwLock::new(geometry),
            trigger_mode: RwLock::new(trigger_mode),
            device_config: RwLock::new(None),
            info: RwLock::new(DeviceInfo::default()),
        }
    }

    /// Ask for a reconfigure. Never blocks.
    pub fn request_reconfigure(&self) {
        self.pending.store(true, Ordering::SeqCst);
    }

    /// Whether a reconfigure is pending.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Whether a handle is installed.
    #[must_use]
    pub fn has_device(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Rebuild the device if a reconfigure is pending.
    ///
    /// The flag is cleared before any work, so a request that arrives while
    /// this runs triggers another pass. On failure the flag is raised again
    /// and no handle is installed.
    pub fn reconfigure(&self) -> Result<Reconfigured> {
        let mut device = self.device.lock();
        if !self.pending.swap(false, Ordering::SeqCst) {
            return Ok(Reconfigured::Unchanged);
        }

        if let Err(e) = self.rebuild(&mut device) {
            self.pending.store(true, Ordering::SeqCst);
            warn!(camera = %self.config.name, error = %e, "Reconfigure failed");
            return Err(e);
        }

        if self.is_pending() {
            warn!(camera = %self.config.name, "Reconfigure requested again while reconfiguring");
        }
        Ok(Reconfigured::Rebuilt)
    }

    fn rebuild(&self, device: &mut Option<Box<dyn PdvChannel>>) -> Result<()> {
        if let Some(mut old) = device.take() {
            self.connected.store(false, Ordering::SeqCst);
            debug!(camera = %self.config.name, "Closing previous handle");
            old.abort_and_restart_timeout();
            old.close();
        }

        let trigger_mode = *self.trigger_mode.read();
        let config_file = self.config.config_file(trigger_mode);
        let (unit, channel) = (self.config.unit, self.config.channel);

        let mut handle = self.driver.open_channel(unit, channel)?;
        let vendor = match self.initialize(handle.as_mut(), &config_file) {
            Ok(vendor) => vendor,
            Err(e) => {
                handle.close();
                return Err(e);
            }
        };

        let info = handle.info();
        let region_reset =
            self.geometry
                .write()
                .apply_readback(info.width, info.height, info.depth);
        if region_reset {
            info!(
                camera = %self.config.name,
                width = info.width,
                height = info.height,
                "Requested region does not fit the sensor, using full frame"
            );
        }

        info!(
            camera = %self.config.name,
            unit,
            channel,
            class = %vendor.camera_class,
            model = %info.camera_model,
            config_file = %config_file.display(),
            width = info.width,
            height = info.height,
            depth = info.depth,
            "Device configured"
        );

        *self.info.write() = info;
        *self.device_config.write() = Some(DeviceConfig {
            unit,
            channel,
            model: self.config.model.clone(),
            trigger_mode,
            config_file,
        });
        *device = Some(handle);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn initialize(&self, handle: &mut dyn PdvChannel, config_file: &std::path::Path) -> Result<VendorConfig> {
        let vendor = self.driver.load_config(config_file)?;
        handle.init_device(&vendor)?;
        handle.allocate_ring(self.config.num_buffers)?;
        handle.set_timeout(TransferTimeout::DeviceDefault);
        Ok(vendor)
    }

    /// Take the device lock. Blocks while a run or a reconfigure holds it.
    pub fn lock_device(&self) -> DeviceGuard<'_> {
        self.device.lock()
    }

    /// Take the device lock if nobody holds it.
    pub fn try_lock_device(&self) -> Option<DeviceGuard<'_>> {
        self.device.try_lock()
    }

    /// Record that the handle vanished while connected.
    pub fn connection_lost(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.request_reconfigure();
    }

    /// Abort transfers, close and drop the handle.
    pub fn close_device(&self) {
        let mut device = self.device.lock();
        if let Some(mut handle) = device.take() {
            handle.abort_and_restart_timeout();
            handle.close();
            info!(camera = %self.config.name, "Device closed");
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Current geometry.
    #[must_use]
    pub fn geometry(&self) -> Geometry {
        *self.geometry.read()
    }

    /// Apply a geometry setter; request a reconfigure if it changed anything.
    pub fn update_geometry(&self, set: impl FnOnce(&mut Geometry) -> Result<bool>) -> Result<bool> {
        let changed = set(&mut self.geometry.write())?;
        if changed {
            self.request_reconfigure();
        }
        Ok(changed)
    }

    /// Current trigger mode.
    #[must_use]
    pub fn trigger_mode(&self) -> TriggerMode {
        *self.trigger_mode.read()
    }

    /// Change the trigger mode; request a reconfigure if it changed.
    pub fn set_trigger_mode(&self, mode: TriggerMode) -> bool {
        let mut current = self.trigger_mode.write();
        if *current == mode {
            return false;
        }
        *current = mode;
        self.request_reconfigure();
        true
    }

    /// Identity read back at the last reconfigure.
    #[must_use]
    pub fn device_info(&self) -> DeviceInfo {
        self.info.read().clone()
    }

    /// Configuration of the installed handle.
    #[must_use]
    pub fn device_config(&self) -> Option<DeviceConfig> {
        self.device_config.read().clone()
    }

    /// Camera configuration this manager was built with.
    #[must_use]
    pub fn camera_config(&self) -> &CameraConfig {
        &self.config
    }
}

impl std::fmt::Debug for ReconfigurationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconfigurationManager")
            .field("camera", &self.config.name)
            .field("pending", &self.is_pending())
            .field("connected", &self.has_device())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::VendorConfig;
    use crate::error::PdvError;
    use crate::sim::{DeviceCall, SimDriver, SimSensor};
    use tracing_test::traced_test;

    fn manager(driver: &SimDriver) -> ReconfigurationManager {
        ReconfigurationManager::new(
            CameraConfig::new("CAM1", "opal1000"),
            Arc::new(driver.clone()),
        )
    }

    #[test]
    fn reconfigure_without_request_does_no_io() {
        let driver = SimDriver::new(SimSensor::default());
        let mgr = manager(&driver);
        assert_eq!(mgr.reconfigure().unwrap(), Reconfigured::Unchanged);
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn reconfigure_is_idempotent() {
        let driver = SimDriver::new(SimSensor::default());
        let mgr = manager(&driver);
        mgr.request_reconfigure();
        assert_eq!(mgr.reconfigure().unwrap(), Reconfigured::Rebuilt);
        let calls = driver.calls().len();
        assert_eq!(mgr.reconfigure().unwrap(), Reconfigured::Unchanged);
        assert_eq!(driver.calls().len(), calls);
        assert!(mgr.has_device());
    }

    #[test]
    fn reconfigure_sequence_and_readback() {
        let driver = SimDriver::new(SimSensor::default());
        driver.register_config(
            "db/opal1000f.cfg",
            VendorConfig {
                camera_class: "Adimec".into(),
                camera_model: "Opal 1000".into(),
                width: 1024,
                height: 1000,
                depth: 12,
                ..VendorConfig::default()
            },
        );
        let mgr = manager(&driver);
        mgr.request_reconfigure();
        mgr.reconfigure().unwrap();

        assert_eq!(
            driver.calls(),
            vec![
                DeviceCall::Open { unit: 0, channel: 0 },
                DeviceCall::LoadConfig(PathBuf::from("db/opal1000f.cfg")),
                DeviceCall::InitDevice,
                DeviceCall::AllocateRing(4),
                DeviceCall::SetTimeout(TransferTimeout::DeviceDefault),
            ]
        );
        let g = mgr.geometry();
        assert_eq!((g.width, g.height, g.bit_depth), (1024, 1000, 12));
        assert_eq!(mgr.device_info().camera_model, "Opal 1000");
        assert_eq!(
            mgr.device_config().map(|c| c.config_file),
            Some(PathBuf::from("db/opal1000f.cfg"))
        );
    }

    #[test]
    fn trigger_mode_selects_config_file() {
        let driver = SimDriver::new(SimSensor::default());
        let mgr = manager(&driver);
        assert!(mgr.set_trigger_mode(TriggerMode::Pulse));
        assert!(!mgr.set_trigger_mode(TriggerMode::Pulse));
        mgr.reconfigure().unwrap();
        assert!(driver
            .calls()
            .contains(&DeviceCall::LoadConfig(PathBuf::from("db/opal1000p.cfg"))));
    }

    #[test]
    fn failed_init_closes_handle_and_rearms_flag() {
        let driver = SimDriver::new(SimSensor::default());
        driver.inject(|f| f.fail_inits = 1);
        let mgr = manager(&driver);
        mgr.request_reconfigure();

        assert!(matches!(mgr.reconfigure(), Err(PdvError::DeviceInit(_))));
        assert!(mgr.is_pending());
        assert!(!mgr.has_device());
        assert_eq!(driver.calls().last(), Some(&DeviceCall::Close));

        assert_eq!(mgr.reconfigure().unwrap(), Reconfigured::Rebuilt);
        assert!(!mgr.is_pending());
    }

    #[test]
    #[traced_test]
    fn failed_open_rearms_flag() {
        let driver = SimDriver::new(SimSensor::default());
        driver.inject(|f| f.fail_opens = 1);
        let mgr = manager(&driver);
        mgr.request_reconfigure();
        assert!(matches!(mgr.reconfigure(), Err(PdvError::DeviceOpen { .. })));
        assert!(mgr.is_pending());
        assert!(logs_contain("Reconfigure failed"));
    }

    #[test]
    fn rebuild_closes_previous_handle() {
        let driver = SimDriver::new(SimSensor::default());
        let mgr = manager(&driver);
        mgr.request_reconfigure();
        mgr.reconfigure().unwrap();
        driver.clear_calls();

        mgr.request_reconfigure();
        mgr.reconfigure().unwrap();
        let calls = driver.calls();
        assert_eq!(calls[0], DeviceCall::AbortAndRestartTimeout);
        assert_eq!(calls[1], DeviceCall::Close);
        assert_eq!(calls[2], DeviceCall::Open { unit: 0, channel: 0 });
    }

    #[test]
    fn geometry_change_requests_reconfigure_once() {
        let driver = SimDriver::new(SimSensor::default());
        let mgr = manager(&driver);
        mgr.request_reconfigure();
        mgr.reconfigure().unwrap();

        assert!(mgr.update_geometry(|g| g.set_size_x(320)).unwrap());
        assert!(mgr.is_pending());
        mgr.reconfigure().unwrap();

        assert!(!mgr.update_geometry(|g| g.set_size_x(320)).unwrap());
        assert!(!mgr.is_pending());

        assert!(mgr.update_geometry(|g| g.set_size_x(0)).is_err());
        assert!(!mgr.is_pending());
        assert_eq!(mgr.geometry().region.size_x, 320);
    }
}
