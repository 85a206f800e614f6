//! The host-facing camera object.
//!
//! [`EdtCamera`] ties one frame-grabber channel to one acquire worker thread.
//! The control plane (setters, [`EdtCamera::set_acquiring`], reports) only
//! touches atomics, short mutexes and the reconfigure flag; the device itself
//! is driven by the worker.
//!
//! # Example
//! ```no_run
//! use edt_pdv::camera::EdtCamera;
//! use edt_pdv::config::CameraConfig;
//! use edt_pdv::sim::{SimDriver, SimSensor};
//! use std::sync::Arc;
//!
//! # fn main() -> edt_pdv::Result<()> {
//! let driver = SimDriver::new(SimSensor::default());
//! let camera = EdtCamera::builder(CameraConfig::new("CAM1", "opal1000"), Arc::new(driver))
//!     .sink(|frame: Arc<edt_pdv::OutputFrame>| println!("frame {}", frame.id))
//!     .build()?;
//! camera.connect()?;
//! camera.set_acquiring(true);
//! # Ok(())
//! # }
//! ```

use crate::acquisition::{AcquisitionController, AcquisitionRequest, ImageMode};
use crate::commands::{CommandTable, ParamKey, ParamValue};
use crate::config::CameraConfig;
use crate::device::{DeviceInfo, PdvDriver};
use crate::error::{PdvError, Result};
use crate::geometry::{Geometry, TriggerMode};
use crate::pipeline::FramePipeline;
use crate::pool::BufferPool;
use crate::reconfigure::{ReconfigurationManager, Reconfigured};
use crate::sink::{DiscardSink, FrameSink};
use crate::status::{
    AcquisitionStats, CameraStatus, LoopTimers, StatsSnapshot, TimerStats, TimingSnapshot,
    WorkerState,
};
use crate::timestamp::{SystemClock, TimeSource};
use crate::worker::{AcquireWorker, StopSignal};
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// State shared between the control plane and the acquire worker.
pub(crate) struct CameraCore {
    pub(crate) name: String,
    pub(crate) config: CameraConfig,
    pub(crate) reconfig: ReconfigurationManager,
    pub(crate) control: AcquisitionController,
    pub(crate) pipeline: FramePipeline,
    pub(crate) sink: Arc<dyn FrameSink>,
    pub(crate) time_source: Arc<dyn TimeSource>,
    pub(crate) stats: AcquisitionStats,
    pub(crate) timers: LoopTimers,
    pub(crate) stop: StopSignal,
    status_tx: watch::Sender<CameraStatus>,
    state_tx: watch::Sender<WorkerState>,
    /// Gain requested by the host, re-armed after every rebuild.
    gain: Mutex<Option<f64>>,
    /// Gain to program at the next run start.
    pending_gain: Mutex<Option<i32>>,
    timestamp_event: AtomicU32,
    acquire_time: Mutex<Option<f64>>,
}

impl CameraCore {
    pub(crate) fn publish_status(&self, status: CameraStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    pub(crate) fn publish_state(&self, state: WorkerState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    /// Rebuild the device if a reconfigure is pending and publish the outcome.
    pub(crate) fn reconfigure(&self) -> Result<Reconfigured> {
        if !self.reconfig.is_pending() {
            return self.reconfig.reconfigure();
        }

        self.publish_status(CameraStatus::Initializing);
        match self.reconfig.reconfigure() {
            Ok(Reconfigured::Rebuilt) => {
                self.stats.reconfigured();
                if let Some(gain) = *self.gain.lock() {
                    match device_gain(gain) {
                        Ok(value) => *self.pending_gain.lock() = Some(value),
                        Err(e) => warn!(camera = %self.name, error = %e, "Ignoring gain"),
                    }
                }
                self.publish_status(CameraStatus::Idle);
                Ok(Reconfigured::Rebuilt)
            }
            Ok(Reconfigured::Unchanged) => {
                let status = if self.reconfig.has_device() {
                    CameraStatus::Idle
                } else {
                    CameraStatus::Error
                };
                self.publish_status(status);
                Ok(Reconfigured::Unchanged)
            }
            Err(e) => {
                self.publish_status(CameraStatus::Error);
                Err(e)
            }
        }
    }

    pub(crate) fn take_pending_gain(&self) -> Option<i32> {
        self.pending_gain.lock().take()
    }

    pub(crate) fn timestamp_event(&self) -> u32 {
        self.timestamp_event.load(Ordering::Relaxed)
    }
}

/// Device gain for a host gain value.
fn device_gain(gain: f64) -> Result<i32> {
    let rounded = gain.round();
    if !rounded.is_finite() || rounded < f64::from(i32::MIN) || rounded > f64::from(i32::MAX) {
        return Err(PdvError::validation("Gain", format!("{gain} is out of range")));
    }
    Ok(rounded as i32)
}

/// Builder for [`EdtCamera`].
pub struct EdtCameraBuilder {
    config: CameraConfig,
    driver: Arc<dyn PdvDriver>,
    pool: Option<BufferPool>,
    sink: Option<Arc<dyn FrameSink>>,
    time_source: Option<Arc<dyn TimeSource>>,
}

impl EdtCameraBuilder {
    /// Share `pool` with other cameras. Defaults to a private unbounded pool.
    #[must_use]
    pub fn pool(mut self, pool: BufferPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Where completed frames go. Defaults to [`DiscardSink`].
    #[must_use]
    pub fn sink(mut self, sink: impl FrameSink + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// Same as [`Self::sink`] for an already shared sink.
    #[must_use]
    pub fn shared_sink(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Timestamp provider. Defaults to [`SystemClock`].
    #[must_use]
    pub fn time_source(mut self, source: Arc<dyn TimeSource>) -> Self {
        self.time_source = Some(source);
        self
    }

    /// Validate the configuration and build the camera. Nothing is opened yet.
    pub fn build(self) -> Result<EdtCamera> {
        self.config.validate().map_err(PdvError::Configuration)?;
        let config = self.config;

        let gain = match config.gain {
            Some(gain) => {
                device_gain(gain)?;
                Some(gain)
            }
            None => None,
        };

        let (status_tx, _) = watch::channel(CameraStatus::Disconnected);
        let (state_tx, _) = watch::channel(WorkerState::Idle);
        let pool = self.pool.unwrap_or_else(BufferPool::unbounded);

        let core = CameraCore {
            name: config.name.clone(),
            reconfig: ReconfigurationManager::new(config.clone(), self.driver),
            control: AcquisitionController::new(config.image_mode, config.num_images),
            pipeline: FramePipeline::new(pool, config.line_layout),
            sink: self.sink.unwrap_or_else(|| Arc::new(DiscardSink)),
            time_source: self.time_source.unwrap_or_else(|| Arc::new(SystemClock)),
            stats: AcquisitionStats::default(),
            timers: LoopTimers::default(),
            stop: StopSignal::default(),
            status_tx,
            state_tx,
            gain: Mutex::new(gain),
            pending_gain: Mutex::new(None),
            timestamp_event: AtomicU32::new(config.timestamp_event),
            acquire_time: Mutex::new(None),
            config,
        };

        Ok(EdtCamera {
            core: Arc::new(core),
            worker: Mutex::new(None),
            commands: CommandTable::standard(),
        })
    }
}

/// One camera on one frame-grabber channel.
pub struct EdtCamera {
    core: Arc<CameraCore>,
    worker: Mutex<Option<JoinHandle<()>>>,
    commands: CommandTable,
}

impl EdtCamera {
    /// Start building a camera for `config` on `driver`.
    pub fn builder(config: CameraConfig, driver: Arc<dyn PdvDriver>) -> EdtCameraBuilder {
        EdtCameraBuilder {
            config,
            driver,
            pool: None,
            sink: None,
            time_source: None,
        }
    }

    /// Open the device and start the acquire worker.
    ///
    /// The first reconfigure runs on the calling thread. If it fails the error
    /// is returned, status is [`CameraStatus::Error`] and the worker keeps
    /// retrying in the background. Calling this on a connected camera is a
    /// no-op.
    pub fn connect(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        self.core.stop.clear();
        self.core.reconfig.request_reconfigure();
        let result = self.core.reconfigure().map(|_| ());
        if let Err(e) = &result {
            error!(camera = %self.core.name, error = %e, "Initial connect failed, retrying in background");
        }

        *worker = Some(AcquireWorker::spawn(Arc::clone(&self.core))?);
        info!(
            camera = %self.core.name,
            unit = self.core.config.unit,
            channel = self.core.config.channel,
            "Camera connected"
        );
        result
    }

    /// Stop acquisition, join the worker and close the device.
    pub fn disconnect(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };

        self.core.control.set_acquiring(false);
        self.core.stop.set();
        self.core.control.nudge();
        if handle.join().is_err() {
            error!(camera = %self.core.name, "Acquire worker panicked during shutdown");
        }

        self.core.reconfig.close_device();
        self.core.publish_status(CameraStatus::Disconnected);
        info!(camera = %self.core.name, "Camera disconnected");
    }

    /// Whether the worker is running.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Start or stop acquisition.
    pub fn set_acquiring(&self, on: bool) {
        let remaining = self.core.control.set_acquiring(on);
        debug!(camera = %self.core.name, on, remaining, "Acquire requested");
        if on {
            return;
        }
        // Flush queued transfers now unless the worker is inside a wait.
        if let Some(mut guard) = self.core.reconfig.try_lock_device() {
            if let Some(device) = guard.as_mut() {
                device.abort_and_restart_timeout();
            }
        }
    }

    /// Whether acquisition is requested.
    #[must_use]
    pub fn is_acquiring(&self) -> bool {
        self.core.control.is_acquiring()
    }

    /// Region width.
    pub fn set_size_x(&self, value: u32) -> Result<bool> {
        self.update_geometry(|g| g.set_size_x(value))
    }

    /// Region height.
    pub fn set_size_y(&self, value: u32) -> Result<bool> {
        self.update_geometry(|g| g.set_size_y(value))
    }

    /// Region column offset.
    pub fn set_min_x(&self, value: u32) -> Result<bool> {
        self.update_geometry(|g| g.set_min_x(value))
    }

    /// Region row offset.
    pub fn set_min_y(&self, value: u32) -> Result<bool> {
        self.update_geometry(|g| g.set_min_y(value))
    }

    /// Horizontal binning.
    pub fn set_bin_x(&self, value: u32) -> Result<bool> {
        self.update_geometry(|g| g.set_bin_x(value))
    }

    /// Vertical binning.
    pub fn set_bin_y(&self, value: u32) -> Result<bool> {
        self.update_geometry(|g| g.set_bin_y(value))
    }

    fn update_geometry(&self, set: impl FnOnce(&mut Geometry) -> Result<bool>) -> Result<bool> {
        let changed = self.core.reconfig.update_geometry(set)?;
        if changed {
            self.core.control.nudge();
        }
        Ok(changed)
    }

    /// Select the trigger mode; the matching vendor file is loaded on the
    /// next reconfigure.
    pub fn set_trigger_mode(&self, mode: TriggerMode) -> bool {
        let changed = self.core.reconfig.set_trigger_mode(mode);
        if changed {
            info!(camera = %self.core.name, %mode, "Trigger mode changed");
            self.core.control.nudge();
        }
        changed
    }

    /// Select the image mode.
    pub fn set_image_mode(&self, mode: ImageMode) -> bool {
        self.core.control.set_image_mode(mode)
    }

    /// Frames per run in [`ImageMode::Multiple`].
    pub fn set_num_images(&self, num_images: u32) -> Result<bool> {
        self.core.control.set_num_images(num_images)
    }

    /// Set the camera gain.
    ///
    /// Applied right away when the device is idle, otherwise at the next
    /// run start.
    pub fn set_gain(&self, gain: f64) -> Result<()> {
        let value = device_gain(gain)?;
        *self.core.gain.lock() = Some(gain);

        if !self.core.control.is_acquiring() {
            if let Some(mut guard) = self.core.reconfig.try_lock_device() {
                if let Some(device) = guard.as_mut() {
                    device.set_gain(value)?;
                    *self.core.pending_gain.lock() = None;
                    debug!(camera = %self.core.name, gain = value, "Gain applied");
                    return Ok(());
                }
            }
        }

        *self.core.pending_gain.lock() = Some(value);
        debug!(camera = %self.core.name, gain = value, "Gain deferred to next start");
        Ok(())
    }

    /// Timing event frames are stamped against.
    pub fn set_timestamp_event(&self, event: u32) {
        self.core.timestamp_event.store(event, Ordering::Relaxed);
    }

    /// Exposure time read back from the camera, in seconds.
    pub fn set_acquire_time(&self, seconds: f64) -> Result<()> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(PdvError::validation(
                "AcquireTime",
                format!("{seconds} is not a valid exposure"),
            ));
        }
        *self.core.acquire_time.lock() = Some(seconds);
        Ok(())
    }

    /// Route a host parameter write through the command table.
    pub fn write_param(&self, key: ParamKey, value: ParamValue) -> Result<()> {
        self.commands.dispatch(self, key, value)
    }

    /// Camera name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Board index.
    #[must_use]
    pub fn unit(&self) -> u32 {
        self.core.config.unit
    }

    /// Channel on the board.
    #[must_use]
    pub fn channel(&self) -> u32 {
        self.core.config.channel
    }

    /// Configuration the camera was built with.
    #[must_use]
    pub fn config(&self) -> &CameraConfig {
        &self.core.config
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> CameraStatus {
        *self.core.status_tx.borrow()
    }

    /// Watch status changes.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<CameraStatus> {
        self.core.status_tx.subscribe()
    }

    /// Current worker state.
    #[must_use]
    pub fn worker_state(&self) -> WorkerState {
        *self.core.state_tx.borrow()
    }

    /// Watch worker state changes.
    #[must_use]
    pub fn subscribe_worker_state(&self) -> watch::Receiver<WorkerState> {
        self.core.state_tx.subscribe()
    }

    /// Requested geometry; sensor fields reflect the last reconfigure.
    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.core.reconfig.geometry()
    }

    /// Current trigger mode.
    #[must_use]
    pub fn trigger_mode(&self) -> TriggerMode {
        self.core.reconfig.trigger_mode()
    }

    /// Image mode, count and remaining frames.
    #[must_use]
    pub fn request(&self) -> AcquisitionRequest {
        self.core.control.request()
    }

    /// Identity read back from the device.
    #[must_use]
    pub fn device_info(&self) -> DeviceInfo {
        self.core.reconfig.device_info()
    }

    /// Whether a reconfigure is pending.
    #[must_use]
    pub fn reconfigure_pending(&self) -> bool {
        self.core.reconfig.is_pending()
    }

    /// Frame and run counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }

    /// Diagnostic loop timers.
    #[must_use]
    pub fn timing(&self) -> TimingSnapshot {
        self.core.timers.snapshot()
    }

    /// Clear the diagnostic loop timers.
    pub fn reset_timing(&self) {
        self.core.timers.reset();
    }

    /// Shared buffer pool.
    #[must_use]
    pub fn pool(&self) -> &BufferPool {
        self.core.pipeline.pool()
    }

    /// Human-readable state dump. Higher verbosity adds counters, timers and
    /// hardware registers.
    #[must_use]
    pub fn report(&self, verbosity: u32) -> String {
        let core = &self.core;
        let info = self.device_info();
        let geometry = self.geometry();
        let request = self.request();
        let config_file = core
            .reconfig
            .device_config()
            .map_or_else(|| "-".to_string(), |c| c.config_file.display().to_string());

        let mut out = String::new();
        let _ = writeln!(out, "EDT camera {}", core.name);
        let _ = writeln!(out, "  Status:          {}", self.status());
        let _ = writeln!(
            out,
            "  Model:           {} ({} {})",
            core.config.model, info.camera_class, info.camera_model
        );
        let _ = writeln!(out, "  Camera info:     {}", info.camera_info);
        let _ = writeln!(out, "  Config file:     {config_file}");
        let _ = writeln!(
            out,
            "  Driver/library:  {} / {}",
            info.driver_version, info.library_version
        );
        let _ = writeln!(
            out,
            "  Unit/channel:    {}/{}",
            core.config.unit, core.config.channel
        );
        let _ = writeln!(out, "  Ring buffers:    {}", core.config.num_buffers);
        let _ = writeln!(
            out,
            "  Sensor:          {} x {}, {} bits",
            geometry.width, geometry.height, geometry.bit_depth
        );
        let r = geometry.region;
        let _ = writeln!(
            out,
            "  Region:          ({}, {}) {} x {}, bin {} x {}",
            r.min_x, r.min_y, r.size_x, r.size_y, geometry.binning.x, geometry.binning.y
        );
        let _ = writeln!(out, "  Trigger mode:    {}", self.trigger_mode());
        let _ = writeln!(
            out,
            "  Image mode:      {:?}, {} images, {} remaining",
            request.image_mode, request.num_images, request.remaining
        );

        if verbosity >= 1 {
            let stats = self.stats();
            let _ = writeln!(
                out,
                "  Frames:          {} received, {} delivered, {} this run",
                stats.frames_received, stats.frames_delivered, stats.images_this_run
            );
            let _ = writeln!(
                out,
                "  Problems:        {} timeouts, {} sync warnings, {} dropped",
                stats.timeouts, stats.sync_warnings, stats.dropped
            );
            let _ = writeln!(
                out,
                "  Runs/reconfigs:  {} / {}",
                stats.runs, stats.reconfigures
            );
            let timing = self.timing();
            write_timer(&mut out, "ReAcquire", &timing.reacquire);
            write_timer(&mut out, "ReArm", &timing.rearm);
            write_timer(&mut out, "ProcessImage", &timing.process);
            if let Some(gain) = *core.gain.lock() {
                let _ = writeln!(out, "  Gain:            {gain}");
            }
            if let Some(seconds) = *core.acquire_time.lock() {
                let _ = writeln!(out, "  Acquire time:    {seconds} s");
            }
            let _ = writeln!(out, "  Timestamp event: {}", core.timestamp_event());
        }

        if verbosity >= 2 {
            let _ = writeln!(out, "  DMA size:        {} bytes", info.dma_size);
            let _ = writeln!(
                out,
                "  HW region:       {:?} (enabled: {})",
                info.region, info.region_enabled
            );
            let register = if core.control.is_acquiring() {
                None
            } else {
                core.reconfig
                    .try_lock_device()
                    .and_then(|guard| guard.as_ref().map(|d| d.status_register()))
            };
            match register {
                Some(value) => {
                    let _ = writeln!(out, "  Status register: {value:#06x}");
                }
                None => {
                    let _ = writeln!(out, "  Status register: busy");
                }
            }
        }
        out
    }
}

fn write_timer(out: &mut String, label: &str, timer: &TimerStats) {
    let _ = writeln!(
        out,
        "  {label:<16} last {:?}, mean {:?}, max {:?} ({} samples)",
        timer.last,
        timer.mean(),
        timer.max,
        timer.count
    );
}

impl Drop for EdtCamera {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for EdtCamera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdtCamera")
            .field("name", &self.core.name)
            .field("unit", &self.core.config.unit)
            .field("channel", &self.core.config.channel)
            .field("status", &self.status())
            .finish()
    }
}
