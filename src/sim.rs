//! Simulated frame grabber.
//!
//! `SimDriver` implements the capability traits without hardware so the
//! state machine can run end to end in tests and from the CLI. Every call a
//! channel receives is appended to a shared log of [`DeviceCall`]s, and
//! faults (failed opens, failed inits, timeouts, frame-sync errors) can be
//! injected by frame number.
//!
//! Frames carry a ramp pattern `(x + y + frame) % 4096`, one value per pixel,
//! so tests can tell frames apart.

use crate::device::{
    DeviceInfo, FrameSyncStatus, HwRegion, PdvChannel, PdvDriver, RawFrame, RingSlot,
    TransferTimeout, VendorConfig,
};
use crate::error::{PdvError, Result};
use crate::pool::BufferPool;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// One call received by a simulated channel or driver.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum DeviceCall {
    Open { unit: u32, channel: u32 },
    LoadConfig(PathBuf),
    InitDevice,
    AllocateRing(u32),
    SetTimeout(TransferTimeout),
    SetRegion(HwRegion),
    EnableRegion(bool),
    EnableFrameSync(bool),
    SetGain(i32),
    StartImages(u32),
    /// A wait began; `pool_outstanding` is filled when a pool probe is set.
    WaitNextRawBuffer { pool_outstanding: Option<usize> },
    AbortAndRestartTimeout,
    Close,
}

/// Sensor the simulator pretends to be attached to.
#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct SimSensor {
    pub camera_class: String,
    pub camera_model: String,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    /// Readout time per frame.
    pub frame_interval: Duration,
}

impl Default for SimSensor {
    fn default() -> Self {
        Self {
            camera_class: "Simulated".to_string(),
            camera_model: "sim".to_string(),
            width: 640,
            height: 480,
            depth: 12,
            frame_interval: Duration::from_millis(1),
        }
    }
}

/// Faults to inject. Frame numbers count every frame produced by the driver,
/// starting at 1.
#[derive(Debug, Clone, Default)]
pub struct SimFaults {
    /// Fail this many upcoming opens.
    pub fail_opens: u32,
    /// Fail this many upcoming device inits.
    pub fail_inits: u32,
    /// Time out once instead of producing these frames.
    pub timeouts: HashSet<u64>,
    /// Report this sync status for these frames.
    pub sync_faults: HashMap<u64, FrameSyncStatus>,
}

struct SimInner {
    sensor: Mutex<SimSensor>,
    configs: Mutex<HashMap<PathBuf, VendorConfig>>,
    calls: Mutex<Vec<DeviceCall>>,
    faults: Mutex<SimFaults>,
    probe: Mutex<Option<BufferPool>>,
    frames_produced: AtomicU64,
}

impl SimInner {
    fn record(&self, call: DeviceCall) {
        trace!(?call, "sim");
        self.calls.lock().push(call);
    }
}

/// Simulated driver. Clones share the same sensor, log and faults.
#[derive(Clone)]
pub struct SimDriver {
    inner: Arc<SimInner>,
}

impl SimDriver {
    /// Driver for `sensor`.
    #[must_use]
    pub fn new(sensor: SimSensor) -> Self {
        Self {
            inner: Arc::new(SimInner {
                sensor: Mutex::new(sensor),
                configs: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                faults: Mutex::new(SimFaults::default()),
                probe: Mutex::new(None),
                frames_produced: AtomicU64::new(0),
            }),
        }
    }

    /// Serve `config` for `path` instead of reading the file.
    pub fn register_config(&self, path: impl Into<PathBuf>, config: VendorConfig) {
        self.inner.configs.lock().insert(path.into(), config);
    }

    /// Replace the simulated sensor. Takes effect at the next open.
    pub fn set_sensor(&self, sensor: SimSensor) {
        *self.inner.sensor.lock() = sensor;
    }

    /// Edit the injected faults.
    pub fn inject(&self, edit: impl FnOnce(&mut SimFaults)) {
        edit(&mut self.inner.faults.lock());
    }

    /// Record pool occupancy at every wait.
    pub fn set_pool_probe(&self, pool: BufferPool) {
        *self.inner.probe.lock() = Some(pool);
    }

    /// Calls received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.inner.calls.lock().clone()
    }

    /// Number of logged calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&DeviceCall) -> bool) -> usize {
        self.inner.calls.lock().iter().filter(|c| pred(c)).count()
    }

    /// Forget the call log.
    pub fn clear_calls(&self) {
        self.inner.calls.lock().clear();
    }

    /// Frames produced across all channels.
    #[must_use]
    pub fn frames_produced(&self) -> u64 {
        self.inner.frames_produced.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for SimDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimDriver")
            .field("sensor", &*self.inner.sensor.lock())
            .field("frames_produced", &self.frames_produced())
            .finish()
    }
}

impl PdvDriver for SimDriver {
    fn open_channel(&self, unit: u32, channel: u32) -> Result<Box<dyn PdvChannel>> {
        self.inner.record(DeviceCall::Open { unit, channel });
        {
            let mut faults = self.inner.faults.lock();
            if faults.fail_opens > 0 {
                faults.fail_opens -= 1;
                return Err(PdvError::DeviceOpen {
                    unit,
                    channel,
                    reason: "injected open failure".to_string(),
                });
            }
        }

        let sensor = self.inner.sensor.lock().clone();
        debug!(unit, channel, model = %sensor.camera_model, "Opened simulated channel");
        Ok(Box::new(SimChannel {
            shared: Arc::clone(&self.inner),
            sensor,
            config: None,
            ring: Vec::new(),
            slot_frames: Vec::new(),
            next_slot: 0,
            queued: 0,
            region: HwRegion::default(),
            region_enabled: false,
            frame_sync: false,
        }))
    }

    fn load_config(&self, path: &Path) -> Result<VendorConfig> {
        self.inner.record(DeviceCall::LoadConfig(path.to_path_buf()));
        if let Some(config) = self.inner.configs.lock().get(path) {
            return Ok(config.clone());
        }

        match std::fs::read_to_string(path) {
            Ok(text) => {
                let mut config = parse_vendor_config(&text);
                config.path = path.to_path_buf();
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // No file on disk: describe the simulated sensor.
                let sensor = self.inner.sensor.lock();
                Ok(VendorConfig {
                    path: path.to_path_buf(),
                    camera_class: sensor.camera_class.clone(),
                    camera_model: sensor.camera_model.clone(),
                    camera_info: "synthesized".to_string(),
                    width: sensor.width,
                    height: sensor.height,
                    depth: sensor.depth,
                    extras: BTreeMap::new(),
                })
            }
            Err(e) => Err(PdvError::DeviceInit(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        }
    }
}

/// Parse the `key: value` lines of a vendor configuration file.
///
/// `#` starts a comment. Quotes around values are dropped. Unknown keys are
/// kept in `extras`; malformed numbers read as 0.
#[must_use]
pub fn parse_vendor_config(text: &str) -> VendorConfig {
    let mut config = VendorConfig::default();
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().trim_matches('"').to_string();
        match key {
            "camera_class" => config.camera_class = value,
            "camera_model" => config.camera_model = value,
            "camera_info" => config.camera_info = value,
            "width" => config.width = value.parse().unwrap_or(0),
            "height" => config.height = value.parse().unwrap_or(0),
            "depth" => config.depth = value.parse().unwrap_or(0),
            _ => {
                config.extras.insert(key.to_string(), value);
            }
        }
    }
    config
}

/// A simulated open channel.
pub struct SimChannel {
    shared: Arc<SimInner>,
    sensor: SimSensor,
    config: Option<VendorConfig>,
    ring: Vec<Vec<u8>>,
    slot_frames: Vec<u64>,
    next_slot: usize,
    queued: u32,
    region: HwRegion,
    region_enabled: bool,
    frame_sync: bool,
}

impl SimChannel {
    fn dims(&self) -> (u32, u32, u32) {
        match &self.config {
            Some(c) if c.width > 0 && c.height > 0 => (c.width, c.height, c.depth.max(1)),
            _ => (self.sensor.width, self.sensor.height, self.sensor.depth),
        }
    }

    fn dma_size(&self) -> usize {
        let (width, height, depth) = self.dims();
        let bpp = if depth <= 8 { 1 } else { 2 };
        let (cols, rows) = if self.region_enabled {
            (self.region.hactive, self.region.vactive)
        } else {
            (width, height)
        };
        cols as usize * rows as usize * bpp
    }

    fn fill(&mut self, slot: usize, frame: u64) {
        let (width, height, depth) = self.dims();
        let (cols, rows) = if self.region_enabled {
            (self.region.hactive, self.region.vactive)
        } else {
            (width, height)
        };
        let wide = depth > 8;
        let size = self.dma_size();
        let buf = &mut self.ring[slot];
        buf.resize(size, 0);

        let mut at = 0;
        for y in 0..rows as u64 {
            for x in 0..cols as u64 {
                let value = ((x + y + frame) % 4096) as u16;
                if wide {
                    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
                    at += 2;
                } else {
                    buf[at] = value as u8;
                    at += 1;
                }
            }
        }
        self.slot_frames[slot] = frame;
    }
}

impl PdvChannel for SimChannel {
    fn init_device(&mut self, config: &VendorConfig) -> Result<()> {
        self.shared.record(DeviceCall::InitDevice);
        let mut faults = self.shared.faults.lock();
        if faults.fail_inits > 0 {
            faults.fail_inits -= 1;
            return Err(PdvError::DeviceInit("injected init failure".to_string()));
        }
        self.config = Some(config.clone());
        Ok(())
    }

    fn allocate_ring(&mut self, buffers: u32) -> Result<()> {
        self.shared.record(DeviceCall::AllocateRing(buffers));
        if buffers == 0 {
            return Err(PdvError::DeviceInit("ring needs at least one buffer".to_string()));
        }
        self.ring = vec![Vec::new(); buffers as usize];
        self.slot_frames = vec![0; buffers as usize];
        self.next_slot = 0;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: TransferTimeout) {
        self.shared.record(DeviceCall::SetTimeout(timeout));
    }

    fn set_region(&mut self, region: HwRegion) -> Result<()> {
        self.shared.record(DeviceCall::SetRegion(region));
        let (width, height, _) = self.dims();
        if region.hskip + region.hactive > width || region.vskip + region.vactive > height {
            return Err(PdvError::DeviceInit(format!(
                "region {region:?} outside {width}x{height}"
            )));
        }
        self.region = region;
        Ok(())
    }

    fn enable_region(&mut self, enable: bool) -> Result<()> {
        self.shared.record(DeviceCall::EnableRegion(enable));
        self.region_enabled = enable;
        Ok(())
    }

    fn enable_frame_sync(&mut self, enable: bool) -> Result<()> {
        self.shared.record(DeviceCall::EnableFrameSync(enable));
        self.frame_sync = enable;
        Ok(())
    }

    fn set_gain(&mut self, gain: i32) -> Result<()> {
        self.shared.record(DeviceCall::SetGain(gain));
        Ok(())
    }

    fn start_images(&mut self, count: u32) {
        self.shared.record(DeviceCall::StartImages(count));
        self.queued = self.queued.saturating_add(count);
    }

    fn wait_next_raw_buffer(&mut self, timeout: Duration) -> Option<RingSlot> {
        let pool_outstanding = self.shared.probe.lock().as_ref().map(BufferPool::outstanding);
        self.shared
            .record(DeviceCall::WaitNextRawBuffer { pool_outstanding });

        if self.ring.is_empty() || self.queued == 0 {
            std::thread::sleep(timeout);
            return None;
        }

        let frame = self.shared.frames_produced.load(Ordering::Relaxed) + 1;
        if self.shared.faults.lock().timeouts.remove(&frame) {
            return None;
        }

        if !self.sensor.frame_interval.is_zero() {
            std::thread::sleep(self.sensor.frame_interval);
        }
        self.queued -= 1;
        self.shared.frames_produced.store(frame, Ordering::Relaxed);

        let slot = self.next_slot;
        self.next_slot = (slot + 1) % self.ring.len();
        self.fill(slot, frame);
        Some(RingSlot(slot))
    }

    fn raw_frame(&self, slot: RingSlot) -> Option<RawFrame<'_>> {
        self.ring
            .get(slot.0)
            .map(|data| RawFrame::new(slot, data.as_slice()))
    }

    fn check_frame_sync(&self, frame: &RawFrame<'_>) -> FrameSyncStatus {
        if !self.frame_sync {
            return FrameSyncStatus::Lost;
        }
        let number = self.slot_frames.get(frame.slot().0).copied().unwrap_or(0);
        if let Some(status) = self.shared.faults.lock().sync_faults.get(&number) {
            return *status;
        }
        FrameSyncStatus::Ok {
            counter: number as u32,
        }
    }

    fn abort_and_restart_timeout(&mut self) {
        self.shared.record(DeviceCall::AbortAndRestartTimeout);
        self.queued = 0;
    }

    fn info(&self) -> DeviceInfo {
        let (width, height, depth) = self.dims();
        let config = self.config.clone().unwrap_or_default();
        DeviceInfo {
            camera_class: config.camera_class,
            camera_model: config.camera_model,
            camera_info: config.camera_info,
            driver_version: "sim-driver 1.0".to_string(),
            library_version: "sim-lib 1.0".to_string(),
            width,
            height,
            depth,
            dma_size: self.dma_size(),
            region: self.region,
            region_enabled: self.region_enabled,
        }
    }

    fn status_register(&self) -> u32 {
        u32::from(self.queued > 0) | (u32::from(self.frame_sync) << 1)
    }

    fn close(&mut self) {
        self.shared.record(DeviceCall::Close);
        self.queued = 0;
        self.ring.clear();
    }
}
