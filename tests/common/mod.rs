//! Shared helpers for the acquisition integration tests.
//!
//! - `fast_config`: a camera config with millisecond delays
//! - `sim_camera`: an `EdtCamera` on a fresh `SimDriver`
//! - `FrameLog`: a sink that keeps every delivered frame
//! - `wait_until`: poll a condition with a deadline

#![allow(dead_code)] // Not every test file uses every helper

use edt_pdv::camera::EdtCameraBuilder;
use edt_pdv::sim::{SimDriver, SimSensor};
use edt_pdv::{CameraConfig, EdtCamera, FrameSink, OutputFrame};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Generous bound for anything the worker should do "soon".
pub const SETTLE: Duration = Duration::from_secs(5);

/// Camera config with delays short enough for tests.
pub fn fast_config(name: &str) -> CameraConfig {
    let mut config = CameraConfig::new(name, "opal1000");
    config.reconfigure_delay = Duration::from_millis(5);
    config.camera_start_delay = Duration::ZERO;
    config.acquire_timeout = Duration::from_millis(100);
    config
}

/// Simulated sensor with no readout delay.
pub fn sensor(width: u32, height: u32, depth: u32) -> SimSensor {
    SimSensor {
        width,
        height,
        depth,
        frame_interval: Duration::ZERO,
        ..SimSensor::default()
    }
}

/// Builder for a camera on `driver`.
pub fn builder(config: CameraConfig, driver: &SimDriver) -> EdtCameraBuilder {
    EdtCamera::builder(config, Arc::new(driver.clone()))
}

/// Connected camera delivering into a fresh [`FrameLog`].
pub fn sim_camera(config: CameraConfig, sensor: SimSensor) -> (EdtCamera, SimDriver, FrameLog) {
    let driver = SimDriver::new(sensor);
    let log = FrameLog::default();
    let camera = builder(config, &driver)
        .sink(log.clone())
        .build()
        .expect("camera builds");
    camera.connect().expect("camera connects");
    (camera, driver, log)
}

/// Poll `condition` every millisecond until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Sink that records delivered frames.
#[derive(Clone, Default)]
pub struct FrameLog {
    frames: Arc<Mutex<Vec<Arc<OutputFrame>>>>,
}

impl FrameLog {
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn frames(&self) -> Vec<Arc<OutputFrame>> {
        self.frames.lock().clone()
    }

    pub fn wait_for(&self, count: usize) -> bool {
        wait_until(SETTLE, || self.len() >= count)
    }
}

impl FrameSink for FrameLog {
    fn deliver(&self, frame: Arc<OutputFrame>) {
        self.frames.lock().push(frame);
    }
}
