//! The per-camera acquire worker.
//!
//! One named OS thread per connected camera runs this state machine until the
//! camera is disconnected:
//!
//! ```text
//! Idle ──► Reconfiguring ◄────────────────────────────┐
//!             │  (debounce, retry until it succeeds)  │ flag set
//!             ▼                                       │
//!          WaitingForWork ──► Starting ──► AcquiringFrame ──► Stopping
//!             ▲                                                  │
//!             └──────────────────────────────────────────────────┘
//! ```
//!
//! Every blocking point (debounce sleep, wait for work, wait for a frame) is
//! bounded, so the shared flags are re-read regularly. Errors inside a loop
//! iteration are logged and the loop carries on. A panic raised by a
//! collaborator is caught at the top of the loop and the run continues with
//! the next iteration.
//!
//! Each `set_acquiring(true)` starts a new run generation. A worker that sees
//! the generation change mid-run goes back through `Starting`, so a stop and
//! restart between two frames re-arms the ring.

use crate::acquisition::SyncPolicy;
use crate::camera::CameraCore;
use crate::device::PdvChannel;
use crate::error::{PdvError, Result};
use crate::geometry::Geometry;
use crate::pipeline::OutputFrame;
use crate::reconfigure::Reconfigured;
use crate::status::{CameraStatus, WorkerState};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Sticky stop request with an interruptible sleep.
#[derive(Debug, Default)]
pub(crate) struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    pub(crate) fn set(&self) {
        *self.stopped.lock() = true;
        self.cond.notify_all();
    }

    pub(crate) fn clear(&self) {
        *self.stopped.lock() = false;
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleep for `duration` unless stopped first. True when stopped.
    pub(crate) fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.cond.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }
}

/// A frame ready for delivery and the moment its buffer arrived.
struct Produced {
    frame: OutputFrame,
    arrived: Instant,
}

pub(crate) struct AcquireWorker {
    core: Arc<CameraCore>,
    state: WorkerState,
    /// Frame delivered in the previous iteration, released at the loop top.
    held: Option<Arc<OutputFrame>>,
    /// Geometry the current run was started with.
    run_geometry: Geometry,
    /// Generation of the run being acquired.
    run: u64,
}

impl AcquireWorker {
    /// Start the worker thread for `core`.
    pub(crate) fn spawn(core: Arc<CameraCore>) -> std::io::Result<JoinHandle<()>> {
        let name = format!("acq-{}", core.name);
        std::thread::Builder::new().name(name).spawn(move || {
            let worker = AcquireWorker {
                core,
                state: WorkerState::Idle,
                held: None,
                run_geometry: Geometry::default(),
                run: 0,
            };
            worker.run();
        })
    }

    fn run(mut self) {
        info!(camera = %self.core.name, "Acquire worker started");
        self.core.publish_state(self.state);

        while !self.core.stop.is_set() {
            let current = self.state;
            match panic::catch_unwind(AssertUnwindSafe(|| self.step())) {
                Ok(next) => self.state = next,
                Err(payload) => {
                    error!(
                        camera = %self.core.name,
                        state = ?current,
                        panic = %panic_message(payload.as_ref()),
                        "Acquire loop recovered from panic"
                    );
                    self.held = None;
                    // The request survives; the next pass picks the run back up.
                    self.state = match current {
                        WorkerState::AcquiringFrame => WorkerState::AcquiringFrame,
                        WorkerState::Starting => WorkerState::WaitingForWork,
                        _ => WorkerState::Idle,
                    };
                }
            }
            self.core.publish_state(self.state);
        }

        if matches!(
            self.state,
            WorkerState::Starting | WorkerState::AcquiringFrame | WorkerState::Stopping
        ) {
            self.stopping();
        }
        self.held = None;
        self.state = WorkerState::Exited;
        self.core.publish_state(self.state);
        info!(camera = %self.core.name, "Acquire worker exited");
    }

    fn step(&mut self) -> WorkerState {
        match self.state {
            WorkerState::Idle => self.idle(),
            WorkerState::Reconfiguring => self.reconfiguring(),
            WorkerState::WaitingForWork => self.waiting_for_work(),
            WorkerState::Starting => self.starting(),
            WorkerState::AcquiringFrame => self.acquiring(),
            WorkerState::Stopping => self.stopping(),
            WorkerState::Exited => WorkerState::Exited,
        }
    }

    /// True when the device must be rebuilt before anything else.
    fn needs_reconfigure(&self) -> bool {
        let reconfig = &self.core.reconfig;
        if reconfig.is_pending() {
            return true;
        }
        if !reconfig.has_device() {
            warn!(camera = %self.core.name, error = %PdvError::ConnectionLost, "No device handle");
            reconfig.connection_lost();
            return true;
        }
        false
    }

    fn idle(&mut self) -> WorkerState {
        if self.needs_reconfigure() {
            WorkerState::Reconfiguring
        } else {
            WorkerState::WaitingForWork
        }
    }

    fn reconfiguring(&mut self) -> WorkerState {
        if self.core.stop.sleep(self.core.config.reconfigure_delay) {
            return WorkerState::Reconfiguring;
        }

        match self.core.reconfigure() {
            Ok(Reconfigured::Rebuilt) => WorkerState::WaitingForWork,
            Ok(Reconfigured::Unchanged) if self.core.reconfig.has_device() => {
                WorkerState::WaitingForWork
            }
            Ok(Reconfigured::Unchanged) => {
                self.core.reconfig.request_reconfigure();
                WorkerState::Reconfiguring
            }
            // Already logged and published; retry after the next debounce.
            Err(_) => WorkerState::Reconfiguring,
        }
    }

    fn waiting_for_work(&mut self) -> WorkerState {
        if self.needs_reconfigure() {
            return WorkerState::Reconfiguring;
        }

        if self.core.control.has_work() {
            return WorkerState::Starting;
        }

        let woken = self.core.control.wait_for_work(self.core.config.acquire_timeout);
        if self.core.stop.is_set() {
            return WorkerState::WaitingForWork;
        }
        if self.core.reconfig.is_pending() {
            return WorkerState::Reconfiguring;
        }
        if self.core.control.has_work() {
            return WorkerState::Starting;
        }
        if woken {
            trace!(camera = %self.core.name, "Woken without work");
        }
        WorkerState::WaitingForWork
    }

    fn starting(&mut self) -> WorkerState {
        let core = Arc::clone(&self.core);
        let geometry = core.reconfig.geometry();
        self.run = core.control.run();

        let mut guard = core.reconfig.lock_device();
        let Some(device) = guard.as_mut() else {
            core.reconfig.connection_lost();
            return WorkerState::Reconfiguring;
        };

        // Clear anything left queued by a previous run.
        device.abort_and_restart_timeout();
        if core.stop.sleep(core.config.camera_start_delay) {
            return WorkerState::Stopping;
        }

        if let Err(e) = self.program_run(device.as_mut(), &geometry) {
            error!(camera = %core.name, error = %e, "Failed to start acquisition");
            return WorkerState::Stopping;
        }

        core.stats.run_started();
        core.publish_status(CameraStatus::Acquiring);
        device.start_images(core.config.num_buffers);
        self.run_geometry = geometry;

        info!(
            camera = %core.name,
            size_x = geometry.region.size_x,
            size_y = geometry.region.size_y,
            cropped = geometry.is_cropped(),
            remaining = core.control.remaining(),
            run = self.run,
            "Acquisition started"
        );
        WorkerState::AcquiringFrame
    }

    fn program_run(&self, device: &mut dyn PdvChannel, geometry: &Geometry) -> Result<()> {
        let (region, crop) = geometry.hardware_region(self.core.config.vertical_skip);
        device.set_region(region)?;
        device.enable_region(crop)?;
        debug!(camera = %self.core.name, ?region, crop, "Region programmed");

        if let Some(gain) = self.core.take_pending_gain() {
            if let Err(e) = device.set_gain(gain) {
                warn!(camera = %self.core.name, gain, error = %e, "Failed to apply gain");
            }
        }

        if let Err(e) = device.enable_frame_sync(true) {
            warn!(camera = %self.core.name, error = %e, "Frame sync unavailable");
        }
        Ok(())
    }

    fn acquiring(&mut self) -> WorkerState {
        loop {
            // Release the previous frame before waiting for the next one.
            self.held = None;

            if self.core.stop.is_set()
                || self.core.reconfig.is_pending()
                || !self.core.control.has_work()
            {
                return WorkerState::Stopping;
            }
            if self.core.control.run() != self.run {
                debug!(camera = %self.core.name, run = self.run, "Acquisition restarted");
                return WorkerState::Starting;
            }

            match self.acquire_locked() {
                Ok(Some(produced)) => self.deliver(produced),
                Ok(None) => {}
                Err(PdvError::TransferTimeout(timeout)) => {
                    debug!(camera = %self.core.name, ?timeout, "No frame before timeout");
                }
                Err(e) if e.is_frame_local() => {
                    warn!(camera = %self.core.name, error = %e, "Frame dropped");
                }
                Err(PdvError::ConnectionLost) => return WorkerState::Stopping,
                Err(e) => {
                    error!(camera = %self.core.name, error = %e, "Acquire iteration failed");
                }
            }
        }
    }

    /// Run [`Self::acquire_one`] under the device lock. The lock is released
    /// before the frame is delivered.
    fn acquire_locked(&self) -> Result<Option<Produced>> {
        let mut guard = self.core.reconfig.lock_device();
        match guard.as_mut() {
            Some(device) => self.acquire_one(device.as_mut()),
            None => {
                self.core.reconfig.connection_lost();
                Err(PdvError::ConnectionLost)
            }
        }
    }

    /// Wait for one raw buffer, rearm, validate and convert it.
    ///
    /// Runs with the device lock held; the frame is delivered after release.
    fn acquire_one(&self, device: &mut dyn PdvChannel) -> Result<Option<Produced>> {
        let core = &self.core;
        let timeout = core.config.acquire_timeout;

        core.publish_status(CameraStatus::Waiting);
        core.timers.wait_started(Instant::now());
        let slot = device.wait_next_raw_buffer(timeout);

        if !core.control.is_acquiring() || core.control.run() != self.run {
            debug!(camera = %core.name, "Acquisition cancelled during wait");
            return Ok(None);
        }
        let Some(slot) = slot else {
            core.stats.timeout();
            return Err(PdvError::TransferTimeout(timeout));
        };

        let arrived = Instant::now();
        core.stats.frame_received();
        if core.control.consume_frame() != 0 {
            device.start_images(1);
            core.timers.rearmed(arrived);
        }
        core.publish_status(CameraStatus::Acquiring);

        let Some(raw) = device.raw_frame(slot) else {
            core.stats.frame_dropped();
            return Err(PdvError::ShortBuffer {
                expected: self.run_geometry.frame_bytes(),
                actual: 0,
            });
        };

        let sync = device.check_frame_sync(&raw);
        if !sync.is_ok() {
            core.stats.sync_warning();
            let warning = PdvError::FrameSync(format!("{sync:?}"));
            warn!(camera = %core.name, slot = slot.0, error = %warning, "Frame sync check failed");
            if core.config.sync_policy == SyncPolicy::Skip {
                core.stats.frame_dropped();
                return Ok(None);
            }
        }

        let converted = core
            .time_source
            .stamp(core.timestamp_event())
            .and_then(|stamp| core.pipeline.convert(&raw, &self.run_geometry, stamp, sync));
        match converted {
            Ok(frame) => Ok(Some(Produced { frame, arrived })),
            Err(e) => {
                core.stats.frame_dropped();
                Err(e)
            }
        }
    }

    fn deliver(&mut self, produced: Produced) {
        let frame = Arc::new(produced.frame);
        self.held = Some(Arc::clone(&frame));

        let id = frame.id;
        self.core.sink.deliver(frame);
        self.core.stats.frame_delivered();
        self.core.stats.image_in_run();
        self.core.timers.processed(produced.arrived);
        trace!(camera = %self.core.name, id, "Frame delivered");

        if self.core.control.is_acquiring() && self.core.control.remaining() == 0 {
            info!(camera = %self.core.name, "Requested frames acquired");
        }
    }

    fn stopping(&mut self) -> WorkerState {
        self.held = None;
        if !self.core.control.finish(self.run) {
            debug!(camera = %self.core.name, "Newer run requested while stopping");
        }
        {
            let mut guard = self.core.reconfig.lock_device();
            if let Some(device) = guard.as_mut() {
                device.abort_and_restart_timeout();
            }
        }
        self.core.timers.run_ended();
        self.core.publish_status(CameraStatus::Idle);
        info!(
            camera = %self.core.name,
            frames = self.core.stats.snapshot().images_this_run,
            "Acquisition stopped"
        );

        if self.core.reconfig.is_pending() {
            WorkerState::Reconfiguring
        } else {
            WorkerState::WaitingForWork
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
