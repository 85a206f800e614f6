//! Acquire/idle state and the frame budget of the current run.
//!
//! [`AcquisitionController`] is written by the control plane and read by the
//! acquire worker. It turns image mode and image count into a remaining-frame
//! counter and wakes the worker through a binary [`WakeSignal`].
//!
//! The counter is positive while frames remain, zero when idle or done, and
//! [`UNBOUNDED`] in continuous mode. Decrementing never moves a negative
//! counter, so continuous runs only end when acquisition is switched off.

use crate::error::{PdvError, Result};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Remaining-frame value meaning "until stopped".
pub const UNBOUNDED: i64 = -1;

/// How many frames one acquisition produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageMode {
    /// One frame.
    Single,
    /// `num_images` frames.
    Multiple,
    /// Until stopped.
    #[default]
    Continuous,
}

impl ImageMode {
    /// Decode the host's integer encoding (0, 1, 2).
    pub fn from_index(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Self::Single),
            1 => Ok(Self::Multiple),
            2 => Ok(Self::Continuous),
            other => Err(PdvError::validation(
                "ImageMode",
                format!("{other} is not one of 0 (single), 1 (multiple), 2 (continuous)"),
            )),
        }
    }
}

/// What to do with a frame whose sync check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Log it and deliver the frame anyway.
    #[default]
    Accept,
    /// Log it and drop the frame.
    Skip,
}

/// Image mode, count and the derived counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AcquisitionRequest {
    /// Requested mode.
    pub image_mode: ImageMode,
    /// Requested count for [`ImageMode::Multiple`].
    pub num_images: u32,
    /// Whether the host asked for acquisition.
    pub acquiring: bool,
    /// Frames left in the current run.
    pub remaining: i64,
    /// Bumped every time acquisition is switched on.
    pub run: u64,
}

impl AcquisitionRequest {
    /// Counter a new run starts with.
    #[must_use]
    pub fn target(image_mode: ImageMode, num_images: u32) -> i64 {
        match image_mode {
            ImageMode::Single => 1,
            ImageMode::Multiple => i64::from(num_images),
            ImageMode::Continuous => UNBOUNDED,
        }
    }

    fn retarget(&mut self) {
        self.remaining = Self::target(self.image_mode, self.num_images);
    }
}

/// Binary wake-up: any number of signals before a wait collapse into one.
#[derive(Debug, Default)]
pub struct WakeSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl WakeSignal {
    /// Raise the signal.
    pub fn signal(&self) {
        *self.pending.lock() = true;
        self.cond.notify_one();
    }

    /// Wait up to `timeout` for the signal and consume it.
    ///
    /// Returns false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            // Spurious wakeups just end the wait early; callers loop.
            let _ = self.cond.wait_for(&mut pending, timeout);
        }
        std::mem::replace(&mut *pending, false)
    }
}

/// Control-plane side of acquisition.
#[derive(Debug)]
pub struct AcquisitionController {
    request: Mutex<AcquisitionRequest>,
    wake: WakeSignal,
}

impl AcquisitionController {
    /// Idle controller with the given mode and count.
    #[must_use]
    pub fn new(image_mode: ImageMode, num_images: u32) -> Self {
        Self {
            request: Mutex::new(AcquisitionRequest {
                image_mode,
                num_images,
                acquiring: false,
                remaining: 0,
                run: 0,
            }),
            wake: WakeSignal::default(),
        }
    }

    /// Start or stop acquisition. Returns the new remaining counter.
    pub fn set_acquiring(&self, on: bool) -> i64 {
        let remaining = {
            let mut req = self.request.lock();
            req.acquiring = on;
            if on {
                req.run = req.run.wrapping_add(1);
                req.retarget();
            } else {
                req.remaining = 0;
            }
            req.remaining
        };
        if on {
            self.wake.signal();
        }
        remaining
    }

    /// Change the image mode. Recomputes the counter of a run in progress.
    pub fn set_image_mode(&self, mode: ImageMode) -> bool {
        let mut req = self.request.lock();
        if req.image_mode == mode {
            return false;
        }
        req.image_mode = mode;
        if req.acquiring {
            req.retarget();
        }
        true
    }

    /// Change the image count. Recomputes the counter of a run in progress.
    pub fn set_num_images(&self, num_images: u32) -> Result<bool> {
        if num_images == 0 {
            return Err(PdvError::validation("NumImages", "must be > 0"));
        }
        let mut req = self.request.lock();
        if req.num_images == num_images {
            return Ok(false);
        }
        req.num_images = num_images;
        if req.acquiring {
            req.retarget();
        }
        Ok(true)
    }

    /// Snapshot of the request.
    #[must_use]
    pub fn request(&self) -> AcquisitionRequest {
        *self.request.lock()
    }

    /// Whether acquisition is requested.
    #[must_use]
    pub fn is_acquiring(&self) -> bool {
        self.request.lock().acquiring
    }

    /// Frames left in the current run.
    #[must_use]
    pub fn remaining(&self) -> i64 {
        self.request.lock().remaining
    }

    /// Generation of the most recent `set_acquiring(true)`.
    #[must_use]
    pub fn run(&self) -> u64 {
        self.request.lock().run
    }

    /// True while a run should keep going.
    #[must_use]
    pub fn has_work(&self) -> bool {
        let req = self.request.lock();
        req.acquiring && req.remaining != 0
    }

    /// Count one frame against the budget and return what is left.
    pub fn consume_frame(&self) -> i64 {
        let mut req = self.request.lock();
        if req.remaining > 0 {
            req.remaining -= 1;
        }
        req.remaining
    }

    /// End run `run`: not acquiring, nothing remaining.
    ///
    /// A newer run requested in the meantime is left alone. Returns whether
    /// the request was cleared.
    pub fn finish(&self, run: u64) -> bool {
        let mut req = self.request.lock();
        if req.run != run {
            return false;
        }
        req.acquiring = false;
        req.remaining = 0;
        true
    }

    /// Block until woken or `timeout` passes. True when woken.
    pub fn wait_for_work(&self, timeout: Duration) -> bool {
        self.wake.wait_timeout(timeout)
    }

    /// Wake the worker without changing the request.
    pub fn nudge(&self) {
        self.wake.signal();
    }
}
