//! Frame-grabber capability interface.
//!
//! The vendor driver is reached only through these two traits. [`PdvDriver`]
//! opens channels and parses vendor configuration files; [`PdvChannel`] is an
//! open channel with its DMA ring. A channel is used by one thread at a time:
//! the reconfigure manager owns it and the acquire worker borrows it inside
//! its critical sections.
//!
//! Raw frames are exposed in two steps. [`PdvChannel::wait_next_raw_buffer`]
//! blocks until a ring slot completes and returns its [`RingSlot`];
//! [`PdvChannel::raw_frame`] then lends a view of that slot. The view borrows
//! the channel, so it cannot outlive the copy-out, while the worker is still
//! free to rearm the next transfer between the two calls.

use crate::error::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Crop window programmed on the grabber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct HwRegion {
    /// Columns skipped at the start of each line.
    pub hskip: u32,
    /// Active columns per line.
    pub hactive: u32,
    /// Lines skipped at the start of the frame.
    pub vskip: u32,
    /// Active lines.
    pub vactive: u32,
}

/// Per-transfer hardware timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferTimeout {
    /// Let the driver derive the timeout from the camera settings.
    DeviceDefault,
    /// Fixed timeout in milliseconds.
    Millis(u32),
}

/// Parsed vendor configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VendorConfig {
    /// File the configuration was read from.
    pub path: PathBuf,
    /// `camera_class` entry.
    pub camera_class: String,
    /// `camera_model` entry.
    pub camera_model: String,
    /// `camera_info` entry.
    pub camera_info: String,
    /// Sensor width.
    pub width: u32,
    /// Sensor height.
    pub height: u32,
    /// Bits per pixel.
    pub depth: u32,
    /// Remaining directives, passed through untouched.
    pub extras: BTreeMap<String, String>,
}

/// Identity and geometry read back from an initialized channel.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub camera_class: String,
    pub camera_model: String,
    pub camera_info: String,
    pub driver_version: String,
    pub library_version: String,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    /// Bytes the grabber transfers per image with the current crop.
    pub dma_size: usize,
    /// Crop currently programmed and whether it is enabled.
    pub region: HwRegion,
    pub region_enabled: bool,
}

/// Index of a completed slot in the channel's DMA ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RingSlot(pub usize);

/// Borrowed view of a completed ring slot.
///
/// The bytes belong to the channel and are recycled once the ring wraps.
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    slot: RingSlot,
    data: &'a [u8],
}

impl<'a> RawFrame<'a> {
    /// Wrap a ring slot's bytes.
    #[must_use]
    pub fn new(slot: RingSlot, data: &'a [u8]) -> Self {
        Self { slot, data }
    }

    /// Ring slot the bytes live in.
    #[must_use]
    pub fn slot(&self) -> RingSlot {
        self.slot
    }

    /// The raw bytes.
    #[must_use]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Number of bytes in the slot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for a zero-length slot.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Result of the grabber's frame-sync check on a raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FrameSyncStatus {
    /// Frame counter is in sequence.
    Ok {
        /// Hardware frame counter.
        counter: u32,
    },
    /// Frame-sync is running but the counter is out of sequence.
    CounterMismatch {
        /// Hardware frame counter.
        counter: u32,
    },
    /// Frame-sync is not working for this frame.
    Lost,
}

impl FrameSyncStatus {
    /// True when the counter was in sequence.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

/// Entry point into the vendor driver.
pub trait PdvDriver: Send + Sync {
    /// Open `unit`/`channel` and return an exclusive handle.
    fn open_channel(&self, unit: u32, channel: u32) -> Result<Box<dyn PdvChannel>>;

    /// Read and parse a vendor configuration file.
    fn load_config(&self, path: &Path) -> Result<VendorConfig>;
}

/// An open frame-grabber channel.
#[allow(missing_docs)]
pub trait PdvChannel: Send {
    /// Apply a parsed configuration to the camera and grabber.
    fn init_device(&mut self, config: &VendorConfig) -> Result<()>;

    /// Allocate the DMA ring with `buffers` slots.
    fn allocate_ring(&mut self, buffers: u32) -> Result<()>;

    fn set_timeout(&mut self, timeout: TransferTimeout);

    fn set_region(&mut self, region: HwRegion) -> Result<()>;

    fn enable_region(&mut self, enable: bool) -> Result<()>;

    fn enable_frame_sync(&mut self, enable: bool) -> Result<()>;

    fn set_gain(&mut self, gain: i32) -> Result<()>;

    /// Queue `count` image transfers.
    fn start_images(&mut self, count: u32);

    /// Block until the next queued transfer completes, or `timeout` passes.
    fn wait_next_raw_buffer(&mut self, timeout: Duration) -> Option<RingSlot>;

    /// View the bytes of a completed slot.
    fn raw_frame(&self, slot: RingSlot) -> Option<RawFrame<'_>>;

    fn check_frame_sync(&self, frame: &RawFrame<'_>) -> FrameSyncStatus;

    /// Abort queued transfers and restart the hardware timeout.
    fn abort_and_restart_timeout(&mut self);

    fn info(&self) -> DeviceInfo;

    /// Raw grabber status register, for diagnostics.
    fn status_register(&self) -> u32;

    fn close(&mut self);
}
