//! # EDT PDV Camera Driver
//!
//! Acquisition state machine for cameras attached to EDT PDV frame grabbers.
//! Each camera owns one grabber channel and one acquire worker thread. The
//! worker reconfigures the channel when geometry or trigger settings change,
//! streams frames out of the DMA ring, rearms the next transfer before copying
//! the current one, and hands every frame to a [`FrameSink`] outside all
//! camera locks.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: Image mode, frame budget and the worker wake-up signal.
//! - **`camera`**: `EdtCamera`, the host-facing object (connect, setters,
//!   reports).
//! - **`commands`**: `ParamKey` to setter dispatch for host parameter writes.
//! - **`config`**: Figment-based loading of `AppConfig` from TOML and the
//!   environment.
//! - **`device`**: The `PdvDriver`/`PdvChannel` capability traits the vendor
//!   library is reached through.
//! - **`error`**: The `PdvError` enum for centralized error handling.
//! - **`geometry`**: Sensor geometry, region, binning and trigger mode with
//!   their validation rules.
//! - **`pipeline`**: Raw buffer to `OutputFrame` conversion, including
//!   mid-top line de-interleaving.
//! - **`pool`**: Bounded, reusable pixel buffers shared by all cameras.
//! - **`reconfigure`**: Serialized device (re)initialization against a
//!   pending flag.
//! - **`registry`**: The process-wide `CameraRegistry`.
//! - **`sim`**: A simulated frame grabber with a call log and fault injection.
//! - **`sink`**: Downstream frame consumers.
//! - **`status`**: Camera status, worker state, counters and loop timers.
//! - **`timestamp`**: Frame timestamps and pulse ids.
//! - **`tracing_setup`**: `tracing-subscriber` initialization.

pub mod acquisition;
pub mod camera;
pub mod commands;
pub mod config;
pub mod device;
pub mod error;
pub mod geometry;
pub mod pipeline;
pub mod pool;
pub mod reconfigure;
pub mod registry;
pub mod sim;
pub mod sink;
pub mod status;
pub mod timestamp;
pub mod tracing_setup;
mod worker;

pub use acquisition::{ImageMode, SyncPolicy};
pub use camera::EdtCamera;
pub use commands::{ParamKey, ParamValue};
pub use config::{AppConfig, CameraConfig};
pub use error::{PdvError, Result};
pub use geometry::{Binning, Geometry, Region, TriggerMode};
pub use pipeline::{LineLayout, OutputFrame};
pub use pool::BufferPool;
pub use registry::CameraRegistry;
pub use sink::{ChannelSink, DiscardSink, FrameSink};
pub use status::{CameraStatus, WorkerState};
