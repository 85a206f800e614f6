//! Sensor geometry, requested region and trigger mode.
//!
//! [`Geometry`] holds what the frame grabber reported at the last reconfigure
//! (sensor width, height and bit depth) together with the region and binning
//! the host asked for. Every setter validates the candidate state as a whole
//! and either commits it or leaves the current state untouched.
//!
//! Setters return `Ok(true)` when the state changed, which is the caller's cue
//! to request a reconfigure. Writing the current value back returns `Ok(false)`.

use crate::device::HwRegion;
use crate::error::{PdvError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How the camera is triggered. Selects the vendor configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Camera runs on its internal clock.
    #[default]
    FreeRun,
    /// Exposure starts on an external trigger edge.
    ExternalTrigger,
    /// Exposure follows the external pulse width.
    Pulse,
}

impl TriggerMode {
    /// Suffix appended to the model name to form the config file stem.
    #[must_use]
    pub fn config_suffix(self) -> char {
        match self {
            Self::FreeRun => 'f',
            Self::ExternalTrigger => 't',
            Self::Pulse => 'p',
        }
    }

    /// Decode the host's integer encoding (0, 1, 2).
    pub fn from_index(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Self::FreeRun),
            1 => Ok(Self::ExternalTrigger),
            2 => Ok(Self::Pulse),
            other => Err(PdvError::validation(
                "TriggerMode",
                format!("{other} is not one of 0 (free run), 1 (external), 2 (pulse)"),
            )),
        }
    }

    /// Integer encoding used by the host.
    #[must_use]
    pub fn index(self) -> i64 {
        match self {
            Self::FreeRun => 0,
            Self::ExternalTrigger => 1,
            Self::Pulse => 2,
        }
    }
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FreeRun => "FreeRun",
            Self::ExternalTrigger => "ExternalTrigger",
            Self::Pulse => "Pulse",
        };
        f.write_str(name)
    }
}

/// Requested region of interest, in sensor pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Region {
    /// First column.
    pub min_x: u32,
    /// First row.
    pub min_y: u32,
    /// Number of columns.
    pub size_x: u32,
    /// Number of rows.
    pub size_y: u32,
}

impl Region {
    /// Region covering a whole `width` x `height` sensor.
    #[must_use]
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            min_x: 0,
            min_y: 0,
            size_x: width,
            size_y: height,
        }
    }
}

/// Binning factors. Carried as frame metadata only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binning {
    /// Horizontal factor.
    pub x: u32,
    /// Vertical factor.
    pub y: u32,
}

impl Default for Binning {
    fn default() -> Self {
        Self { x: 1, y: 1 }
    }
}

/// Sensor geometry read back from the device plus the requested region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Geometry {
    /// Sensor width reported by the device.
    pub width: u32,
    /// Sensor height reported by the device.
    pub height: u32,
    /// Bits per pixel reported by the device.
    pub bit_depth: u32,
    /// Requested region.
    pub region: Region,
    /// Requested binning.
    pub binning: Binning,
}

impl Geometry {
    /// Geometry with no sensor information yet and the given initial request.
    ///
    /// The request is not validated here; it is reconciled against the sensor
    /// at the first reconfigure.
    #[must_use]
    pub fn requested(region: Option<Region>, binning: Binning) -> Self {
        Self {
            region: region.unwrap_or_default(),
            binning,
            ..Self::default()
        }
    }

    /// Bytes per output pixel: 1 up to 8 bits, 2 above.
    #[must_use]
    pub fn bytes_per_pixel(&self) -> usize {
        if self.bit_depth <= 8 {
            1
        } else {
            2
        }
    }

    /// Size in bytes of one output frame for the current region.
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        self.region.size_x as usize * self.region.size_y as usize * self.bytes_per_pixel()
    }

    /// True when the region is smaller than the sensor on either axis.
    #[must_use]
    pub fn is_cropped(&self) -> bool {
        self.region.size_x < self.width || self.region.size_y < self.height
    }

    /// Crop to program on the grabber and whether to enable it.
    ///
    /// The camera applies the vertical offset itself unless `vertical_skip`
    /// is set, so by default the transfer always starts at row 0.
    #[must_use]
    pub fn hardware_region(&self, vertical_skip: bool) -> (HwRegion, bool) {
        if self.is_cropped() {
            let region = HwRegion {
                hskip: self.region.min_x,
                hactive: self.region.size_x,
                vskip: if vertical_skip { self.region.min_y } else { 0 },
                vactive: self.region.size_y,
            };
            (region, true)
        } else {
            let region = HwRegion {
                hskip: 0,
                hactive: self.width,
                vskip: 0,
                vactive: self.height,
            };
            (region, false)
        }
    }

    /// Install dimensions read back from the device.
    ///
    /// A requested region that does not fit the reported sensor is reset to
    /// the full frame. Returns true when that happened.
    pub fn apply_readback(&mut self, width: u32, height: u32, bit_depth: u32) -> bool {
        self.width = width;
        self.height = height;
        self.bit_depth = bit_depth;

        if self.check_region("Region").is_err() {
            self.region = Region::full(width, height);
            return true;
        }
        false
    }

    /// Set the region width.
    pub fn set_size_x(&mut self, value: u32) -> Result<bool> {
        self.update("SizeX", |g| g.region.size_x = value)
    }

    /// Set the region height.
    pub fn set_size_y(&mut self, value: u32) -> Result<bool> {
        self.update("SizeY", |g| g.region.size_y = value)
    }

    /// Set the first column of the region.
    pub fn set_min_x(&mut self, value: u32) -> Result<bool> {
        self.update("MinX", |g| g.region.min_x = value)
    }

    /// Set the first row of the region.
    pub fn set_min_y(&mut self, value: u32) -> Result<bool> {
        self.update("MinY", |g| g.region.min_y = value)
    }

    /// Set the horizontal binning factor.
    pub fn set_bin_x(&mut self, value: u32) -> Result<bool> {
        self.update("BinX", |g| g.binning.x = value)
    }

    /// Set the vertical binning factor.
    pub fn set_bin_y(&mut self, value: u32) -> Result<bool> {
        self.update("BinY", |g| g.binning.y = value)
    }

    fn update(&mut self, param: &'static str, mutate: impl FnOnce(&mut Self)) -> Result<bool> {
        let mut candidate = *self;
        mutate(&mut candidate);
        if candidate == *self {
            return Ok(false);
        }

        candidate.check_binning(param)?;
        if candidate.region != self.region {
            candidate.check_region(param)?;
        }

        *self = candidate;
        Ok(true)
    }

    fn check_binning(&self, param: &'static str) -> Result<()> {
        if self.binning.x == 0 || self.binning.y == 0 {
            return Err(PdvError::validation(param, "binning must be > 0"));
        }
        Ok(())
    }

    fn check_region(&self, param: &'static str) -> Result<()> {
        let r = &self.region;
        if self.width == 0 || self.height == 0 {
            return Err(PdvError::validation(
                param,
                "sensor size unknown until the camera is connected",
            ));
        }
        if r.size_x == 0 || r.size_y == 0 {
            return Err(PdvError::validation(param, "region size must be > 0"));
        }
        if u64::from(r.min_x) + u64::from(r.size_x) > u64::from(self.width) {
            return Err(PdvError::validation(
                param,
                format!(
                    "MinX {} + SizeX {} exceeds sensor width {}",
                    r.min_x, r.size_x, self.width
                ),
            ));
        }
        if u64::from(r.min_y) + u64::from(r.size_y) > u64::from(self.height) {
            return Err(PdvError::validation(
                param,
                format!(
                    "MinY {} + SizeY {} exceeds sensor height {}",
                    r.min_y, r.size_y, self.height
                ),
            ));
        }
        Ok(())
    }
}
