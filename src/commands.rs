//! Host parameter writes.
//!
//! Every writable parameter is a [`ParamKey`]. [`CommandTable`] maps each key
//! to a handler that decodes the [`ParamValue`] and calls the matching
//! [`EdtCamera`] setter. Serial readback keys (`Ser*`) route to the same
//! setters as their host equivalents.

use crate::acquisition::ImageMode;
use crate::camera::EdtCamera;
use crate::error::{PdvError, Result};
use crate::geometry::TriggerMode;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Writable camera parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ParamKey {
    Acquire,
    ImageMode,
    NumImages,
    BinX,
    BinY,
    MinX,
    MinY,
    SizeX,
    SizeY,
    TriggerMode,
    Gain,
    TimestampEvent,
    SerMinX,
    SerMinY,
    SerSizeX,
    SerSizeY,
    SerTriggerMode,
    SerAcquireTime,
}

impl ParamKey {
    /// Every key, in table order.
    pub const ALL: [ParamKey; 18] = [
        ParamKey::Acquire,
        ParamKey::ImageMode,
        ParamKey::NumImages,
        ParamKey::BinX,
        ParamKey::BinY,
        ParamKey::MinX,
        ParamKey::MinY,
        ParamKey::SizeX,
        ParamKey::SizeY,
        ParamKey::TriggerMode,
        ParamKey::Gain,
        ParamKey::TimestampEvent,
        ParamKey::SerMinX,
        ParamKey::SerMinY,
        ParamKey::SerSizeX,
        ParamKey::SerSizeY,
        ParamKey::SerTriggerMode,
        ParamKey::SerAcquireTime,
    ];

    /// Host-side parameter name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ParamKey::Acquire => "Acquire",
            ParamKey::ImageMode => "ImageMode",
            ParamKey::NumImages => "NumImages",
            ParamKey::BinX => "BinX",
            ParamKey::BinY => "BinY",
            ParamKey::MinX => "MinX",
            ParamKey::MinY => "MinY",
            ParamKey::SizeX => "SizeX",
            ParamKey::SizeY => "SizeY",
            ParamKey::TriggerMode => "TriggerMode",
            ParamKey::Gain => "Gain",
            ParamKey::TimestampEvent => "TimestampEvent",
            ParamKey::SerMinX => "SerMinX",
            ParamKey::SerMinY => "SerMinY",
            ParamKey::SerSizeX => "SerSizeX",
            ParamKey::SerSizeY => "SerSizeY",
            ParamKey::SerTriggerMode => "SerTriggerMode",
            ParamKey::SerAcquireTime => "SerAcquireTime",
        }
    }

    /// Look a key up by its host-side name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.as_str() == name)
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value written by the host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamValue {
    /// Integer parameter.
    Int(i64),
    /// Floating point parameter.
    Float(f64),
}

impl ParamValue {
    /// Integer value; floats must be integral.
    pub fn as_i64(self, param: &'static str) -> Result<i64> {
        match self {
            ParamValue::Int(v) => Ok(v),
            ParamValue::Float(v) if v.fract() == 0.0 && v.abs() < 9.0e15 => Ok(v as i64),
            ParamValue::Float(v) => Err(PdvError::validation(
                param,
                format!("{v} is not an integer"),
            )),
        }
    }

    /// Non-negative 32-bit value.
    pub fn as_u32(self, param: &'static str) -> Result<u32> {
        let v = self.as_i64(param)?;
        u32::try_from(v).map_err(|_| PdvError::validation(param, format!("{v} is out of range")))
    }

    /// Floating point value.
    #[must_use]
    pub fn as_f64(self) -> f64 {
        match self {
            ParamValue::Int(v) => v as f64,
            ParamValue::Float(v) => v,
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

type Handler = Box<dyn Fn(&EdtCamera, ParamValue) -> Result<()> + Send + Sync>;

/// Dispatch table from [`ParamKey`] to setter.
pub struct CommandTable {
    handlers: HashMap<ParamKey, Handler>,
}

impl CommandTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Install `handler` for `key`, replacing any previous one.
    pub fn register(
        &mut self,
        key: ParamKey,
        handler: impl Fn(&EdtCamera, ParamValue) -> Result<()> + Send + Sync + 'static,
    ) {
        self.handlers.insert(key, Box::new(handler));
    }

    /// The table every camera uses.
    #[must_use]
    pub fn standard() -> Self {
        let mut table = Self::new();

        table.register(ParamKey::Acquire, |cam, v| {
            cam.set_acquiring(v.as_i64("Acquire")? != 0);
            Ok(())
        });
        table.register(ParamKey::ImageMode, |cam, v| {
            cam.set_image_mode(ImageMode::from_index(v.as_i64("ImageMode")?)?);
            Ok(())
        });
        table.register(ParamKey::NumImages, |cam, v| {
            cam.set_num_images(v.as_u32("NumImages")?).map(drop)
        });
        table.register(ParamKey::BinX, |cam, v| cam.set_bin_x(v.as_u32("BinX")?).map(drop));
        table.register(ParamKey::BinY, |cam, v| cam.set_bin_y(v.as_u32("BinY")?).map(drop));

        for key in [ParamKey::MinX, ParamKey::SerMinX] {
            table.register(key, |cam, v| cam.set_min_x(v.as_u32("MinX")?).map(drop));
        }
        for key in [ParamKey::MinY, ParamKey::SerMinY] {
            table.register(key, |cam, v| cam.set_min_y(v.as_u32("MinY")?).map(drop));
        }
        for key in [ParamKey::SizeX, ParamKey::SerSizeX] {
            table.register(key, |cam, v| cam.set_size_x(v.as_u32("SizeX")?).map(drop));
        }
        for key in [ParamKey::SizeY, ParamKey::SerSizeY] {
            table.register(key, |cam, v| cam.set_size_y(v.as_u32("SizeY")?).map(drop));
        }
        for key in [ParamKey::TriggerMode, ParamKey::SerTriggerMode] {
            table.register(key, |cam, v| {
                cam.set_trigger_mode(TriggerMode::from_index(v.as_i64("TriggerMode")?)?);
                Ok(())
            });
        }

        table.register(ParamKey::Gain, |cam, v| cam.set_gain(v.as_f64()));
        table.register(ParamKey::TimestampEvent, |cam, v| {
            cam.set_timestamp_event(v.as_u32("TimestampEvent")?);
            Ok(())
        });
        table.register(ParamKey::SerAcquireTime, |cam, v| {
            cam.set_acquire_time(v.as_f64())
        });

        table
    }

    /// Whether `key` has a handler.
    #[must_use]
    pub fn contains(&self, key: ParamKey) -> bool {
        self.handlers.contains_key(&key)
    }

    /// Run the handler for `key`.
    pub fn dispatch(&self, camera: &EdtCamera, key: ParamKey, value: ParamValue) -> Result<()> {
        let handler = self.handlers.get(&key).ok_or_else(|| {
            PdvError::validation("param", format!("no handler for {key}"))
        })?;
        debug!(camera = %camera.name(), param = %key, ?value, "Parameter write");
        handler(camera, value)
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CommandTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandTable")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}
