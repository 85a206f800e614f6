//! Raw-buffer to output-frame conversion.
//!
//! [`FramePipeline::convert`] copies one borrowed ring slot into a pool
//! buffer, undoing the sensor's line interleave if configured, and attaches
//! the geometry metadata the downstream consumer needs. The returned
//! [`OutputFrame`] owns its pixels; the ring slot can be recycled as soon as
//! `convert` returns.

use crate::device::{FrameSyncStatus, RawFrame};
use crate::error::{PdvError, Result};
use crate::geometry::Geometry;
use crate::pool::BufferPool;
use crate::timestamp::FrameStamp;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Order in which the sensor delivers lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineLayout {
    /// Lines arrive top to bottom.
    #[default]
    Sequential,
    /// Lines arrive in pairs from the middle outwards: the first line of
    /// each pair fills the top half moving up, the second fills the bottom
    /// half moving down.
    MidTopInterleaved,
}

/// A completed frame, owned by whoever holds it.
#[derive(Debug, Clone)]
pub struct OutputFrame {
    /// Monotonic per-camera frame id, starting at 1.
    pub id: u64,
    /// Columns.
    pub width: u32,
    /// Rows.
    pub height: u32,
    /// Bits per pixel reported by the sensor.
    pub bit_depth: u32,
    /// 1 or 2.
    pub bytes_per_pixel: usize,
    /// Column of the region's origin on the sensor.
    pub offset_x: u32,
    /// Row of the region's origin on the sensor.
    pub offset_y: u32,
    /// Horizontal binning.
    pub bin_x: u32,
    /// Vertical binning.
    pub bin_y: u32,
    /// Acquisition time.
    pub timestamp: DateTime<Utc>,
    /// Timing-system pulse id.
    pub pulse_id: u32,
    /// Outcome of the frame-sync check.
    pub sync: FrameSyncStatus,
    /// Pixel data, row-major, little-endian for 16-bit pixels.
    pub pixels: Bytes,
}

impl OutputFrame {
    /// Bytes of row `y`.
    #[must_use]
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        let stride = self.width as usize * self.bytes_per_pixel;
        let start = y as usize * stride;
        self.pixels.get(start..start + stride)
    }

    /// Pixel value at (`x`, `y`).
    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width {
            return None;
        }
        let row = self.row(y)?;
        let at = x as usize * self.bytes_per_pixel;
        match self.bytes_per_pixel {
            1 => row.get(at).map(|&b| u16::from(b)),
            _ => row
                .get(at..at + 2)
                .map(|b| u16::from_le_bytes([b[0], b[1]])),
        }
    }
}

/// Converts raw ring slots into output frames.
#[derive(Debug)]
pub struct FramePipeline {
    pool: BufferPool,
    layout: LineLayout,
    next_id: AtomicU64,
}

impl FramePipeline {
    /// Pipeline drawing buffers from `pool`.
    #[must_use]
    pub fn new(pool: BufferPool, layout: LineLayout) -> Self {
        Self {
            pool,
            layout,
            next_id: AtomicU64::new(1),
        }
    }

    /// The shared pool.
    #[must_use]
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Copy `raw` into an owned frame described by `geometry`.
    pub fn convert(
        &self,
        raw: &RawFrame<'_>,
        geometry: &Geometry,
        stamp: FrameStamp,
        sync: FrameSyncStatus,
    ) -> Result<OutputFrame> {
        let width = geometry.region.size_x;
        let height = geometry.region.size_y;
        if width == 0 || height == 0 {
            return Err(PdvError::InvalidGeometry { width, height });
        }

        let bytes_per_pixel = geometry.bytes_per_pixel();
        let row_bytes = width as usize * bytes_per_pixel;
        let len = row_bytes * height as usize;
        if raw.len() < len {
            return Err(PdvError::ShortBuffer {
                expected: len,
                actual: raw.len(),
            });
        }

        let mut buffer = self.pool.try_acquire(len)?;
        let src = &raw.data()[..len];
        match self.layout {
            LineLayout::Sequential => buffer.as_mut_slice().copy_from_slice(src),
            LineLayout::MidTopInterleaved => {
                deinterleave_mid_top(src, buffer.as_mut_slice(), row_bytes);
            }
        }

        Ok(OutputFrame {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            width,
            height,
            bit_depth: geometry.bit_depth,
            bytes_per_pixel,
            offset_x: geometry.region.min_x,
            offset_y: geometry.region.min_y,
            bin_x: geometry.binning.x,
            bin_y: geometry.binning.y,
            timestamp: stamp.time,
            pulse_id: stamp.pulse_id,
            sync,
            pixels: buffer.freeze(),
        })
    }
}

/// Undo the mid-top line interleave.
///
/// `src` and `dst` hold the same number of whole rows of `row_bytes` each.
/// Source line `2i` lands on row `mid - 1 - i`, line `2i + 1` on row
/// `mid + i`. With an odd row count the last source line is the bottom row.
pub fn deinterleave_mid_top(src: &[u8], dst: &mut [u8], row_bytes: usize) {
    if row_bytes == 0 {
        return;
    }
    let rows = src.len().min(dst.len()) / row_bytes;
    let mid = rows / 2;

    let mut lines = src.chunks_exact(row_bytes);
    for i in 0..mid {
        let (Some(upper), Some(lower)) = (lines.next(), lines.next()) else {
            break;
        };
        let top = (mid - 1 - i) * row_bytes;
        let bottom = (mid + i) * row_bytes;
        dst[top..top + row_bytes].copy_from_slice(upper);
        dst[bottom..bottom + row_bytes].copy_from_slice(lower);
    }
    if rows % 2 == 1 {
        if let Some(last) = lines.next() {
            let at = (rows - 1) * row_bytes;
            dst[at..at + row_bytes].copy_from_slice(last);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RingSlot;
    use crate::geometry::Region;
    use chrono::TimeZone;

    fn geometry(width: u32, height: u32, depth: u32) -> Geometry {
        let mut g = Geometry::default();
        g.apply_readback(width, height, depth);
        g
    }

    fn stamp() -> FrameStamp {
        FrameStamp::from_time(Utc.timestamp_opt(1_700_000_000, 7).single().unwrap())
    }

    const SYNCED: FrameSyncStatus = FrameSyncStatus::Ok { counter: 0 };

    #[test]
    fn deinterleave_restores_row_order() {
        // Rows 0..6 tagged with their final index, in arrival order.
        let arrival = [2u8, 3, 1, 4, 0, 5];
        let mut out = [0u8; 6];
        deinterleave_mid_top(&arrival, &mut out, 1);
        assert_eq!(out, [0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn deinterleave_multi_byte_rows_odd_count() {
        let arrival = [1u8, 1, 2, 2, 0, 0, 3, 3, 4, 4];
        let mut out = [9u8; 10];
        deinterleave_mid_top(&arrival, &mut out, 2);
        assert_eq!(out, [0, 0, 1, 1, 2, 2, 3, 3, 4, 4]);
    }

    #[test]
    fn convert_copies_and_tags_metadata() {
        let pool = BufferPool::unbounded();
        let pipeline = FramePipeline::new(pool.clone(), LineLayout::Sequential);
        let mut g = geometry(4, 2, 16);
        g.binning.x = 2;

        let data: Vec<u8> = (0..16).collect();
        let raw = RawFrame::new(RingSlot(0), &data);
        let frame = pipeline.convert(&raw, &g, stamp(), SYNCED).unwrap();

        assert_eq!(frame.id, 1);
        assert_eq!((frame.width, frame.height), (4, 2));
        assert_eq!(frame.bytes_per_pixel, 2);
        assert_eq!(frame.bin_x, 2);
        assert_eq!(&frame.pixels[..], &data[..]);
        assert_eq!(frame.pixel(1, 0), Some(u16::from_le_bytes([2, 3])));
        assert_eq!(pool.outstanding(), 1);

        let next = pipeline.convert(&raw, &g, stamp(), SYNCED).unwrap();
        assert_eq!(next.id, 2);
        drop(frame);
        drop(next);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn convert_uses_region_and_offsets() {
        let pipeline = FramePipeline::new(BufferPool::unbounded(), LineLayout::Sequential);
        let mut g = geometry(8, 8, 8);
        g.region = Region {
            min_x: 2,
            min_y: 3,
            size_x: 2,
            size_y: 2,
        };
        let data = [7u8; 4];
        let frame = pipeline
            .convert(&RawFrame::new(RingSlot(1), &data), &g, stamp(), SYNCED)
            .unwrap();
        assert_eq!(frame.pixels.len(), 4);
        assert_eq!((frame.offset_x, frame.offset_y), (2, 3));
        assert_eq!(frame.pixel(1, 1), Some(7));
    }

    #[test]
    fn zero_dimension_is_invalid_geometry() {
        let pipeline = FramePipeline::new(BufferPool::unbounded(), LineLayout::Sequential);
        let g = Geometry::default();
        let result = pipeline.convert(&RawFrame::new(RingSlot(0), &[]), &g, stamp(), SYNCED);
        assert!(matches!(result, Err(PdvError::InvalidGeometry { .. })));
    }

    #[test]
    fn short_raw_buffer_is_rejected() {
        let pipeline = FramePipeline::new(BufferPool::unbounded(), LineLayout::Sequential);
        let g = geometry(4, 4, 8);
        let data = [0u8; 8];
        let result = pipeline.convert(&RawFrame::new(RingSlot(0), &data), &g, stamp(), SYNCED);
        assert!(matches!(
            result,
            Err(PdvError::ShortBuffer {
                expected: 16,
                actual: 8
            })
        ));
    }

    #[test]
    fn exhausted_pool_is_allocation_error() {
        let pool = BufferPool::new(1, 0);
        let pipeline = FramePipeline::new(pool, LineLayout::Sequential);
        let g = geometry(2, 2, 8);
        let data = [0u8; 4];
        let raw = RawFrame::new(RingSlot(0), &data);
        let held = pipeline.convert(&raw, &g, stamp(), SYNCED).unwrap();
        assert!(matches!(
            pipeline.convert(&raw, &g, stamp(), SYNCED),
            Err(PdvError::Allocation(_))
        ));
        drop(held);
        assert!(pipeline.convert(&raw, &g, stamp(), SYNCED).is_ok());
    }
}
