//! Downstream frame delivery.
//!
//! The acquire worker calls [`FrameSink::deliver`] once per completed frame,
//! outside every camera lock. Sinks must not block for long: the worker is
//! also the thread that rearms the DMA ring.

use crate::pipeline::OutputFrame;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

/// Receives completed frames.
pub trait FrameSink: Send + Sync {
    /// Take a completed frame.
    fn deliver(&self, frame: Arc<OutputFrame>);
}

impl<F> FrameSink for F
where
    F: Fn(Arc<OutputFrame>) + Send + Sync,
{
    fn deliver(&self, frame: Arc<OutputFrame>) {
        self(frame);
    }
}

/// Sink that throws frames away.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardSink;

impl FrameSink for DiscardSink {
    fn deliver(&self, _frame: Arc<OutputFrame>) {}
}

/// Fans frames out over tokio channels.
///
/// The broadcast side is lossy: slow subscribers see `Lagged`. The optional
/// reliable side is an mpsc channel that blocks the worker when full, so it
/// should only be used by a consumer that keeps up (a writer, typically).
#[derive(Debug)]
pub struct ChannelSink {
    frame_tx: broadcast::Sender<Arc<OutputFrame>>,
    reliable_tx: Option<mpsc::Sender<Arc<OutputFrame>>>,
}

impl ChannelSink {
    /// Broadcast-only sink holding up to `capacity` frames per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (frame_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            frame_tx,
            reliable_tx: None,
        }
    }

    /// Add a lossless mpsc consumer and return its receiver.
    pub fn with_reliable(mut self, capacity: usize) -> (Self, mpsc::Receiver<Arc<OutputFrame>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.reliable_tx = Some(tx);
        (self, rx)
    }

    /// Subscribe to the broadcast stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<OutputFrame>> {
        self.frame_tx.subscribe()
    }
}

impl FrameSink for ChannelSink {
    fn deliver(&self, frame: Arc<OutputFrame>) {
        if let Some(ref tx) = self.reliable_tx {
            if tx.blocking_send(frame.clone()).is_err() {
                trace!(id = frame.id, "Reliable consumer gone");
            }
        }
        // No subscribers is not an error.
        let _ = self.frame_tx.send(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{FrameSyncStatus, RawFrame, RingSlot};
    use crate::geometry::Geometry;
    use crate::pipeline::{FramePipeline, LineLayout};
    use crate::pool::BufferPool;
    use crate::timestamp::{SystemClock, TimeSource};

    fn frame(pool: &BufferPool) -> Arc<OutputFrame> {
        let pipeline = FramePipeline::new(pool.clone(), LineLayout::Sequential);
        let mut g = Geometry::default();
        g.apply_readback(2, 2, 8);
        let data = [1u8, 2, 3, 4];
        let stamp = SystemClock.stamp(0).unwrap();
        Arc::new(
            pipeline
                .convert(
                    &RawFrame::new(RingSlot(0), &data),
                    &g,
                    stamp,
                    FrameSyncStatus::Ok { counter: 1 },
                )
                .unwrap(),
        )
    }

    #[test]
    fn closure_sink_receives_frames() {
        let pool = BufferPool::unbounded();
        let seen = parking_lot::Mutex::new(Vec::new());
        let sink = |f: Arc<OutputFrame>| seen.lock().push(f.id);
        sink.deliver(frame(&pool));
        assert_eq!(*seen.lock(), vec![1]);
    }

    #[test]
    fn discard_sink_releases_buffer() {
        let pool = BufferPool::unbounded();
        DiscardSink.deliver(frame(&pool));
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn channel_sink_fans_out() {
        let pool = BufferPool::unbounded();
        let (sink, mut reliable) = ChannelSink::new(4).with_reliable(4);
        let mut rx = sink.subscribe();

        sink.deliver(frame(&pool));

        assert_eq!(rx.try_recv().unwrap().pixels.len(), 4);
        assert_eq!(reliable.try_recv().unwrap().id, 1);
    }
}
