//! Operator-visible status, counters and loop timers.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Camera status published to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CameraStatus {
    /// Connected, not acquiring.
    Idle,
    /// Reconfiguring the device.
    Initializing,
    /// Waiting for the next frame.
    Waiting,
    /// A run is in progress.
    Acquiring,
    /// The last reconfigure failed; retrying.
    Error,
    /// No device.
    Disconnected,
}

impl fmt::Display for CameraStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Acquire worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[allow(missing_docs)]
pub enum WorkerState {
    Idle,
    Reconfiguring,
    WaitingForWork,
    Starting,
    AcquiringFrame,
    Stopping,
    Exited,
}

/// Monotonic counters.
#[derive(Debug, Default)]
pub struct AcquisitionStats {
    frames_received: AtomicU64,
    frames_delivered: AtomicU64,
    images_this_run: AtomicU64,
    timeouts: AtomicU64,
    sync_warnings: AtomicU64,
    dropped: AtomicU64,
    runs: AtomicU64,
    reconfigures: AtomicU64,
}

/// Snapshot of [`AcquisitionStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Raw buffers received from the grabber.
    pub frames_received: u64,
    /// Frames handed to the sink.
    pub frames_delivered: u64,
    /// Frames delivered in the current (or last) run.
    pub images_this_run: u64,
    /// Waits that timed out.
    pub timeouts: u64,
    /// Frames whose sync check failed.
    pub sync_warnings: u64,
    /// Frames dropped by sync policy, timestamp or pipeline failures.
    pub dropped: u64,
    /// Acquisition runs started.
    pub runs: u64,
    /// Successful reconfigures.
    pub reconfigures: u64,
}

macro_rules! counter {
    ($($inc:ident => $field:ident),* $(,)?) => {
        $(
            #[doc = concat!("Increment `", stringify!($field), "`.")]
            pub fn $inc(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl AcquisitionStats {
    counter! {
        frame_received => frames_received,
        frame_delivered => frames_delivered,
        image_in_run => images_this_run,
        timeout => timeouts,
        sync_warning => sync_warnings,
        frame_dropped => dropped,
        reconfigured => reconfigures,
    }

    /// A run started: count it and reset the per-run counter.
    pub fn run_started(&self) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.images_this_run.store(0, Ordering::Relaxed);
    }

    /// Current values.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            images_this_run: self.images_this_run.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            sync_warnings: self.sync_warnings.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            runs: self.runs.load(Ordering::Relaxed),
            reconfigures: self.reconfigures.load(Ordering::Relaxed),
        }
    }
}

/// Running statistics of one loop interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TimerStats {
    /// Samples recorded.
    pub count: u64,
    /// Most recent sample.
    pub last: Duration,
    /// Largest sample.
    pub max: Duration,
    /// Sum of all samples.
    pub total: Duration,
}

impl TimerStats {
    /// Mean sample, zero when empty.
    #[must_use]
    pub fn mean(&self) -> Duration {
        match u32::try_from(self.count) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.total / n,
            Err(_) => Duration::from_secs_f64(self.total.as_secs_f64() / self.count as f64),
        }
    }

    fn record(&mut self, sample: Duration) {
        self.count += 1;
        self.last = sample;
        self.max = self.max.max(sample);
        self.total += sample;
    }
}

/// Diagnostic timers of the acquire loop.
#[derive(Debug, Default)]
pub struct LoopTimers {
    inner: Mutex<LoopTimersInner>,
}

#[derive(Debug, Default)]
struct LoopTimersInner {
    reacquire: TimerStats,
    rearm: TimerStats,
    process: TimerStats,
    last_wait: Option<Instant>,
}

/// Snapshot of [`LoopTimers`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TimingSnapshot {
    /// From one wait to the next.
    pub reacquire: TimerStats,
    /// From buffer arrival to the rearm.
    pub rearm: TimerStats,
    /// From buffer arrival to delivery.
    pub process: TimerStats,
}

impl LoopTimers {
    /// A wait for the next buffer begins.
    pub fn wait_started(&self, now: Instant) {
        let mut inner = self.inner.lock();
        if let Some(prev) = inner.last_wait.replace(now) {
            inner.reacquire.record(now - prev);
        }
    }

    /// The next transfer was rearmed `since` the buffer arrived.
    pub fn rearmed(&self, since: Instant) {
        self.inner.lock().rearm.record(since.elapsed());
    }

    /// A frame was delivered `since` the buffer arrived.
    pub fn processed(&self, since: Instant) {
        self.inner.lock().process.record(since.elapsed());
    }

    /// Forget the wait-to-wait anchor at the end of a run.
    pub fn run_ended(&self) {
        self.inner.lock().last_wait = None;
    }

    /// Clear all timers.
    pub fn reset(&self) {
        *self.inner.lock() = LoopTimersInner::default();
    }

    /// Current values.
    #[must_use]
    pub fn snapshot(&self) -> TimingSnapshot {
        let inner = self.inner.lock();
        TimingSnapshot {
            reacquire: inner.reacquire,
            rearm: inner.rearm,
            process: inner.process,
        }
    }
}
