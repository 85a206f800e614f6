//! Shared frame buffer pool.
//!
//! One `BufferPool` is shared by every camera in the process. Frames of
//! different sizes come out of the same pool, so buffers are handed out by
//! capacity: a free buffer that is large enough is reused, otherwise a new
//! one is allocated as long as the pool's buffer and memory limits allow.
//! A limit of 0 means unlimited.
//!
//! All accounting runs under one exclusive lock. Copying pixel data into an
//! acquired buffer happens outside it.
//!
//! ## Memory Flow
//!
//! ```text
//! 1. try_acquire(len) returns a PooledBuffer sized to len
//! 2. The pipeline copies (or de-interleaves) raw bytes into it
//! 3. freeze() wraps it in bytes::Bytes without copying
//! 4. Bytes clones travel with the OutputFrame to every consumer
//! 5. When the last clone drops, the buffer goes back on the free list
//! ```

use crate::error::{PdvError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

struct PoolState {
    free: Vec<Vec<u8>>,
    outstanding: usize,
    allocated_buffers: usize,
    memory_bytes: usize,
}

struct PoolInner {
    state: Mutex<PoolState>,
    max_buffers: usize,
    max_memory: usize,
    total_acquires: AtomicU64,
    total_returns: AtomicU64,
}

impl PoolInner {
    fn release(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        state.free.push(buffer);
        self.total_returns.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of pool accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Buffers currently held by frames.
    pub outstanding: usize,
    /// Buffers on the free list.
    pub free: usize,
    /// Buffers allocated in total (outstanding + free).
    pub allocated_buffers: usize,
    /// Bytes allocated in total.
    pub memory_bytes: usize,
    /// Acquisitions since creation.
    pub total_acquires: u64,
    /// Returns since creation.
    pub total_returns: u64,
}

/// Pool of reusable byte buffers shared across cameras.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool with the given limits (0 = unlimited).
    #[must_use]
    pub fn new(max_buffers: usize, max_memory: usize) -> Self {
        info!(max_buffers, max_memory_mb = max_memory as f64 / (1024.0 * 1024.0), "BufferPool created");

        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    free: Vec::new(),
                    outstanding: 0,
                    allocated_buffers: 0,
                    memory_bytes: 0,
                }),
                max_buffers,
                max_memory,
                total_acquires: AtomicU64::new(0),
                total_returns: AtomicU64::new(0),
            }),
        }
    }

    /// Pool without limits.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(0, 0)
    }

    /// Take a zero-filled buffer of exactly `len` bytes.
    ///
    /// Fails with [`PdvError::Allocation`] when the limits leave no room.
    pub fn try_acquire(&self, len: usize) -> Result<PooledBuffer> {
        let mut buffer = {
            let mut state = self.inner.state.lock();
            let buffer = self.take_or_allocate(&mut state, len)?;
            state.outstanding += 1;
            buffer
        };
        self.inner.total_acquires.fetch_add(1, Ordering::Relaxed);

        buffer.resize(len, 0);
        Ok(PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(&self.inner),
        })
    }

    fn take_or_allocate(&self, state: &mut PoolState, len: usize) -> Result<Vec<u8>> {
        if let Some(idx) = state.free.iter().position(|b| b.capacity() >= len) {
            return Ok(state.free.swap_remove(idx));
        }

        // Nothing big enough is free. Make room by discarding free buffers
        // until a new allocation fits both limits.
        loop {
            let buffers_ok = self.inner.max_buffers == 0 || state.allocated_buffers < self.inner.max_buffers;
            let memory_ok = self.inner.max_memory == 0 || state.memory_bytes + len <= self.inner.max_memory;
            if buffers_ok && memory_ok {
                break;
            }
            match state.free.pop() {
                Some(discarded) => {
                    state.allocated_buffers -= 1;
                    state.memory_bytes -= discarded.capacity();
                    debug!(capacity = discarded.capacity(), "Discarded free buffer to make room");
                }
                None => {
                    return Err(PdvError::Allocation(format!(
                        "{len} bytes requested with {} buffers ({} bytes) outstanding",
                        state.outstanding, state.memory_bytes
                    )));
                }
            }
        }

        let buffer = Vec::with_capacity(len);
        state.allocated_buffers += 1;
        state.memory_bytes += buffer.capacity();
        Ok(buffer)
    }

    /// Current accounting.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            outstanding: state.outstanding,
            free: state.free.len(),
            allocated_buffers: state.allocated_buffers,
            memory_bytes: state.memory_bytes,
            total_acquires: self.inner.total_acquires.load(Ordering::Relaxed),
            total_returns: self.inner.total_returns.load(Ordering::Relaxed),
        }
    }

    /// Buffers currently held by frames.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.state.lock().outstanding
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("max_buffers", &self.inner.max_buffers)
            .field("max_memory", &self.inner.max_memory)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A buffer taken from the pool. Returned automatically on drop.
pub struct PooledBuffer {
    buffer: Option<Vec<u8>>,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    /// The buffer contents.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or(&[])
    }

    /// Mutable access for filling the buffer.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buffer.as_deref_mut().unwrap_or(&mut [])
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// True for a zero-length buffer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Convert into `Bytes` without copying.
    ///
    /// The buffer returns to the pool when the last `Bytes` clone drops.
    #[must_use]
    pub fn freeze(self) -> Bytes {
        Bytes::from_owner(self)
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.release(buffer);
        }
    }
}
