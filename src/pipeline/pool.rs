// SPDX-License-Identifier: GPL-3.0-only

//! Fixed-capacity pool of preview buffers
//!
//! The render thread acquires a buffer per frame and hands it to the
//! consumer; dropping the [`PreviewBuffer`] returns its storage. A consumer
//! that holds on to buffers starves the pool, and `acquire` then returns
//! `None` instead of allocating.

use crate::backends::camera::{Dimensions, VideoOrientation};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Default)]
struct PoolState {
    dimensions: Option<Dimensions>,
    generation: u64,
    free: Vec<Vec<u8>>,
    outstanding: usize,
    /// Buffers on loan from earlier generations
    stale_outstanding: usize,
}

impl PoolState {
    fn on_loan(&self) -> usize {
        self.outstanding + self.stale_outstanding
    }
}

#[derive(Debug)]
struct PoolShared {
    capacity: usize,
    state: Mutex<PoolState>,
}

impl PoolShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn give_back(&self, generation: u64, storage: Vec<u8>) {
        let mut state = self.lock();
        if state.generation != generation {
            // Buffer from before a resize; its storage no longer fits
            state.stale_outstanding = state.stale_outstanding.saturating_sub(1);
            return;
        }
        state.outstanding = state.outstanding.saturating_sub(1);
        state.free.push(storage);
    }
}

/// Pool of RGBA buffers sized to the current frame dimensions
#[derive(Debug, Clone)]
pub struct PreviewBufferPool {
    shared: Arc<PoolShared>,
}

impl PreviewBufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                capacity: capacity.max(1),
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Buffers currently held outside the pool, whatever their generation
    pub fn outstanding(&self) -> usize {
        self.shared.lock().on_loan()
    }

    pub fn available(&self) -> usize {
        self.capacity().saturating_sub(self.outstanding())
    }

    pub fn dimensions(&self) -> Option<Dimensions> {
        self.shared.lock().dimensions
    }

    /// Take a buffer for a frame of `dimensions`, or `None` when all
    /// buffers are in use.
    ///
    /// A change of dimensions starts a new generation: free buffers are
    /// discarded and buffers still out are dropped when they come back.
    /// Those buffers keep counting against the capacity until then.
    pub fn acquire(&self, dimensions: Dimensions) -> Option<PreviewBuffer> {
        let mut state = self.shared.lock();

        if state.dimensions != Some(dimensions) {
            debug!(
                from = ?state.dimensions,
                to = %dimensions,
                "Preview pool resized"
            );
            state.dimensions = Some(dimensions);
            state.generation += 1;
            state.free.clear();
            state.stale_outstanding += state.outstanding;
            state.outstanding = 0;
        }

        if state.on_loan() >= self.shared.capacity {
            return None;
        }

        let len = dimensions.width as usize * dimensions.height as usize * 4;
        let data = state.free.pop().unwrap_or_else(|| vec![0; len]);
        state.outstanding += 1;

        Some(PreviewBuffer {
            data,
            dimensions,
            timestamp: Duration::ZERO,
            orientation: VideoOrientation::default(),
            generation: state.generation,
            pool: Arc::downgrade(&self.shared),
        })
    }
}

/// Rendered frame on loan from a [`PreviewBufferPool`]
///
/// Tightly packed RGBA. Dropping it (or calling [`release`](Self::release))
/// returns the storage to the pool.
pub struct PreviewBuffer {
    data: Vec<u8>,
    dimensions: Dimensions,
    timestamp: Duration,
    orientation: VideoOrientation,
    generation: u64,
    pool: Weak<PoolShared>,
}

impl PreviewBuffer {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    pub fn width(&self) -> u32 {
        self.dimensions.width
    }

    pub fn height(&self) -> u32 {
        self.dimensions.height
    }

    /// Timestamp of the captured frame this buffer was rendered from
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    /// Orientation of the captured frame
    pub fn orientation(&self) -> VideoOrientation {
        self.orientation
    }

    pub(crate) fn stamp(&mut self, timestamp: Duration, orientation: VideoOrientation) {
        self.timestamp = timestamp;
        self.orientation = orientation;
    }

    /// Return the buffer to its pool
    pub fn release(self) {}
}

impl fmt::Debug for PreviewBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreviewBuffer")
            .field("dimensions", &self.dimensions)
            .field("timestamp", &self.timestamp)
            .field("orientation", &self.orientation)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl Drop for PreviewBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.give_back(self.generation, std::mem::take(&mut self.data));
        }
    }
}
