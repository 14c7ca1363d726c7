//! Telemetry Buffer
//!
//! Bounded FIFO of recent readings shared between the device path (writer)
//! and the render / uplink paths (readers).

use crate::domain::models::Reading;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Default number of retained readings (one chart width)
pub const DEFAULT_CAPACITY: usize = 100;

/// Per-axis view of the buffer, one `(sequence, value)` series per chart.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AxisSeries {
    pub x: Vec<(u64, f32)>,
    pub y: Vec<(u64, f32)>,
    pub z: Vec<(u64, f32)>,
}

struct Inner {
    readings: VecDeque<Reading>,
    evicted: u64,
}

pub struct TelemetryBuffer {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl TelemetryBuffer {
    /// Create a buffer holding at most `capacity` readings (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                readings: VecDeque::with_capacity(capacity),
                evicted: 0,
            }),
        }
    }

    /// Append a reading, evicting and returning the oldest one at capacity.
    pub fn push(&self, reading: Reading) -> Option<Reading> {
        let mut inner = self.lock();
        let evicted = if inner.readings.len() == self.capacity {
            inner.evicted += 1;
            inner.readings.pop_front()
        } else {
            None
        };
        inner.readings.push_back(reading);
        evicted
    }

    /// Owned copy of the buffer in push order.
    pub fn snapshot(&self) -> Vec<Reading> {
        self.lock().readings.iter().copied().collect()
    }

    /// Owned per-axis copy of the buffer in push order.
    pub fn axis_snapshot(&self) -> AxisSeries {
        let inner = self.lock();
        let mut series = AxisSeries {
            x: Vec::with_capacity(inner.readings.len()),
            y: Vec::with_capacity(inner.readings.len()),
            z: Vec::with_capacity(inner.readings.len()),
        };
        for r in &inner.readings {
            series.x.push((r.sequence, r.x));
            series.y.push((r.sequence, r.y));
            series.z.push((r.sequence, r.z));
        }
        series
    }

    pub fn latest(&self) -> Option<Reading> {
        self.lock().readings.back().copied()
    }

    pub fn len(&self) -> usize {
        self.lock().readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().readings.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of readings dropped by capacity eviction since creation
    pub fn evicted(&self) -> u64 {
        self.lock().evicted
    }

    /// Drop every retained reading. Used when the bridge stops.
    pub fn clear(&self) {
        self.lock().readings.clear();
    }

    // A panic while holding the lock cannot leave the deque half-updated,
    // so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for TelemetryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
