//! Outbound events and the bounded delivery queue
//!
//! The core emits two event families outward: per-location data updates
//! (`ThermalGridUpdate`/`SensorUpdate`) plus `Fusion` decisions, and
//! `Health` transitions. Consumers subscribe over TCP (see
//! [`streaming`](crate::streaming)); the core never touches a UI.
//!
//! Delivery is lossy by design: the queue is bounded and drops the OLDEST
//! entry when full, favoring recency over completeness - a stale grid is
//! worthless once a fresher one exists.

use crate::fusion::FusionResult;
use crate::health::DeviceHealthRecord;
use crate::thermal::ThermalGrid;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Events published to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// A calibrated thermal grid for a logical location
    ThermalGridUpdate { location: String, grid: ThermalGrid },
    /// ADC readings for a logical location
    SensorUpdate {
        location: String,
        timestamp_us: u64,
        values: BTreeMap<String, i64>,
    },
    /// A fresh fusion decision for a logical location
    Fusion {
        location: String,
        result: FusionResult,
    },
    /// A device health transition
    Health {
        device: String,
        record: DeviceHealthRecord,
    },
}

struct QueueInner {
    items: VecDeque<Event>,
    dropped: u64,
}

/// Bounded multi-producer event queue with drop-oldest overflow
pub struct EventQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                dropped: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue an event, evicting the oldest entry if the queue is full
    pub fn push(&self, event: Event) {
        let mut inner = self.inner.lock();
        if inner.items.len() >= self.capacity {
            inner.items.pop_front();
            inner.dropped += 1;
            if inner.dropped == 1 || inner.dropped % 1000 == 0 {
                log::warn!(
                    "Event queue full, dropping oldest ({} dropped so far)",
                    inner.dropped
                );
            }
        }
        inner.items.push_back(event);
    }

    /// Move up to `max` events into `out`; returns how many were taken
    pub fn drain_into(&self, out: &mut Vec<Event>, max: usize) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.items.len().min(max);
        out.extend(inner.items.drain(..n));
        n
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total events evicted since startup
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }
}
