//! Bounded output queue
//!
//! FIFO of compressed units shared between the producing pipeline thread and
//! the delivery side. Capacity is fixed; what happens on overflow is decided
//! by [`DropPolicy`]. Surviving units are never reordered.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::frame::CompressedUnit;
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;

/// Overflow policy for a full queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Discard the unit being pushed, keep the queued ones
    #[default]
    DropNewest,
    /// Evict the oldest queued unit to make room
    DropOldest,
}

/// What `push` did with the unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queue was full; the pushed unit was discarded
    DroppedNewest,
    /// Queue was full; the oldest unit was discarded and the new one queued
    EvictedOldest,
}

impl PushOutcome {
    /// Whether the pushed unit is now in the queue
    pub fn is_queued(&self) -> bool {
        !matches!(self, PushOutcome::DroppedNewest)
    }
}

/// Queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: u64,
    pub popped: u64,
    pub dropped: u64,
}

struct Inner {
    units: VecDeque<CompressedUnit>,
    stats: QueueStats,
}

pub struct OutputQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    policy: DropPolicy,
    throttler: LogThrottler,
}

impl OutputQueue {
    pub fn new(capacity: usize, policy: DropPolicy) -> Result<Self> {
        if capacity == 0 {
            return Err(AppError::Config("Queue capacity must be >= 1".to_string()));
        }
        debug!("Output queue: capacity={}, policy={:?}", capacity, policy);
        Ok(Self {
            inner: Mutex::new(Inner {
                units: VecDeque::with_capacity(capacity),
                stats: QueueStats::default(),
            }),
            capacity,
            policy,
            throttler: LogThrottler::with_secs(5),
        })
    }

    /// Push a unit, applying the drop policy when full
    pub fn push(&self, unit: CompressedUnit) -> PushOutcome {
        let (outcome, dropped_seq) = {
            let mut inner = self.inner.lock();
            inner.stats.pushed += 1;
            if inner.units.len() < self.capacity {
                inner.units.push_back(unit);
                (PushOutcome::Queued, None)
            } else {
                inner.stats.dropped += 1;
                match self.policy {
                    DropPolicy::DropNewest => (PushOutcome::DroppedNewest, Some(unit.sequence)),
                    DropPolicy::DropOldest => {
                        let evicted = inner.units.pop_front().map(|u| u.sequence);
                        inner.units.push_back(unit);
                        (PushOutcome::EvictedOldest, evicted)
                    }
                }
            }
        };

        // Log outside the lock
        if let Some(sequence) = dropped_seq {
            if let Some(suppressed) = self.throttler.check("queue_full") {
                if suppressed > 0 {
                    warn!(
                        "Output queue full ({}), dropped unit {} ({} more drops suppressed)",
                        self.capacity, sequence, suppressed
                    );
                } else {
                    warn!("Output queue full ({}), dropped unit {}", self.capacity, sequence);
                }
            }
        }
        outcome
    }

    pub fn try_pop(&self) -> Option<CompressedUnit> {
        let mut inner = self.inner.lock();
        let unit = inner.units.pop_front()?;
        inner.stats.popped += 1;
        Some(unit)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().units.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Discard all queued units, returning how many were removed
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let removed = inner.units.len();
        inner.units.clear();
        removed
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.lock().stats
    }
}
