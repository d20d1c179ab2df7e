//! Delivery bridge
//!
//! Hands compressed units from the pipeline's producer thread to a
//! single-threaded, cooperative consumer. The consumer pulls with
//! [`DeliveryBridge::retrieve_unit`], which never blocks: it either copies a
//! queued unit into the caller's buffer or records that a request is
//! outstanding. When the producer queues a unit while a request is
//! outstanding, the bridge raises exactly one wakeup through the consumer's
//! [`EventTrigger`].
//!
//! State machine:
//!
//! ```text
//!            pull, queue empty              unit queued
//!   Idle ─────────────────────────> AwaitingData ─────────────> DataReady
//!    ^  <──────── cancel() ────────────┘                            │
//!    └──────────────────────── pull (unit delivered) <──────────────┘
//! ```
//!
//! The consumer arms `AwaitingData` before re-checking the queue, and the
//! producer queues before testing for `AwaitingData`, so a unit can never
//! slip between the two without a wakeup.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use tokio::sync::Notify;
use tracing::{debug, trace};

use super::trigger::EventTrigger;
use crate::video::frame::CompressedUnit;
use crate::video::queue::OutputQueue;

/// Producer-side "unit available" callback
pub type UnitCallback = Arc<dyn Fn() + Send + Sync>;

const IDLE: u8 = 0;
const AWAITING_DATA: u8 = 1;
const DATA_READY: u8 = 2;

/// Bridge state as seen by the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// No outstanding request
    Idle,
    /// A pull found the queue empty; waiting for the producer
    AwaitingData,
    /// The producer raised a wakeup; the next pull will succeed
    DataReady,
}

impl BridgeState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            AWAITING_DATA => BridgeState::AwaitingData,
            DATA_READY => BridgeState::DataReady,
            _ => BridgeState::Idle,
        }
    }
}

/// One unit copied out to the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Bytes copied into the caller's buffer
    pub bytes_written: usize,
    /// Bytes of the unit that did not fit
    pub truncated_bytes: usize,
    /// Wall-clock time the unit was handed over
    pub presentation_time: SystemTime,
    /// Capture time of the source frame
    pub capture_ts: Instant,
    pub sequence: u64,
}

/// Result of a pull
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullResult {
    Delivered(Delivery),
    /// Nothing queued; a wakeup will follow when a unit arrives
    Pending,
}

struct Shared {
    state: AtomicU8,
    trigger: Arc<dyn EventTrigger>,
    /// Internal signal used by `next_unit`
    wake: Notify,
    wakeups: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    /// Called by the producer after a unit has been queued
    fn on_unit(&self) {
        if self
            .state
            .compare_exchange(AWAITING_DATA, DATA_READY, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.wakeups.fetch_add(1, Ordering::Relaxed);
            trace!("Delivery bridge: raising wakeup");
            self.wake.notify_one();
            self.trigger.trigger();
        }
    }
}

pub struct DeliveryBridge {
    queue: Arc<OutputQueue>,
    shared: Arc<Shared>,
}

impl DeliveryBridge {
    pub fn new(queue: Arc<OutputQueue>, trigger: Arc<dyn EventTrigger>) -> Self {
        Self {
            queue,
            shared: Arc::new(Shared {
                state: AtomicU8::new(IDLE),
                trigger,
                wake: Notify::new(),
                wakeups: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Callback for the producer to invoke once per queued unit
    ///
    /// Safe to call from any thread; it only raises a wakeup when a request
    /// is outstanding.
    pub fn unit_notifier(&self) -> UnitCallback {
        let shared = self.shared.clone();
        Arc::new(move || shared.on_unit())
    }

    /// Pull the next unit into `out` without blocking
    ///
    /// Units longer than `out` are truncated; the cut is reported in
    /// [`Delivery::truncated_bytes`].
    pub fn retrieve_unit(&self, out: &mut [u8]) -> PullResult {
        // Fast path: data already queued, no wakeup involved
        if let Some(unit) = self.queue.try_pop() {
            self.shared.state.store(IDLE, Ordering::Release);
            return PullResult::Delivered(Self::deliver(unit, out));
        }

        // Arm, then re-check so a unit queued in between is not missed
        self.shared.state.store(AWAITING_DATA, Ordering::Release);
        match self.queue.try_pop() {
            Some(unit) => {
                self.shared.state.store(IDLE, Ordering::Release);
                PullResult::Delivered(Self::deliver(unit, out))
            }
            None => {
                trace!("Delivery bridge: queue empty, awaiting data");
                PullResult::Pending
            }
        }
    }

    fn deliver(unit: CompressedUnit, out: &mut [u8]) -> Delivery {
        let data = unit.data();
        let written = data.len().min(out.len());
        out[..written].copy_from_slice(&data[..written]);
        let truncated = data.len() - written;
        if truncated > 0 {
            debug!(
                "Unit {} truncated: {} of {} bytes delivered",
                unit.sequence,
                written,
                data.len()
            );
        }
        Delivery {
            bytes_written: written,
            truncated_bytes: truncated,
            presentation_time: SystemTime::now(),
            capture_ts: unit.capture_ts,
            sequence: unit.sequence,
        }
    }

    /// Drop an outstanding request without raising a wakeup
    ///
    /// Returns whether a request was pending.
    pub fn cancel(&self) -> bool {
        let previous = self.shared.state.swap(IDLE, Ordering::AcqRel);
        if previous == AWAITING_DATA {
            debug!("Delivery bridge: pending request cancelled");
        }
        previous == AWAITING_DATA
    }

    pub fn state(&self) -> BridgeState {
        BridgeState::from_raw(self.shared.state.load(Ordering::Acquire))
    }

    /// Number of wakeups raised so far
    pub fn wakeups(&self) -> u64 {
        self.shared.wakeups.load(Ordering::Relaxed)
    }

    /// Mark production finished and wake the consumer once so it can notice
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            debug!("Delivery bridge closed");
            self.shared.wake.notify_one();
            self.shared.trigger.trigger();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn queue(&self) -> &Arc<OutputQueue> {
        &self.queue
    }

    /// Await the next unit from a tokio event loop
    ///
    /// Returns `None` once the bridge is closed and the queue drained.
    pub async fn next_unit(&self, out: &mut [u8]) -> Option<Delivery> {
        loop {
            if let PullResult::Delivered(delivery) = self.retrieve_unit(out) {
                return Some(delivery);
            }
            if self.is_closed() {
                self.cancel();
                // A unit may have landed between the pull and the close check
                return match self.retrieve_unit(out) {
                    PullResult::Delivered(delivery) => Some(delivery),
                    PullResult::Pending => {
                        self.cancel();
                        None
                    }
                };
            }
            self.shared.wake.notified().await;
        }
    }
}
