//! Delivery side of the pipeline
//!
//! # Components
//!
//! - `DeliveryBridge` - Non-blocking pull contract for a single-threaded consumer
//! - `EventTrigger` / `NotifyTrigger` - Cross-thread wakeup into the event loop

pub mod bridge;
pub mod trigger;

pub use bridge::{BridgeState, Delivery, DeliveryBridge, PullResult, UnitCallback};
pub use trigger::{EventTrigger, NotifyTrigger};
