//! livecam - live camera capture and compression pipeline
//!
//! Captures frames from a V4L2 device, converts them to the encoder's pixel
//! format, throttles them to a target rate, compresses them and hands the
//! resulting units to a single-threaded consumer through a non-blocking
//! delivery bridge.

pub mod config;
pub mod error;
pub mod stream;
pub mod utils;
pub mod video;

pub use error::{AppError, Result};
