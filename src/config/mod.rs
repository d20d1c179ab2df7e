//! Configuration
//!
//! Pipeline settings are read from an optional TOML file and then
//! overridden by command-line flags.

mod schema;

pub use schema::*;
