//! Logging and metrics.

pub mod logger;
pub mod metrics;

pub use logger::{set_level_floor, Logger, Severity};
