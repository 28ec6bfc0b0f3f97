//! Telemetry: logging setup and stack statistics

mod logging;
mod metrics;

pub use logging::{init_logging, LogConfig};
pub use metrics::{Counter, StackStats};
