//! Audio metering for capture sources

pub mod level;

pub use level::{rms_level, AudioLevelMonitor, MonitorConfig};
