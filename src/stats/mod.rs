//! Runtime statistics

pub mod metrics;

pub use metrics::{CompositorStats, LinkStats, ManagerStats};
