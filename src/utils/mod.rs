//! # Utility Modules
//!
//! Supporting utilities shared by the loader and the bridge.
//!
//! ## Components
//! - **Logging**: `tracing-subscriber` installation driven by [`LoggingConfig`](crate::config::LoggingConfig)
//! - **Metrics**: Thread-safe counters for handle traffic and events

pub mod logging;
pub mod metrics;

pub use metrics::{BridgeMetrics, MetricsSnapshot};
