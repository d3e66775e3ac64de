//! # Utility Modules
//!
//! Supporting pieces shared by the server and client.
//!
//! ## Components
//! - **Logging**: tracing subscriber setup from [`LoggingConfig`](crate::config::LoggingConfig)
//! - **Metrics**: process-wide atomic counters
//! - **Timeout**: default deadlines and async timeout wrappers

pub mod logging;
pub mod metrics;
pub mod timeout;

pub use logging::init_logging;
pub use metrics::{global_metrics, Metrics, MetricsSnapshot};
