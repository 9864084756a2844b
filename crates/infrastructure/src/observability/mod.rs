//! Observability module
//!
//! Metrics handles and structured log events shared by the worker loops.

pub mod metrics_collector;
pub mod structured_logger;

pub use metrics_collector::MetricsCollector;
pub use structured_logger::StructuredLogger;
