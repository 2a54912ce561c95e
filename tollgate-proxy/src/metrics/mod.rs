//! Metrics module for the Tollgate gateway
//!
//! Provides Prometheus metrics for monitoring and observability.

pub mod prometheus;

pub use prometheus::{
    encode_metrics, observe_queue, record_queue_wait, record_rate_limited, record_rejected,
    record_usage, record_usage_failure, register_metrics, set_backend_healthy, RequestTimer,
};
