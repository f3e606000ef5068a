//! Prometheus metrics for the pgBackRest operator
//!
//! This module exposes metrics for monitoring operator health and
//! reconciliation, plus the health and readiness endpoints.

mod prometheus;

pub use prometheus::*;
