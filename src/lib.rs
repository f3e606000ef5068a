//! pgBackRest Kubernetes Operator
//!
//! Reconciles the pgBackRest backup subsystem of PostgresCluster resources:
//! repository hosts and volumes, configuration, stanzas, scheduled backups
//! and the backup used to create replicas.

pub mod adapters;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod k8s;
pub mod metrics;
pub mod naming;
pub mod reconcilers;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use error::{Error, Result};
