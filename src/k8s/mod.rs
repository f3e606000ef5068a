//! Adapters to the Kubernetes API
//!
//! The reconcilers only see the traits defined here, so every step can be
//! driven against in-memory fakes.

mod events;
mod exec;
mod store;

pub use events::{actions, reasons, EventRecorder, KubeEventRecorder};
pub use exec::{ExecError, ExecOutput, KubePodExecutor, PodExecutor};
pub use store::{from_dynamic, to_dynamic, KubeStore, ResourceKind, ResourceStore, StoreError};

#[cfg(test)]
pub use events::MockEventRecorder;
#[cfg(test)]
pub use exec::MockPodExecutor;
