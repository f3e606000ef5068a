//! Adapters converting the PostgresCluster spec into pgBackRest configuration
//! and the Kubernetes objects that run it

mod pgbackrest_config;
mod repo_storage;
mod ssh;
mod stanza_command;
mod workloads;

pub use pgbackrest_config::*;
pub use repo_storage::*;
pub use ssh::*;
pub use stanza_command::*;
pub use workloads::*;
