//! Operator configuration
//!
//! Settings are read from environment variables, each with a default.

use std::time::Duration;

const DEFAULT_METRICS_PORT: u16 = 8080;
const DEFAULT_REQUEUE_NOW_SECS: u64 = 5;
const DEFAULT_REQUEUE_DELAY_SECS: u64 = 10;
const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 300;
const DEFAULT_FIELD_MANAGER: &str = "pgbackrest-operator";

/// Operator-wide settings
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// Port serving /metrics, /healthz and /readyz
    pub metrics_port: u16,
    /// Requeue used when a step asks to be retried right away
    pub requeue_now: Duration,
    /// Requeue used when a step asks to be retried after a delay
    pub requeue_delay: Duration,
    /// Requeue used when nothing is pending
    pub resync_interval: Duration,
    /// Field manager for server-side apply and the event reporter name
    pub field_manager: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            metrics_port: DEFAULT_METRICS_PORT,
            requeue_now: Duration::from_secs(DEFAULT_REQUEUE_NOW_SECS),
            requeue_delay: Duration::from_secs(DEFAULT_REQUEUE_DELAY_SECS),
            resync_interval: Duration::from_secs(DEFAULT_RESYNC_INTERVAL_SECS),
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self {
            metrics_port: env_var_or_default("METRICS_PORT", DEFAULT_METRICS_PORT),
            requeue_now: Duration::from_secs(env_var_or_default(
                "REQUEUE_NOW_SECS",
                DEFAULT_REQUEUE_NOW_SECS,
            )),
            requeue_delay: Duration::from_secs(env_var_or_default(
                "REQUEUE_DELAY_SECS",
                DEFAULT_REQUEUE_DELAY_SECS,
            )),
            resync_interval: Duration::from_secs(env_var_or_default(
                "RESYNC_INTERVAL_SECS",
                DEFAULT_RESYNC_INTERVAL_SECS,
            )),
            field_manager: std::env::var("FIELD_MANAGER")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_FIELD_MANAGER.to_string()),
        }
    }
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
