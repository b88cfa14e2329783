//! Runtime configuration for the operator

use std::time::Duration;

/// Requeue while a dependency is still installing
pub const DEPENDENCY_PENDING_REQUEUE: Duration = Duration::from_secs(10);

/// Requeue while a dependency is missing or not installed
pub const DEPENDENCY_MISSING_REQUEUE: Duration = Duration::from_secs(30);

/// Safety-net requeue while a workflow is running, in case a watch event is missed
pub const WORKFLOW_RUNNING_REQUEUE: Duration = Duration::from_secs(30);

/// Base and cap for the error backoff, in seconds
pub const ERROR_BACKOFF_BASE_SECS: u64 = 5;
pub const ERROR_BACKOFF_MAX_SECS: u64 = 300;

const DEFAULT_INSTALL_TTL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_CONCURRENCY: u16 = 5;

/// Settings shared by every reconcile
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,

    /// Longest an addon may stay uninstalled before it is forced to `Failed`
    pub install_ttl: Duration,

    /// Parallel reconciles across different addons
    pub concurrency: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            install_ttl: DEFAULT_INSTALL_TTL,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl OperatorConfig {
    pub fn new(namespace: Option<String>, install_ttl_secs: u64, concurrency: u16) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.trim().is_empty()),
            install_ttl: Duration::from_secs(install_ttl_secs),
            concurrency: concurrency.max(1),
        }
    }

    pub fn install_ttl_millis(&self) -> i64 {
        i64::try_from(self.install_ttl.as_millis()).unwrap_or(i64::MAX)
    }
}
