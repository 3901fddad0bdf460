use std::time::Duration;

/// Bound on any single cluster api call
pub(crate) const API_TIMEOUT: Duration = Duration::from_secs(30);
/// Page size of paginated list calls
pub(crate) const LIST_PAGE_LIMIT: u32 = 500;
/// Interval between deployment readiness probes
pub(crate) const READY_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// How long a rollout may take before it counts as failed
pub(crate) const READY_TIMEOUT: Duration = Duration::from_secs(600);
/// Interval of the model readiness daemon
pub(crate) const DAEMON_INTERVAL: Duration = Duration::from_secs(10);
/// First retry delay after a retryable reconciliation failure
pub(crate) const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Retry delay cap
pub(crate) const BACKOFF_CAP: Duration = Duration::from_secs(60);
/// Retry attempts per delivered event; the next revision retries from scratch
pub(crate) const MAX_RETRIES: u32 = 6;
