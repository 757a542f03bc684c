//! Session manager configuration.

use serde::Deserialize;
use std::time::Duration;

/// Tunables for [`SesameManager`](crate::sesame::SesameManager).
///
/// Deserializable so applications can embed it in their own config files;
/// every field falls back to its default when absent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SesameConfig {
    /// How long a stale user or device is kept before eviction
    pub max_latency_ms: u64,
    /// Bound on each device's inactive session list
    pub max_inactive_sessions: usize,
    /// Resends allowed after a device mismatch before giving up
    pub max_mismatch_retries: u32,
    /// Attempts per network call for transient failures
    pub network_attempts: u32,
    /// Linear backoff step between network attempts
    pub retry_backoff_ms: u64,
    /// Period of the background cleanup task
    pub cleanup_interval_ms: u64,
}

impl Default for SesameConfig {
    fn default() -> Self {
        Self {
            max_latency_ms: 14_400_000,
            max_inactive_sessions: 10,
            max_mismatch_retries: 1,
            network_attempts: 3,
            retry_backoff_ms: 200,
            cleanup_interval_ms: 60_000,
        }
    }
}

impl SesameConfig {
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub(crate) fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(u64::from(attempt)))
    }
}
