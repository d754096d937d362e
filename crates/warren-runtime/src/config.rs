//! Engine-wide execution configuration.

use std::time::Duration;

/// Configuration applied to every pool and request of one [`crate::Engine`].
///
/// These knobs are engine-wide, not per-request.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Warmed isolates per (site, deploy) pool.
    pub pool_size: usize,

    /// Wall-clock budget for one execution: handler await, response
    /// extraction and waitUntil drain all share it.
    pub execution_timeout: Duration,

    /// Heap cap per isolate, in megabytes. 0 disables the cap.
    pub memory_limit_mb: usize,

    /// Cap on concurrent outbound `fetch()` calls across the engine.
    pub max_inflight_fetches: usize,

    /// Per-call timeout for outbound `fetch()`.
    pub fetch_timeout: Duration,

    /// Cap on an outbound fetch response body, in bytes.
    pub max_fetch_response_bytes: usize,

    /// Permit `fetch()`/`EventSource` targets in loopback, private and
    /// link-local ranges. Off by default.
    pub allow_private_network: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            execution_timeout: Duration::from_secs(30),
            memory_limit_mb: 128,
            max_inflight_fetches: 16,
            fetch_timeout: Duration::from_secs(30),
            max_fetch_response_bytes: 10 * 1024 * 1024,
            allow_private_network: false,
        }
    }
}

impl EngineConfig {
    pub fn memory_limit_bytes(&self) -> usize {
        self.memory_limit_mb * 1024 * 1024
    }
}
