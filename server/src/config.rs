//! Server configuration.

use std::sync::Arc;
use std::time::Duration;

use common::clock::{Clock, SystemClock};
use storage::StorageConfig;

/// Settings for a single consensus server.
///
/// Timeouts follow the usual constraints: the heartbeat interval must be
/// well below the election timeout, and the session timeout well above it,
/// or liveness suffers.
#[derive(Clone)]
pub struct ServerConfig {
    /// Base election timeout; the effective timer is randomized in
    /// `[election_timeout, 2 * election_timeout)`.
    pub election_timeout: Duration,
    /// Fixed leader heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Session liveness bound, measured in log time (leader-stamped entry
    /// timestamps), never local wall clock.
    pub session_timeout: Duration,
    /// Log storage settings.
    pub storage: StorageConfig,
    /// Clock used to stamp entries when this server leads. Tests inject a
    /// mock to drive session expiration deterministically.
    pub clock: Arc<dyn Clock>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(500),
            heartbeat_interval: Duration::from_millis(250),
            session_timeout: Duration::from_secs(5),
            storage: StorageConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("election_timeout", &self.election_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("session_timeout", &self.session_timeout)
            .field("storage", &self.storage)
            .finish()
    }
}
