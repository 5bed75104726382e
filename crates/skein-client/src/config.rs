//! Client configuration

use std::time::Duration;

/// Configuration for the connection coordinator
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Delay between backend lookup retries after a resolver timeout
    pub resolve_retry_delay: Duration,
    /// Maximum entries a connection buffers before rejecting new ones with
    /// a queue-overflow failure
    pub pending_queue_ceiling: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            resolve_retry_delay: Duration::from_secs(5),
            pending_queue_ceiling: 1000,
        }
    }
}

impl ClientConfig {
    /// Create a new builder
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

/// Builder for [`ClientConfig`]
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Set the delay between backend lookup retries
    pub fn resolve_retry_delay(mut self, delay: Duration) -> Self {
        self.config.resolve_retry_delay = delay;
        self
    }

    /// Set the per-connection pending queue ceiling
    pub fn pending_queue_ceiling(mut self, ceiling: usize) -> Self {
        self.config.pending_queue_ceiling = ceiling;
        self
    }

    /// Build the configuration
    pub fn build(self) -> ClientConfig {
        self.config
    }
}
