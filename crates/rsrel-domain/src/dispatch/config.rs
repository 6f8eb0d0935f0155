//! Configuration for the local dispatcher.

use std::time::Duration;

/// Configuration for the local dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum traversal depth.
    pub max_depth: u32,
    /// Timeout for a whole check or expand operation.
    pub timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_depth: 50,
            timeout: Duration::from_secs(30),
        }
    }
}

impl DispatcherConfig {
    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
