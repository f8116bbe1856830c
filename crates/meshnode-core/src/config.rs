//! Runtime configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NodeError, NodeResult};

/// Default capacity of the inbound and outbound queues
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Default time an RPC waits for its reply
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time in-flight handlers get to finish during shutdown
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Default longest accepted inbound line (1 MiB)
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Tunables for a node process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Capacity of the inbound and outbound FIFO queues
    pub queue_capacity: usize,
    /// How long an RPC waits for its reply
    pub rpc_timeout: Duration,
    /// How long shutdown waits for in-flight handlers before cancelling them
    pub shutdown_grace: Duration,
    /// Start shutdown when the inbound stream ends
    pub exit_on_eof: bool,
    /// Inbound lines longer than this are dropped as malformed
    pub max_line_bytes: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            exit_on_eof: false,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl NodeConfig {
    /// Set the queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the RPC timeout
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Set the shutdown grace period
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Shut down when the inbound stream hits end-of-file
    pub fn with_exit_on_eof(mut self, exit_on_eof: bool) -> Self {
        self.exit_on_eof = exit_on_eof;
        self
    }

    /// Set the inbound line length limit
    pub fn with_max_line_bytes(mut self, max: usize) -> Self {
        self.max_line_bytes = max;
        self
    }

    /// Reject values the runtime can't work with
    pub fn validate(&self) -> NodeResult<()> {
        if self.queue_capacity == 0 {
            return Err(NodeError::Config(
                "queue capacity must be at least 1".to_string(),
            ));
        }
        if self.rpc_timeout.is_zero() {
            return Err(NodeError::Config("RPC timeout must be non-zero".to_string()));
        }
        if self.max_line_bytes == 0 {
            return Err(NodeError::Config(
                "max line length must be at least 1 byte".to_string(),
            ));
        }
        Ok(())
    }
}
