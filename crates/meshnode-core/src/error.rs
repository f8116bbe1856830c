//! Error types for the meshnode runtime

use std::time::Duration;

use thiserror::Error;

/// Main error type for node runtime operations
#[derive(Error, Debug)]
pub enum NodeError {
    /// An inbound line could not be decoded into an envelope
    #[error("Malformed line: {0}")]
    Decode(String),

    /// No handler is registered for the body's `type`
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    /// The body decoded as an envelope but its fields don't match the message contract
    #[error("Malformed {msg_type} body: {reason}")]
    MalformedBody {
        /// The `type` of the offending body
        msg_type: String,
        /// What was wrong with it
        reason: String,
    },

    /// Building an outbound body failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// No reply arrived for an RPC within the configured timeout
    #[error("RPC {msg_id} to {dest} timed out after {timeout:?}")]
    RpcTimeout {
        /// Request id assigned to the RPC
        msg_id: u64,
        /// Destination node
        dest: String,
        /// How long the caller waited
        timeout: Duration,
    },

    /// Node identity was requested before the init handshake completed
    #[error("Node has not received init yet")]
    NotInitialized,

    /// A second init arrived after the identity was fixed
    #[error("Node already initialized as {0}")]
    AlreadyInitialized(String),

    /// The runtime is shutting down and the operation was abandoned
    #[error("Node is shutting down")]
    ShuttingDown,

    /// The outbound queue is closed, nothing more can be sent
    #[error("Transport closed")]
    TransportClosed,

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A runtime task panicked or was aborted
    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeError {
    /// Whether the error should terminate the process.
    ///
    /// Transport I/O failures, bad configuration and crashed runtime tasks
    /// are fatal. Protocol errors and timeouts are reported and the node
    /// keeps running.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NodeError::Io(_) | NodeError::Config(_) | NodeError::Join(_)
        )
    }

    /// Build a `MalformedBody` error for the given message type.
    pub fn malformed(msg_type: impl Into<String>, reason: impl ToString) -> Self {
        NodeError::MalformedBody {
            msg_type: msg_type.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias using NodeError
pub type NodeResult<T> = Result<T, NodeError>;
