//! Meshnode Core Library
//!
//! Runtime for nodes of a simulated distributed-systems cluster that talk
//! to their test harness in newline-delimited JSON over stdin/stdout.
//!
//! ## Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  lifecycle::serve                                               │
//! │  ├── inbound pump ──► [queue] ──► Node::run                     │
//! │  │                               ├── replies ──► PendingReplies │
//! │  │                               ├── init ──► NodeIdentity      │
//! │  │                               └── handlers (one task each)   │
//! │  ├── outbound pump ◄── [queue] ◄── send / rpc / reply           │
//! │  └── shutdown: stop inbound, quiesce handlers, drain outbound   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Workloads are plain handler sets registered on a [`NodeBuilder`]:
//! [`Broadcaster`] (flood-fill gossip broadcast) and [`IdGenerator`]
//! (cluster-unique ids).
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use meshnode_core::{Broadcaster, NodeBuilder, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> meshnode_core::NodeResult<()> {
//!     let broadcaster = Arc::new(Broadcaster::new());
//!     let builder = broadcaster.register(NodeBuilder::new(NodeConfig::default()));
//!
//!     let report = meshnode_core::run_stdio(builder).await?;
//!     eprintln!("{:?}", report);
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod config;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod logging;
pub mod message;
pub mod node;
pub mod rpc;
pub mod transport;
pub mod unique_id;

// Re-exports
pub use broadcast::{BroadcastLog, BroadcastMessage, Broadcaster, DedupSet, Gossip, GossipId};
pub use config::NodeConfig;
pub use error::{NodeError, NodeResult};
pub use identity::{IdentityState, NodeIdentity};
pub use lifecycle::{run_stdio, serve, shutdown_signal, ShutdownReport};
pub use message::{Body, Envelope, InitRequest};
pub use node::{Context, Node, NodeBuilder};
pub use unique_id::{GenerateOk, IdGenerator};
