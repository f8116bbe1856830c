//! Flood-fill gossip broadcast with duplicate suppression
//!
//! Every value enters the cluster as a gossip message tagged with the node
//! that first received it and that node's local sequence number. A node
//! that sees a gossip identity for the first time records the value and
//! forwards the unmodified message to its neighbours, skipping the peer it
//! came from and the origin. Repeats of an identity are dropped, which also
//! ends forwarding cycles.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Broadcaster                                                    │
//! │  ├── next_seq: AtomicU64                                        │
//! │  │   └── Sequence numbers for values this node originates       │
//! │  ├── seen: DedupSet                                             │
//! │  │   └── (origin, seq) identities already absorbed              │
//! │  └── log: BroadcastLog                                          │
//! │      └── Distinct values in local arrival order                 │
//! │                                                                 │
//! │  broadcast ──wrap──► absorb ──new?──► log + forward             │
//! │  gossip ──────────► absorb ──dup?──► drop                       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::{NodeError, NodeResult};
use crate::message::Envelope;
use crate::node::{Context, NodeBuilder};

/// Message types the broadcast workload answers
pub const HANDLED_TYPES: [&str; 4] = ["broadcast", "gossip", "read", "topology"];

/// Identity of one gossiped value: who introduced it, and their sequence number
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GossipId {
    pub origin: String,
    pub seq: u64,
}

/// Peer-to-peer carrier for a broadcast value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gossip {
    /// Node that received the value from a client
    pub origin_node: String,
    /// Origin-local sequence number
    pub seq_id: u64,
    /// The broadcast value
    pub message: i64,
}

impl Gossip {
    /// Dedup key for this message
    pub fn id(&self) -> GossipId {
        GossipId {
            origin: self.origin_node.clone(),
            seq: self.seq_id,
        }
    }
}

/// Bodies of the broadcast workload, keyed by their `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastMessage {
    Broadcast {
        message: i64,
    },
    BroadcastOk,
    Gossip(Gossip),
    Read,
    ReadOk {
        messages: Vec<i64>,
    },
    Topology {
        #[serde(default)]
        topology: HashMap<String, Vec<String>>,
    },
    TopologyOk,
}

/// Set of gossip identities already absorbed. Never shrinks.
#[derive(Debug, Default)]
pub struct DedupSet {
    seen: Mutex<HashSet<GossipId>>,
}

impl DedupSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `id`, returning true if it was not present.
    ///
    /// Test and insert happen under one lock, so of any number of concurrent
    /// callers with the same id exactly one gets true.
    pub fn insert(&self, id: GossipId) -> bool {
        self.seen.lock().insert(id)
    }

    pub fn contains(&self, id: &GossipId) -> bool {
        self.seen.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}

#[derive(Debug, Default)]
struct LogInner {
    values: Vec<i64>,
    present: HashSet<i64>,
}

/// Append-only log of distinct values, in local arrival order
#[derive(Debug, Default)]
pub struct BroadcastLog {
    inner: RwLock<LogInner>,
}

impl BroadcastLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `value` unless it is already logged. Returns true if appended.
    pub fn append(&self, value: i64) -> bool {
        let mut inner = self.inner.write();
        if !inner.present.insert(value) {
            return false;
        }
        inner.values.push(value);
        true
    }

    /// Copy of the log
    pub fn snapshot(&self) -> Vec<i64> {
        self.inner.read().values.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().values.is_empty()
    }
}

/// Neighbours a gossip message is forwarded to: everyone except the peer it
/// arrived from and the node that originated it.
pub fn forward_targets<'a>(neighbours: &'a [String], sender: &str, origin: &str) -> Vec<&'a str> {
    neighbours
        .iter()
        .map(String::as_str)
        .filter(|n| *n != sender && *n != origin)
        .collect()
}

/// State and handlers of the broadcast workload
#[derive(Debug, Default)]
pub struct Broadcaster {
    next_seq: AtomicU64,
    seen: DedupSet,
    log: BroadcastLog,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register handlers for every type in [`HANDLED_TYPES`]
    pub fn register(self: &Arc<Self>, builder: NodeBuilder) -> NodeBuilder {
        HANDLED_TYPES.into_iter().fold(builder, |builder, msg_type| {
            let broadcaster = Arc::clone(self);
            builder.handle(msg_type, move |ctx, envelope| {
                let broadcaster = Arc::clone(&broadcaster);
                async move { broadcaster.handle(ctx, envelope).await }
            })
        })
    }

    /// Handle one broadcast-workload request
    pub async fn handle(&self, ctx: Context, envelope: Envelope) -> NodeResult<()> {
        match envelope.body.decode::<BroadcastMessage>()? {
            BroadcastMessage::Broadcast { message } => {
                let gossip = Gossip {
                    origin_node: ctx.identity().id().to_string(),
                    seq_id: self.next_seq.fetch_add(1, Ordering::Relaxed) + 1,
                    message,
                };
                self.absorb(&ctx, &envelope.src, gossip).await;
                ctx.reply(&envelope, &BroadcastMessage::BroadcastOk).await
            }
            BroadcastMessage::Gossip(gossip) => {
                self.absorb(&ctx, &envelope.src, gossip).await;
                Ok(())
            }
            BroadcastMessage::Read => {
                let messages = self.log.snapshot();
                ctx.reply(&envelope, &BroadcastMessage::ReadOk { messages })
                    .await
            }
            BroadcastMessage::Topology { topology } => {
                // Forwarding keeps using the neighbours fixed at init
                debug!(nodes = topology.len(), "Acknowledging topology");
                ctx.reply(&envelope, &BroadcastMessage::TopologyOk).await
            }
            BroadcastMessage::BroadcastOk
            | BroadcastMessage::ReadOk { .. }
            | BroadcastMessage::TopologyOk => Err(NodeError::malformed(
                envelope.msg_type(),
                "acknowledgment without in_reply_to",
            )),
        }
    }

    /// Apply a gossip message that arrived from `sender`.
    ///
    /// Returns false if its identity was already seen. Otherwise the value
    /// is logged and the message forwarded once to each eligible neighbour;
    /// a failed forward is logged and not retried.
    pub async fn absorb(&self, ctx: &Context, sender: &str, gossip: Gossip) -> bool {
        if !self.seen.insert(gossip.id()) {
            trace!(origin = %gossip.origin_node, seq = gossip.seq_id, "Dropping duplicate gossip");
            return false;
        }

        if self.log.append(gossip.message) {
            debug!(
                origin = %gossip.origin_node,
                seq = gossip.seq_id,
                message = gossip.message,
                "Absorbed broadcast value"
            );
        }

        let targets = forward_targets(ctx.identity().neighbours(), sender, &gossip.origin_node);
        let forward = BroadcastMessage::Gossip(gossip);
        for dest in targets {
            if let Err(e) = ctx.send(dest, &forward).await {
                warn!(dest, error = %e, "Failed to forward gossip");
            }
        }
        true
    }

    /// Snapshot of the broadcast log
    pub fn messages(&self) -> Vec<i64> {
        self.log.snapshot()
    }

    /// Number of distinct gossip identities absorbed
    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }
}
