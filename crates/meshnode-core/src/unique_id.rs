//! Unique id workload (`generate`)
//!
//! Ids have the form `<node_id>-<counter>-<epoch>`. The counter starts at 1
//! and the epoch at 0; when the counter has been used at `u64::MAX` the
//! next id wraps it back to 1 and bumps the epoch. Ids are unique per node
//! because the pair never repeats, and unique cluster-wide because node ids
//! are distinct.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::NodeResult;
use crate::message::Envelope;
use crate::node::{Context, NodeBuilder};

/// Message type the unique id workload answers
pub const GENERATE: &str = "generate";

/// Reply to `generate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "generate_ok")]
pub struct GenerateOk {
    pub id: String,
}

/// Issues `(counter, epoch)` pairs
#[derive(Debug)]
pub struct IdGenerator {
    // (last counter issued, epoch)
    state: Mutex<(u64, u64)>,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::starting_at(0, 0)
    }
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generator whose next pair follows `(counter, epoch)`
    pub fn starting_at(counter: u64, epoch: u64) -> Self {
        Self {
            state: Mutex::new((counter, epoch)),
        }
    }

    /// Next `(counter, epoch)` pair
    pub fn next_pair(&self) -> (u64, u64) {
        let mut state = self.state.lock();
        if state.0 == u64::MAX {
            state.0 = 0;
            state.1 += 1;
        }
        state.0 += 1;
        *state
    }

    /// Next id for `node_id`
    pub fn next_id(&self, node_id: &str) -> String {
        let (counter, epoch) = self.next_pair();
        format_id(node_id, counter, epoch)
    }

    /// Register the `generate` handler
    pub fn register(self: &Arc<Self>, builder: NodeBuilder) -> NodeBuilder {
        let generator = Arc::clone(self);
        builder.handle(GENERATE, move |ctx, envelope| {
            let generator = Arc::clone(&generator);
            async move { generator.handle(ctx, envelope).await }
        })
    }

    async fn handle(&self, ctx: Context, envelope: Envelope) -> NodeResult<()> {
        let id = self.next_id(ctx.identity().id());
        trace!(%id, "Generated id");
        ctx.reply(&envelope, &GenerateOk { id }).await
    }
}

/// Render an id
pub fn format_id(node_id: &str, counter: u64, epoch: u64) -> String {
    format!("{}-{}-{}", node_id, counter, epoch)
}
