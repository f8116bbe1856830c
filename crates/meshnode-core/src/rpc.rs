//! Pending reply table for outbound RPCs
//!
//! Each outstanding RPC owns a single-use rendezvous slot keyed by the
//! request id it was sent with. An inbound reply carrying that id in
//! `in_reply_to` is handed to the slot; the slot is removed from the table
//! when it is resolved or when the waiting [`PendingSlot`] is dropped
//! (timeout, shutdown, or the caller giving up), so the table never holds
//! entries for requests nobody is waiting on.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::message::Envelope;

/// Outstanding RPCs keyed by request id
#[derive(Debug, Default)]
pub struct PendingReplies {
    slots: Mutex<HashMap<u64, oneshot::Sender<Envelope>>>,
}

impl PendingReplies {
    /// An empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a slot for `msg_id`.
    ///
    /// Ids come from a monotonic counter, so a live slot is never replaced.
    pub fn register(&self, msg_id: u64) -> PendingSlot<'_> {
        let (tx, rx) = oneshot::channel();
        let previous = self.slots.lock().insert(msg_id, tx);
        debug_assert!(previous.is_none(), "request id {} reused while pending", msg_id);

        PendingSlot {
            table: self,
            msg_id,
            rx,
        }
    }

    /// Deliver a reply to the slot its `in_reply_to` names.
    ///
    /// Returns false when no caller is waiting for it any more.
    pub fn resolve(&self, reply: Envelope) -> bool {
        let Some(msg_id) = reply.body.in_reply_to else {
            return false;
        };

        let slot = self.slots.lock().remove(&msg_id);
        match slot {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Whether a caller is still waiting on `msg_id`
    pub fn contains(&self, msg_id: u64) -> bool {
        self.slots.lock().contains_key(&msg_id)
    }

    /// Number of outstanding RPCs
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether no RPC is outstanding
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    fn release(&self, msg_id: u64) {
        if self.slots.lock().remove(&msg_id).is_some() {
            debug!(msg_id, "Released unanswered RPC slot");
        }
    }
}

/// A registered slot; waiting on it yields the correlated reply.
///
/// Dropping the slot removes it from the table.
#[derive(Debug)]
pub struct PendingSlot<'a> {
    table: &'a PendingReplies,
    msg_id: u64,
    rx: oneshot::Receiver<Envelope>,
}

impl PendingSlot<'_> {
    /// Wait for the reply. `None` if the slot was dropped from the table.
    pub async fn wait(&mut self) -> Option<Envelope> {
        (&mut self.rx).await.ok()
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.table.release(self.msg_id);
    }
}
