//! Node identity assigned by the init handshake
//!
//! A node starts out [`IdentityState::Uninitialized`] and moves to `Ready`
//! exactly once, when the harness sends `init`. Code that needs the node's
//! id or neighbours can only reach them through [`IdentityCell::get`],
//! which fails with [`NodeError::NotInitialized`] before the transition.

use std::sync::{Arc, OnceLock};

use crate::error::{NodeError, NodeResult};

/// This node's id and the peers it forwards to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    id: String,
    cluster: Vec<String>,
    neighbours: Vec<String>,
}

impl NodeIdentity {
    /// Build an identity from the init payload.
    ///
    /// `node_ids` lists the whole cluster; the node's own id is left out of
    /// the neighbour set so gossip is never addressed back to ourselves.
    pub fn new(id: impl Into<String>, node_ids: Vec<String>) -> Self {
        let id = id.into();
        let neighbours = node_ids.iter().filter(|n| **n != id).cloned().collect();
        Self {
            id,
            cluster: node_ids,
            neighbours,
        }
    }

    /// This node's id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Every node in the cluster, as announced by init
    pub fn cluster(&self) -> &[String] {
        &self.cluster
    }

    /// Peers this node forwards gossip to (the cluster minus itself)
    pub fn neighbours(&self) -> &[String] {
        &self.neighbours
    }
}

/// Whether the init handshake has happened yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityState {
    /// No init received
    Uninitialized,
    /// Identity fixed by init
    Ready(Arc<NodeIdentity>),
}

/// Write-once holder for the node identity
#[derive(Debug, Default)]
pub struct IdentityCell {
    inner: OnceLock<Arc<NodeIdentity>>,
}

impl IdentityCell {
    /// An empty cell
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix the identity. Fails if it was already assigned.
    pub fn assign(&self, identity: NodeIdentity) -> NodeResult<Arc<NodeIdentity>> {
        let identity = Arc::new(identity);
        match self.inner.set(Arc::clone(&identity)) {
            Ok(()) => Ok(identity),
            Err(_) => Err(NodeError::AlreadyInitialized(
                self.inner
                    .get()
                    .map(|existing| existing.id().to_string())
                    .unwrap_or_default(),
            )),
        }
    }

    /// The identity, or `NotInitialized` before init
    pub fn get(&self) -> NodeResult<Arc<NodeIdentity>> {
        self.inner.get().cloned().ok_or(NodeError::NotInitialized)
    }

    /// Current state
    pub fn state(&self) -> IdentityState {
        match self.inner.get() {
            Some(identity) => IdentityState::Ready(Arc::clone(identity)),
            None => IdentityState::Uninitialized,
        }
    }

    /// Check whether init has run
    pub fn is_ready(&self) -> bool {
        self.inner.get().is_some()
    }
}
