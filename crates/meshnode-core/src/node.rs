//! Dispatch core: handler routing, request ids, reply correlation
//!
//! A [`NodeBuilder`] collects one handler per message type; building it
//! freezes the handler table and yields a cloneable [`Node`] handle. The
//! dispatch loop ([`Node::run`]) takes decoded envelopes off the inbound
//! queue and routes them:
//!
//! - a body with `in_reply_to` is a reply and goes to the matching pending
//!   RPC slot (or is discarded if that caller already gave up);
//! - `init` is handled inline by the node itself and fixes the
//!   [`NodeIdentity`] before the next envelope is taken;
//! - anything else runs as its own task in the handler registered for its
//!   `type`, which is only invoked once the identity is known.
//!
//! Handlers produce output through [`Node::send`], [`Node::rpc`] and
//! [`Node::reply`], all of which enqueue onto the outbound queue.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult};
use crate::identity::{IdentityCell, IdentityState, NodeIdentity};
use crate::message::{Body, Envelope, InitRequest, INIT, INIT_OK};
use crate::rpc::PendingReplies;

type Handler = Arc<dyn Fn(Context, Envelope) -> BoxFuture<'static, NodeResult<()>> + Send + Sync>;

/// What a handler gets besides the envelope: the node, and the identity
/// that init assigned.
#[derive(Clone)]
pub struct Context {
    node: Node,
    identity: Arc<NodeIdentity>,
}

impl Context {
    /// This node's identity
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Shorthand for [`Node::reply`]
    pub async fn reply<T: Serialize + ?Sized>(&self, request: &Envelope, body: &T) -> NodeResult<()> {
        self.node.reply(request, body).await
    }

    /// Shorthand for [`Node::send`]
    pub async fn send<T: Serialize + ?Sized>(&self, dest: &str, body: &T) -> NodeResult<u64> {
        self.node.send(dest, body).await
    }

    /// Shorthand for [`Node::rpc`]
    pub async fn rpc<T: Serialize + ?Sized>(&self, dest: &str, body: &T) -> NodeResult<Envelope> {
        self.node.rpc(dest, body).await
    }
}

/// Collects handlers before the node starts.
pub struct NodeBuilder {
    config: NodeConfig,
    handlers: HashMap<String, Handler>,
}

impl NodeBuilder {
    /// Start a builder with the given configuration
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for `msg_type`.
    ///
    /// A later registration for the same type replaces the earlier one.
    /// `init` is handled by the node itself and can't be overridden.
    pub fn handle<F, Fut>(mut self, msg_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Context, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = NodeResult<()>> + Send + 'static,
    {
        let msg_type = msg_type.into();
        if msg_type == INIT {
            warn!("Ignoring handler for built-in init message");
            return self;
        }

        let handler: Handler = Arc::new(move |ctx, envelope| handler(ctx, envelope).boxed());
        if self.handlers.insert(msg_type.clone(), handler).is_some() {
            debug!(%msg_type, "Replaced existing handler");
        }
        self
    }

    /// Configuration the node will run with
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Message types with a registered handler
    pub fn registered_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Freeze the handler table and create the node.
    ///
    /// Everything the node emits goes to `outbound`.
    pub fn build(self, outbound: mpsc::Sender<Envelope>) -> Node {
        Node {
            inner: Arc::new(NodeInner {
                identity: IdentityCell::new(),
                next_msg_id: AtomicU64::new(0),
                pending: PendingReplies::new(),
                handlers: self.handlers,
                outbound,
                rpc_timeout: self.config.rpc_timeout,
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }
}

struct NodeInner {
    identity: IdentityCell,
    next_msg_id: AtomicU64,
    pending: PendingReplies,
    handlers: HashMap<String, Handler>,
    outbound: mpsc::Sender<Envelope>,
    rpc_timeout: Duration,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

/// Cheaply cloneable handle to a running node
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// The identity assigned by init
    pub fn identity(&self) -> NodeResult<Arc<NodeIdentity>> {
        self.inner.identity.get()
    }

    /// Whether init has run
    pub fn identity_state(&self) -> IdentityState {
        self.inner.identity.state()
    }

    /// Number of RPCs still waiting for a reply
    pub fn pending_rpc_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Whether an RPC with this request id is still waiting
    pub fn has_pending(&self, msg_id: u64) -> bool {
        self.inner.pending.contains(msg_id)
    }

    /// Send a fire-and-forget message and return the request id it carries.
    pub async fn send<T: Serialize + ?Sized>(&self, dest: &str, body: &T) -> NodeResult<u64> {
        let identity = self.identity()?;
        let body = Body::from_payload(body)?;
        let msg_id = self.next_msg_id();

        self.enqueue(Envelope::new(identity.id(), dest, body.with_msg_id(msg_id)))
            .await?;
        debug!(msg_id, dest, "Sent message");
        Ok(msg_id)
    }

    /// Send a request and wait for its correlated reply.
    ///
    /// Fails with [`NodeError::RpcTimeout`] if no reply arrives within the
    /// configured timeout, or [`NodeError::ShuttingDown`] if the node is
    /// cancelled first. The pending slot is released on every path.
    pub async fn rpc<T: Serialize + ?Sized>(&self, dest: &str, body: &T) -> NodeResult<Envelope> {
        let identity = self.identity()?;
        let body = Body::from_payload(body)?;
        let msg_id = self.next_msg_id();

        // Register before sending so a fast reply can't miss the slot
        let mut slot = self.inner.pending.register(msg_id);
        self.enqueue(Envelope::new(identity.id(), dest, body.with_msg_id(msg_id)))
            .await?;
        debug!(msg_id, dest, "Sent RPC request");

        let timeout = self.inner.rpc_timeout;
        tokio::select! {
            reply = tokio::time::timeout(timeout, slot.wait()) => match reply {
                Ok(Some(reply)) => {
                    debug!(msg_id, dest, "Received RPC reply");
                    Ok(reply)
                }
                Ok(None) => Err(NodeError::ShuttingDown),
                Err(_) => {
                    warn!(msg_id, dest, ?timeout, "RPC timed out");
                    Err(NodeError::RpcTimeout {
                        msg_id,
                        dest: dest.to_string(),
                        timeout,
                    })
                }
            },
            _ = self.inner.cancel.cancelled() => Err(NodeError::ShuttingDown),
        }
    }

    /// Answer `request`: source and destination are swapped and
    /// `in_reply_to` is set to the request's `msg_id`.
    pub async fn reply<T: Serialize + ?Sized>(&self, request: &Envelope, body: &T) -> NodeResult<()> {
        let in_reply_to = request.body.msg_id.ok_or_else(|| {
            NodeError::malformed(request.msg_type(), "request has no msg_id to reply to")
        })?;
        let body = Body::from_payload(body)?.with_in_reply_to(in_reply_to);

        self.enqueue(Envelope::new(request.dest.clone(), request.src.clone(), body))
            .await?;
        debug!(in_reply_to, dest = %request.src, "Replied");
        Ok(())
    }

    /// Process one inbound envelope to completion.
    pub async fn dispatch(&self, envelope: Envelope) -> NodeResult<()> {
        if envelope.is_reply() {
            let in_reply_to = envelope.body.in_reply_to;
            let src = envelope.src.clone();
            if !self.inner.pending.resolve(envelope) {
                warn!(?in_reply_to, %src, "Discarding reply with no waiting caller");
            }
            return Ok(());
        }

        if envelope.msg_type() == INIT {
            return self.handle_init(envelope).await;
        }

        let handler = self
            .inner
            .handlers
            .get(envelope.msg_type())
            .cloned()
            .ok_or_else(|| NodeError::UnknownMessageType(envelope.msg_type().to_string()))?;

        let ctx = Context {
            node: self.clone(),
            identity: self.identity()?,
        };
        handler(ctx, envelope).await
    }

    /// Dispatch loop: spawn one task per inbound envelope until the queue
    /// closes. Returns the number of envelopes dispatched.
    ///
    /// `init` is handled inline, so every envelope read after it sees the
    /// identity it assigns.
    pub async fn run(self, mut inbound: mpsc::Receiver<Envelope>) -> u64 {
        let mut dispatched = 0u64;

        while let Some(envelope) = inbound.recv().await {
            dispatched += 1;
            if envelope.msg_type() == INIT && !envelope.is_reply() {
                if let Err(e) = self.dispatch(envelope).await {
                    warn!(error = %e, "Failed to handle init");
                }
                continue;
            }

            let node = self.clone();
            self.inner.tasks.spawn(async move {
                let msg_type = envelope.msg_type().to_string();
                let src = envelope.src.clone();
                if let Err(e) = node.dispatch(envelope).await {
                    warn!(%msg_type, %src, error = %e, "Failed to handle message");
                }
            });
        }

        debug!(dispatched, "Dispatch loop finished");
        dispatched
    }

    /// Stop accepting new handler tasks and wait for the running ones.
    ///
    /// If they don't finish within `grace`, every suspended RPC and blocked
    /// enqueue is cancelled and the wait continues until they unwind.
    /// Returns false if cancellation was needed.
    pub async fn quiesce(&self, grace: Duration) -> bool {
        self.inner.tasks.close();
        if tokio::time::timeout(grace, self.inner.tasks.wait()).await.is_ok() {
            return true;
        }

        warn!(
            in_flight = self.inner.tasks.len(),
            "Handlers still running after grace period, cancelling"
        );
        self.inner.cancel.cancel();
        self.inner.tasks.wait().await;
        false
    }

    /// Cancel every suspended RPC and blocked enqueue immediately
    pub fn cancel_in_flight(&self) {
        self.inner.cancel.cancel();
    }

    async fn handle_init(&self, envelope: Envelope) -> NodeResult<()> {
        let request: InitRequest = envelope.body.decode()?;
        let identity = self
            .inner
            .identity
            .assign(NodeIdentity::new(request.node_id, request.node_ids))?;

        info!(
            node_id = identity.id(),
            cluster_size = identity.cluster().len(),
            neighbours = ?identity.neighbours(),
            "Node initialized"
        );

        self.reply(&envelope, &Body::new(INIT_OK)).await
    }

    fn next_msg_id(&self) -> u64 {
        self.inner.next_msg_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn enqueue(&self, envelope: Envelope) -> NodeResult<()> {
        tokio::select! {
            sent = self.inner.outbound.send(envelope) => {
                sent.map_err(|_| NodeError::TransportClosed)
            }
            _ = self.inner.cancel.cancelled() => Err(NodeError::ShuttingDown),
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("identity", &self.inner.identity.state())
            .field("pending_rpcs", &self.inner.pending.len())
            .field("handlers", &self.inner.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    fn test_node(builder: NodeBuilder) -> (Node, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(16);
        (builder.build(tx), rx)
    }

    fn init_envelope(node_id: &str, node_ids: &[&str]) -> Envelope {
        Envelope::new(
            "c0",
            node_id,
            Body::new(INIT)
                .with_msg_id(1)
                .with_field("node_id", node_id)
                .with_field("node_ids", json!(node_ids)),
        )
    }

    async fn initialized(builder: NodeBuilder) -> (Node, mpsc::Receiver<Envelope>) {
        let (node, mut rx) = test_node(builder);
        node.dispatch(init_envelope("n1", &["n1", "n2", "n3"]))
            .await
            .unwrap();
        let init_ok = rx.recv().await.unwrap();
        assert_eq!(init_ok.msg_type(), INIT_OK);
        (node, rx)
    }

    #[tokio::test]
    async fn test_init_fixes_identity_and_acknowledges() {
        let (node, mut rx) = test_node(NodeBuilder::new(NodeConfig::default()));
        assert_eq!(node.identity_state(), IdentityState::Uninitialized);

        node.dispatch(init_envelope("n1", &["n1", "n2"])).await.unwrap();

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.src, "n1");
        assert_eq!(reply.dest, "c0");
        assert_eq!(reply.msg_type(), "init_ok");
        assert_eq!(reply.body.in_reply_to, Some(1));

        let identity = node.identity().unwrap();
        assert_eq!(identity.id(), "n1");
        assert_eq!(identity.neighbours(), ["n2".to_string()].as_slice());
    }

    #[tokio::test]
    async fn test_second_init_is_rejected() {
        let (node, _rx) = initialized(NodeBuilder::new(NodeConfig::default())).await;
        let err = node
            .dispatch(init_envelope("n7", &["n7"]))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::AlreadyInitialized(_)));
        assert_eq!(node.identity().unwrap().id(), "n1");
    }

    #[tokio::test]
    async fn test_handler_requires_init() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);
        let builder = NodeBuilder::new(NodeConfig::default()).handle("read", move |_ctx, _msg| {
            let flag = Arc::clone(&flag);
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }
        });
        let (node, _rx) = test_node(builder);

        let read = Envelope::new("c1", "n1", Body::new("read").with_msg_id(1));
        let err = node.dispatch(read).await.unwrap_err();
        assert!(matches!(err, NodeError::NotInitialized));
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unknown_type_is_reported() {
        let (node, _rx) = initialized(NodeBuilder::new(NodeConfig::default())).await;
        let err = node
            .dispatch(Envelope::new("c1", "n1", Body::new("frobnicate").with_msg_id(2)))
            .await
            .unwrap_err();
        match err {
            NodeError::UnknownMessageType(t) => assert_eq!(t, "frobnicate"),
            other => panic!("Expected UnknownMessageType, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_receives_identity() {
        let builder = NodeBuilder::new(NodeConfig::default()).handle("whoami", |ctx, msg| async move {
            let id = ctx.identity().id().to_string();
            ctx.reply(&msg, &json!({"type": "whoami_ok", "id": id})).await
        });
        let (node, mut rx) = initialized(builder).await;

        node.dispatch(Envelope::new("c1", "n1", Body::new("whoami").with_msg_id(4)))
            .await
            .unwrap();

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.body.field("id"), Some(&json!("n1")));
    }

    #[tokio::test]
    async fn test_reply_swaps_endpoints_and_correlates() {
        let (node, mut rx) = initialized(NodeBuilder::new(NodeConfig::default())).await;
        let request = Envelope::new("c9", "n1", Body::new("echo").with_msg_id(42));

        node.reply(&request, &json!({"type": "echo_ok", "echo": "hi"}))
            .await
            .unwrap();

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.src, "n1");
        assert_eq!(reply.dest, "c9");
        assert_eq!(reply.body.in_reply_to, Some(42));
        assert_eq!(reply.body.msg_id, None);
        assert_eq!(reply.body.field("echo"), Some(&json!("hi")));
    }

    #[tokio::test]
    async fn test_reply_needs_request_id() {
        let (node, _rx) = initialized(NodeBuilder::new(NodeConfig::default())).await;
        let request = Envelope::new("n2", "n1", Body::new("gossip"));
        let err = node
            .reply(&request, &Body::new("gossip_ok"))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::MalformedBody { .. }));
    }

    #[tokio::test]
    async fn test_send_ids_are_monotonic() {
        let (node, mut rx) = initialized(NodeBuilder::new(NodeConfig::default())).await;

        let first = node.send("n2", &Body::new("ping")).await.unwrap();
        let second = node.send("n3", &Body::new("ping")).await.unwrap();
        assert!(second > first);

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.src, "n1");
        assert_eq!(sent.dest, "n2");
        assert_eq!(sent.body.msg_id, Some(first));
        assert_eq!(node.pending_rpc_count(), 0);
    }

    #[tokio::test]
    async fn test_send_waits_for_room_in_full_queue() {
        let (tx, mut rx) = mpsc::channel(1);
        let node = NodeBuilder::new(NodeConfig::default()).build(tx);
        // init_ok takes the only slot
        node.dispatch(init_envelope("n1", &["n1", "n2"])).await.unwrap();

        let blocked = tokio::time::timeout(
            Duration::from_millis(100),
            node.send("n2", &Body::new("ping")),
        )
        .await;
        assert!(blocked.is_err(), "send should wait while the queue is full");

        assert_eq!(rx.recv().await.unwrap().msg_type(), INIT_OK);
        let msg_id = node.send("n2", &Body::new("ping")).await.unwrap();
        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.msg_type(), "ping");
        assert_eq!(sent.body.msg_id, Some(msg_id));
    }

    #[tokio::test]
    async fn test_send_before_init_fails() {
        let (node, _rx) = test_node(NodeBuilder::new(NodeConfig::default()));
        assert!(matches!(
            node.send("n2", &Body::new("ping")).await,
            Err(NodeError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_send_serialization_error_is_synchronous() {
        let (node, mut rx) = initialized(NodeBuilder::new(NodeConfig::default())).await;
        let err = node.send("n2", &vec![1, 2, 3]).await.unwrap_err();
        assert!(matches!(err, NodeError::Serialization(_)));
        assert!(rx.try_recv().is_err(), "nothing should be enqueued");
    }

    #[tokio::test]
    async fn test_rpc_returns_correlated_reply() {
        let (node, mut rx) = initialized(NodeBuilder::new(NodeConfig::default())).await;

        let caller = node.clone();
        let call = tokio::spawn(async move { caller.rpc("n2", &Body::new("read")).await });

        let request = rx.recv().await.unwrap();
        let msg_id = request.body.msg_id.unwrap();
        assert!(node.has_pending(msg_id));

        let reply = Envelope::new("n2", "n1", Body::new("read_ok").with_in_reply_to(msg_id));
        node.dispatch(reply).await.unwrap();

        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply.body.in_reply_to, Some(msg_id));
        assert!(!node.has_pending(msg_id));
    }

    #[tokio::test]
    async fn test_concurrent_rpcs_get_their_own_replies() {
        let (node, mut rx) = initialized(NodeBuilder::new(NodeConfig::default())).await;

        let a = node.clone();
        let b = node.clone();
        let call_a = tokio::spawn(async move { a.rpc("n2", &json!({"type": "read", "tag": "a"})).await });
        let call_b = tokio::spawn(async move { b.rpc("n3", &json!({"type": "read", "tag": "b"})).await });

        let mut requests = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        // Answer in reverse order of arrival
        requests.reverse();
        for request in &requests {
            let tag = request.body.field("tag").cloned().unwrap();
            let reply = Envelope::new(
                request.dest.clone(),
                "n1",
                Body::new("read_ok")
                    .with_in_reply_to(request.body.msg_id.unwrap())
                    .with_field("tag", tag),
            );
            node.dispatch(reply).await.unwrap();
        }

        let reply_a = call_a.await.unwrap().unwrap();
        let reply_b = call_b.await.unwrap().unwrap();
        assert_eq!(reply_a.body.field("tag"), Some(&json!("a")));
        assert_eq!(reply_b.body.field("tag"), Some(&json!("b")));
        assert_eq!(node.pending_rpc_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rpc_times_out_and_releases_slot() {
        let (node, mut rx) = initialized(NodeBuilder::new(NodeConfig::default())).await;

        let started = tokio::time::Instant::now();
        let err = node.rpc("n9", &Body::new("read")).await.unwrap_err();

        let request = rx.recv().await.unwrap();
        let msg_id = request.body.msg_id.unwrap();
        match err {
            NodeError::RpcTimeout { msg_id: id, dest, timeout } => {
                assert_eq!(id, msg_id);
                assert_eq!(dest, "n9");
                assert_eq!(timeout, Duration::from_secs(10));
            }
            other => panic!("Expected RpcTimeout, got {:?}", other),
        }
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(!node.has_pending(msg_id));
        assert_eq!(node.pending_rpc_count(), 0);
    }

    #[tokio::test]
    async fn test_replies_never_reach_type_handlers() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);
        let builder = NodeBuilder::new(NodeConfig::default()).handle("read_ok", move |_ctx, _msg| {
            let flag = Arc::clone(&flag);
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }
        });
        let (node, _rx) = initialized(builder).await;

        // Dangling: nobody is waiting on 77
        let reply = Envelope::new("n2", "n1", Body::new("read_ok").with_in_reply_to(77));
        node.dispatch(reply).await.unwrap();

        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiting_rpc() {
        let (node, mut rx) = initialized(NodeBuilder::new(NodeConfig::default())).await;

        let caller = node.clone();
        let call = tokio::spawn(async move { caller.rpc("n2", &Body::new("read")).await });
        let request = rx.recv().await.unwrap();

        node.cancel_in_flight();
        assert!(matches!(call.await.unwrap(), Err(NodeError::ShuttingDown)));
        assert!(!node.has_pending(request.body.msg_id.unwrap()));
    }

    #[tokio::test]
    async fn test_builder_keeps_init_builtin() {
        let builder = NodeBuilder::new(NodeConfig::default())
            .handle("init", |_ctx, _msg| async { Ok(()) })
            .handle("read", |_ctx, _msg| async { Ok(()) });
        assert_eq!(builder.registered_types(), vec!["read"]);
    }

    #[tokio::test]
    async fn test_run_dispatches_until_queue_closes() {
        let (node, mut out) = test_node(NodeBuilder::new(NodeConfig::default()));
        let (tx, rx) = mpsc::channel(4);

        let loop_handle = tokio::spawn(node.clone().run(rx));
        tx.send(init_envelope("n1", &["n1"])).await.unwrap();
        drop(tx);

        assert_eq!(loop_handle.await.unwrap(), 1);
        assert!(node.quiesce(Duration::from_secs(1)).await);
        assert_eq!(out.recv().await.unwrap().msg_type(), INIT_OK);
    }
}
