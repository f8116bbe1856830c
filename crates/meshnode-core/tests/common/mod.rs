//! In-process stand-in for the test harness.
//!
//! Each node runs `serve` over a pair of in-memory pipes. A router task per
//! node reads the node's output and delivers envelopes addressed to another
//! running node straight into that node's input; everything else (replies
//! to clients, gossip for peers that aren't running) lands in the outbox
//! the test reads from.

#![allow(dead_code)]

use std::collections::HashMap;
use std::time::Duration;

use meshnode_core::{serve, Body, Envelope, NodeBuilder, NodeResult, ShutdownReport};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// How long a test waits for any single expected message
pub const WAIT: Duration = Duration::from_secs(5);

const PIPE_CAPACITY: usize = 64 * 1024;

struct RunningNode {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<NodeResult<ShutdownReport>>,
}

pub struct Cluster {
    inputs: HashMap<String, mpsc::UnboundedSender<String>>,
    nodes: Vec<(String, RunningNode)>,
    outbox: mpsc::UnboundedReceiver<Envelope>,
    held: Vec<Envelope>,
    next_msg_id: u64,
}

impl Cluster {
    /// Start `ids` as a fully connected cluster and complete init on each.
    pub async fn start(ids: &[&str], builder: impl Fn() -> NodeBuilder) -> Self {
        Self::start_with_members(ids, ids, builder).await
    }

    /// Start `running`, but tell every node the cluster is `members`.
    ///
    /// Traffic for members that aren't running ends up in the outbox.
    pub async fn start_with_members(
        running: &[&str],
        members: &[&str],
        builder: impl Fn() -> NodeBuilder,
    ) -> Self {
        let (outbox_tx, outbox) = mpsc::unbounded_channel();
        let mut inputs = HashMap::new();
        let mut outputs = Vec::new();
        let mut nodes = Vec::new();

        for id in running {
            let (harness_in, node_in) = tokio::io::duplex(PIPE_CAPACITY);
            let (node_out, harness_out) = tokio::io::duplex(PIPE_CAPACITY);
            let (stop, stop_rx) = oneshot::channel::<()>();

            let handle = tokio::spawn(serve(builder(), node_in, node_out, async move {
                let _ = stop_rx.await;
            }));

            inputs.insert(id.to_string(), spawn_input_writer(harness_in));
            outputs.push(harness_out);
            nodes.push((id.to_string(), RunningNode { stop, handle }));
        }

        for output in outputs {
            spawn_router(output, inputs.clone(), outbox_tx.clone());
        }

        let mut cluster = Self {
            inputs,
            nodes,
            outbox,
            held: Vec::new(),
            next_msg_id: 0,
        };

        for id in running {
            let init = Body::new("init")
                .with_field("node_id", *id)
                .with_field("node_ids", json!(members));
            let reply = cluster.request("c0", id, init).await;
            assert_eq!(reply.msg_type(), "init_ok", "init of {} failed", id);
        }

        cluster
    }

    /// Deliver a raw line to a node.
    pub fn send_line(&self, dest: &str, line: impl Into<String>) {
        self.inputs[dest]
            .send(line.into())
            .expect("node input closed");
    }

    /// Deliver an envelope to a node.
    pub fn send(&self, envelope: Envelope) {
        let dest = envelope.dest.clone();
        self.send_line(&dest, envelope.to_line().unwrap());
    }

    /// Send a client request and wait for its correlated reply.
    pub async fn request(&mut self, client: &str, dest: &str, body: Body) -> Envelope {
        self.next_msg_id += 1;
        let msg_id = self.next_msg_id;
        self.send(Envelope::new(client, dest, body.with_msg_id(msg_id)));

        let client = client.to_string();
        self.recv_matching(|e| e.dest == client && e.body.in_reply_to == Some(msg_id))
            .await
    }

    /// `read` the broadcast log of a node
    pub async fn read(&mut self, client: &str, dest: &str) -> Vec<i64> {
        let reply = self.request(client, dest, Body::new("read")).await;
        assert_eq!(reply.msg_type(), "read_ok");
        serde_json::from_value(reply.body.field("messages").cloned().unwrap()).unwrap()
    }

    /// Wait for the next outbox envelope matching `pred`; others are held
    /// for later calls.
    pub async fn recv_matching(&mut self, pred: impl Fn(&Envelope) -> bool) -> Envelope {
        if let Some(i) = self.held.iter().position(&pred) {
            return self.held.remove(i);
        }

        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let envelope = tokio::time::timeout_at(deadline, self.outbox.recv())
                .await
                .expect("timed out waiting for envelope")
                .expect("outbox closed");
            if pred(&envelope) {
                return envelope;
            }
            self.held.push(envelope);
        }
    }

    /// Everything that reaches the outbox within `window`, held ones first.
    pub async fn collect_for(&mut self, window: Duration) -> Vec<Envelope> {
        let mut out: Vec<Envelope> = self.held.drain(..).collect();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(envelope)) = tokio::time::timeout_at(deadline, self.outbox.recv()).await {
            out.push(envelope);
        }
        out
    }

    /// Stop every node and collect their reports.
    pub async fn shutdown(self) -> Vec<(String, ShutdownReport)> {
        let mut reports = Vec::new();
        for (id, node) in self.nodes {
            let _ = node.stop.send(());
            let report = node.handle.await.unwrap().unwrap();
            reports.push((id, report));
        }
        reports
    }
}

fn spawn_input_writer(mut pipe: DuplexStream) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(mut line) = rx.recv().await {
            line.push('\n');
            if pipe.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });
    tx
}

fn spawn_router(
    output: DuplexStream,
    inputs: HashMap<String, mpsc::UnboundedSender<String>>,
    outbox: mpsc::UnboundedSender<Envelope>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(output).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let envelope = Envelope::from_line(line.as_bytes()).expect("node wrote invalid JSON");
            match inputs.get(&envelope.dest) {
                Some(input) => {
                    let _ = input.send(line);
                }
                None => {
                    let _ = outbox.send(envelope);
                }
            }
        }
    });
}
