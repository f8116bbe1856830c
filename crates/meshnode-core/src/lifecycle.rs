//! Process lifecycle: start the pumps and the dispatch loop, run until told
//! to stop, then shut everything down in order.
//!
//! ## Shutdown sequence
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  1. interrupt (or EOF with exit_on_eof)                         │
//! │  2. stop inbound pump ──► inbound queue closes                  │
//! │  3. dispatch loop drains the queue and returns                  │
//! │  4. wait up to shutdown_grace for handler tasks                 │
//! │     └── still running? cancel RPC waits and blocked sends       │
//! │  5. stop outbound pump ──► drain, write, flush                  │
//! │  6. return ShutdownReport                                       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::NodeResult;
use crate::node::NodeBuilder;
use crate::transport;

/// What the node did over its lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Non-blank inbound lines
    pub lines_read: u64,
    /// Inbound lines dropped as malformed
    pub lines_dropped: u64,
    /// Envelopes handed to the dispatch loop
    pub envelopes_dispatched: u64,
    /// Envelopes written to the transport
    pub envelopes_written: u64,
    /// Whether the inbound stream reached end-of-file
    pub reached_eof: bool,
    /// Whether in-flight handlers had to be cancelled after the grace period
    pub handlers_cancelled: bool,
}

/// Run a node over `reader`/`writer` until `shutdown` resolves.
///
/// With `exit_on_eof` set, the end of the inbound stream also triggers
/// shutdown. A write failure on the transport ends the run early and is
/// returned after the rest of the node has been shut down.
pub async fn serve<R, W, F>(
    builder: NodeBuilder,
    reader: R,
    writer: W,
    shutdown: F,
) -> NodeResult<ShutdownReport>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = ()>,
{
    let config = builder.config().clone();
    config.validate()?;

    let (inbound_tx, inbound_rx) = mpsc::channel(config.queue_capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_capacity);
    let inbound_stop = CancellationToken::new();
    let outbound_stop = CancellationToken::new();

    let mut inbound = transport::spawn_inbound(
        reader,
        inbound_tx,
        config.max_line_bytes,
        inbound_stop.clone(),
    );
    let mut outbound = transport::spawn_outbound(writer, outbound_rx, outbound_stop.clone());

    let node = builder.build(outbound_tx);
    let dispatcher = tokio::spawn(node.clone().run(inbound_rx));
    info!(
        queue_capacity = config.queue_capacity,
        rpc_timeout = ?config.rpc_timeout,
        "Node started"
    );

    tokio::pin!(shutdown);
    let mut inbound_result = None;
    let mut outbound_result = None;
    tokio::select! {
        _ = &mut shutdown => info!("Shutdown requested"),
        result = &mut inbound, if config.exit_on_eof => {
            info!("Inbound stream finished, shutting down");
            inbound_result = Some(result);
        }
        result = &mut outbound => {
            warn!("Outbound pump exited early, shutting down");
            outbound_result = Some(result);
        }
    }

    inbound_stop.cancel();
    let inbound_stats = match inbound_result {
        Some(result) => result?,
        None => inbound.await?,
    };

    let envelopes_dispatched = dispatcher.await?;
    let graceful = node.quiesce(config.shutdown_grace).await;
    drop(node);

    outbound_stop.cancel();
    let outbound_stats = match outbound_result {
        Some(result) => result??,
        None => outbound.await??,
    };

    let report = ShutdownReport {
        lines_read: inbound_stats.lines_read,
        lines_dropped: inbound_stats.lines_dropped,
        envelopes_dispatched,
        envelopes_written: outbound_stats.envelopes_written,
        reached_eof: inbound_stats.reached_eof,
        handlers_cancelled: !graceful,
    };
    info!(?report, "Node stopped");
    Ok(report)
}

/// Run a node over stdin/stdout until an interrupt or terminate signal.
pub async fn run_stdio(builder: NodeBuilder) -> NodeResult<ShutdownReport> {
    serve(builder, tokio::io::stdin(), tokio::io::stdout(), shutdown_signal()).await
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => debug!("Received interrupt"),
        _ = terminate => debug!("Received SIGTERM"),
    }
}
