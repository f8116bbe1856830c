//! Meshnode
//!
//! The node process a distributed-systems test harness spawns: it reads
//! newline-delimited JSON messages on stdin and writes its own on stdout.
//! Diagnostics go to stderr.
//!
//! ## Usage
//!
//! ```bash
//! # Flood-fill broadcast node
//! meshnode broadcast
//!
//! # Unique id generator
//! meshnode unique-id
//!
//! # Both workloads on one node, with debug logs and a JSONL trace
//! meshnode -vv --log-dir ./logs --instance n1 all
//!
//! # Exit when stdin closes instead of waiting for a signal
//! meshnode broadcast --exit-on-eof < messages.jsonl
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use meshnode_core::logging::LoggingBuilder;
use meshnode_core::{Broadcaster, IdGenerator, NodeBuilder, NodeConfig};
use tracing::info;

/// How long the runtime waits for the blocked stdin reader on exit
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(200);

/// Meshnode - cluster node for distributed-systems test harnesses
#[derive(Parser)]
#[command(name = "meshnode")]
#[command(version = "0.1.0")]
#[command(about = "Meshnode - cluster node for distributed-systems test harnesses")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Also write JSONL logs under this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Instance name for JSONL logs (default: node-<pid>)
    #[arg(long, global = true)]
    instance: Option<String>,

    #[command(flatten)]
    runtime: RuntimeArgs,

    #[command(subcommand)]
    command: Workload,
}

/// Runtime tunables
#[derive(Args)]
struct RuntimeArgs {
    /// Capacity of the inbound and outbound queues
    #[arg(long, global = true, default_value_t = meshnode_core::config::DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// RPC reply timeout in milliseconds
    #[arg(long, global = true, default_value_t = 10_000)]
    rpc_timeout_ms: u64,

    /// Time in-flight handlers get to finish on shutdown, in milliseconds
    #[arg(long, global = true, default_value_t = 2_000)]
    shutdown_grace_ms: u64,

    /// Shut down when stdin reaches end-of-file
    #[arg(long, global = true)]
    exit_on_eof: bool,

    /// Longest accepted inbound line in bytes
    #[arg(long, global = true, default_value_t = meshnode_core::config::DEFAULT_MAX_LINE_BYTES)]
    max_line_bytes: usize,
}

impl RuntimeArgs {
    fn to_config(&self) -> NodeConfig {
        NodeConfig::default()
            .with_queue_capacity(self.queue_capacity)
            .with_rpc_timeout(Duration::from_millis(self.rpc_timeout_ms))
            .with_shutdown_grace(Duration::from_millis(self.shutdown_grace_ms))
            .with_exit_on_eof(self.exit_on_eof)
            .with_max_line_bytes(self.max_line_bytes)
    }
}

#[derive(Subcommand, Clone, Copy)]
enum Workload {
    /// Gossip broadcast (broadcast, read, topology)
    Broadcast,

    /// Cluster-unique id generation (generate)
    UniqueId,

    /// Both workloads on one node
    All,
}

impl Workload {
    fn register(self, builder: NodeBuilder) -> NodeBuilder {
        match self {
            Workload::Broadcast => Arc::new(Broadcaster::new()).register(builder),
            Workload::UniqueId => Arc::new(IdGenerator::new()).register(builder),
            Workload::All => {
                let builder = Arc::new(Broadcaster::new()).register(builder);
                Arc::new(IdGenerator::new()).register(builder)
            }
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli)?;

    let config = cli.runtime.to_config();
    config.validate()?;
    let builder = cli.command.register(NodeBuilder::new(config));
    info!(types = ?builder.registered_types(), "Starting node");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(meshnode_core::run_stdio(builder));
    // stdin is read on a blocking thread that can't be interrupted
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);

    let report = result?;
    info!(
        lines_read = report.lines_read,
        lines_dropped = report.lines_dropped,
        envelopes_written = report.envelopes_written,
        "Node exited"
    );
    Ok(())
}

fn setup_logging(cli: &Cli) -> Result<()> {
    let mut logging = LoggingBuilder::new().verbosity(cli.verbose);
    if let Some(dir) = &cli.log_dir {
        let instance = cli
            .instance
            .clone()
            .unwrap_or_else(|| format!("node-{}", std::process::id()));
        logging = logging.jsonl(dir, instance);
    }
    logging.init()?;
    Ok(())
}
