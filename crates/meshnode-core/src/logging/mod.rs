//! Structured logging for node processes.
//!
//! Human-readable output goes to stderr (stdout is the transport). With a
//! log directory configured, every event is also appended as one JSON
//! object per line to a per-instance file:
//!
//! ```text
//! logs/
//! └── raw/
//!     ├── 2026-10-16_n1.jsonl
//!     ├── 2026-10-16_n2.jsonl
//!     └── 2026-10-16_n3.jsonl
//! ```
//!
//! Files from all nodes of a test run can be merged back into one timeline
//! with [`read_entries`], or queried directly:
//!
//! ```bash
//! # Every dropped line across the cluster
//! jq 'select(.msg == "Dropping malformed line")' logs/raw/*.jsonl
//!
//! # Gossip absorbed by n2, in order
//! jq 'select(.instance == "n2" and .target == "meshnode_core::broadcast")' logs/raw/*.jsonl
//! ```

pub mod entry;
pub mod layer;
pub mod writer;

pub use entry::JsonLogEntry;
pub use layer::{verbosity_filter, JsonlLayer, LoggingBuilder};
pub use writer::{read_entries, read_instance_entries, InstanceLogWriter};
