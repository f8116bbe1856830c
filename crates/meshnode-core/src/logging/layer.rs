//! `tracing` layer that mirrors events into the instance's JSONL file, and
//! the subscriber setup used by the node binary.

use std::fmt::Write as FmtWrite;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Number, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use super::entry::JsonLogEntry;
use super::writer::InstanceLogWriter;
use crate::error::{NodeError, NodeResult};

/// Writes every event it sees to an [`InstanceLogWriter`].
pub struct JsonlLayer {
    writer: Arc<InstanceLogWriter>,
}

impl JsonlLayer {
    pub fn new(logs_dir: impl AsRef<Path>, instance: impl Into<String>) -> std::io::Result<Self> {
        Ok(Self {
            writer: Arc::new(InstanceLogWriter::new(logs_dir, instance)?),
        })
    }

    /// Path of the file being written
    pub fn log_path(&self) -> &Path {
        self.writer.path()
    }

    pub fn instance(&self) -> &str {
        self.writer.instance()
    }
}

impl<S> Layer<S> for JsonlLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();

        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let mut entry = JsonLogEntry::new(
            metadata.level().as_str().to_lowercase(),
            self.writer.instance(),
            metadata.target(),
            visitor.message.unwrap_or_default(),
        );
        if !visitor.fields.is_empty() {
            entry = entry.with_fields(Value::Object(visitor.fields));
        }
        if let Some(scope) = ctx.event_scope(event) {
            let spans: Vec<&str> = scope.from_root().map(|span| span.name()).collect();
            if !spans.is_empty() {
                entry = entry.with_span(spans.join(" > "));
            }
        }

        // Logging must never take the node down
        let _ = self.writer.write(&entry);
    }
}

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl JsonVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut buf = String::new();
        let _ = write!(&mut buf, "{:?}", value);
        if field.name() == "message" {
            self.message = Some(buf);
        } else {
            self.insert(field, Value::String(buf));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.insert(field, Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::Bool(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = Number::from_f64(value) {
            self.insert(field, Value::Number(n));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, Value::String(value.to_string()));
    }
}

/// Default filter directive for a `-v` count
pub fn verbosity_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Installs the global subscriber for a node process.
///
/// Human-readable output always goes to stderr, since stdout carries the
/// transport. `RUST_LOG` overrides the verbosity-derived filter.
#[derive(Debug, Clone, Default)]
pub struct LoggingBuilder {
    verbose: u8,
    jsonl: Option<(PathBuf, String)>,
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `-v` flags given
    pub fn verbosity(mut self, verbose: u8) -> Self {
        self.verbose = verbose;
        self
    }

    /// Also write JSONL entries under `logs_dir` for `instance`
    pub fn jsonl(mut self, logs_dir: impl Into<PathBuf>, instance: impl Into<String>) -> Self {
        self.jsonl = Some((logs_dir.into(), instance.into()));
        self
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(verbosity_filter(self.verbose)))
    }

    /// Build the JSONL layer on its own, if one was requested
    pub fn build_layer(&self) -> NodeResult<Option<JsonlLayer>> {
        self.jsonl
            .as_ref()
            .map(|(dir, instance)| JsonlLayer::new(dir, instance.clone()))
            .transpose()
            .map_err(NodeError::from)
    }

    /// Install the subscriber. Returns the JSONL file path, if any.
    pub fn init(self) -> NodeResult<Option<PathBuf>> {
        let jsonl = self.build_layer()?;
        let path = jsonl.as_ref().map(|layer| layer.log_path().to_path_buf());

        tracing_subscriber::registry()
            .with(self.env_filter())
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .with(jsonl)
            .try_init()
            .map_err(|e| NodeError::Config(format!("logging already initialized: {}", e)))?;

        Ok(path)
    }
}
