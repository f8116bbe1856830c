//! Line transport pumps
//!
//! Two independent tasks sit between the byte streams and the dispatch
//! core:
//!
//! ```text
//!  reader ──► inbound pump ──► [queue] ──► dispatch loop
//!                                              │
//!  writer ◄── outbound pump ◄── [queue] ◄── handlers (send / reply / rpc)
//! ```
//!
//! The inbound pump decodes one envelope per line and hands it off as soon
//! as there is room in the queue; a line that fails to decode is logged and
//! skipped. The outbound pump writes envelopes in exactly the order they
//! were queued. Each pump stops when its token is cancelled: the inbound
//! side stops reading and closes its queue, the outbound side first writes
//! everything already queued, then flushes.

use futures::SinkExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{NodeError, NodeResult};
use crate::message::Envelope;

/// Counters reported by the inbound pump when it stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboundStats {
    /// Non-blank lines read
    pub lines_read: u64,
    /// Lines dropped because they could not be decoded
    pub lines_dropped: u64,
    /// Whether the stream ended (rather than the pump being stopped)
    pub reached_eof: bool,
}

/// Counters reported by the outbound pump when it stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboundStats {
    /// Envelopes written to the transport
    pub envelopes_written: u64,
    /// Envelopes that could not be serialized
    pub envelopes_dropped: u64,
}

/// Result of reading one line
#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    Line,
    TooLong(usize),
    Eof,
}

/// Spawn the inbound pump.
///
/// Decoded envelopes are pushed into `queue`; a full queue suspends reading
/// (backpressure) rather than dropping input. The queue is closed when the
/// pump returns.
pub fn spawn_inbound<R>(
    reader: R,
    queue: mpsc::Sender<Envelope>,
    max_line_bytes: usize,
    stop: CancellationToken,
) -> JoinHandle<InboundStats>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(run_inbound(BufReader::new(reader), queue, max_line_bytes, stop))
}

async fn run_inbound<R>(
    mut reader: R,
    queue: mpsc::Sender<Envelope>,
    max_line_bytes: usize,
    stop: CancellationToken,
) -> InboundStats
where
    R: AsyncBufRead + Unpin,
{
    let mut stats = InboundStats::default();
    let mut line = Vec::with_capacity(1024);

    loop {
        let read = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                debug!("Inbound pump stopped");
                break;
            }
            read = read_line(&mut reader, &mut line, max_line_bytes) => read,
        };

        match read {
            Ok(LineRead::Eof) => {
                info!(lines = stats.lines_read, "Inbound stream closed");
                stats.reached_eof = true;
                break;
            }
            Ok(LineRead::TooLong(len)) => {
                stats.lines_read += 1;
                stats.lines_dropped += 1;
                warn!(len, limit = max_line_bytes, "Dropping oversized line");
                continue;
            }
            Ok(LineRead::Line) => {}
            Err(e) => {
                warn!(error = %e, "Inbound read failed, stopping pump");
                break;
            }
        }

        if line.trim_ascii().is_empty() {
            continue;
        }
        stats.lines_read += 1;

        let envelope = match Envelope::from_line(&line) {
            Ok(envelope) => envelope,
            Err(e) => {
                stats.lines_dropped += 1;
                warn!(error = %e, line = %String::from_utf8_lossy(&line), "Dropping malformed line");
                continue;
            }
        };

        trace!(src = %envelope.src, msg_type = %envelope.msg_type(), "Received envelope");

        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                debug!("Inbound pump stopped while queue was full");
                break;
            }
            sent = queue.send(envelope) => {
                if sent.is_err() {
                    debug!("Dispatch queue closed, stopping inbound pump");
                    break;
                }
            }
        }
    }

    stats
}

/// Read one `\n`-terminated line into `buf`, without the terminator.
///
/// Lines longer than `limit` are consumed in full but not buffered.
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut seen = 0usize;

    loop {
        let (used, done) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(if seen == 0 {
                    LineRead::Eof
                } else if seen > limit {
                    LineRead::TooLong(seen)
                } else {
                    LineRead::Line
                });
            }

            let (chunk, used, done) = match available.iter().position(|b| *b == b'\n') {
                Some(i) => (&available[..i], i + 1, true),
                None => (available, available.len(), false),
            };

            seen += chunk.len();
            if seen <= limit {
                buf.extend_from_slice(chunk);
            } else {
                buf.clear();
            }
            (used, done)
        };

        reader.consume(used);

        if done {
            return Ok(if seen > limit {
                LineRead::TooLong(seen)
            } else {
                LineRead::Line
            });
        }
    }
}

/// Spawn the outbound pump.
///
/// Returns an error only when writing to the transport fails.
pub fn spawn_outbound<W>(
    writer: W,
    queue: mpsc::Receiver<Envelope>,
    stop: CancellationToken,
) -> JoinHandle<NodeResult<OutboundStats>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(run_outbound(writer, queue, stop))
}

async fn run_outbound<W>(
    writer: W,
    mut queue: mpsc::Receiver<Envelope>,
    stop: CancellationToken,
) -> NodeResult<OutboundStats>
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, LinesCodec::new());
    let mut stats = OutboundStats::default();

    loop {
        let next = tokio::select! {
            biased;
            next = queue.recv() => next,
            _ = stop.cancelled() => break,
        };

        match next {
            Some(envelope) => write_envelope(&mut sink, envelope, &mut stats).await?,
            None => {
                debug!("All senders gone, outbound pump finishing");
                break;
            }
        }
    }

    // Drain whatever was queued before the stop
    queue.close();
    while let Some(envelope) = queue.recv().await {
        write_envelope(&mut sink, envelope, &mut stats).await?;
    }

    SinkExt::<String>::flush(&mut sink).await.map_err(codec_error)?;
    debug!(written = stats.envelopes_written, "Outbound pump stopped");

    Ok(stats)
}

async fn write_envelope<W>(
    sink: &mut FramedWrite<W, LinesCodec>,
    envelope: Envelope,
    stats: &mut OutboundStats,
) -> NodeResult<()>
where
    W: AsyncWrite + Unpin,
{
    let line = match envelope.to_line() {
        Ok(line) => line,
        Err(e) => {
            stats.envelopes_dropped += 1;
            warn!(dest = %envelope.dest, error = %e, "Dropping unserializable envelope");
            return Ok(());
        }
    };

    trace!(dest = %envelope.dest, msg_type = %envelope.msg_type(), "Writing envelope");
    sink.send(line).await.map_err(codec_error)?;
    stats.envelopes_written += 1;
    Ok(())
}

fn codec_error(e: LinesCodecError) -> NodeError {
    match e {
        LinesCodecError::Io(e) => NodeError::Io(e),
        LinesCodecError::MaxLineLengthExceeded => {
            NodeError::Serialization("outbound line too long".to_string())
        }
    }
}
