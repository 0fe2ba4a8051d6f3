//! Endpoints: a framed transport paired with an identity and queue wiring.
//!
//! Each endpoint owns two tasks. The reader task drains the transport into
//! the router's event queue in wire order; the writer task drains an
//! outbound queue onto the transport, serializing writes so frames are never
//! interleaved. The router itself never touches a stream directly.
//!
//! Endpoints are built from any `AsyncRead`/`AsyncWrite` pair, so tests can
//! drive the router over in-memory duplex pipes exactly the way production
//! drives it over child stdio.

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant, sleep_until};

use crate::error::FramingError;
use crate::jsonrpc::Message;
use crate::router::Event;
use crate::transport::{MessageReader, MessageWriter};

/// Outbound queue depth per endpoint. A peer that stops reading blocks the
/// router once this fills, which is the intended backpressure.
const OUTBOUND_QUEUE: usize = 256;

/// Which peer an endpoint speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// The single LSP client on our stdin/stdout.
    Client,
    /// Server `s[i]`, in command-line order; index 0 is primary.
    Server(usize),
}

/// One event from an endpoint's read side, delivered in wire order.
#[derive(Debug)]
pub enum StreamEvent {
    /// A classified message.
    Message(Message),
    /// Clean end of stream.
    Eof,
    /// Unrecoverable framing error; the stream is unusable past this point.
    Fatal(FramingError),
}

/// An endpoint handle held by the router.
pub struct Endpoint {
    /// Identity of the peer.
    pub source: Source,
    /// Display name; servers get renamed once `serverInfo.name` is known.
    name: watch::Sender<String>,
    outbound: mpsc::Sender<(Value, Instant)>,
    alive: bool,
}

impl Endpoint {
    /// Wire up an endpoint from a raw stream pair, spawning its reader and
    /// writer tasks. `delay` postpones each outbound message by that amount
    /// on an independent timer (wire order is still preserved because the
    /// writer drains in FIFO order and all delays are equal).
    pub fn start<R, W>(
        source: Source,
        name: impl Into<String>,
        reader: R,
        writer: W,
        events: mpsc::Sender<Event>,
        delay: Option<Duration>,
    ) -> Endpoint
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (name_tx, _) = watch::channel(name.into());

        tokio::spawn(read_loop(MessageReader::new(reader), source, events));
        tokio::spawn(write_loop(MessageWriter::new(writer), outbound_rx, delay));

        Endpoint {
            source,
            name: name_tx,
            outbound,
            alive: true,
        }
    }

    /// Enqueue a message for this peer. Blocks only when the peer has
    /// stopped draining its stream. Returns `false` when the writer task is
    /// gone, which the caller treats like a dead endpoint.
    pub async fn send(&self, message: &Message) -> bool {
        self.outbound
            .send((message.to_value(), Instant::now()))
            .await
            .is_ok()
    }

    /// Current display name.
    pub fn name(&self) -> String {
        self.name.borrow().clone()
    }

    /// A receiver that observes name changes (used by the stderr forwarder).
    pub fn name_watch(&self) -> watch::Receiver<String> {
        self.name.subscribe()
    }

    /// Replace the display name (after `serverInfo.name` is learned).
    pub fn rename(&self, name: String) {
        let _ = self.name.send(name);
    }

    /// Whether the endpoint is still usable.
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Mark the endpoint dead. Dropping the outbound sender would close the
    /// peer's input stream, which the shutdown sequence does explicitly.
    pub fn mark_dead(&mut self) {
        self.alive = false;
    }
}

/// Reader task: transport frames → router events, in wire order.
async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: MessageReader<R>,
    source: Source,
    events: mpsc::Sender<Event>,
) {
    loop {
        let event = match reader.read_message().await {
            Ok(Some(value)) => match Message::classify(value) {
                Ok(message) => StreamEvent::Message(message),
                Err(e) => {
                    // Structurally invalid but well-framed: drop and go on.
                    tracing::warn!(?source, error = %e, "unclassifiable message dropped");
                    continue;
                }
            },
            Ok(None) => StreamEvent::Eof,
            Err(e) => StreamEvent::Fatal(e),
        };
        let terminal = !matches!(event, StreamEvent::Message(_));
        if events.send(Event::Stream(source, event)).await.is_err() {
            return; // router gone, nothing left to report to
        }
        if terminal {
            return;
        }
    }
}

/// Writer task: outbound queue → transport, FIFO, one frame at a time.
async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: MessageWriter<W>,
    mut outbound: mpsc::Receiver<(Value, Instant)>,
    delay: Option<Duration>,
) {
    while let Some((value, enqueued)) = outbound.recv().await {
        if let Some(delay) = delay {
            sleep_until(enqueued + delay).await;
        }
        if let Err(e) = writer.write_message(&value).await {
            tracing::warn!(error = %e, "write failed, closing endpoint writer");
            return;
        }
    }
    let _ = writer.close().await;
}
