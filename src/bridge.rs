//! Relays one transport's output to one viewer.
//!
//! Chunks from the read loop are pushed onto a bounded queue without waiting.
//! A consumer task drains that queue, coalescing whatever is already waiting
//! into a single payload per viewer message. The consumer waits for the viewer,
//! so a viewer which falls behind fills the queue and new chunks are dropped.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

use crate::{
    error::Error,
    registry::SessionRegistry,
    transport::{CallbackToken, DataCallback, Transport, TransportState},
};

/// How many messages may wait between the relay and the viewer's socket.
pub const VIEWER_BACKLOG: usize = 8;

/// Knobs for viewer sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeSettings {
    /// How many chunks may wait for the viewer before new ones are dropped.
    pub queue_capacity: usize,

    /// At most this many chunks go into one viewer message.
    pub batch_max_chunks: usize,

    /// Stop adding chunks to a message once it holds this many bytes.
    pub batch_max_bytes: usize,

    /// Send a carriage return to a device with no history when a viewer attaches,
    /// which usually makes it print its prompt.
    pub probe_on_empty_history: bool,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            batch_max_chunks: 50,
            batch_max_bytes: 32 * 1024,
            probe_on_empty_history: true,
        }
    }
}

/// Structured messages to a viewer, next to the plain text payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Notice {
    /// Something went wrong.
    Error {
        /// Human readable description.
        message: String,
    },
}

impl Notice {
    /// An error notice.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// The wire form of this notice.
    pub fn to_json(&self) -> String {
        // A tagged enum with a single string field cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// What a viewer is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Device output, decoded as text.
    Payload(String),

    /// A structured notice.
    Notice(Notice),
}

/// Decodes a byte stream as UTF-8 across chunk boundaries.
///
/// A multi byte sequence split over two chunks is held back until complete.
/// Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    /// Decode the next chunk of the stream.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let mut input = std::mem::take(&mut self.carry);
        input.extend_from_slice(bytes);

        let mut decoded = String::with_capacity(input.len());
        let mut rest = &input[..];

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    decoded.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, invalid) = rest.split_at(e.valid_up_to());
                    decoded.push_str(&String::from_utf8_lossy(valid));

                    match e.error_len() {
                        Some(len) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            rest = &invalid[len..];
                        }
                        None => {
                            // Incomplete sequence at the end, wait for the rest.
                            self.carry = invalid.to_vec();
                            break;
                        }
                    }
                }
            }
        }

        decoded
    }
}

/// A data callback pushing chunks onto `queue`.
///
/// Never waits: if the queue is full the chunk is dropped and counted.
fn enqueue_callback(queue: mpsc::Sender<Bytes>, dropped: Arc<AtomicUsize>) -> DataCallback {
    Arc::new(move |chunk: &[u8]| {
        match queue.try_send(Bytes::copy_from_slice(chunk)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(chunk)) => {
                let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(bytes = chunk.len(), total, "Viewer queue full, dropping chunk");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("Viewer queue closed");
            }
        }
    })
}

/// Take whatever else is queued right now, up to the limits, after `first`.
fn drain_batch(
    first: Bytes,
    queue: &mut mpsc::Receiver<Bytes>,
    max_chunks: usize,
    max_bytes: usize,
) -> BytesMut {
    let mut batch = BytesMut::from(&first[..]);
    let mut chunks = 1;

    while chunks < max_chunks && batch.len() < max_bytes {
        match queue.try_recv() {
            Ok(chunk) => {
                batch.extend_from_slice(&chunk);
                chunks += 1;
            }
            Err(_) => break,
        }
    }

    batch
}

async fn relay(
    mut queue: mpsc::Receiver<Bytes>,
    viewer: mpsc::Sender<Outbound>,
    mut decoder: Utf8Decoder,
    settings: BridgeSettings,
    cancel: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            chunk = queue.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        let batch = drain_batch(
            first,
            &mut queue,
            settings.batch_max_chunks,
            settings.batch_max_bytes,
        );
        trace!("Relaying {} bytes", batch.len());

        let text = decoder.decode(&batch);
        if text.is_empty() {
            continue;
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            sent = viewer.send(Outbound::Payload(text)) => if sent.is_err() {
                debug!("Viewer went away");
                break;
            },
        }
    }

    debug!("Relay stopped");
}

/// One viewer attached to one transport.
pub struct BridgeSession {
    id: Uuid,
    transport: Arc<dyn Transport>,
    token: CallbackToken,
    cancel: CancellationToken,
    consumer: JoinHandle<()>,
    dropped: Arc<AtomicUsize>,
}

impl BridgeSession {
    /// Attach a viewer to the session `key`.
    ///
    /// Fails with [`Error::NotConnected`] if there is no such live session.
    pub fn attach(
        registry: &SessionRegistry,
        key: &str,
        viewer: mpsc::Sender<Outbound>,
        settings: &BridgeSettings,
    ) -> Result<Self, Error> {
        let transport = registry
            .transport(key)
            .ok_or_else(|| Error::NotConnected(key.into()))?;

        Self::attach_transport(transport, viewer, settings)
    }

    /// Attach a viewer to a transport.
    ///
    /// The recent history is sent to the viewer first, then live output.
    pub fn attach_transport(
        transport: Arc<dyn Transport>,
        viewer: mpsc::Sender<Outbound>,
        settings: &BridgeSettings,
    ) -> Result<Self, Error> {
        if !transport.is_connected() {
            return Err(Error::NotConnected(transport.key().into()));
        }

        let id = Uuid::new_v4();
        let span = info_span!("viewer", %id, key = %transport.key());
        let _entered = span.enter();

        let (queue_tx, queue_rx) = mpsc::channel(settings.queue_capacity.max(1));
        let dropped = Arc::new(AtomicUsize::new(0));

        let (token, history) = transport.subscribe(enqueue_callback(queue_tx, dropped.clone()));

        let cancel = CancellationToken::new();
        let mut decoder = Utf8Decoder::default();
        if history.is_empty() {
            if settings.probe_on_empty_history {
                probe(transport.clone());
            }
        } else {
            debug!(bytes = history.len(), "Replaying history");
            let text = decoder.decode(&history);
            if !text.is_empty() {
                match viewer.try_send(Outbound::Payload(text)) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("Viewer backlog full, history not replayed");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!("Viewer gone before history replay");
                        cancel.cancel();
                    }
                }
            }
        }

        let consumer = tokio::spawn(
            relay(queue_rx, viewer, decoder, settings.clone(), cancel.clone())
                .instrument(span.clone()),
        );

        info!("Viewer attached");

        Ok(Self {
            id,
            transport,
            token,
            cancel,
            consumer,
            dropped,
        })
    }

    /// Identifies this viewer in logs.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The session key of the transport.
    pub fn key(&self) -> &str {
        self.transport.key()
    }

    /// Send viewer input to the device, verbatim.
    pub async fn forward(&self, bytes: &[u8]) -> Result<(), Error> {
        if !self.transport.is_connected() {
            return Err(Error::NotConnected(self.key().into()));
        }

        self.transport.send(bytes).await
    }

    /// Observe the transport's lifecycle, to notice a disconnect mid-session.
    pub fn transport_state(&self) -> watch::Receiver<TransportState> {
        self.transport.state_changes()
    }

    /// How many chunks were dropped because the viewer fell behind.
    pub fn dropped_chunks(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop relaying.
    ///
    /// The consumer is stopped and awaited first. The callback is then removed,
    /// unless another viewer has installed its own in the meantime.
    pub async fn detach(self) {
        let Self {
            id,
            transport,
            token,
            cancel,
            consumer,
            dropped,
        } = self;

        cancel.cancel();
        if let Err(e) = consumer.await {
            warn!(?e, "Relay join error");
        }

        let cleared = transport.clear_data_callback_if(token);

        info!(
            %id,
            key = %transport.key(),
            cleared,
            dropped = dropped.load(Ordering::Relaxed),
            "Viewer detached"
        );
    }
}

/// Nudge the device into printing something (typically its prompt).
fn probe(transport: Arc<dyn Transport>) {
    tokio::spawn(
        async move {
            match transport.send(b"\r").await {
                Ok(()) => debug!("Sent probe"),
                Err(e) => warn!(%e, "Could not send probe"),
            }
        }
        .in_current_span(),
    );
}
