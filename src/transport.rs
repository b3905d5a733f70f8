use std::{
    fmt::Display,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{
    error::Error,
    history::{HistoryBuffer, DEFAULT_HISTORY_CAPACITY},
};

/// Pseudo terminal raw mode setup.
pub mod raw_mode;

/// Serial port transport.
pub mod serial;

/// Raw TCP ("telnet") transport.
pub mod tcp;

/// The largest chunk a read loop hands over in one go.
pub(crate) const READ_CHUNK: usize = 4096;

/// Which kind of device a session talks to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// A tty/COM device, keyed by its path.
    #[default]
    Serial,

    /// A raw TCP stream, keyed by `host:port`.
    #[serde(alias = "telnet")]
    Tcp,
}

impl Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionKind::Serial => write!(f, "serial"),
            ConnectionKind::Tcp => write!(f, "tcp"),
        }
    }
}

/// Lifecycle of a transport.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransportState {
    /// Nothing is open.
    Disconnected,

    /// An open is in progress.
    Connecting,

    /// The device is open and the read loop runs.
    Connected,

    /// The last open attempt failed.
    Failed,
}

impl Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            TransportState::Disconnected => "disconnected",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Failed => "failed",
        };
        write!(f, "{state}")
    }
}

/// Settings shared by every transport a registry creates.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Baud rate for serial sessions which do not ask for one.
    pub default_baud_rate: u32,

    /// Upper bound for a single blocking serial read.
    pub serial_timeout: Duration,

    /// Bytes of history kept per session.
    pub history_capacity: usize,

    /// Log device payloads at debug level.
    pub log_device_data: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            default_baud_rate: serial::DEFAULT_BAUD_RATE,
            serial_timeout: Duration::from_millis(100),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            log_device_data: false,
        }
    }
}

/// Receives every chunk a transport reads, in order.
///
/// Invoked from the read loop while the transport's feed is locked,
/// so it must be quick and must not call back into the transport.
pub type DataCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Identifies one installed [`DataCallback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackToken(Uuid);

impl Display for CallbackToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Feed {
    history: HistoryBuffer,
    callback: Option<(CallbackToken, DataCallback)>,
}

/// The parts of a transport which are the same for every variant:
/// lifecycle state, history and the single subscriber slot.
///
/// Shared between a transport and its read loop.
pub struct TransportCore {
    key: String,
    state: watch::Sender<TransportState>,
    feed: Mutex<Feed>,
    log_device_data: bool,
}

impl TransportCore {
    pub(crate) fn new(key: &str, settings: &TransportSettings) -> Self {
        let (state, _) = watch::channel(TransportState::Disconnected);

        Self {
            key: key.into(),
            state,
            feed: Mutex::new(Feed {
                history: HistoryBuffer::new(settings.history_capacity),
                callback: None,
            }),
            log_device_data: settings.log_device_data,
        }
    }

    fn feed(&self) -> MutexGuard<'_, Feed> {
        // Every critical section is a single append or replace,
        // so a poisoned feed is still consistent.
        self.feed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The session key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: TransportState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(key = %self.key, %previous, %state, "State change");
        }
    }

    /// Observe lifecycle changes.
    pub fn state_changes(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    /// Record a chunk from the device and hand it to the subscriber, if any.
    pub(crate) fn deliver(&self, chunk: &[u8]) {
        if self.log_device_data {
            debug!(key = %self.key, data = %String::from_utf8_lossy(chunk), "From device");
        }

        let mut feed = self.feed();
        feed.history.append(chunk);

        match &feed.callback {
            Some((_, callback)) => callback(chunk),
            None => trace!(key = %self.key, "Read {} bytes, nobody is listening", chunk.len()),
        }
    }

    /// A copy of the history.
    pub fn history(&self) -> Vec<u8> {
        self.feed().history.snapshot()
    }

    /// Bytes currently held in the history.
    pub fn history_len(&self) -> usize {
        self.feed().history.len()
    }

    /// Install (replacing any previous) or clear the subscriber.
    pub fn set_callback(&self, callback: Option<DataCallback>) -> Option<CallbackToken> {
        let installed = callback.map(|callback| (CallbackToken(Uuid::new_v4()), callback));
        let token = installed.as_ref().map(|(token, _)| *token);

        self.feed().callback = installed;
        token
    }

    /// Snapshot the history and install the subscriber in one step,
    /// so nothing read in between is lost or seen twice.
    pub fn subscribe(&self, callback: DataCallback) -> (CallbackToken, Vec<u8>) {
        let token = CallbackToken(Uuid::new_v4());

        let mut feed = self.feed();
        let history = feed.history.snapshot();
        feed.callback = Some((token, callback));

        (token, history)
    }

    /// Clear the subscriber, but only if it is still the one `token` refers to.
    pub fn clear_callback_if(&self, token: CallbackToken) -> bool {
        let mut feed = self.feed();

        match &feed.callback {
            Some((installed, _)) if *installed == token => {
                feed.callback = None;
                true
            }
            _ => false,
        }
    }
}

/// A device connection: something which produces bytes and accepts bytes.
///
/// Variants only implement opening, closing and writing.
/// Everything touching state, history and the subscriber is shared via [`TransportCore`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// The shared state of this transport.
    fn core(&self) -> &TransportCore;

    /// Which kind of device this is.
    fn kind(&self) -> ConnectionKind;

    /// The configured baud rate, for transports which have one.
    fn baud_rate(&self) -> Option<u32> {
        None
    }

    /// Open the device and start the read loop.
    ///
    /// Failure is reported as `false`, never as a panic,
    /// and leaves nothing open behind.
    /// Connecting an already connected transport is a no-op returning `true`.
    async fn connect(&self) -> bool;

    /// Stop the read loop, wait for it, clear the subscriber and close the device.
    ///
    /// Once this returns the subscriber is never invoked again.
    /// Disconnecting twice is a no-op.
    async fn disconnect(&self);

    /// Write all bytes to the device and flush.
    async fn send(&self, bytes: &[u8]) -> Result<(), Error>;

    /// The session key (device path, or `host:port`).
    fn key(&self) -> &str {
        self.core().key()
    }

    /// Current lifecycle state.
    fn state(&self) -> TransportState {
        self.core().state()
    }

    /// True if the device is open and being read.
    fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }

    /// Observe lifecycle changes.
    fn state_changes(&self) -> watch::Receiver<TransportState> {
        self.core().state_changes()
    }

    /// Install or clear the single subscriber. Last writer wins.
    fn set_data_callback(&self, callback: Option<DataCallback>) -> Option<CallbackToken> {
        self.core().set_callback(callback)
    }

    /// Clear the subscriber if `token` still refers to it.
    fn clear_data_callback_if(&self, token: CallbackToken) -> bool {
        self.core().clear_callback_if(token)
    }

    /// Atomically snapshot the history and install a subscriber.
    fn subscribe(&self, callback: DataCallback) -> (CallbackToken, Vec<u8>) {
        self.core().subscribe(callback)
    }

    /// A copy of the recent output.
    fn history(&self) -> Vec<u8> {
        self.core().history()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;

    fn core() -> TransportCore {
        TransportCore::new(
            "test",
            &TransportSettings {
                history_capacity: 8,
                ..Default::default()
            },
        )
    }

    fn counting() -> (DataCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let task_count = count.clone();

        let callback: DataCallback = Arc::new(move |chunk: &[u8]| {
            task_count.fetch_add(chunk.len(), Ordering::SeqCst);
        });

        (callback, count)
    }

    #[test]
    fn deliver_appends_history_and_calls_back() {
        let core = core();
        let (callback, count) = counting();
        core.set_callback(Some(callback));

        core.deliver(b"abc");
        core.deliver(b"defghij");

        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert_eq!(core.history(), b"cdefghij");
    }

    #[test]
    fn newest_callback_wins() {
        let core = core();
        let (first, first_count) = counting();
        let (second, second_count) = counting();

        core.set_callback(Some(first));
        core.set_callback(Some(second));
        core.deliver(b"xy");

        assert_eq!(first_count.load(Ordering::SeqCst), 0);
        assert_eq!(second_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stale_token_does_not_clear_newer_callback() {
        let core = core();
        let (old, _) = counting();
        let (new, new_count) = counting();

        let old_token = core.set_callback(Some(old)).unwrap();
        let (new_token, _) = core.subscribe(new);

        assert!(!core.clear_callback_if(old_token));
        core.deliver(b"z");
        assert_eq!(new_count.load(Ordering::SeqCst), 1);

        assert!(core.clear_callback_if(new_token));
        core.deliver(b"z");
        assert_eq!(new_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscribe_returns_history_before_the_callback_sees_anything() {
        let core = core();
        core.deliver(b"prompt> ");

        let (callback, count) = counting();
        let (_, history) = core.subscribe(callback);

        assert_eq!(history, b"prompt> ");
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn state_changes_are_observable() {
        let core = core();
        let states = core.state_changes();

        core.set_state(TransportState::Connected);

        assert_eq!(*states.borrow(), TransportState::Connected);
        assert_eq!(core.state(), TransportState::Connected);
    }

    #[test]
    fn kind_accepts_telnet_alias() {
        let kind: ConnectionKind = serde_json::from_str("\"telnet\"").unwrap();
        assert_eq!(kind, ConnectionKind::Tcp);

        let kind: ConnectionKind = serde_json::from_str("\"serial\"").unwrap();
        assert_eq!(kind, ConnectionKind::Serial);
    }
}
