//! The registry owns every open session.
//!
//! Lookups (status, send, attaching viewers) only take a short lived lock over the map.
//! Opening and closing sessions is serialized registry wide by a separate lifecycle lock,
//! so a slow connect never blocks traffic on other sessions.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::{
    error::Error,
    transport::{
        serial::{self, PortInfo, SerialParams, SerialTransport},
        tcp::{TcpAddress, TcpTransport},
        ConnectionKind, Transport, TransportSettings,
    },
};

/// Extra parameters for opening a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Serial line speed. The registry default is used if not given.
    /// Ignored for TCP sessions.
    pub baud_rate: Option<u32>,
}

impl ConnectOptions {
    /// Options asking for a specific baud rate.
    pub fn with_baud_rate(baud_rate: u32) -> Self {
        Self {
            baud_rate: Some(baud_rate),
        }
    }
}

/// A live session as reported by [`SessionRegistry::status`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionStatus {
    /// The session key.
    pub key: String,

    /// Which kind of transport backs the session.
    pub kind: ConnectionKind,

    /// Whether the transport is connected.
    pub connected: bool,

    /// Baud rate, for serial sessions.
    pub baud_rate: Option<u32>,

    /// How many bytes of history are held.
    pub history_bytes: usize,
}

type Sessions = HashMap<String, Arc<dyn Transport>>;

/// Owns the mapping from session key to transport.
///
/// Construct one per process and hand it (in an [`Arc`]) to whoever needs it.
/// Call [`SessionRegistry::disconnect`] with `None` on shutdown.
pub struct SessionRegistry {
    settings: TransportSettings,
    sessions: Mutex<Sessions>,
    lifecycle: AsyncMutex<()>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(TransportSettings::default())
    }
}

impl SessionRegistry {
    /// An empty registry. Transports it creates use the given settings.
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            settings,
            sessions: Mutex::new(HashMap::new()),
            lifecycle: AsyncMutex::new(()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, Sessions> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn build(
        &self,
        key: &str,
        kind: ConnectionKind,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn Transport>, Error> {
        let transport: Arc<dyn Transport> = match kind {
            ConnectionKind::Serial => Arc::new(SerialTransport::new(
                SerialParams {
                    path: key.into(),
                    baud_rate: options.baud_rate.unwrap_or(self.settings.default_baud_rate),
                },
                &self.settings,
            )),
            ConnectionKind::Tcp => Arc::new(TcpTransport::new(key.parse::<TcpAddress>()?, &self.settings)),
        };

        Ok(transport)
    }

    // Sessions whose read loop ended on its own (peer closed, device gone)
    // linger until here. Must be called with the lifecycle lock held.
    async fn prune_stale(&self) {
        let stale = {
            let mut sessions = self.sessions();
            let keys = sessions
                .iter()
                .filter(|(_, transport)| !transport.is_connected())
                .map(|(key, _)| key.clone())
                .collect::<Vec<_>>();

            keys.into_iter()
                .filter_map(|key| sessions.remove(&key))
                .collect::<Vec<_>>()
        };

        for transport in stale {
            debug!(key = %transport.key(), "Removing stale session");
            transport.disconnect().await;
        }
    }

    /// Open a session.
    ///
    /// Returns `true` immediately if `key` is already connected.
    /// On failure nothing is registered.
    pub async fn connect(&self, key: &str, kind: ConnectionKind, options: ConnectOptions) -> bool {
        let _lifecycle = self.lifecycle.lock().await;
        self.prune_stale().await;

        if self.sessions().contains_key(key) {
            debug!(%key, "Already connected");
            return true;
        }

        let transport = match self.build(key, kind, &options) {
            Ok(transport) => transport,
            Err(e) => {
                warn!(%key, %e, "Could not set up session");
                return false;
            }
        };

        if !transport.connect().await {
            return false;
        }

        info!(%key, %kind, "Session open");
        self.sessions().insert(key.into(), transport);

        true
    }

    /// Close one session, or every session if `key` is `None`.
    ///
    /// Sessions are closed one at a time, each awaited before the next.
    /// Closing an unknown key does nothing.
    pub async fn disconnect(&self, key: Option<&str>) {
        let _lifecycle = self.lifecycle.lock().await;

        let removed = {
            let mut sessions = self.sessions();
            match key {
                Some(key) => sessions.remove(key).into_iter().collect::<Vec<_>>(),
                None => sessions.drain().map(|(_, transport)| transport).collect(),
            }
        };

        for transport in removed {
            transport.disconnect().await;
            info!(key = %transport.key(), "Session closed");
        }

        self.prune_stale().await;
    }

    /// Write to a session.
    pub async fn send(&self, key: &str, bytes: &[u8]) -> Result<(), Error> {
        let transport = self
            .transport(key)
            .ok_or_else(|| Error::NotConnected(key.into()))?;

        transport.send(bytes).await
    }

    /// With a key, whether that session is connected.
    /// Without, whether any session is.
    pub fn is_connected(&self, key: Option<&str>) -> bool {
        let sessions = self.sessions();

        match key {
            Some(key) => sessions
                .get(key)
                .map_or(false, |transport| transport.is_connected()),
            None => sessions.values().any(|transport| transport.is_connected()),
        }
    }

    /// The transport of a connected session.
    pub fn transport(&self, key: &str) -> Option<Arc<dyn Transport>> {
        self.sessions()
            .get(key)
            .filter(|transport| transport.is_connected())
            .cloned()
    }

    /// Every live session.
    pub fn status(&self) -> Vec<SessionStatus> {
        let mut status = self
            .sessions()
            .iter()
            .filter(|(_, transport)| transport.is_connected())
            .map(|(key, transport)| SessionStatus {
                key: key.clone(),
                kind: transport.kind(),
                connected: true,
                baud_rate: transport.baud_rate(),
                history_bytes: transport.core().history_len(),
            })
            .collect::<Vec<_>>();

        status.sort_by(|a, b| a.key.cmp(&b.key));
        status
    }

    /// The serial devices visible to the OS.
    pub fn list_ports() -> Result<Vec<PortInfo>, Error> {
        serial::available_ports()
    }
}
