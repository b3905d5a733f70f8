use std::{fmt::Display, str::FromStr, sync::Arc};

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::Mutex,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::{
    ConnectionKind, Transport, TransportCore, TransportSettings, TransportState, READ_CHUNK,
};
use crate::error::Error;

/// Where a TCP session dials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpAddress {
    /// Hostname or IP address.
    pub host: String,

    /// TCP port.
    pub port: u16,
}

impl FromStr for TcpAddress {
    type Err = Error;

    fn from_str(address: &str) -> Result<Self, Self::Err> {
        let bad_address = || Error::BadAddress(address.into());

        let (host, port) = address.rsplit_once(':').ok_or_else(bad_address)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(bad_address());
        }
        let port = port.parse().map_err(|_| bad_address())?;

        Ok(Self {
            host: host.into(),
            port,
        })
    }
}

impl Display for TcpAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

struct Running {
    cancel: CancellationToken,
    read_loop: JoinHandle<()>,
    // Locked separately so a slow peer never holds up `disconnect`.
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

/// A raw TCP stream, e.g. a device console exposed by a terminal server.
pub struct TcpTransport {
    address: TcpAddress,
    core: Arc<TransportCore>,
    running: Mutex<Option<Running>>,
}

impl TcpTransport {
    /// A disconnected transport for the given address.
    pub fn new(address: TcpAddress, settings: &TransportSettings) -> Self {
        let core = Arc::new(TransportCore::new(&address.to_string(), settings));

        Self {
            address,
            core,
            running: Mutex::new(None),
        }
    }

    /// The address this transport dials.
    pub fn address(&self) -> &TcpAddress {
        &self.address
    }

    async fn teardown(&self, running: Running) {
        running.cancel.cancel();
        if let Err(e) = running.read_loop.await {
            warn!(?e, "Read loop join error");
        }

        self.core.set_callback(None);

        // Any send in flight saw the cancellation and let go of the writer.
        let mut writer = running.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(?e, "Shutting down the write half failed, peer likely gone already");
        }
    }
}

async fn read_loop(mut reader: OwnedReadHalf, core: Arc<TransportCore>, cancel: CancellationToken) {
    debug!("Read loop started");
    let mut buffer = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Read loop cancelled");
                break;
            }
            read = reader.read(&mut buffer) => match read {
                Ok(0) => {
                    info!("Connection closed by peer");
                    core.set_state(TransportState::Disconnected);
                    break;
                }
                Ok(n) => core.deliver(&buffer[..n]),
                Err(e) => {
                    error!(?e, "Read error, exiting");
                    core.set_state(TransportState::Disconnected);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn core(&self) -> &TransportCore {
        &self.core
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Tcp
    }

    async fn connect(&self) -> bool {
        let mut running = self.running.lock().await;

        if running.is_some() && self.is_connected() {
            return true;
        }

        // The read loop may have ended on its own (peer closed).
        if let Some(stale) = running.take() {
            self.teardown(stale).await;
        }

        self.core.set_state(TransportState::Connecting);
        info!(address = %self.address, "Connecting");

        let stream =
            match TcpStream::connect((self.address.host.as_str(), self.address.port)).await {
                Ok(stream) => stream,
                Err(e) => {
                    let e = Error::ConnectionFailed {
                        key: self.key().into(),
                        problem: e.to_string(),
                    };
                    warn!(%e, "Connect failed");
                    self.core.set_state(TransportState::Failed);
                    return false;
                }
            };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(?e, "Could not disable Nagle");
        }

        let (reader, writer) = stream.into_split();
        let cancel = CancellationToken::new();

        self.core.set_state(TransportState::Connected);
        let read_loop = tokio::spawn(
            read_loop(reader, self.core.clone(), cancel.clone())
                .instrument(info_span!("transport", key = %self.key())),
        );

        *running = Some(Running {
            cancel,
            read_loop,
            writer: Arc::new(Mutex::new(writer)),
        });

        info!(address = %self.address, "Connected");
        true
    }

    async fn disconnect(&self) {
        let mut running = self.running.lock().await;

        if let Some(running) = running.take() {
            self.teardown(running).await;
            info!(address = %self.address, "Disconnected");
        }

        self.core.set_state(TransportState::Disconnected);
    }

    async fn send(&self, bytes: &[u8]) -> Result<(), Error> {
        let (writer, cancel) = match self.running.lock().await.as_ref() {
            Some(running) if self.is_connected() => (running.writer.clone(), running.cancel.clone()),
            _ => return Err(Error::NotConnected(self.key().into())),
        };

        let write = async {
            let mut writer = writer.lock().await;
            writer.write_all(bytes).await?;
            writer.flush().await
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(bytes = bytes.len(), "Send interrupted by disconnect");
                Err(Error::NotConnected(self.key().into()))
            }
            written = write => Ok(written?),
        }
    }
}
