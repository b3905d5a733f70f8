use std::{
    io::{self, Read, Write},
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serialport::{SerialPort, SerialPortType};
use tokio::{sync::Mutex, task, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::{
    raw_mode, ConnectionKind, Transport, TransportCore, TransportSettings, TransportState,
    READ_CHUNK,
};
use crate::error::Error;

/// Baud rate used when none is asked for.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Baud rates a serial session may be opened with.
pub const SUPPORTED_BAUD_RATES: [u32; 12] = [
    300, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115_200, 230_400, 460_800, 921_600,
];

/// How long the read loop rests when the device had nothing for us.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Check that a baud rate is one we support.
pub fn validate_baud_rate(baud_rate: u32) -> Result<(), Error> {
    if SUPPORTED_BAUD_RATES.contains(&baud_rate) {
        Ok(())
    } else {
        Err(Error::UnsupportedBaudRate(baud_rate))
    }
}

/// A serial device as seen by the operating system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortInfo {
    /// What to connect to, e.g. `/dev/ttyACM0` or `COM3`.
    pub identifier: String,

    /// Human readable description.
    pub description: String,

    /// Manufacturer, if the device reports one.
    pub manufacturer: Option<String>,

    /// Bus specific identification.
    pub hardware_id: String,
}

impl From<serialport::SerialPortInfo> for PortInfo {
    fn from(info: serialport::SerialPortInfo) -> Self {
        let (description, manufacturer, hardware_id) = match info.port_type {
            SerialPortType::UsbPort(usb) => {
                let mut hardware_id = format!("USB VID:PID={:04X}:{:04X}", usb.vid, usb.pid);
                if let Some(serial_number) = &usb.serial_number {
                    hardware_id += &format!(" SER={serial_number}");
                }

                (
                    usb.product.unwrap_or_else(|| "USB serial device".into()),
                    usb.manufacturer,
                    hardware_id,
                )
            }
            SerialPortType::PciPort => ("PCI serial device".into(), None, "PCI".into()),
            SerialPortType::BluetoothPort => {
                ("Bluetooth serial device".into(), None, "BLUETOOTH".into())
            }
            SerialPortType::Unknown => ("n/a".into(), None, "n/a".into()),
        };

        Self {
            identifier: info.port_name,
            description,
            manufacturer,
            hardware_id,
        }
    }
}

/// List the serial devices currently visible.
pub fn available_ports() -> Result<Vec<PortInfo>, Error> {
    let ports = tokio_serial::available_ports()
        .map_err(|e| Error::Io(format!("Could not list serial ports: {e}")))?;

    if ports.is_empty() {
        debug!("No serial ports available");
    }

    Ok(ports.into_iter().map(PortInfo::from).collect())
}

/// What a serial session opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialParams {
    /// The tty should likely be along the lines of `/dev/ttyACMx` on unix, and `COMx` on Windows.
    pub path: String,

    /// Line speed. Ignored by pseudo terminals, but validated all the same.
    pub baud_rate: u32,
}

type SharedPort = Arc<StdMutex<Box<dyn SerialPort>>>;

struct Running {
    cancel: CancellationToken,
    read_loop: JoinHandle<()>,
    writer: SharedPort,
}

/// A serial port (or pseudo terminal).
///
/// The port handle is blocking, so every open, read and write happens on
/// tokio's blocking pool; the read loop itself is a regular task awaiting those.
pub struct SerialTransport {
    params: SerialParams,
    timeout: Duration,
    core: Arc<TransportCore>,
    running: Mutex<Option<Running>>,
}

/// Open the port, returning a reader and a writer handle to it.
///
/// Blocking.
fn open(params: &SerialParams, timeout: Duration) -> Result<(Box<dyn SerialPort>, SharedPort), Error> {
    let connection_failed = |problem: String| Error::ConnectionFailed {
        key: params.path.clone(),
        problem,
    };

    let port = serialport::new(&params.path, params.baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(timeout)
        .open_native()
        .map_err(|e| connection_failed(e.to_string()))?;

    if raw_mode::is_pseudo_terminal(&params.path) {
        match raw_mode::configure(&port) {
            Ok(()) => debug!("Pseudo terminal set to raw mode"),
            Err(e) => warn!(%e, "Could not set raw mode, continuing anyway"),
        }
    }

    // If this fails `port` is dropped, which closes it.
    let reader = port
        .try_clone()
        .map_err(|e| connection_failed(format!("Could not clone port handle: {e}")))?;

    let writer: Box<dyn SerialPort> = Box::new(port);

    Ok((reader, Arc::new(StdMutex::new(writer))))
}

/// Read whatever is available right now.
///
/// Uses the available byte count when the OS gives us one,
/// else falls back to a read bounded by the port timeout.
/// An empty result means "nothing yet".
fn read_available(port: &mut dyn SerialPort) -> io::Result<Vec<u8>> {
    let mut buffer = vec![0u8; READ_CHUNK];

    let read = match port.bytes_to_read() {
        Ok(0) => return Ok(vec![]),
        Ok(available) => port.read(&mut buffer[..(available as usize).min(READ_CHUNK)]),
        Err(_) => port.read(&mut buffer),
    };

    match read {
        Ok(n) => {
            buffer.truncate(n);
            Ok(buffer)
        }
        Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(vec![]),
        Err(e) => Err(e),
    }
}

async fn read_loop(
    mut port: Box<dyn SerialPort>,
    core: Arc<TransportCore>,
    cancel: CancellationToken,
) {
    debug!("Read loop started");

    while !cancel.is_cancelled() {
        let blocking_read = task::spawn_blocking(move || {
            let read = read_available(port.as_mut());
            (port, read)
        });

        let read = match blocking_read.await {
            Ok((returned, read)) => {
                port = returned;
                read
            }
            Err(e) => {
                error!(?e, "Blocking read task failed, exiting");
                core.set_state(TransportState::Disconnected);
                return;
            }
        };

        match read {
            Ok(chunk) if chunk.is_empty() => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                }
            }
            Ok(chunk) => {
                if cancel.is_cancelled() {
                    break;
                }
                core.deliver(&chunk);
            }
            Err(e) => {
                error!(?e, "Serial port error, exiting");
                core.set_state(TransportState::Disconnected);
                return;
            }
        }
    }

    debug!("Read loop cancelled");
}

impl SerialTransport {
    /// A disconnected transport for the given port.
    pub fn new(params: SerialParams, settings: &TransportSettings) -> Self {
        let core = Arc::new(TransportCore::new(&params.path, settings));

        Self {
            params,
            timeout: settings.serial_timeout,
            core,
            running: Mutex::new(None),
        }
    }

    async fn teardown(&self, running: Running) {
        running.cancel.cancel();
        if let Err(e) = running.read_loop.await {
            warn!(?e, "Read loop join error");
        }

        self.core.set_callback(None);

        // The reader half went away with the read loop, this closes the port.
        drop(running.writer);
    }

    async fn try_connect(&self) -> Result<Running, Error> {
        validate_baud_rate(self.params.baud_rate)?;

        let params = self.params.clone();
        let timeout = self.timeout;
        let (reader, writer) = task::spawn_blocking(move || open(&params, timeout))
            .await
            .map_err(|e| Error::Io(format!("Open task failed: {e}")))??;

        let cancel = CancellationToken::new();

        self.core.set_state(TransportState::Connected);
        let read_loop = tokio::spawn(
            read_loop(reader, self.core.clone(), cancel.clone())
                .instrument(info_span!("transport", key = %self.params.path)),
        );

        Ok(Running {
            cancel,
            read_loop,
            writer,
        })
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn core(&self) -> &TransportCore {
        &self.core
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Serial
    }

    fn baud_rate(&self) -> Option<u32> {
        Some(self.params.baud_rate)
    }

    async fn connect(&self) -> bool {
        let mut running = self.running.lock().await;

        if running.is_some() && self.is_connected() {
            return true;
        }

        // The read loop may have ended on its own (device unplugged).
        if let Some(stale) = running.take() {
            self.teardown(stale).await;
        }

        self.core.set_state(TransportState::Connecting);
        info!(path = %self.params.path, baud = self.params.baud_rate, "Opening serial port");

        match self.try_connect().await {
            Ok(started) => {
                *running = Some(started);
                info!(path = %self.params.path, "Serial port open");
                true
            }
            Err(e) => {
                warn!(%e, "Could not open serial port");
                self.core.set_state(TransportState::Failed);
                false
            }
        }
    }

    async fn disconnect(&self) {
        let mut running = self.running.lock().await;

        if let Some(running) = running.take() {
            self.teardown(running).await;
            info!(path = %self.params.path, "Serial port closed");
        }

        self.core.set_state(TransportState::Disconnected);
    }

    async fn send(&self, bytes: &[u8]) -> Result<(), Error> {
        let writer = match self.running.lock().await.as_ref() {
            Some(running) if self.is_connected() => running.writer.clone(),
            _ => return Err(Error::NotConnected(self.key().into())),
        };

        let bytes = bytes.to_vec();
        task::spawn_blocking(move || {
            let mut port = writer.lock().unwrap_or_else(PoisonError::into_inner);
            port.write_all(&bytes)?;
            port.flush()
        })
        .await
        .map_err(|e| Error::Io(format!("Write task failed: {e}")))??;

        Ok(())
    }
}
