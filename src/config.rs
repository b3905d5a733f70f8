use std::{
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::{
    bridge::BridgeSettings,
    error::Error,
    transport::{serial, TransportSettings},
};

/// The port the server listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 8000;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// The configuration used for running the server.
///
/// Every field may be left out of a configuration file, in which case the default is used.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// The address to listen on.
    pub host: String,

    /// The port to listen on.
    pub port: u16,

    /// Baud rate for serial sessions which do not ask for one.
    pub default_baud_rate: u32,

    /// Upper bound in milliseconds for a single blocking serial read.
    pub serial_timeout_ms: u64,

    /// Bytes of output kept per session for replay.
    pub history_capacity: usize,

    /// One of `trace`, `debug`, `info`, `warn`, `error`.
    pub log_level: String,

    /// If set, logs are also written to a daily rolling file here.
    pub log_dir: Option<PathBuf>,

    /// Log everything devices send, at debug level.
    /// Noisy.
    pub log_device_data: bool,

    /// If set, files in this directory are served at `/`.
    pub frontend_dir: Option<PathBuf>,

    /// Viewer session settings.
    pub bridge: BridgeSettings,
}

impl Default for Config {
    fn default() -> Self {
        let transport = TransportSettings::default();

        Self {
            host: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            default_baud_rate: transport.default_baud_rate,
            serial_timeout_ms: transport.serial_timeout.as_millis() as u64,
            history_capacity: transport.history_capacity,
            log_level: "info".into(),
            log_dir: None,
            log_device_data: transport.log_device_data,
            frontend_dir: None,
            bridge: BridgeSettings::default(),
        }
    }
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    pub fn deserialize(input: &str) -> Result<Self, Error> {
        Self::ron()
            .from_str::<Config>(input)
            .map_err(|e| Error::BadConfig(format!("Not valid RON: {e}")))
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            port: 8080,
            log_level: "debug".into(),
            log_dir: Some("logs".into()),
            frontend_dir: Some("frontend/dist".into()),
            bridge: BridgeSettings {
                queue_capacity: 2000,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> String {
        // Plain data with string keys, serializing it does not fail.
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .unwrap_or_default()
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let path = p.as_ref();
        let s = std::fs::read_to_string(path)
            .map_err(|e| Error::BadConfig(format!("Could not read {path:?}: {e}")))?;

        Self::deserialize(&s)
    }

    /// The configured log level.
    pub fn log_level(&self) -> Result<Level, Error> {
        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(Error::BadConfig(format!(
                "`log_level` is `{}`, expected one of {}",
                self.log_level,
                LOG_LEVELS.iter().join(", ")
            )));
        }

        Level::from_str(&self.log_level).map_err(|e| Error::BadConfig(e.to_string()))
    }

    /// Where the server should listen.
    pub fn socket_addr(&self) -> Result<SocketAddr, Error> {
        let host = self
            .host
            .parse::<IpAddr>()
            .map_err(|_| Error::BadConfig(format!("`host` is `{}`, not an IP address", self.host)))?;

        Ok(SocketAddr::new(host, self.port))
    }

    /// Settings for the transports of every session.
    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            default_baud_rate: self.default_baud_rate,
            serial_timeout: Duration::from_millis(self.serial_timeout_ms),
            history_capacity: self.history_capacity,
            log_device_data: self.log_device_data,
        }
    }

    fn check_positive(&self) -> Result<(), Error> {
        let fields = [
            ("port", self.port as usize),
            ("serial_timeout_ms", self.serial_timeout_ms as usize),
            ("history_capacity", self.history_capacity),
            ("bridge.queue_capacity", self.bridge.queue_capacity),
            ("bridge.batch_max_chunks", self.bridge.batch_max_chunks),
            ("bridge.batch_max_bytes", self.bridge.batch_max_bytes),
        ];

        match fields.iter().find(|(_, value)| *value == 0) {
            Some((field, _)) => Err(Error::BadConfig(format!("`{field}` must be greater than zero"))),
            None => Ok(()),
        }
    }

    fn check_baud_rate(&self) -> Result<(), Error> {
        serial::validate_baud_rate(self.default_baud_rate).map_err(|_| {
            Error::BadConfig(format!(
                "`default_baud_rate` is {}, expected one of {}",
                self.default_baud_rate,
                serial::SUPPORTED_BAUD_RATES.iter().join(", ")
            ))
        })
    }

    /// Check every field, naming the first bad one.
    pub fn validate(&self) -> Result<(), Error> {
        self.socket_addr()?;
        self.check_positive()?;
        self.check_baud_rate()?;
        self.log_level()?;

        Ok(())
    }
}
