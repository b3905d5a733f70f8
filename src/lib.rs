#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

/// The request-handling layer: JSON endpoints for opening, closing and listing sessions.
pub mod api;

/// Relays a session's output to a viewer, and viewer input back to the device.
pub mod bridge;

/// The command line interface.
pub mod cli;

/// Relates to config files.
pub mod config;

/// Possible errors in this library.
pub mod error;

/// The recent output of a device, replayed to viewers as they attach.
pub mod history;

/// Logging/tracing setup.
pub mod logging;

/// Owns every open session, keyed by device path or `host:port`.
pub mod registry;

/// Code relating to setting up the server which serves the API and viewer websockets.
pub mod server;

/// Device connections: serial ports and raw TCP streams.
pub mod transport;

/// Handles incoming viewer websockets.
pub(crate) mod websocket;
