//! JSON endpoints for managing sessions.

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    error::Error,
    registry::{ConnectOptions, SessionRegistry, SessionStatus},
    transport::{
        serial::{self, PortInfo},
        tcp::TcpAddress,
        ConnectionKind,
    },
};

/// Body of `POST /api/connect`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectRequest {
    /// The session key: a serial device, or `host:port`.
    pub port: String,

    /// Serial line speed.
    #[serde(default)]
    pub baudrate: Option<u32>,

    /// Defaults to serial.
    #[serde(default)]
    pub connection_type: ConnectionKind,
}

impl ConnectRequest {
    /// Catch what we can before trying to open anything.
    fn check(&self) -> Result<(), Error> {
        if self.port.trim().is_empty() {
            return Err(Error::BadRequest("`port` must not be empty".into()));
        }

        match self.connection_type {
            ConnectionKind::Serial => {
                if let Some(baud_rate) = self.baudrate {
                    serial::validate_baud_rate(baud_rate)?;
                }
            }
            ConnectionKind::Tcp => {
                self.port.parse::<TcpAddress>()?;
            }
        }

        Ok(())
    }
}

/// Body of `POST /api/disconnect`. Without a port, every session is closed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisconnectRequest {
    /// The session to close.
    #[serde(default)]
    pub port: Option<String>,
}

/// Outcome of a request, tagged by `status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Reply {
    /// The server is up.
    Ok,

    /// A session was opened (or already was).
    Connected {
        /// The session key.
        port: String,
    },

    /// Sessions were closed.
    Disconnected,

    /// The request failed.
    Error {
        /// What went wrong.
        message: String,
    },
}

impl Reply {
    fn error(message: impl ToString) -> Self {
        Self::Error {
            message: message.to_string(),
        }
    }
}

/// Reply of `GET /api/ports`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortsReply {
    /// Visible serial devices.
    pub ports: Vec<PortInfo>,
}

/// Reply of `GET /api/status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusReply {
    /// Whether any session is connected.
    pub connected: bool,

    /// Every live session.
    pub sessions: Vec<SessionStatus>,
}

pub(crate) async fn health() -> Json<Reply> {
    Json(Reply::Ok)
}

pub(crate) async fn list_ports() -> Response {
    let ports = tokio::task::spawn_blocking(SessionRegistry::list_ports)
        .await
        .map_err(|e| Error::Io(format!("Port listing task failed: {e}")))
        .and_then(|ports| ports);

    match ports {
        Ok(ports) => Json(PortsReply { ports }).into_response(),
        Err(e) => {
            warn!(%e, "Could not list ports");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(Reply::error(e))).into_response()
        }
    }
}

pub(crate) async fn connect(
    Extension(registry): Extension<Arc<SessionRegistry>>,
    Json(request): Json<ConnectRequest>,
) -> Json<Reply> {
    info!(port = %request.port, kind = %request.connection_type, "Connect requested");

    if let Err(e) = request.check() {
        return Json(Reply::error(e));
    }

    let options = ConnectOptions {
        baud_rate: request.baudrate,
    };

    if registry
        .connect(&request.port, request.connection_type, options)
        .await
    {
        Json(Reply::Connected { port: request.port })
    } else {
        Json(Reply::error(format!("Failed to connect to `{}`", request.port)))
    }
}

pub(crate) async fn disconnect(
    Extension(registry): Extension<Arc<SessionRegistry>>,
    request: Option<Json<DisconnectRequest>>,
) -> Json<Reply> {
    let request = request.map(|Json(request)| request).unwrap_or_default();
    info!(port = ?request.port, "Disconnect requested");

    registry.disconnect(request.port.as_deref()).await;

    Json(Reply::Disconnected)
}

pub(crate) async fn status(Extension(registry): Extension<Arc<SessionRegistry>>) -> Json<StatusReply> {
    let sessions = registry.status();

    Json(StatusReply {
        connected: !sessions.is_empty(),
        sessions,
    })
}
