use std::{io, net::SocketAddr, sync::Arc};

use axum::{
    http::StatusCode,
    response::IntoResponse,
    routing::{get, get_service, post},
    Extension, Router,
};
use tokio::sync::oneshot;
use tower::ServiceBuilder;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, info};

use crate::{api, config::Config, error::Error, registry::SessionRegistry, websocket};

pub use crate::config::DEFAULT_PORT;

fn router(config: &Config, registry: Arc<SessionRegistry>) -> Router {
    let app = Router::new()
        .route("/ws", get(websocket::ws_handler))
        .route("/health", get(api::health))
        .route("/api/ports", get(api::list_ports))
        .route("/api/connect", post(api::connect))
        .route("/api/disconnect", post(api::disconnect))
        .route("/api/status", get(api::status))
        .route("/config", get(show_config))
        .route("/version", get(show_version));

    let app = match &config.frontend_dir {
        Some(dir) => {
            debug!(?dir, "Serving frontend");
            app.fallback(get_service(ServeDir::new(dir)).handle_error(static_file_error))
        }
        None => app,
    };

    app.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            // Every handler reaches sessions through the one registry
            .layer(Extension(registry))
            // Viewer sessions are tuned by the config
            .layer(Extension(config.bridge.clone()))
            .layer(Extension(config.clone())),
    )
}

async fn run(
    config: Config,
    registry: Arc<SessionRegistry>,
    port: Option<u16>,
    allocated_port: Option<oneshot::Sender<u16>>,
) -> Result<(), Error> {
    config.validate()?;

    let app = router(&config, registry);

    let addr = SocketAddr::new(config.socket_addr()?.ip(), port.unwrap_or(0));
    let server = axum::Server::try_bind(&addr)
        .map_err(|e| Error::Io(format!("Could not bind {addr}: {e}")))?
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());
    let addr = server.local_addr();

    if let Some(port_reply) = allocated_port {
        if port_reply.send(addr.port()).is_err() {
            debug!("Nobody wanted to know the allocated port");
        }
    }

    info!("listening on {}", addr);

    server
        .await
        .map_err(|e| Error::Io(format!("Server error: {e}")))
}

/// Start the server on an arbitrary available port.
/// The port allocated will be sent on the provided channel.
pub async fn run_any_port(
    config: Config,
    registry: Arc<SessionRegistry>,
    allocated_port: oneshot::Sender<u16>,
) -> Result<(), Error> {
    run(config, registry, None, Some(allocated_port)).await
}

/// Start the server on the given port.
pub async fn run_on_port(
    config: Config,
    registry: Arc<SessionRegistry>,
    port: u16,
) -> Result<(), Error> {
    run(config, registry, Some(port), None).await
}

async fn show_config(Extension(config): Extension<Config>) -> impl IntoResponse {
    config.serialize_pretty()
}

async fn show_version() -> impl IntoResponse {
    format!("Serial Harbor v{}\n", env!("CARGO_PKG_VERSION"))
}

async fn static_file_error(error: io::Error) -> impl IntoResponse {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Could not serve file: {error}"),
    )
}
