use std::{net::SocketAddr, sync::Arc};

use futures::{sink::Sink, stream::Stream, SinkExt, StreamExt};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Query, WebSocketUpgrade,
    },
    response::IntoResponse,
    Extension, TypedHeader,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::{
    bridge::{BridgeSession, BridgeSettings, Notice, Outbound, VIEWER_BACKLOG},
    registry::SessionRegistry,
    transport::TransportState,
};

/// Which session a viewer wants, e.g. `/ws?port=/dev/ttyACM0`.
#[derive(Debug, Deserialize)]
pub(crate) struct ViewerQuery {
    port: Option<String>,
}

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    user_agent: Option<TypedHeader<headers::UserAgent>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<ViewerQuery>,
    Extension(registry): Extension<Arc<SessionRegistry>>,
    Extension(settings): Extension<BridgeSettings>,
) -> impl IntoResponse {
    if let Some(TypedHeader(user_agent)) = user_agent {
        info!("`{}`@`{addr}` connected", user_agent.as_str());
    }

    ws.on_upgrade(move |socket| {
        handle_websocket(socket, query.port, registry, settings)
            .instrument(info_span!("socket", %addr))
    })
}

async fn notify(sender: &mpsc::Sender<Outbound>, notice: Notice) {
    if sender.send(Outbound::Notice(notice)).await.is_err() {
        debug!("Viewer gone, notice not sent");
    }
}

/// Forward viewer input until the viewer leaves, forwarding fails,
/// or the transport goes away.
pub(crate) async fn read<S>(
    mut receiver: S,
    session: &BridgeSession,
    sender: &mpsc::Sender<Outbound>,
) where
    S: Unpin,
    S: Stream<Item = Result<Message, axum::Error>>,
{
    let mut state = session.transport_state();
    let disconnected = || Notice::error(format!("`{}` disconnected", session.key()));

    if *state.borrow_and_update() != TransportState::Connected {
        notify(sender, disconnected()).await;
        return;
    }

    loop {
        let input = tokio::select! {
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() != TransportState::Connected {
                    info!("Transport went away mid-session");
                    notify(sender, disconnected()).await;
                    break;
                }
                continue;
            }
            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Binary(bytes))) => bytes,
                Some(Ok(Message::Ping(_))) => {
                    debug!("socket ping");
                    continue;
                }
                Some(Ok(Message::Pong(_))) => {
                    debug!("socket pong");
                    continue;
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("client disconnected");
                    break;
                }
                Some(Err(e)) => {
                    debug!(?e, "socket error");
                    break;
                }
            }
        };

        trace!(bytes = input.len(), "viewer input");

        if let Err(e) = session.forward(&input).await {
            warn!(%e, "Could not forward viewer input");
            notify(sender, Notice::error(e.to_string())).await;
            break;
        }
    }
}

pub(crate) async fn write(
    mut sender: impl Sink<Message> + Unpin,
    mut receiver: mpsc::Receiver<Outbound>,
) {
    while let Some(outbound) = receiver.recv().await {
        let message = match outbound {
            Outbound::Payload(text) => {
                trace!(bytes = text.len(), "payload");
                Message::Text(text)
            }
            Outbound::Notice(notice) => {
                info!(?notice, "notice");
                Message::Text(notice.to_json())
            }
        };

        if sender.send(message).await.is_err() {
            debug!("client disconnected");
            return;
        }
    }

    // Every producer is gone, the session is over.
    let _ = sender.send(Message::Close(None)).await;
    trace!("Close sent");
}

pub(crate) async fn handle_websocket(
    websocket: WebSocket,
    port: Option<String>,
    registry: Arc<SessionRegistry>,
    settings: BridgeSettings,
) {
    let (stream_sender, stream_receiver) = websocket.split();
    let (outbound_sender, outbound_receiver) = mpsc::channel::<Outbound>(VIEWER_BACKLOG);

    let write_handle = tokio::spawn(write(stream_sender, outbound_receiver).in_current_span());

    match port.filter(|port| !port.is_empty()) {
        None => {
            notify(&outbound_sender, Notice::error("Missing port query parameter")).await;
        }
        Some(key) => {
            match BridgeSession::attach(&registry, &key, outbound_sender.clone(), &settings) {
                Ok(session) => {
                    read(stream_receiver, &session, &outbound_sender).await;
                    session.detach().await;
                }
                Err(e) => {
                    info!(%e, "Viewer refused");
                    notify(&outbound_sender, Notice::error(e.to_string())).await;
                }
            }
        }
    }

    // The relay dropped its sender when it was detached, this was the last one.
    drop(outbound_sender);

    match write_handle.await {
        Ok(()) => debug!("Write task joined"),
        Err(e) => warn!("Write task join error: {e:?}"),
    }
}
