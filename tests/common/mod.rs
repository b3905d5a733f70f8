#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::http::StatusCode;
use color_eyre::{eyre::eyre, Result};
use futures::StreamExt;
use serial_harbor::{bridge::Notice, config::Config, registry::SessionRegistry, transport::DataCallback};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::info;

pub type Viewer = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A device which echoes everything back, on the given address.
pub async fn echo_listener(addr: &str) -> Result<SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    Ok(addr)
}

/// A device which prints `prompt` as soon as someone connects, then echoes.
pub async fn prompt_listener(prompt: &'static str) -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                if socket.write_all(prompt.as_bytes()).await.is_err() {
                    return;
                }
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    Ok(addr)
}

/// A device which waits for any input, then writes `text` in small pieces.
pub async fn chatty_listener(text: String, piece: usize) -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let mut trigger = [0u8; 1];
            if socket.read(&mut trigger).await.is_err() {
                return;
            }

            for chunk in text.as_bytes().chunks(piece) {
                if socket.write_all(chunk).await.is_err() {
                    return;
                }
            }

            // Hold the connection open until the other side leaves.
            let _ = socket.read(&mut trigger).await;
        }
    });

    Ok(addr)
}

/// A data callback sending each chunk on a channel.
pub fn channel_callback() -> (DataCallback, mpsc::UnboundedReceiver<Vec<u8>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: DataCallback = Arc::new(move |chunk: &[u8]| {
        let _ = tx.send(chunk.to_vec());
    });
    (callback, rx)
}

/// Collect chunks until at least `len` bytes arrived.
pub async fn collect(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>, len: usize) -> Result<Vec<u8>> {
    let mut collected = vec![];

    while collected.len() < len {
        let chunk = timeout(Duration::from_secs(5), rx.recv())
            .await?
            .ok_or_else(|| eyre!("Callback channel closed"))?;
        collected.extend(chunk);
    }

    Ok(collected)
}

/// Wait until the session `key` holds at least `len` bytes of history.
pub async fn wait_for_history(registry: &SessionRegistry, key: &str, len: usize) -> Result<()> {
    timeout(Duration::from_secs(5), async {
        loop {
            let held = registry
                .transport(key)
                .map(|transport| transport.history().len())
                .unwrap_or_default();

            if held >= len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    Ok(())
}

/// Start a server using `registry`, returning the port it listens on.
pub async fn start_server_with_config(config: Config, registry: Arc<SessionRegistry>) -> Result<u16> {
    let (port_tx, port_rx) = oneshot::channel();

    tokio::spawn(async move { serial_harbor::server::run_any_port(config, registry, port_tx).await });
    let port = port_rx.await?;

    Ok(port)
}

/// Start a server with a default configuration.
pub async fn start_server(registry: Arc<SessionRegistry>) -> Result<u16> {
    start_server_with_config(Config::default(), registry).await
}

/// Connect a viewer to the session `key`, or without a key if `None`.
pub async fn connect_viewer(port: u16, key: Option<&str>) -> Result<Viewer> {
    let url = match key {
        Some(key) => format!("ws://127.0.0.1:{port}/ws?port={key}"),
        None => format!("ws://127.0.0.1:{port}/ws"),
    };

    info!("Connecting viewer to {url}");
    let (stream, http_response) = tokio_tungstenite::connect_async(url).await?;

    assert_eq!(http_response.status(), StatusCode::SWITCHING_PROTOCOLS);

    Ok(stream)
}

/// The next text frame.
pub async fn receive(viewer: &mut Viewer) -> Result<String> {
    let message = timeout(Duration::from_secs(5), viewer.next())
        .await?
        .ok_or_else(|| eyre!("Stream closed"))??;

    Ok(message.to_text()?.to_owned())
}

/// The next text frame, which must be a notice.
pub async fn receive_notice(viewer: &mut Viewer) -> Result<Notice> {
    let text = receive(viewer).await?;

    Ok(serde_json::from_str(&text)?)
}

/// Concatenate text frames until `expected` bytes arrived.
pub async fn receive_text(viewer: &mut Viewer, expected: usize) -> Result<String> {
    let mut text = String::new();

    while text.len() < expected {
        text += &receive(viewer).await?;
    }

    Ok(text)
}

/// Whether the viewer's stream ends (close frame or end of stream) within a bounded wait.
pub async fn closes(viewer: &mut Viewer) -> Result<bool> {
    let message = timeout(Duration::from_secs(5), viewer.next()).await?;

    Ok(match message {
        None => true,
        Some(Ok(tungstenite::Message::Close(_))) => true,
        Some(Err(_)) => true,
        Some(Ok(_)) => false,
    })
}
