use std::sync::Arc;

use color_eyre::Result;
use futures::SinkExt;
use pretty_assertions::assert_eq;
use serial_harbor::{
    bridge::Notice, config::Config, registry::SessionRegistry, transport::ConnectionKind,
};

mod common;

fn quiet_config() -> Config {
    let mut config = Config::default();
    config.bridge.probe_on_empty_history = false;
    config
}

#[tokio::test]
async fn missing_port_is_an_error() -> Result<()> {
    let port = common::start_server(Arc::new(SessionRegistry::default())).await?;
    let mut viewer = common::connect_viewer(port, None).await?;

    assert_eq!(
        common::receive_notice(&mut viewer).await?,
        Notice::error("Missing port query parameter")
    );
    assert!(common::closes(&mut viewer).await?);

    Ok(())
}

#[tokio::test]
async fn unknown_port_is_not_connected() -> Result<()> {
    let port = common::start_server(Arc::new(SessionRegistry::default())).await?;
    let mut viewer = common::connect_viewer(port, Some("/dev/ttyUSB9")).await?;

    assert_eq!(
        common::receive_notice(&mut viewer).await?,
        Notice::error("`/dev/ttyUSB9` is not connected")
    );
    assert!(common::closes(&mut viewer).await?);

    Ok(())
}

#[tokio::test]
async fn viewer_types_and_sees_the_echo() -> Result<()> {
    let key = common::echo_listener("127.0.0.1:0").await?.to_string();
    let registry = Arc::new(SessionRegistry::default());
    assert!(registry.connect(&key, ConnectionKind::Tcp, Default::default()).await);

    let port = common::start_server_with_config(quiet_config(), registry.clone()).await?;
    let mut viewer = common::connect_viewer(port, Some(&key)).await?;

    viewer
        .send(tungstenite::Message::Text("Hello Telnet".into()))
        .await?;
    assert_eq!(common::receive_text(&mut viewer, 12).await?, "Hello Telnet");

    viewer
        .send(tungstenite::Message::Binary(b"raw bytes".to_vec()))
        .await?;
    assert_eq!(common::receive_text(&mut viewer, 9).await?, "raw bytes");

    registry.disconnect(None).await;

    Ok(())
}

#[tokio::test]
async fn history_is_replayed_on_attach() -> Result<()> {
    let key = common::prompt_listener("uart:~$ ").await?.to_string();
    let registry = Arc::new(SessionRegistry::default());
    assert!(registry.connect(&key, ConnectionKind::Tcp, Default::default()).await);
    common::wait_for_history(&registry, &key, 8).await?;

    let port = common::start_server(registry.clone()).await?;

    let mut first = common::connect_viewer(port, Some(&key)).await?;
    assert_eq!(common::receive(&mut first).await?, "uart:~$ ");
    first.close(None).await?;

    // Viewers come and go, the history stays.
    let mut second = common::connect_viewer(port, Some(&key)).await?;
    assert_eq!(common::receive(&mut second).await?, "uart:~$ ");

    registry.disconnect(None).await;

    Ok(())
}

#[tokio::test]
async fn viewer_is_told_when_the_session_closes() -> Result<()> {
    let key = common::echo_listener("127.0.0.1:0").await?.to_string();
    let registry = Arc::new(SessionRegistry::default());
    assert!(registry.connect(&key, ConnectionKind::Tcp, Default::default()).await);

    let port = common::start_server_with_config(quiet_config(), registry.clone()).await?;
    let mut viewer = common::connect_viewer(port, Some(&key)).await?;

    // Round trip once so the viewer is known to be attached.
    viewer.send(tungstenite::Message::Text("ping".into())).await?;
    assert_eq!(common::receive_text(&mut viewer, 4).await?, "ping");

    registry.disconnect(Some(&key)).await;

    assert_eq!(
        common::receive_notice(&mut viewer).await?,
        Notice::error(format!("`{key}` disconnected"))
    );
    assert!(common::closes(&mut viewer).await?);

    Ok(())
}
