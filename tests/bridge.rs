use color_eyre::{eyre::eyre, Result};
use pretty_assertions::assert_eq;
use serial_harbor::{
    bridge::{BridgeSession, BridgeSettings, Outbound, VIEWER_BACKLOG},
    registry::SessionRegistry,
    transport::ConnectionKind,
};
use std::time::Duration;
use tokio::{sync::mpsc, time::timeout};

mod common;

async fn next_payload(viewer: &mut mpsc::Receiver<Outbound>) -> Result<String> {
    match timeout(Duration::from_secs(5), viewer.recv()).await? {
        Some(Outbound::Payload(text)) => Ok(text),
        other => Err(eyre!("Expected a payload, got {other:?}")),
    }
}

#[tokio::test]
async fn late_viewer_sees_the_prompt_first() -> Result<()> {
    let key = common::prompt_listener("prompt> ").await?.to_string();

    let registry = SessionRegistry::default();
    assert!(registry.connect(&key, ConnectionKind::Tcp, Default::default()).await);
    common::wait_for_history(&registry, &key, "prompt> ".len()).await?;

    let (viewer, mut viewer_rx) = mpsc::channel(VIEWER_BACKLOG);
    let session = BridgeSession::attach(&registry, &key, viewer, &BridgeSettings::default())?;

    assert_eq!(next_payload(&mut viewer_rx).await?, "prompt> ");

    session.forward(b"status\r\n").await?;
    let mut echoed = String::new();
    while echoed.len() < "status\r\n".len() {
        echoed += &next_payload(&mut viewer_rx).await?;
    }
    assert_eq!(echoed, "status\r\n");

    session.detach().await;
    registry.disconnect(None).await;

    Ok(())
}

#[tokio::test]
async fn output_arrives_whole_and_in_order() -> Result<()> {
    let text = lipsum::lipsum(2000);
    // Writing starts once the probe arrives.
    let key = common::chatty_listener(text.clone(), 7).await?.to_string();

    let registry = SessionRegistry::default();
    assert!(registry.connect(&key, ConnectionKind::Tcp, Default::default()).await);

    let (viewer, mut viewer_rx) = mpsc::channel(VIEWER_BACKLOG);
    let session = BridgeSession::attach(&registry, &key, viewer, &BridgeSettings::default())?;

    let mut received = String::new();
    while received.len() < text.len() {
        received += &next_payload(&mut viewer_rx).await?;
    }

    assert_eq!(received, text);
    assert_eq!(session.dropped_chunks(), 0);

    session.detach().await;
    registry.disconnect(None).await;

    Ok(())
}

#[tokio::test]
async fn viewer_of_unknown_session_is_refused() -> Result<()> {
    let registry = SessionRegistry::default();
    let (viewer, _viewer_rx) = mpsc::channel(VIEWER_BACKLOG);

    let attached = BridgeSession::attach(&registry, "127.0.0.1:1", viewer, &BridgeSettings::default());
    assert!(attached.is_err());

    Ok(())
}

#[tokio::test]
async fn forwarding_fails_once_the_session_is_closed() -> Result<()> {
    let key = common::echo_listener("127.0.0.1:0").await?.to_string();

    let registry = SessionRegistry::default();
    assert!(registry.connect(&key, ConnectionKind::Tcp, Default::default()).await);

    let settings = BridgeSettings {
        probe_on_empty_history: false,
        ..Default::default()
    };
    let (viewer, _viewer_rx) = mpsc::channel(VIEWER_BACKLOG);
    let session = BridgeSession::attach(&registry, &key, viewer, &settings)?;

    registry.disconnect(Some(&key)).await;

    assert!(session.forward(b"anyone?").await.is_err());
    session.detach().await;

    Ok(())
}
