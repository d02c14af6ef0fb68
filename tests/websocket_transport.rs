//! WebSocket transport against a local agent

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use duplex_voice::{
    codec::encode,
    config::TransportConfig,
    error::NetworkError,
    network::{Transport, TransportEvent, WebSocketTransport},
};

async fn bind() -> (TcpListener, TransportConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = TransportConfig {
        url: format!("ws://{}/live", listener.local_addr().unwrap()),
        connect_timeout_ms: 2000,
        close_timeout_ms: 500,
        ..Default::default()
    };
    (listener, config)
}

#[tokio::test]
async fn test_session_with_agent() {
    let (listener, config) = bind().await;

    let agent = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let mut received = Vec::new();

        // setup, then one audio message
        while received.len() < 2 {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    received.push(serde_json::from_str::<serde_json::Value>(&text).unwrap());
                    if received.len() == 1 {
                        for reply in [
                            r#"{"type":"transcript","text":"Hi"}"#,
                            "not json",
                            r#"{"type":"audio","payload":"AAA=","sample_rate":24000,"channels":1}"#,
                            r#"{"type":"interrupted"}"#,
                            r#"{"type":"turn_complete"}"#,
                        ] {
                            ws.send(Message::Text(reply.to_string())).await.unwrap();
                        }
                    }
                }
                Some(Ok(_)) => {}
                other => panic!("agent stream ended early: {:?}", other),
            }
        }
        ws.close(None).await.unwrap();
        received
    });

    let transport = WebSocketTransport::new(config, 16_000, 1);
    let mut session = transport.open().await.unwrap();

    assert_eq!(
        session.next_event().await,
        Some(TransportEvent::TranscriptFragment("Hi".into()))
    );
    match session.next_event().await {
        Some(TransportEvent::AudioChunk(chunk)) => {
            assert_eq!(chunk.payload, "AAA=");
            assert_eq!(chunk.sample_rate, 24_000);
        }
        other => panic!("expected audio, got {:?}", other),
    }
    assert_eq!(session.next_event().await, Some(TransportEvent::Interrupted));
    assert_eq!(session.next_event().await, Some(TransportEvent::TurnComplete));

    session.try_send(encode(&[0.5, -0.5], 1, 16_000).unwrap()).unwrap();

    assert_eq!(session.next_event().await, Some(TransportEvent::Closed));
    assert_eq!(session.next_event().await, None);

    let received = agent.await.unwrap();
    assert_eq!(received[0]["type"], "setup");
    assert_eq!(received[0]["sample_rate"], 16_000);
    assert_eq!(received[0]["channels"], 1);
    assert!(!received[0]["session_id"].as_str().unwrap().is_empty());
    assert_eq!(received[1]["type"], "audio");
    assert_eq!(received[1]["sample_rate"], 16_000);

    session.close().await;
}

#[tokio::test]
async fn test_client_close_reaches_agent() {
    let (listener, config) = bind().await;

    let agent = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return true,
                Some(Ok(_)) => {}
            }
        }
    });

    let transport = WebSocketTransport::new(config, 16_000, 1);
    let session = transport.open().await.unwrap();
    session.close().await;

    assert!(agent.await.unwrap());
}

#[tokio::test]
async fn test_agent_error_message_is_terminal() {
    let (listener, config) = bind().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let _setup = ws.next().await;
        ws.send(Message::Text(r#"{"type":"error","message":"quota exceeded"}"#.into()))
            .await
            .unwrap();
        ws.send(Message::Text(r#"{"type":"transcript","text":"late"}"#.into()))
            .await
            .unwrap();
        // hold the socket open until the client goes away
        while ws.next().await.is_some() {}
    });

    let transport = WebSocketTransport::new(config, 16_000, 1);
    let mut session = transport.open().await.unwrap();

    assert_eq!(
        session.next_event().await,
        Some(TransportEvent::Error("quota exceeded".into()))
    );
    assert_eq!(session.next_event().await, None);
    session.close().await;
}

#[tokio::test]
async fn test_handshake_timeout() {
    // accepts TCP but never answers the upgrade
    let (listener, mut config) = bind().await;
    config.connect_timeout_ms = 200;

    let transport = WebSocketTransport::new(config, 16_000, 1);
    let result = transport.open().await;
    assert!(matches!(result, Err(NetworkError::Timeout(200))));
    drop(listener);
}
