//! Gemini Live Client Tests
//!
//! Run the WebSocket client against a local server speaking the
//! `BidiGenerateContent` message shapes.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::borrow::Cow;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rohana_live::config::ServiceConfig;
use rohana_live::live::{GeminiLiveService, LiveSetup, MediaChunk, ServerEvent, VoiceService};
use rohana_live::VoiceError;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

const KEY_VAR: &str = "ROHANA_LIVE_IT_GEMINI_KEY";

async fn local_service() -> (GeminiLiveService, TcpListener) {
    // SAFETY: test-only variable, identical value in every test.
    unsafe { std::env::set_var(KEY_VAR, "test-key") };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = ServiceConfig {
        endpoint: format!("ws://{}/ws", listener.local_addr().unwrap()),
        api_key_env: vec![KEY_VAR.into()],
        connect_timeout_secs: 2,
        ..ServiceConfig::default()
    };
    (GeminiLiveService::new(config), listener)
}

fn setup() -> LiveSetup {
    LiveSetup {
        model: "models/test-audio".into(),
        voice: "Zephyr".into(),
    }
}

async fn next_text<S>(ws: &mut S) -> serde_json::Value
where
    S: futures_util::Stream<
            Item = Result<Message, tokio_tungstenite::tungstenite::Error>,
        > + Unpin,
{
    match ws.next().await {
        Some(Ok(Message::Text(text))) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

async fn recv(events: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out")
        .expect("event stream ended")
}

// ────────────────────────────────────────────────────────────────────────────
// Session flow
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_full_session_round_trip() {
    let (service, listener) = local_service().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        let setup = next_text(&mut ws).await;
        assert_eq!(setup["setup"]["model"], "models/test-audio");
        assert_eq!(
            setup["setup"]["generationConfig"]["responseModalities"],
            json!(["AUDIO"])
        );
        ws.send(Message::Text(json!({ "setupComplete": {} }).to_string()))
            .await
            .unwrap();

        let input = next_text(&mut ws).await;
        assert_eq!(
            input["realtimeInput"]["mediaChunks"][0]["mimeType"],
            "audio/pcm;rate=16000"
        );

        // Binary JSON frames are accepted too.
        let reply = json!({
            "serverContent": {
                "modelTurn": { "parts": [
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AAAA" } }
                ]}
            }
        });
        ws.send(Message::Binary(reply.to_string().into_bytes()))
            .await
            .unwrap();
        ws.send(Message::Text(
            json!({ "serverContent": { "interrupted": true } }).to_string(),
        ))
        .await
        .unwrap();

        while let Some(Ok(msg)) = ws.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    let mut connection = service.connect(&setup()).await.unwrap();
    let mut events = connection.take_events().unwrap();
    assert!(connection.take_events().is_none());

    assert_eq!(recv(&mut events).await, ServerEvent::Opened);

    connection
        .sender()
        .send_audio(MediaChunk::pcm16("AAAA".into()))
        .unwrap();

    assert_eq!(
        recv(&mut events).await,
        ServerEvent::Message {
            audio: Some("AAAA".into()),
            interrupted: false,
            turn_complete: false,
        }
    );
    assert_eq!(
        recv(&mut events).await,
        ServerEvent::Message {
            audio: None,
            interrupted: true,
            turn_complete: false,
        }
    );

    let sender = connection.sender();
    connection.close().await;
    assert!(sender.is_closed());
    tokio::time::timeout(Duration::from_secs(2), server)
        .await
        .unwrap()
        .unwrap();
}

// ────────────────────────────────────────────────────────────────────────────
// Failures
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_policy_close_is_reported_as_error() {
    let (service, listener) = local_service().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _setup = next_text(&mut ws).await;
        let _ = ws
            .close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: Cow::Borrowed("API key not valid"),
            }))
            .await;
    });

    let mut connection = service.connect(&setup()).await.unwrap();
    let mut events = connection.take_events().unwrap();
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap();
    assert_eq!(event, Some(ServerEvent::Error("API key not valid".into())));
}

#[tokio::test]
async fn test_unreachable_endpoint_is_connection_error() {
    let (service, listener) = local_service().await;
    drop(listener);

    match service.connect(&setup()).await {
        Err(VoiceError::Connection(_)) => {}
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("connected to a closed port"),
    }
}
