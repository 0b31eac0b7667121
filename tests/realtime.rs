// Realtime push handling against a local WebSocket server, with the REST
// backend mocked for the re-fetches push events trigger.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use httpmock::prelude::*;
use serde_json::json;

use pwnthemall_instances::realtime::{PushEvent, RealtimeListener};
use pwnthemall_instances::{ChallengeId, HttpInstanceClient, InstanceApi, InstanceStore, LocalStatus};

/// What the fake push server does with each connection.
#[derive(Clone)]
struct Script {
    messages: Vec<String>,
    /// Close with 1000 after sending, instead of dropping the socket.
    close_normally: bool,
    connections: Arc<AtomicUsize>,
}

async fn ws_handler(ws: WebSocketUpgrade, State(script): State<Script>) -> Response {
    ws.on_upgrade(move |socket| run_script(socket, script))
}

async fn run_script(mut socket: WebSocket, script: Script) {
    script.connections.fetch_add(1, Ordering::SeqCst);
    for text in &script.messages {
        if socket.send(Message::Text(text.clone().into())).await.is_err() {
            return;
        }
    }
    if script.close_normally {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "bye".into(),
            })))
            .await;
        // Drain until the client acknowledges the close.
        while let Some(Ok(_)) = socket.recv().await {}
    }
    // Otherwise the socket is dropped without a close frame.
}

async fn serve(script: Script) -> SocketAddr {
    let app = Router::new()
        .route("/api/ws/updates", get(ws_handler))
        .route("/api/ws/notifications", get(ws_handler))
        .with_state(script);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_hit(mock: &httpmock::Mock<'_>) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while mock.hits_async().await == 0 {
        assert!(tokio::time::Instant::now() < deadline, "backend was never called");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn id(n: u64) -> ChallengeId {
    ChallengeId::new(n).unwrap()
}

#[tokio::test]
async fn test_instance_update_merges_and_refetches() {
    let backend = MockServer::start_async().await;
    let status = backend
        .mock_async(|when, then| {
            when.method(GET).path("/api/challenges/42/status");
            then.status(200).json_body(json!({
                "has_instance": true,
                "status": "running",
                "connection_info": ["tcp://1.2.3.4:31337"]
            }));
        })
        .await;

    let script = Script {
        messages: vec![json!({
            "event": "instance_update",
            "teamId": 1,
            "userId": 2,
            "username": "alice",
            "challengeId": 42,
            "status": "running",
            "connectionInfo": ["tcp://1.2.3.4:31337"]
        })
        .to_string()],
        close_normally: true,
        connections: Arc::default(),
    };
    let addr = serve(script.clone()).await;

    let api: Arc<dyn InstanceApi> = Arc::new(HttpInstanceClient::new(backend.base_url()).unwrap());
    let store = InstanceStore::new();
    let handle = RealtimeListener::new(vec![format!("ws://{addr}/api/ws/notifications")])
        .with_reconnect_delay(Duration::from_millis(50))
        .spawn(api, store.clone());
    let mut pushed = handle.subscribe();

    let event = tokio::time::timeout(Duration::from_secs(5), pushed.recv())
        .await
        .expect("no push event")
        .unwrap();
    match event {
        PushEvent::InstanceUpdate(update) => assert_eq!(update.username, "alice"),
        other => panic!("unexpected event: {other:?}"),
    }

    let view = store.view(id(42));
    assert_eq!(view.local_status, LocalStatus::Running);
    assert_eq!(view.connection_info, vec!["tcp://1.2.3.4:31337"]);

    // The push is followed by a confirming fetch.
    wait_for_hit(&status).await;

    // A normal close ends the session for good.
    eventually("session end", || handle.is_finished()).await;
    assert_eq!(script.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_instance_event_triggers_refetch() {
    let backend = MockServer::start_async().await;
    let status = backend
        .mock_async(|when, then| {
            when.method(GET).path("/api/challenges/7/status");
            then.status(200)
                .json_body(json!({"has_instance": false, "status": "no_instance"}));
        })
        .await;

    let script = Script {
        messages: vec![
            r#"{"event":"ctf-status","action":"update","data":{"status":"active"}}"#.to_string(),
            r#"{"event":"instance","action":"update","data":{"challengeId":7}}"#.to_string(),
        ],
        close_normally: true,
        connections: Arc::default(),
    };
    let addr = serve(script).await;

    let api: Arc<dyn InstanceApi> = Arc::new(HttpInstanceClient::new(backend.base_url()).unwrap());
    let store = InstanceStore::new();
    let _handle = RealtimeListener::new(vec![format!("ws://{addr}/api/ws/updates")])
        .spawn(api, store.clone());

    wait_for_hit(&status).await;
    eventually("store update", || store.view(id(7)).confirmed.is_some()).await;
    assert_eq!(store.view(id(7)).local_status, LocalStatus::Stopped);
}

#[tokio::test]
async fn test_dropped_connection_reconnects() {
    let backend = MockServer::start_async().await;
    let script = Script {
        messages: Vec::new(),
        close_normally: false,
        connections: Arc::default(),
    };
    let addr = serve(script.clone()).await;

    let api: Arc<dyn InstanceApi> = Arc::new(HttpInstanceClient::new(backend.base_url()).unwrap());
    let handle = RealtimeListener::new(vec![format!("ws://{addr}/api/ws/updates")])
        .with_reconnect_delay(Duration::ZERO)
        .spawn(api, InstanceStore::new());

    eventually("reconnect", || script.connections.load(Ordering::SeqCst) >= 2).await;
    assert!(!handle.is_finished());

    drop(handle);
    let seen = script.connections.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(script.connections.load(Ordering::SeqCst) <= seen + 1);
}
