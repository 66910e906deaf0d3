#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use realtime_api::auth::tokens::JwtResolver;
use realtime_api::config::Config;
use realtime_api::db::memory::MemoryRepository;
use realtime_api::gateway::backplane::MemoryBackplane;
use realtime_api::models::booking::Booking;
use realtime_api::models::role::Role;
use realtime_api::AppState;

pub const SECRET: &str = "integration-test-secret";

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Gateway instances sharing one store and one backplane, the way
/// horizontally scaled processes share Postgres and Redis.
pub struct TestCluster {
    pub repo: Arc<MemoryRepository>,
    pub backplane: MemoryBackplane,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            repo: Arc::new(MemoryRepository::new()),
            backplane: MemoryBackplane::new(),
        }
    }

    /// Build one instance with its backplane listener running.
    pub fn state(&self) -> AppState {
        self.state_with(Config::for_local(SECRET))
    }

    pub fn state_with(&self, config: Config) -> AppState {
        let state = AppState::new(
            config,
            self.repo.clone(),
            Arc::new(JwtResolver::new(SECRET)),
            Arc::new(self.backplane.clone()),
        );
        state.gateway.spawn_backplane_listener();
        state
    }

    /// The full application router wired to a fresh instance.
    pub fn app(&self) -> (Router, AppState) {
        let state = self.state();
        let app = realtime_api::routes::router().with_state(state.clone());
        (app, state)
    }

    /// Start an actual TCP server for WebSocket testing.
    pub async fn start_server(&self) -> (SocketAddr, AppState) {
        self.start_server_with(Config::for_local(SECRET)).await
    }

    pub async fn start_server_with(&self, config: Config) -> (SocketAddr, AppState) {
        let state = self.state_with(config);
        let app = realtime_api::routes::router().with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (addr, state)
    }
}

/// Mint a bearer token the way the identity provider does.
pub fn token(user_id: &str, role: Role) -> String {
    JwtResolver::new(SECRET)
        .issue(user_id, role, chrono::Duration::minutes(15))
        .expect("issue token")
}

pub fn booking(id: &str, client_id: &str, worker_id: Option<&str>) -> Booking {
    Booking {
        id: id.to_string(),
        client_id: client_id.to_string(),
        assigned_worker_id: worker_id.map(str::to_string),
        status: "CONFIRMED".to_string(),
        progress: 0,
        notes: None,
        scheduled_at: None,
        updated_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// WebSocket helpers
// ---------------------------------------------------------------------------

/// Connect with an `Authorization` header and read `ready`.
/// Returns the stream and the `ready` payload.
pub async fn connect(addr: SocketAddr, token: &str) -> (WsClient, Value) {
    let mut request = format!("ws://{addr}/gateway")
        .into_client_request()
        .expect("request");
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {token}").parse().expect("header value"),
    );

    let (mut ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("ws connect");

    let ready = next_frame(&mut ws).await;
    assert_eq!(ready["op"], 0, "ready should be op=0 (dispatch)");
    assert_eq!(ready["t"], "ready");
    assert!(ready["s"].as_u64().unwrap() > 0);

    (ws, ready["d"].clone())
}

/// Send an op=0 client action.
pub async fn send_action(ws: &mut WsClient, action: &str, data: Value) {
    let frame = serde_json::json!({ "op": 0, "t": action, "d": data });
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .expect("send action");
}

pub async fn send_raw(ws: &mut WsClient, text: &str) {
    ws.send(Message::Text(text.to_string().into()))
        .await
        .expect("send frame");
}

/// Read the next text frame as JSON, skipping pings.
pub async fn next_frame(ws: &mut WsClient) -> Value {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for frame")
            .expect("stream ended")
            .expect("ws read error");

        match msg {
            Message::Text(text) => return serde_json::from_str(&text).expect("parse frame"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected text frame, got: {other:?}"),
        }
    }
}

/// Read frames until a dispatch named `event` arrives; returns its payload.
pub async fn wait_for(ws: &mut WsClient, event: &str) -> Value {
    loop {
        let frame = next_frame(ws).await;
        if frame["t"] == event {
            return frame["d"].clone();
        }
    }
}

/// Assert no dispatch named `event` arrives within a short window.
pub async fn assert_no_event(ws: &mut WsClient, event: &str) {
    let deadline = time::Instant::now() + Duration::from_millis(300);
    loop {
        match time::timeout_at(deadline, ws.next()).await {
            Err(_) => return,
            Ok(None) => return,
            Ok(Some(Ok(Message::Text(text)))) => {
                let frame: Value = serde_json::from_str(&text).expect("parse frame");
                assert_ne!(frame["t"], event, "unexpected {event}: {frame}");
            }
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(tungstenite::Error::ConnectionClosed))) => return,
            Ok(Some(Err(e))) => panic!("ws read error: {e}"),
        }
    }
}

/// Join rooms and return the approved list from `joinedRooms`.
pub async fn join(ws: &mut WsClient, rooms: &[&str]) -> Vec<String> {
    send_action(ws, "join", serde_json::json!(rooms)).await;
    let joined = wait_for(ws, "joinedRooms").await;
    serde_json::from_value(joined["rooms"].clone()).expect("rooms array")
}
