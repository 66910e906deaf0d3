//! WebSocket upgrade handler and per-connection event loop.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time;

use crate::auth::middleware::bearer_token;
use crate::auth::tokens::Identity;
use crate::error::{ApiError, GatewayError};
use crate::AppState;

use super::events::{
    ClientMessage, GatewayMessage, HeartbeatPayload, OutboundEvent, OP_DISPATCH, OP_HEARTBEAT,
};
use super::handler::{error_event, handle_action, ready_event, HEARTBEAT_INTERVAL_MS};
use super::hub::Gateway;
use super::session::Connection;

/// Close codes (4000-range for application-level).
const CLOSE_SESSION_TIMEOUT: u16 = 4009;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

/// Authenticate before upgrading, so a bad credential never gets a socket.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<GatewayQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let credential = bearer_token(&headers).or(query.token.as_deref());
    let identity = match state.gateway.authenticate(credential).await {
        Ok(identity) => identity,
        Err(err) => {
            tracing::debug!(err = %err, "gateway handshake rejected");
            return ApiError::from(err).into_response();
        }
    };

    let gateway = state.gateway.clone();
    ws.on_upgrade(move |socket| handle_connection(socket, gateway, identity))
}

async fn handle_connection(socket: WebSocket, gateway: Arc<Gateway>, identity: Identity) {
    let (mut ws_tx, ws_rx) = socket.split();
    let (connection, outbound_rx) = gateway.connect(identity);

    tracing::info!(
        connection_id = %connection.connection_id,
        user_id = %connection.user_id,
        instance_id = %gateway.instance_id(),
        "gateway connection established"
    );

    if send_event(&mut ws_tx, &connection, &ready_event(&connection))
        .await
        .is_ok()
    {
        run_connection(&gateway, &connection, ws_tx, ws_rx, outbound_rx).await;
    }

    gateway.disconnect(&connection.connection_id);

    tracing::info!(
        connection_id = %connection.connection_id,
        user_id = %connection.user_id,
        "gateway connection ended"
    );
}

/// Main loop: read client frames, drain the outbound queue, enforce heartbeat.
async fn run_connection(
    gateway: &Gateway,
    connection: &Arc<Connection>,
    mut ws_tx: WsSink,
    mut ws_rx: WsStream,
    mut outbound_rx: mpsc::Receiver<Arc<OutboundEvent>>,
) {
    // Heartbeat deadline: client must heartbeat within 1.5× the interval.
    let heartbeat_deadline = Duration::from_millis(HEARTBEAT_INTERVAL_MS * 3 / 2);
    let mut heartbeat_timer = time::interval(heartbeat_deadline);
    heartbeat_timer.tick().await; // First tick fires immediately; skip it.
    let mut got_heartbeat = true;

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(?e, connection_id = %connection.connection_id, "ws read error");
                        break;
                    }
                };

                let client_msg: ClientMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(_) => {
                        let reply = error_event(&GatewayError::validation("Invalid JSON"), None);
                        if send_event(&mut ws_tx, connection, &reply).await.is_err() {
                            break;
                        }
                        continue;
                    }
                };

                let reply = match client_msg.op {
                    OP_HEARTBEAT => {
                        got_heartbeat = true;
                        let payload: HeartbeatPayload = serde_json::from_value(client_msg.d)
                            .unwrap_or(HeartbeatPayload { seq: 0 });
                        if send_message(&mut ws_tx, &GatewayMessage::heartbeat_ack(payload.seq))
                            .await
                            .is_err()
                        {
                            break;
                        }
                        None
                    }
                    OP_DISPATCH => {
                        handle_action(gateway, connection, client_msg.t.as_deref(), client_msg.d)
                            .await
                    }
                    op => Some(error_event(
                        &GatewayError::validation(format!("Unknown opcode {op}")),
                        None,
                    )),
                };

                if let Some(reply) = reply {
                    if send_event(&mut ws_tx, connection, &reply).await.is_err() {
                        break;
                    }
                }
            }

            event = outbound_rx.recv() => {
                let Some(event) = event else { break };
                if send_event(&mut ws_tx, connection, &event).await.is_err() {
                    break;
                }
            }

            _ = heartbeat_timer.tick() => {
                if !got_heartbeat {
                    tracing::debug!(
                        connection_id = %connection.connection_id,
                        "heartbeat timeout, closing connection"
                    );
                    let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Heartbeat timeout").await;
                    break;
                }
                got_heartbeat = false;
            }
        }
    }
}

/// Stamp the connection's next sequence number on an event and send it.
async fn send_event(
    ws_tx: &mut WsSink,
    connection: &Connection,
    event: &OutboundEvent,
) -> Result<(), axum::Error> {
    let msg = GatewayMessage::dispatch(&event.event_name, connection.next_seq(), event.data.clone());
    send_message(ws_tx, &msg).await
}

async fn send_message(ws_tx: &mut WsSink, msg: &GatewayMessage) -> Result<(), axum::Error> {
    let json = serde_json::to_string(msg).map_err(axum::Error::new)?;
    ws_tx.send(Message::Text(json.into())).await
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &str) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
