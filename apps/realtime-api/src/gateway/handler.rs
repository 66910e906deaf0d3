//! Client action dispatch for op=0 frames.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::GatewayError;

use super::events::{
    ClientAction, EventName, OutboundEvent, RoomsPayload, SendMessagePayload,
    ServiceUpdatePayload,
};
use super::hub::Gateway;
use super::session::Connection;

/// Heartbeat interval sent to clients in the `ready` payload (ms).
pub const HEARTBEAT_INTERVAL_MS: u64 = 41250;

/// The `ready` event sent once a connection is registered.
pub fn ready_event(connection: &Connection) -> OutboundEvent {
    OutboundEvent::new(
        EventName::READY,
        serde_json::json!({
            "connectionId": connection.connection_id,
            "userId": connection.user_id,
            "role": connection.role,
            "rooms": connection.rooms(),
            "heartbeatInterval": HEARTBEAT_INTERVAL_MS,
        }),
    )
}

/// Run one client action. Returns the event owed directly to the sender, if
/// any: an acknowledgement or an `error` event. Room fanout goes through the
/// backplane instead.
pub async fn handle_action(
    gateway: &Gateway,
    connection: &Arc<Connection>,
    action: Option<&str>,
    data: Value,
) -> Option<OutboundEvent> {
    let Some(action) = action else {
        return Some(error_event(
            &GatewayError::validation("Missing action name"),
            None,
        ));
    };

    let result = match action {
        ClientAction::JOIN => match parse::<RoomsPayload>(data) {
            Ok(payload) => {
                let joined = gateway.join(connection, payload.into_rooms()).await;
                Ok(Some(OutboundEvent::new(
                    EventName::JOINED_ROOMS,
                    serde_json::json!({ "rooms": joined }),
                )))
            }
            Err(err) => Err(err),
        },
        ClientAction::LEAVE => parse::<RoomsPayload>(data).map(|payload| {
            let left = gateway.leave(connection, payload.into_rooms());
            Some(OutboundEvent::new(
                EventName::LEFT_ROOMS,
                serde_json::json!({ "rooms": left }),
            ))
        }),
        ClientAction::SEND_MESSAGE => match parse::<SendMessagePayload>(data) {
            Ok(payload) => gateway.send_message(connection, payload).await.map(|_| None),
            Err(err) => Err(err),
        },
        ClientAction::UPDATE_SERVICE => match parse::<ServiceUpdatePayload>(data) {
            Ok(payload) => gateway.update_service(connection, payload).await.map(|_| None),
            Err(err) => Err(err),
        },
        other => Err(GatewayError::validation(format!("Unknown action `{other}`"))),
    };

    match result {
        Ok(reply) => reply,
        Err(err) => {
            tracing::debug!(
                connection_id = %connection.connection_id,
                action,
                code = err.code(),
                err = %err,
                "client action rejected"
            );
            Some(error_event(&err, Some(action)))
        }
    }
}

pub fn error_event(err: &GatewayError, action: Option<&str>) -> OutboundEvent {
    OutboundEvent::error(err.code(), &err.client_message(), action)
}

fn parse<T: DeserializeOwned>(data: Value) -> Result<T, GatewayError> {
    serde_json::from_value(data)
        .map_err(|e| GatewayError::validation(format!("Invalid payload: {e}")))
}
