use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use relay_core::{EventRouter, Outcome};
use shared::{domain::ConnectionId, protocol::InboundEvent};
use tracing::{debug, warn};

use crate::app_state::AppState;

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (connection, mut outbound) = state.router.connect().await;

    let send_task = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let text = match event.encode() {
                Ok(v) => v,
                Err(error) => {
                    warn!(%connection, %error, "failed to encode outbound event");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // One frame at a time: a connection's events are handled in arrival order.
    while let Some(message) = receiver.next().await {
        let message = match message {
            Ok(message) => message,
            Err(error) => {
                debug!(%connection, %error, "websocket read failed");
                break;
            }
        };
        match message {
            Message::Text(text) => dispatch_frame(&state.router, connection, text.as_bytes()).await,
            Message::Binary(bytes) => dispatch_frame(&state.router, connection, &bytes).await,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    if let Err(error) = state.router.disconnect(connection).await {
        warn!(%connection, %error, "disconnect cleanup incomplete");
    }
    send_task.abort();
}

/// Decodes and routes one inbound frame. Nothing here ends the connection:
/// bad frames and failed handlers are logged and skipped.
pub(crate) async fn dispatch_frame(router: &EventRouter, connection: ConnectionId, raw: &[u8]) {
    let event = match serde_json::from_slice::<InboundEvent>(raw) {
        Ok(event) => event,
        Err(error) => {
            warn!(%connection, %error, "undecodable frame dropped");
            return;
        }
    };
    let name = event.name();
    match router.handle(connection, event).await {
        Ok(Outcome::Delivered(peers)) => debug!(%connection, event = name, peers, "event routed"),
        Ok(Outcome::Dropped(reason)) => debug!(%connection, event = name, ?reason, "event dropped"),
        Err(error) => warn!(%connection, event = name, %error, "event failed"),
    }
}
