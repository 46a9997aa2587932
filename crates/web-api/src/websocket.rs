use crate::server::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use chrono::Utc;
use perpbot_core::BusEvent;
use tokio::sync::broadcast::error::RecvError;

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(|socket| websocket_connection(socket, state))
}

/// One dashboard connection: a greeting, then every bus event as JSON.
/// A connection that falls behind the bus capacity silently loses its
/// oldest events; the core loops never wait for it.
async fn websocket_connection(mut socket: WebSocket, state: AppState) {
    let mut events = state.bus.subscribe();

    let greeting = BusEvent::ConnectionEstablished {
        timestamp: Utc::now(),
    };
    if send_event(&mut socket, &greeting).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("WebSocket subscriber lagged, skipped {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    tracing::debug!("WebSocket connection closed");
}

async fn send_event(socket: &mut WebSocket, event: &BusEvent) -> Result<(), axum::Error> {
    let json = serde_json::to_string(event).unwrap_or_default();
    socket.send(Message::Text(json)).await
}
