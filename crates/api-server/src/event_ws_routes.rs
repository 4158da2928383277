//! Websocket fan-out of execution-lifecycle events. Every connection gets
//! its own `EventBus::subscribe()` receiver; delivery is best-effort
//! at-least-once for the lifetime of the connection, with a silent drop on
//! backpressure (the subscriber missed events, same as any other
//! `tokio::sync::broadcast` lagger) rather than disconnecting the socket.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use event_bus::Event;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use uuid::Uuid;

use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/ws/events", get(ws_handler))
}

#[derive(Deserialize)]
struct EventFilter {
    user_id: Option<Uuid>,
    execution_id: Option<Uuid>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Response {
    ws.on_upgrade(move |socket| stream_events(socket, state, filter))
}

async fn stream_events(socket: WebSocket, state: AppState, filter: EventFilter) {
    let mut receiver = state.events.subscribe();
    let (mut sink, mut source) = socket.split();

    loop {
        tokio::select! {
            event = receiver.recv() => {
                let event: Event = match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                if let Some(uid) = filter.user_id {
                    if event.user_id != uid {
                        continue;
                    }
                }
                if let Some(eid) = filter.execution_id {
                    if event.execution_id != eid {
                        continue;
                    }
                }

                let Ok(payload) = serde_json::to_string(&event) else { continue };
                if sink.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = source.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}
