//! WebSocket event subscriptions.
//!
//! A client subscribes to one or more instances; the server pushes that
//! instance's `task_update` / `execution_step` / `error` events. Push is
//! best-effort at-most-once — the REST surface stays authoritative for
//! history. Subscriptions are per-connection and per-instance, so one
//! tenant's client never observes another tenant's events, and joining or
//! leaving never disturbs other subscribers.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::TaskEvent;

use super::AppState;

/// Client -> server subscription control messages.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    SubscribeInstance { instance_id: String },
    UnsubscribeInstance { instance_id: String },
}

/// Server -> client acknowledgements (events themselves are `TaskEvent`).
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Ack {
    Subscribed { instance_id: String },
    Unsubscribed { instance_id: String },
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("Event WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    info!("Event WebSocket client connected");

    // All subscribed instances forward into one per-client channel; one
    // forwarder task per subscription.
    let (fwd_tx, mut fwd_rx) = mpsc::channel::<TaskEvent>(64);
    let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            // Push events from subscribed instances to this client.
            event = fwd_rx.recv() => {
                let Some(event) = event else { break };
                if let Ok(json) = serde_json::to_string(&event) {
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        debug!("Client disconnected during send");
                        break;
                    }
                }
            }

            // Subscription control from the client.
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(ack) =
                            handle_client_message(&text, &state, &fwd_tx, &mut forwarders).await
                        {
                            if let Ok(json) = serde_json::to_string(&ack) {
                                if socket.send(Message::Text(json.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Event WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Event WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    for (_, handle) in forwarders.drain() {
        handle.abort();
    }
    info!("Event WebSocket connection closed");
}

async fn handle_client_message(
    text: &str,
    state: &AppState,
    fwd_tx: &mpsc::Sender<TaskEvent>,
    forwarders: &mut HashMap<String, JoinHandle<()>>,
) -> Option<Ack> {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::SubscribeInstance { instance_id }) => {
            if forwarders.contains_key(&instance_id) {
                debug!(instance_id = %instance_id, "Duplicate subscribe ignored");
                return Some(Ack::Subscribed { instance_id });
            }

            let rx = state.service.events().subscribe(&instance_id).await;
            let handle = spawn_forwarder(instance_id.clone(), rx, fwd_tx.clone());
            forwarders.insert(instance_id.clone(), handle);

            info!(instance_id = %instance_id, "Client subscribed to instance events");
            Some(Ack::Subscribed { instance_id })
        }
        Ok(ClientMessage::UnsubscribeInstance { instance_id }) => {
            if let Some(handle) = forwarders.remove(&instance_id) {
                handle.abort();
                info!(instance_id = %instance_id, "Client unsubscribed from instance events");
            }
            Some(Ack::Unsubscribed { instance_id })
        }
        Err(e) => {
            debug!(error = %e, text, "Unrecognized event WS message");
            None
        }
    }
}

/// Pipe one instance's broadcast into the client channel. Lagging loses
/// events (at-most-once push); clients needing history poll the store.
fn spawn_forwarder(
    instance_id: String,
    mut rx: broadcast::Receiver<TaskEvent>,
    fwd_tx: mpsc::Sender<TaskEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if fwd_tx.send(event).await.is_err() {
                        break; // client gone
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(instance_id = %instance_id, missed, "Event subscriber lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
