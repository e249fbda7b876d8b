use axum::{
    body::Bytes,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::models::Appointment;
use super::workflow::{BoardNotifier, ToastLevel};
use crate::server::SharedState;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    AppointmentCreated {
        appointment: Appointment,
    },
    AppointmentUpdated {
        appointment: Appointment,
    },
    StagesChanged {
        team_id: i64,
    },
    TaskUpdated {
        team_id: i64,
        appointment_id: i64,
        task_id: i64,
    },
    Toast {
        team_id: i64,
        level: ToastLevel,
        message: String,
    },
    /// Clients drop local board state and refetch.
    ReloadRequested {
        team_id: i64,
    },
    FunnelUpdated {
        funnel_id: i64,
    },
}

impl WsMessage {
    /// Team the message belongs to; `None` for messages every client receives.
    pub fn team_id(&self) -> Option<i64> {
        match self {
            Self::AppointmentCreated { appointment } | Self::AppointmentUpdated { appointment } => {
                Some(appointment.team_id)
            }
            Self::StagesChanged { team_id }
            | Self::TaskUpdated { team_id, .. }
            | Self::Toast { team_id, .. }
            | Self::ReloadRequested { team_id } => Some(*team_id),
            Self::FunnelUpdated { .. } => None,
        }
    }
}

/// A serialized message plus the team it is scoped to.
#[derive(Debug, Clone)]
pub struct Broadcast {
    pub team_id: Option<i64>,
    pub json: String,
}

impl Broadcast {
    fn visible_to(&self, subscription: Option<i64>) -> bool {
        match (subscription, self.team_id) {
            (Some(wanted), Some(team)) => wanted == team,
            _ => true,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub team_id: Option<i64>,
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    let rx = state.ws_tx.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx, params.team_id))
}

async fn handle_socket(socket: WebSocket, rx: broadcast::Receiver<Broadcast>, team_id: Option<i64>) {
    debug!(?team_id, "Change feed client connected");
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, rx, team_id).await;
    debug!(?team_id, "Change feed client disconnected");
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Forwards broadcasts for the subscribed team, reads client frames, and
/// pings every [`PING_INTERVAL`]. A connection that has not answered a ping
/// within [`PONG_TIMEOUT`] is closed.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<Broadcast>,
    team_id: Option<i64>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if !msg.visible_to(team_id) {
                            continue;
                        }
                        if sender.send(Message::Text(msg.json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Clients refetch on every message, so a gap is recoverable
                        warn!(skipped, "Change feed client lagged");
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

// ── Broadcast helpers ────────────────────────────────────────────────

/// Serialize and broadcast a WsMessage to subscribed clients.
/// Returns silently even if no clients are connected.
pub fn broadcast_message(tx: &broadcast::Sender<Broadcast>, msg: &WsMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(Broadcast {
                team_id: msg.team_id(),
                json,
            });
        }
        Err(e) => {
            warn!(error = %e, "Failed to serialize WsMessage");
        }
    }
}

/// Board notifications delivered over the change feed.
#[derive(Clone)]
pub struct WsNotifier {
    tx: broadcast::Sender<Broadcast>,
}

impl WsNotifier {
    pub fn new(tx: broadcast::Sender<Broadcast>) -> Self {
        Self { tx }
    }
}

impl BoardNotifier for WsNotifier {
    fn toast(&self, team_id: i64, level: ToastLevel, message: &str) {
        broadcast_message(
            &self.tx,
            &WsMessage::Toast {
                team_id,
                level,
                message: message.to_string(),
            },
        );
    }

    fn request_reload(&self, team_id: i64) {
        broadcast_message(&self.tx, &WsMessage::ReloadRequested { team_id });
    }

    fn appointment_changed(&self, appointment: &Appointment) {
        broadcast_message(
            &self.tx,
            &WsMessage::AppointmentUpdated {
                appointment: appointment.clone(),
            },
        );
    }
}

// ── Tests ────────────────────────────────────────────────────────────
