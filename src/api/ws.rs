// =============================================================================
// WebSocket Event Channel — subscription-driven push feed
// =============================================================================
//
// Clients connect to `/ws`, subscribe to a simulation id, and receive the
// hub's immediate events plus 25 ms batch envelopes. All outbound traffic —
// hub fan-out and direct replies alike — goes through one mpsc channel per
// connection, so a single writer owns the socket and ordering is preserved.
//
// Frames are textual JSON only, sent uncompressed as single frames. Any
// inbound frame whose first byte is the gzip magic (0x1F) closes the
// connection with code 1003 (unsupported data).
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::broadcast::sanitize::GZIP_MAGIC;
use crate::broadcast::ClientHandle;
use crate::events::{EventEnvelope, EventType, SimEvent};
use crate::types::TpsMode;

/// Close code for unsupported (compressed/binary) payloads.
const CLOSE_UNSUPPORTED: u16 = 1003;
/// Pseudo simulation id for connection-scoped events.
const SYSTEM_SCOPE: &str = "system";

// =============================================================================
// Client envelope
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientMessage {
    #[serde(rename = "type")]
    message_type: String,
    simulation_id: Option<String>,
    request_id: Option<String>,
    data: Option<Value>,
}

// =============================================================================
// Upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

// =============================================================================
// Connection handler
// =============================================================================

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let client_id = Uuid::new_v4();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let (mut sender, mut receiver) = socket.split();

    // Greet before anything else so the client learns its connection id.
    send_event(
        &outbound_tx,
        SYSTEM_SCOPE,
        SimEvent::now(
            EventType::Welcome,
            json!({
                "clientId": client_id.to_string(),
                "message": "vertex market simulator event channel",
            }),
        ),
    );
    send_event(
        &outbound_tx,
        SYSTEM_SCOPE,
        SimEvent::now(
            EventType::Connection,
            json!({ "connected": true, "clientId": client_id.to_string() }),
        ),
    );

    loop {
        tokio::select! {
            // ── Single-writer outbound pump ─────────────────────────────
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(payload) => {
                        // Single uncompressed text frame per message.
                        if sender.send(Message::Text(payload)).await.is_err() {
                            debug!(%client_id, "WebSocket send failed — disconnecting");
                            break;
                        }
                    }
                    None => break,
                }
            }

            // ── Inbound client messages ─────────────────────────────────
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if text.as_bytes().first() == Some(&GZIP_MAGIC) {
                            warn!(%client_id, "compressed text frame rejected");
                            let _ = sender
                                .send(Message::Close(Some(CloseFrame {
                                    code: CLOSE_UNSUPPORTED,
                                    reason: "compressed frames not supported".into(),
                                })))
                                .await;
                            break;
                        }
                        handle_client_message(&state, client_id, &outbound_tx, &text).await;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        // Text frames only on this channel.
                        warn!(%client_id, first_byte = ?bytes.first(), "binary frame rejected");
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: CLOSE_UNSUPPORTED,
                                reason: "binary frames not supported".into(),
                            })))
                            .await;
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        debug!(%client_id, "pong received");
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(%client_id, "close frame received");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(%client_id, error = %e, "WebSocket receive error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    state.hub.remove_client(client_id);
    info!(%client_id, "WebSocket connection closed — cleanup complete");
}

// =============================================================================
// Message dispatch
// =============================================================================

async fn handle_client_message(
    state: &Arc<AppState>,
    client_id: Uuid,
    outbound: &mpsc::UnboundedSender<String>,
    text: &str,
) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            send_error(outbound, SYSTEM_SCOPE, None, &format!("malformed message: {e}"));
            return;
        }
    };

    let request_id = message.request_id.clone();
    match message.message_type.as_str() {
        "subscribe" => {
            let Some(simulation_id) = message.simulation_id else {
                send_error(outbound, SYSTEM_SCOPE, request_id, "subscribe requires simulationId");
                return;
            };
            if !state.manager.exists(&simulation_id) {
                send_error(
                    outbound,
                    &simulation_id,
                    request_id,
                    "unknown simulation",
                );
                return;
            }

            state
                .hub
                .add_client(&simulation_id, ClientHandle::new(client_id, outbound.clone()));
            send_event(
                outbound,
                &simulation_id,
                SimEvent::now(
                    EventType::SubscribeResponse,
                    json!({
                        "success": true,
                        "simulationId": simulation_id,
                        "requestId": request_id,
                    }),
                ),
            );

            // Follow with the full state so the client can render instantly.
            if let Ok(snapshot) = state.manager.snapshot(&simulation_id) {
                send_event(
                    outbound,
                    &simulation_id,
                    SimEvent::now(
                        EventType::SimulationState,
                        serde_json::to_value(&snapshot).unwrap_or_default(),
                    ),
                );
            }
        }

        "unsubscribe" => {
            state.hub.remove_client(client_id);
            let scope = message.simulation_id.as_deref().unwrap_or(SYSTEM_SCOPE);
            send_event(
                outbound,
                scope,
                SimEvent::now(
                    EventType::UnsubscribeResponse,
                    json!({ "success": true, "requestId": request_id }),
                ),
            );
        }

        "get_status" => {
            with_simulation(state, outbound, &message.simulation_id, request_id, |sim_id| {
                let snapshot = state.manager.snapshot(sim_id).ok()?;
                Some(SimEvent::now(
                    EventType::SimulationStatus,
                    json!({
                        "status": snapshot.status,
                        "isRunning": snapshot.is_running,
                        "isPaused": snapshot.is_paused,
                        "currentTime": snapshot.current_time,
                        "currentPrice": snapshot.current_price,
                    }),
                ))
            });
        }

        "setPauseState" => {
            let Some(simulation_id) = message.simulation_id else {
                send_error(outbound, SYSTEM_SCOPE, request_id, "setPauseState requires simulationId");
                return;
            };
            let paused = message
                .data
                .as_ref()
                .and_then(|d| d.get("paused"))
                .and_then(Value::as_bool)
                .unwrap_or(true);

            let result = if paused {
                state.manager.pause(&simulation_id).map(|_| ())
            } else {
                state.manager.start(&simulation_id).await.map(|_| ())
            };

            match result {
                Ok(()) => {
                    let snapshot = state.manager.snapshot(&simulation_id).ok();
                    send_event(
                        outbound,
                        &simulation_id,
                        SimEvent::now(
                            EventType::SimulationStatus,
                            json!({
                                "isRunning": snapshot.as_ref().map(|s| s.is_running),
                                "isPaused": snapshot.as_ref().map(|s| s.is_paused),
                                "requestId": request_id,
                            }),
                        ),
                    );
                }
                Err(e) => send_error(outbound, &simulation_id, request_id, &e.to_string()),
            }
        }

        "set_tps_mode" => {
            let Some(simulation_id) = message.simulation_id else {
                send_error(outbound, SYSTEM_SCOPE, request_id, "set_tps_mode requires simulationId");
                return;
            };
            let requested = message
                .data
                .as_ref()
                .and_then(|d| d.get("mode"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            match TpsMode::parse(&requested) {
                Some(mode) => match state.manager.set_tps_mode(&simulation_id, mode) {
                    Ok(mode) => send_event(
                        outbound,
                        &simulation_id,
                        SimEvent::now(
                            EventType::TpsStatus,
                            json!({
                                "mode": mode.to_string(),
                                "targetTps": mode.target_tps(),
                                "requestId": request_id,
                            }),
                        ),
                    ),
                    Err(e) => {
                        send_error(outbound, &simulation_id, request_id, &e.to_string())
                    }
                },
                None => send_error(
                    outbound,
                    &simulation_id,
                    request_id,
                    &format!("unknown TPS mode '{requested}'"),
                ),
            }
        }

        "get_tps_status" => {
            with_simulation(state, outbound, &message.simulation_id, request_id, |sim_id| {
                let mode = state.manager.tps_mode(sim_id).ok()?;
                Some(SimEvent::now(
                    EventType::TpsStatus,
                    json!({
                        "mode": mode.to_string(),
                        "targetTps": mode.target_tps(),
                        "multiplier": mode.multiplier(),
                    }),
                ))
            });
        }

        "trigger_liquidation_cascade" => {
            let Some(simulation_id) = message.simulation_id else {
                send_error(
                    outbound,
                    SYSTEM_SCOPE,
                    request_id,
                    "trigger_liquidation_cascade requires simulationId",
                );
                return;
            };
            match state.manager.liquidation_cascade(&simulation_id) {
                Ok(outcome) => send_event(
                    outbound,
                    &simulation_id,
                    SimEvent::now(
                        EventType::LiquidationCascadeTriggered,
                        serde_json::to_value(&outcome).unwrap_or_default(),
                    ),
                ),
                Err(e) => send_error(outbound, &simulation_id, request_id, &e.to_string()),
            }
        }

        "get_stress_capabilities" => {
            let scope = message.simulation_id.clone();
            let cascade_available = scope
                .as_deref()
                .and_then(|id| state.manager.tps_mode(id).ok())
                .map(|mode| mode.allows_liquidation_cascade())
                .unwrap_or(false);
            send_event(
                outbound,
                scope.as_deref().unwrap_or(SYSTEM_SCOPE),
                SimEvent::now(
                    EventType::StressCapabilities,
                    json!({
                        "modes": ["NORMAL", "BURST", "STRESS", "HFT"],
                        "liquidationCascadeAvailable": cascade_available,
                        "requestId": request_id,
                    }),
                ),
            );
        }

        "ping" => {
            send_event(
                outbound,
                SYSTEM_SCOPE,
                SimEvent::now(EventType::Pong, json!({ "requestId": request_id })),
            );
        }

        other => {
            send_error(
                outbound,
                SYSTEM_SCOPE,
                request_id,
                &format!("unknown message type '{other}'"),
            );
        }
    }
}

/// Run a read-only query handler that needs a simulation id.
fn with_simulation<F>(
    state: &Arc<AppState>,
    outbound: &mpsc::UnboundedSender<String>,
    simulation_id: &Option<String>,
    request_id: Option<String>,
    build: F,
) where
    F: FnOnce(&str) -> Option<SimEvent>,
{
    let Some(sim_id) = simulation_id.as_deref() else {
        send_error(outbound, SYSTEM_SCOPE, request_id, "simulationId required");
        return;
    };
    if !state.manager.exists(sim_id) {
        send_error(outbound, sim_id, request_id, "unknown simulation");
        return;
    }
    match build(sim_id) {
        Some(event) => send_event(outbound, sim_id, event),
        None => send_error(outbound, sim_id, None, "query failed"),
    }
}

// =============================================================================
// Outbound helpers
// =============================================================================

fn send_event(outbound: &mpsc::UnboundedSender<String>, simulation_id: &str, event: SimEvent) {
    let envelope = EventEnvelope {
        simulation_id: simulation_id.to_string(),
        event,
    };
    if let Ok(payload) = serde_json::to_string(&envelope) {
        let _ = outbound.send(payload);
    }
}

fn send_error(
    outbound: &mpsc::UnboundedSender<String>,
    simulation_id: &str,
    request_id: Option<String>,
    message: &str,
) {
    send_event(
        outbound,
        simulation_id,
        SimEvent::now(
            EventType::Error,
            json!({ "message": message, "requestId": request_id }),
        ),
    );
}
