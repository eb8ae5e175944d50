// =============================================================================
// Broadcast Hub — per-simulation event fan-out
// =============================================================================
//
// Two delivery paths:
//   - Immediate: price_update, trade, processed_trade, simulation_status,
//     simulation_reset, simulation_state — serialised and dispatched per
//     event, preserving dispatch order.
//   - Batched: everything else accumulates in a per-simulation ring
//     (capacity 2x batch size, newest retained) and is flushed every 25 ms
//     inside a `batch_update` envelope. Within a batch, idempotent types
//     keep only their most recent instance; additive types keep all.
//
// The subscription index is a pair of maps — simulation -> clients and
// client -> subscription metadata — mutated together under a single lock so
// a disconnect can never leave a half-removed client behind.
//
// Clients are mpsc senders feeding the WebSocket write half; a failed send
// means the client is gone, so it is removed on the spot.
// =============================================================================

use std::collections::HashMap;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{EventEnvelope, EventSink, EventType, SimEvent};

use super::sanitize::{sanitize_value, validate_batch, GZIP_MAGIC};

/// Target number of updates per batch.
const BATCH_SIZE: usize = 25;
/// Per-simulation pending ring capacity.
const PENDING_CAP: usize = BATCH_SIZE * 2;
/// Flush period for batched updates.
pub const FLUSH_INTERVAL_MS: u64 = 25;

// ---------------------------------------------------------------------------
// Client handle
// ---------------------------------------------------------------------------

/// One connected subscriber. The sender feeds the connection's write task;
/// every payload is a complete JSON text frame.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub id: Uuid,
    sender: mpsc::UnboundedSender<String>,
}

impl ClientHandle {
    pub fn new(id: Uuid, sender: mpsc::UnboundedSender<String>) -> Self {
        Self { id, sender }
    }

    fn send(&self, payload: String) -> Result<(), ()> {
        self.sender.send(payload).map_err(|_| ())
    }
}

struct ClientMeta {
    simulation_id: String,
    last_update: i64,
    message_count: u64,
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

struct SubscriptionIndex {
    by_simulation: HashMap<String, HashMap<Uuid, ClientHandle>>,
    by_client: HashMap<Uuid, ClientMeta>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubHealth {
    pub healthy: bool,
    pub clients: usize,
    pub simulations: usize,
    pub pending_updates: usize,
    pub events_sent: u64,
    pub batches_sent: u64,
    pub corrupt_batches: u64,
    pub connection_errors: u64,
    pub dropped_updates: u64,
}

/// Fan-out layer between the engines and connected WebSocket clients.
pub struct BroadcastHub {
    index: Mutex<SubscriptionIndex>,
    pending: Mutex<HashMap<String, Vec<SimEvent>>>,
    events_sent: AtomicU64,
    batches_sent: AtomicU64,
    corrupt_batches: AtomicU64,
    connection_errors: AtomicU64,
    dropped_updates: AtomicU64,
    shut_down: AtomicBool,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self {
            index: Mutex::new(SubscriptionIndex {
                by_simulation: HashMap::new(),
                by_client: HashMap::new(),
            }),
            pending: Mutex::new(HashMap::new()),
            events_sent: AtomicU64::new(0),
            batches_sent: AtomicU64::new(0),
            corrupt_batches: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            dropped_updates: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    // ── Subscription management ─────────────────────────────────────────

    /// Subscribe a client to a simulation. A client subscribes to one
    /// simulation at a time; re-subscribing moves it.
    pub fn add_client(&self, simulation_id: &str, client: ClientHandle) {
        let mut index = self.index.lock();

        // Drop any previous subscription for this client id first.
        if let Some(previous) = index.by_client.remove(&client.id) {
            if let Some(clients) = index.by_simulation.get_mut(&previous.simulation_id) {
                clients.remove(&client.id);
                if clients.is_empty() {
                    index.by_simulation.remove(&previous.simulation_id);
                }
            }
        }

        index.by_client.insert(
            client.id,
            ClientMeta {
                simulation_id: simulation_id.to_string(),
                last_update: chrono::Utc::now().timestamp_millis(),
                message_count: 0,
            },
        );
        index
            .by_simulation
            .entry(simulation_id.to_string())
            .or_default()
            .insert(client.id, client);

        debug!(simulation_id, "client subscribed");
    }

    /// Remove a client from both maps atomically.
    pub fn remove_client(&self, client_id: Uuid) {
        let mut index = self.index.lock();
        if let Some(meta) = index.by_client.remove(&client_id) {
            if let Some(clients) = index.by_simulation.get_mut(&meta.simulation_id) {
                clients.remove(&client_id);
                if clients.is_empty() {
                    index.by_simulation.remove(&meta.simulation_id);
                }
            }
            debug!(simulation_id = %meta.simulation_id, "client unsubscribed");
        }
    }

    pub fn client_count(&self, simulation_id: &str) -> usize {
        self.index
            .lock()
            .by_simulation
            .get(simulation_id)
            .map_or(0, HashMap::len)
    }

    // ── Delivery paths ──────────────────────────────────────────────────

    /// Route an event: immediate types dispatch now, everything else joins
    /// the per-simulation pending ring for the next flush.
    pub fn queue_update(&self, simulation_id: &str, event: SimEvent) {
        if self.shut_down.load(Ordering::Relaxed) {
            return;
        }

        if event.event_type.is_immediate() {
            self.dispatch_event(simulation_id, &event);
            return;
        }

        let mut pending = self.pending.lock();
        let ring = pending.entry(simulation_id.to_string()).or_default();
        ring.push(event);
        // Overflow keeps the newest entries.
        while ring.len() > PENDING_CAP {
            ring.remove(0);
            self.dropped_updates.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Dispatch a single event immediately regardless of its type.
    pub fn send_direct(&self, simulation_id: &str, event: SimEvent) {
        if !self.shut_down.load(Ordering::Relaxed) {
            self.dispatch_event(simulation_id, &event);
        }
    }

    /// Send an event to every connected client, across all simulations.
    pub fn broadcast_to_all(&self, event: SimEvent) {
        if self.shut_down.load(Ordering::Relaxed) {
            return;
        }
        let simulation_ids: Vec<String> =
            self.index.lock().by_simulation.keys().cloned().collect();
        for id in simulation_ids {
            self.dispatch_event(&id, &event);
        }
    }

    /// Flush pending rings into batch envelopes.
    pub fn flush(&self) {
        let drained: Vec<(String, Vec<SimEvent>)> = {
            let mut pending = self.pending.lock();
            pending
                .iter_mut()
                .filter(|(_, ring)| !ring.is_empty())
                .map(|(id, ring)| (id.clone(), std::mem::take(ring)))
                .collect()
        };

        for (simulation_id, events) in drained {
            self.dispatch_batch(&simulation_id, events);
        }
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn dispatch_event(&self, simulation_id: &str, event: &SimEvent) {
        let envelope = EventEnvelope {
            simulation_id: simulation_id.to_string(),
            event: SimEvent {
                event_type: event.event_type,
                timestamp: event.timestamp,
                data: sanitize_value(&event.data),
            },
        };

        let payload = match serde_json::to_string(&envelope) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "event serialisation failed — dropped");
                self.corrupt_batches.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if payload.as_bytes().first() == Some(&GZIP_MAGIC) {
            self.corrupt_batches.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.send_to_simulation(simulation_id, payload);
        self.events_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Group a drained ring into the batch envelope and send it.
    fn dispatch_batch(&self, simulation_id: &str, events: Vec<SimEvent>) {
        let mut updates = Map::new();
        let mut count = 0usize;

        for event in events {
            let key = event.event_type.batch_key();
            let data = sanitize_value(&event.data);
            if event.event_type.is_idempotent() {
                // Only the most recent instance survives.
                if updates.insert(key.to_string(), data).is_none() {
                    count += 1;
                }
            } else {
                // Additive (and unclassified) types are all retained.
                match updates
                    .entry(key.to_string())
                    .or_insert_with(|| Value::Array(Vec::new()))
                {
                    Value::Array(items) => {
                        items.push(data);
                        count += 1;
                    }
                    _ => {
                        self.corrupt_batches.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        if count == 0 {
            return;
        }

        let now = chrono::Utc::now().timestamp_millis();
        let message = json!({
            "simulationId": simulation_id,
            "event": {
                "type": "batch_update",
                "timestamp": now,
                "data": {
                    "updates": Value::Object(updates),
                    "updateCount": count,
                    "batchTimestamp": now,
                }
            }
        });

        match validate_batch(&message) {
            Ok(payload) => {
                self.send_to_simulation(simulation_id, payload);
                self.batches_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(simulation_id, error = %e, "invalid batch dropped");
                self.corrupt_batches.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Send a serialised payload to every subscriber of one simulation,
    /// evicting clients whose channel is gone.
    fn send_to_simulation(&self, simulation_id: &str, payload: String) {
        let mut index = self.index.lock();

        let Some(clients) = index.by_simulation.get(simulation_id) else {
            return;
        };

        let mut dead: Vec<Uuid> = Vec::new();
        let mut delivered: Vec<Uuid> = Vec::new();
        for (client_id, client) in clients {
            match client.send(payload.clone()) {
                Ok(()) => delivered.push(*client_id),
                Err(()) => dead.push(*client_id),
            }
        }

        let now = chrono::Utc::now().timestamp_millis();
        for client_id in delivered {
            if let Some(meta) = index.by_client.get_mut(&client_id) {
                meta.last_update = now;
                meta.message_count += 1;
            }
        }

        for client_id in dead {
            self.connection_errors.fetch_add(1, Ordering::Relaxed);
            warn!(simulation_id, %client_id, "client send failed — removing");
            if let Some(meta) = index.by_client.remove(&client_id) {
                if let Some(clients) = index.by_simulation.get_mut(&meta.simulation_id) {
                    clients.remove(&client_id);
                    if clients.is_empty() {
                        index.by_simulation.remove(&meta.simulation_id);
                    }
                }
            }
        }
    }

    // ── Observability / lifecycle ───────────────────────────────────────

    pub fn health_check(&self) -> HubHealth {
        let index = self.index.lock();
        let pending: usize = self.pending.lock().values().map(Vec::len).sum();
        let connection_errors = self.connection_errors.load(Ordering::Relaxed);
        let corrupt = self.corrupt_batches.load(Ordering::Relaxed);

        HubHealth {
            healthy: !self.shut_down.load(Ordering::Relaxed),
            clients: index.by_client.len(),
            simulations: index.by_simulation.len(),
            pending_updates: pending,
            events_sent: self.events_sent.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            corrupt_batches: corrupt,
            connection_errors,
            dropped_updates: self.dropped_updates.load(Ordering::Relaxed),
        }
    }

    /// Stop delivery and drop every subscription. Client channels close as
    /// their senders are dropped.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Relaxed);
        let mut index = self.index.lock();
        let clients = index.by_client.len();
        index.by_simulation.clear();
        index.by_client.clear();
        self.pending.lock().clear();
        info!(clients, "broadcast hub shut down");
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for BroadcastHub {
    fn deliver(&self, simulation_id: &str, event: SimEvent) {
        self.queue_update(simulation_id, event);
    }
}

/// Run the periodic batch flush until the shutdown signal flips.
pub async fn run_flush_task(hub: Arc<BroadcastHub>, mut shutdown: watch::Receiver<bool>) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_millis(FLUSH_INTERVAL_MS));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                hub.flush();
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    hub.flush();
                    info!("broadcast flush task stopping");
                    return;
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> (ClientHandle, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientHandle::new(Uuid::new_v4(), tx), rx)
    }

    fn event(event_type: EventType, data: Value) -> SimEvent {
        SimEvent::new(event_type, 1_700_000_000_000, data)
    }

    #[test]
    fn immediate_events_dispatch_in_order() {
        let hub = BroadcastHub::new();
        let (handle, mut rx) = client();
        hub.add_client("sim-a", handle);

        hub.queue_update("sim-a", event(EventType::Trade, json!({"id": "t1"})));
        hub.queue_update("sim-a", event(EventType::Trade, json!({"id": "t2"})));

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert!(first.contains("t1"));
        assert!(second.contains("t2"));
        // Text frames: plain JSON, no gzip magic.
        assert_ne!(first.as_bytes()[0], GZIP_MAGIC);
        let parsed: Value = serde_json::from_str(&first).unwrap();
        assert_eq!(parsed["event"]["type"], "trade");
    }

    #[test]
    fn batched_events_wait_for_flush() {
        let hub = BroadcastHub::new();
        let (handle, mut rx) = client();
        hub.add_client("sim-a", handle);

        hub.queue_update("sim-a", event(EventType::OrderBook, json!({"rev": 1})));
        assert!(rx.try_recv().is_err());

        hub.flush();
        let payload = rx.try_recv().unwrap();
        let parsed: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed["event"]["type"], "batch_update");
        assert_eq!(parsed["event"]["data"]["updateCount"], 1);
        assert!(parsed["event"]["data"]["updates"]["orderBook"].is_object());
        assert!(parsed["event"]["data"].get("type").is_none());
    }

    #[test]
    fn idempotent_types_keep_latest_only() {
        let hub = BroadcastHub::new();
        let (handle, mut rx) = client();
        hub.add_client("sim-a", handle);

        for rev in 0..5 {
            hub.queue_update("sim-a", event(EventType::OrderBook, json!({"rev": rev})));
        }
        hub.flush();

        let parsed: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(parsed["event"]["data"]["updateCount"], 1);
        assert_eq!(parsed["event"]["data"]["updates"]["orderBook"]["rev"], 4);
    }

    #[test]
    fn additive_types_keep_all() {
        let hub = BroadcastHub::new();
        let (handle, mut rx) = client();
        hub.add_client("sim-a", handle);

        hub.queue_update("sim-a", event(EventType::PositionOpen, json!({"n": 1})));
        hub.queue_update("sim-a", event(EventType::PositionClose, json!({"n": 2})));
        hub.flush();

        let parsed: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        let positions = parsed["event"]["data"]["updates"]["positions"]
            .as_array()
            .unwrap();
        assert_eq!(positions.len(), 2);
        assert_eq!(parsed["event"]["data"]["updateCount"], 2);
    }

    #[test]
    fn overflow_retains_newest() {
        let hub = BroadcastHub::new();
        let (handle, mut rx) = client();
        hub.add_client("sim-a", handle);

        for n in 0..(PENDING_CAP + 10) {
            hub.queue_update("sim-a", event(EventType::PositionOpen, json!({"n": n})));
        }
        hub.flush();

        let parsed: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        let positions = parsed["event"]["data"]["updates"]["positions"]
            .as_array()
            .unwrap();
        assert_eq!(positions.len(), PENDING_CAP);
        // Oldest entries were dropped.
        assert_eq!(positions[0]["n"], 10);
        assert_eq!(hub.health_check().dropped_updates, 10);
    }

    #[test]
    fn disconnect_removes_from_both_maps() {
        let hub = BroadcastHub::new();
        let (handle, _rx) = client();
        let id = handle.id;
        hub.add_client("sim-a", handle);
        assert_eq!(hub.client_count("sim-a"), 1);

        hub.remove_client(id);
        assert_eq!(hub.client_count("sim-a"), 0);
        assert_eq!(hub.health_check().clients, 0);
        assert_eq!(hub.health_check().simulations, 0);
    }

    #[test]
    fn failed_send_evicts_client() {
        let hub = BroadcastHub::new();
        let (handle, rx) = client();
        hub.add_client("sim-a", handle);
        drop(rx); // Receiver gone: every send now fails.

        hub.queue_update("sim-a", event(EventType::Trade, json!({"id": "t"})));
        assert_eq!(hub.client_count("sim-a"), 0);
        assert_eq!(hub.health_check().connection_errors, 1);
    }

    #[test]
    fn resubscribe_moves_client() {
        let hub = BroadcastHub::new();
        let (handle, mut rx) = client();
        hub.add_client("sim-a", handle.clone());
        hub.add_client("sim-b", handle);

        assert_eq!(hub.client_count("sim-a"), 0);
        assert_eq!(hub.client_count("sim-b"), 1);

        hub.queue_update("sim-b", event(EventType::Trade, json!({"id": "t"})));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn broadcast_to_all_reaches_every_simulation() {
        let hub = BroadcastHub::new();
        let (a, mut rx_a) = client();
        let (b, mut rx_b) = client();
        hub.add_client("sim-a", a);
        hub.add_client("sim-b", b);

        hub.broadcast_to_all(event(EventType::SimulationStatus, json!({"up": true})));
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn shutdown_stops_delivery() {
        let hub = BroadcastHub::new();
        let (handle, mut rx) = client();
        hub.add_client("sim-a", handle);

        hub.shutdown();
        hub.queue_update("sim-a", event(EventType::Trade, json!({"id": "t"})));
        assert!(rx.try_recv().is_err());
        assert!(!hub.health_check().healthy);
    }

    #[test]
    fn send_direct_bypasses_batching() {
        let hub = BroadcastHub::new();
        let (handle, mut rx) = client();
        hub.add_client("sim-a", handle);

        hub.send_direct("sim-a", event(EventType::OrderBook, json!({"rev": 9})));
        let parsed: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(parsed["event"]["type"], "order_book");
    }
}
