//! Connection hub: single owner of the live-connection set
//!
//! The hub runs one control loop that is the only writer of the connection
//! map, driven by a single event channel (register / unregister / broadcast /
//! shutdown). Everyone else talks to it through a cloneable [`HubHandle`].
//!
//! Broadcast fan-out never blocks: a connection whose outbound queue is full
//! is marked stale during iteration and removed afterwards, so one slow
//! client cannot stall delivery to its siblings.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RelayError;
use crate::message::ReloadMessage;

/// WebSocket close code: normal closure
pub const CLOSE_NORMAL: u16 = 1000;
/// WebSocket close code: server going away
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// WebSocket close code: policy violation (rate limit)
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Depth of the hub's own event channel
const EVENT_CHANNEL_DEPTH: usize = 256;

/// Connection identity within the hub
pub type ConnId = Uuid;

/// What the write pump drains from a connection's outbound queue
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Pre-serialized envelope to deliver as a text frame
    Payload(String),
    /// Close the transport with this code; the write pump exits after sending
    Close(u16),
}

/// One registered connection as the hub sees it: identity plus the sending
/// half of its outbound queue. The transport itself is owned by the pumps.
pub struct Connection {
    pub id: ConnId,
    pub outbound: mpsc::Sender<Outbound>,
}

enum HubEvent {
    Register(Connection),
    Unregister(ConnId),
    Broadcast(String),
    Shutdown(oneshot::Sender<()>),
}

/// The hub control loop. Construct with [`ConnectionHub::new`] and drive it
/// with `tokio::spawn(hub.run())`.
pub struct ConnectionHub {
    events: mpsc::Receiver<HubEvent>,
    connections: HashMap<ConnId, Connection>,
    connected: Arc<AtomicUsize>,
}

impl ConnectionHub {
    /// Create a hub enforcing `max_connections` and the handle used to talk
    /// to it.
    pub fn new(max_connections: usize) -> (ConnectionHub, HubHandle) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let connected = Arc::new(AtomicUsize::new(0));
        let hub = ConnectionHub {
            events: rx,
            connections: HashMap::new(),
            connected: connected.clone(),
        };
        let handle = HubHandle {
            events: tx,
            connected,
            max_connections,
        };
        (hub, handle)
    }

    /// Run the control loop until shutdown is requested or every handle has
    /// been dropped.
    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                HubEvent::Register(conn) => {
                    debug!(conn_id = %conn.id, "connection registered");
                    if self.connections.insert(conn.id, conn).is_some() {
                        // A colliding id means the slot was double-counted
                        warn!("replaced connection with duplicate id");
                        self.connected.fetch_sub(1, Ordering::Relaxed);
                    }
                }
                HubEvent::Unregister(id) => self.remove(id, CLOSE_NORMAL),
                HubEvent::Broadcast(payload) => self.fan_out(&payload),
                HubEvent::Shutdown(ack) => {
                    info!(connections = self.connections.len(), "hub shutting down");
                    let ids: Vec<ConnId> = self.connections.keys().copied().collect();
                    for id in ids {
                        self.remove(id, CLOSE_GOING_AWAY);
                    }
                    let _ = ack.send(());
                    break;
                }
            }
        }
        debug!("hub control loop exited");
    }

    /// Remove one connection if present: queue a close frame, close its
    /// outbound queue (by dropping the sender), and release its slot.
    /// Safe to call for already-removed ids, so every exit path can funnel
    /// into an unregister without double counting.
    fn remove(&mut self, id: ConnId, close_code: u16) {
        if let Some(conn) = self.connections.remove(&id) {
            let _ = conn.outbound.try_send(Outbound::Close(close_code));
            self.connected.fetch_sub(1, Ordering::Relaxed);
            debug!(conn_id = %id, close_code, "connection unregistered");
        }
    }

    /// Non-blocking fan-out to every registered connection. Connections with
    /// a full or closed queue are collected during iteration and removed
    /// after it completes, never mid-iteration.
    fn fan_out(&mut self, payload: &str) {
        let mut stale: Vec<ConnId> = Vec::new();

        for (id, conn) in &self.connections {
            match conn.outbound.try_send(Outbound::Payload(payload.to_string())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(conn_id = %id, "outbound queue full, dropping slow client");
                    stale.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    stale.push(*id);
                }
            }
        }

        for id in stale {
            self.remove(id, CLOSE_GOING_AWAY);
        }
    }
}

/// Cloneable handle to the hub, used by the handshake path, the pumps, and
/// external collaborators that broadcast change notifications.
#[derive(Clone)]
pub struct HubHandle {
    events: mpsc::Sender<HubEvent>,
    connected: Arc<AtomicUsize>,
    max_connections: usize,
}

impl HubHandle {
    /// Reserve a connection slot and register its outbound queue.
    ///
    /// The slot is claimed atomically before the register event is sent, so
    /// two racing handshakes can never both pass a cap of N. Registration
    /// happens before the pumps start; the hub releases the slot when the
    /// connection is unregistered.
    pub fn try_register(&self, outbound: mpsc::Sender<Outbound>) -> Result<ConnId, RelayError> {
        self.connected
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_connections).then_some(n + 1)
            })
            .map_err(|_| RelayError::CapacityExceeded)?;

        let id = Uuid::new_v4();
        let conn = Connection { id, outbound };
        if self.events.try_send(HubEvent::Register(conn)).is_err() {
            self.connected.fetch_sub(1, Ordering::SeqCst);
            return Err(RelayError::InternalError(
                "hub is not accepting registrations".to_string(),
            ));
        }
        Ok(id)
    }

    /// Ask the hub to drop a connection. Idempotent.
    pub async fn unregister(&self, id: ConnId) {
        let _ = self.events.send(HubEvent::Unregister(id)).await;
    }

    /// Fire-and-forget broadcast to every registered connection
    pub fn broadcast(&self, message: &ReloadMessage) {
        let payload = match message.to_json() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "dropping unserializable broadcast");
                return;
            }
        };
        if self.events.try_send(HubEvent::Broadcast(payload)).is_err() {
            warn!("hub event queue full or closed, dropping broadcast");
        }
    }

    /// Number of currently registered connections (including slots reserved
    /// by handshakes that have not finished upgrading)
    pub fn connected_count(&self) -> usize {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Graceful shutdown: stop the control loop, close every outbound queue
    /// with a going-away code, and wait up to `deadline` for the loop to
    /// confirm. Existing transports drain via their own pumps.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), RelayError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.events.send(HubEvent::Shutdown(ack_tx)).await.is_err() {
            // Loop already gone; nothing to drain
            return Ok(());
        }
        tokio::time::timeout(deadline, ack_rx)
            .await
            .map_err(|_| RelayError::ShutdownTimeout)?
            .map_err(|_| RelayError::ShutdownTimeout)
    }
}
