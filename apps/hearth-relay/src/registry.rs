use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use metrics::{counter, gauge};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::RelayError;
use crate::model::{DeviceId, UserId};
use crate::protocol::ServerEnvelope;

pub type ConnectionId = Uuid;

/// Why a transport was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    ClientDisconnected,
    Replaced,
    ProbeTimeout,
    TransportFailed,
    HandshakeTimeout,
    ServerShutdown,
}

impl CloseReason {
    pub fn label(self) -> &'static str {
        match self {
            CloseReason::ClientDisconnected => "client_disconnected",
            CloseReason::Replaced => "replaced",
            CloseReason::ProbeTimeout => "probe_timeout",
            CloseReason::TransportFailed => "transport_failed",
            CloseReason::HandshakeTimeout => "handshake_timeout",
            CloseReason::ServerShutdown => "server_shutdown",
        }
    }
}

/// Frames queued for a socket's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Envelope(ServerEnvelope),
    /// Liveness probe, written as a WebSocket ping.
    Probe,
    /// Last frame; the writer stops after it.
    Close(CloseReason),
}

/// Write half of one socket.
///
/// Sends never block: frames go to an unbounded queue drained by the socket's
/// writer task. Once closed, every send fails with a transport error.
#[derive(Debug)]
pub struct Transport {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Outbound>,
    closed: AtomicBool,
    close_signal: Notify,
}

impl Transport {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            tx,
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        })
    }

    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn send(&self, envelope: ServerEnvelope) -> Result<(), RelayError> {
        self.push(Outbound::Envelope(envelope))
    }

    pub fn probe(&self) -> Result<(), RelayError> {
        self.push(Outbound::Probe)
    }

    /// Marks the transport closed and queues a close frame. Only the first call
    /// has an effect; returns whether this call closed it.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.tx.send(Outbound::Close(reason));
        self.close_signal.notify_one();
        true
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.close_signal.notified().await;
    }

    fn push(&self, frame: Outbound) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::Transport(format!("connection {} is closed", self.id)));
        }
        self.tx
            .send(frame)
            .map_err(|_| RelayError::Transport(format!("connection {} writer is gone", self.id)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Alive,
    PendingProbe,
    Closed,
}

/// A registered transport bound to one device of one user.
#[derive(Debug)]
pub struct Connection {
    transport: Arc<Transport>,
    device_id: DeviceId,
    user_id: UserId,
    alive: AtomicBool,
    last_ack_ms: AtomicU64,
    registered_at_ms: u64,
}

impl Connection {
    fn new(transport: Arc<Transport>, device_id: DeviceId, user_id: UserId) -> Self {
        let now = now_millis();
        Self {
            transport,
            device_id,
            user_id,
            alive: AtomicBool::new(true),
            last_ack_ms: AtomicU64::new(now),
            registered_at_ms: now,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.transport.id()
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn registered_at_ms(&self) -> u64 {
        self.registered_at_ms
    }

    pub fn last_ack_ms(&self) -> u64 {
        self.last_ack_ms.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> ConnectionState {
        if self.transport.is_closed() {
            ConnectionState::Closed
        } else if self.alive.load(Ordering::Acquire) {
            ConnectionState::Alive
        } else {
            ConnectionState::PendingProbe
        }
    }

    /// Clears the liveness flag, returning whether it was set.
    pub(crate) fn begin_probe(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn acknowledge(&self) {
        self.alive.store(true, Ordering::Release);
        self.last_ack_ms.store(now_millis(), Ordering::Relaxed);
    }
}

pub struct Registration {
    pub connection: Arc<Connection>,
    /// Prior transport of the same device, already closed.
    pub replaced: Option<Arc<Connection>>,
    pub user_devices: usize,
    pub total_connections: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total_connections: usize,
    pub total_users: usize,
    pub devices_per_user: BTreeMap<UserId, usize>,
    /// Ordered by user, then device.
    pub connections: Vec<ConnectionSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSummary {
    pub connection_id: ConnectionId,
    pub device_id: DeviceId,
    pub user_id: UserId,
    pub state: ConnectionState,
    pub registered_at_ms: u64,
    pub last_ack_ms: u64,
}

impl From<&Connection> for ConnectionSummary {
    fn from(connection: &Connection) -> Self {
        Self {
            connection_id: connection.id(),
            device_id: connection.device_id.clone(),
            user_id: connection.user_id.clone(),
            state: connection.state(),
            registered_at_ms: connection.registered_at_ms(),
            last_ack_ms: connection.last_ack_ms(),
        }
    }
}

#[derive(Default)]
struct Tables {
    by_device: HashMap<DeviceId, Arc<Connection>>,
    by_transport: HashMap<ConnectionId, DeviceId>,
    devices_by_user: HashMap<UserId, BTreeSet<DeviceId>>,
}

impl Tables {
    fn insert(&mut self, connection: Arc<Connection>) {
        self.by_transport
            .insert(connection.id(), connection.device_id.clone());
        self.devices_by_user
            .entry(connection.user_id.clone())
            .or_default()
            .insert(connection.device_id.clone());
        self.by_device
            .insert(connection.device_id.clone(), connection);
    }

    fn detach_device(&mut self, device_id: &DeviceId) -> Option<Arc<Connection>> {
        let connection = self.by_device.remove(device_id)?;
        self.by_transport.remove(&connection.id());
        if let Some(devices) = self.devices_by_user.get_mut(&connection.user_id) {
            devices.remove(device_id);
            if devices.is_empty() {
                self.devices_by_user.remove(&connection.user_id);
            }
        }
        Some(connection)
    }

    fn detach_transport(&mut self, id: ConnectionId) -> Option<Arc<Connection>> {
        let device_id = self.by_transport.get(&id)?.clone();
        self.detach_device(&device_id)
    }

    fn device_count(&self, user_id: &UserId) -> usize {
        self.devices_by_user.get(user_id).map_or(0, BTreeSet::len)
    }
}

/// Index of live transports by device and by user.
///
/// All three tables sit behind one lock so a reader never sees a device in a
/// user's set without its connection.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<Tables>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        device_id: DeviceId,
        user_id: UserId,
        transport: Arc<Transport>,
    ) -> Result<Registration, RelayError> {
        if transport.is_closed() {
            return Err(RelayError::Transport(format!(
                "connection {} closed before registration",
                transport.id()
            )));
        }

        let registration = {
            let mut tables = self.inner.write();

            if let Some(existing) = tables.by_device.get(&device_id) {
                if existing.id() == transport.id() && existing.user_id == user_id {
                    existing.acknowledge();
                    return Ok(Registration {
                        connection: Arc::clone(existing),
                        replaced: None,
                        user_devices: tables.device_count(&user_id),
                        total_connections: tables.by_device.len(),
                    });
                }
            }

            let replaced = tables
                .detach_device(&device_id)
                .filter(|previous| previous.id() != transport.id());
            // Same socket re-identifying as another device drops its old entry.
            if let Some(stale) = tables.detach_transport(transport.id()) {
                debug!(
                    connection_id = %stale.id(),
                    device_id = %stale.device_id,
                    "transport re-registered under a new device id"
                );
            }

            let connection = Arc::new(Connection::new(
                Arc::clone(&transport),
                device_id.clone(),
                user_id.clone(),
            ));
            tables.insert(Arc::clone(&connection));

            Registration {
                connection,
                replaced,
                user_devices: tables.device_count(&user_id),
                total_connections: tables.by_device.len(),
            }
        };

        if let Some(previous) = &registration.replaced {
            previous.transport.close(CloseReason::Replaced);
            counter!("hearth_relay_connections_closed_total", 1, "reason" => CloseReason::Replaced.label());
            info!(
                device_id = %device_id,
                user_id = %previous.user_id,
                connection_id = %previous.id(),
                "closed previous connection for device"
            );
        }
        gauge!(
            "hearth_relay_connections_active",
            registration.total_connections as f64
        );
        Ok(registration)
    }

    pub fn remove_device(&self, device_id: &DeviceId) -> Option<Arc<Connection>> {
        let removed = self.inner.write().detach_device(device_id);
        self.record_active();
        removed
    }

    pub fn remove_transport(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.inner.write().detach_transport(id);
        self.record_active();
        removed
    }

    /// Tears down the connection registered for transport `id`.
    ///
    /// Does nothing when `id` is no longer the registered transport of its
    /// device, so a late close from a replaced socket cannot evict its successor.
    pub fn close(&self, id: ConnectionId, reason: CloseReason) -> Option<Arc<Connection>> {
        let connection = self.remove_transport(id)?;
        connection.transport.close(reason);
        counter!("hearth_relay_connections_closed_total", 1, "reason" => reason.label());
        info!(
            device_id = %connection.device_id,
            user_id = %connection.user_id,
            connection_id = %id,
            reason = reason.label(),
            "connection closed"
        );
        Some(connection)
    }

    /// Closes `transport` whether or not it ever registered.
    pub fn close_transport(&self, transport: &Transport, reason: CloseReason) {
        if self.close(transport.id(), reason).is_none() {
            transport.close(reason);
        }
    }

    pub fn devices_of(&self, user_id: &UserId) -> Vec<DeviceId> {
        self.inner
            .read()
            .devices_by_user
            .get(user_id)
            .map(|devices| devices.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn connections_of(&self, user_id: &UserId) -> Vec<Arc<Connection>> {
        let tables = self.inner.read();
        tables
            .devices_by_user
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|device| tables.by_device.get(device).cloned())
            .collect()
    }

    pub fn connection(&self, device_id: &DeviceId) -> Option<Arc<Connection>> {
        self.inner.read().by_device.get(device_id).cloned()
    }

    pub fn is_live(&self, device_id: &DeviceId) -> bool {
        self.connection(device_id)
            .is_some_and(|connection| !connection.transport.is_closed())
    }

    pub fn is_registered(&self, id: ConnectionId) -> bool {
        self.inner.read().by_transport.contains_key(&id)
    }

    pub fn live_connections(&self) -> Vec<Arc<Connection>> {
        self.inner.read().by_device.values().cloned().collect()
    }

    /// Records a probe acknowledgement; false when `id` is not registered.
    pub fn mark_probe_ack(&self, id: ConnectionId) -> bool {
        let tables = self.inner.read();
        let Some(connection) = tables
            .by_transport
            .get(&id)
            .and_then(|device| tables.by_device.get(device))
        else {
            return false;
        };
        connection.acknowledge();
        true
    }

    pub fn snapshot(&self) -> RegistryStats {
        let tables = self.inner.read();
        RegistryStats {
            total_connections: tables.by_device.len(),
            total_users: tables.devices_by_user.len(),
            devices_per_user: tables
                .devices_by_user
                .iter()
                .map(|(user, devices)| (user.clone(), devices.len()))
                .collect(),
            connections: {
                let mut users: Vec<&UserId> = tables.devices_by_user.keys().collect();
                users.sort();
                users
                    .into_iter()
                    .flat_map(|user| &tables.devices_by_user[user])
                    .filter_map(|device| tables.by_device.get(device))
                    .map(|connection| ConnectionSummary::from(connection.as_ref()))
                    .collect()
            },
        }
    }

    fn record_active(&self) {
        let total = self.inner.read().by_device.len();
        gauge!("hearth_relay_connections_active", total as f64);
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
