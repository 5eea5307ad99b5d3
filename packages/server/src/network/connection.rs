//! Connection multiplexer: physical links, virtual channels, and keepalive
//! (spec §3 "Connection"/"Channel", §4.2).
//!
//! One physical `ConnectionHandle` (a single WebSocket) owns N virtual
//! `ChannelHandle`s, each addressed by a client-generated uuid. Resource
//! subscription handlers and the device manager address channels by uuid
//! through the global [`ChannelRegistry`], independent of which physical
//! connection currently owns them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use hub_core::Message;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use super::config::ConnectionConfig;

/// Unique identifier for a physical connection, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// States a virtual channel moves through (spec §3 "Channel").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// A frame queued for delivery to a physical connection's write loop.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Message(Message),
    Close(Option<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    Disconnected,
    Full,
}

/// A client-addressed virtual channel multiplexed over one physical link.
///
/// Sending through a channel forwards to its owning connection's shared
/// outbound queue, tagging the frame with this channel's uuid so the write
/// loop's codec can stamp it on the outgoing JSON envelope.
pub struct ChannelHandle {
    pub id: String,
    pub connection_id: ConnectionId,
    state: RwLock<ChannelState>,
    token: RwLock<Option<String>>,
    out_tx: mpsc::Sender<(String, OutboundFrame)>,
}

impl ChannelHandle {
    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.state.read()
    }

    pub fn set_state(&self, state: ChannelState) {
        *self.state.write() = state;
    }

    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }

    /// Sends a message to this specific channel, stamping its uuid.
    #[must_use]
    pub fn send(&self, mut message: Message) -> bool {
        message.uuid = Some(self.id.clone());
        self.out_tx
            .try_send((self.id.clone(), OutboundFrame::Message(message)))
            .is_ok()
    }
}

/// A physical transport link. Owns the set of virtual channels created on
/// it via `connection:register`; on teardown every owned channel is
/// detached (spec §3 "Connection" invariant).
pub struct ConnectionHandle {
    pub id: ConnectionId,
    out_tx: mpsc::Sender<(String, OutboundFrame)>,
    channels: DashMap<String, Arc<ChannelHandle>>,
    pub connected_at: Instant,
    /// Set from the frame kind of the most recently received message, so
    /// replies are sent back using the same text/binary encoding (spec §4.1).
    pub binary_mode: AtomicBool,
    /// Replaceable so a device registration can tighten the interval/timeout
    /// for this physical link (spec §4.9 step 2).
    keepalive: RwLock<Keepalive>,
}

impl ConnectionHandle {
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.out_tx.is_closed()
    }

    /// Broadcasts to every channel owned by this physical connection
    /// (spec §4.2 legacy fan-out when `uuid` is empty).
    pub fn broadcast_local(&self, message: &Message) {
        for entry in &self.channels {
            entry.value().send(message.clone());
        }
    }

    #[must_use]
    pub fn channel_ids(&self) -> Vec<String> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    pub fn send_close(&self, reason: Option<String>) {
        let _ = self.out_tx.try_send((String::new(), OutboundFrame::Close(reason)));
    }

    /// Sends an unsolicited `ping` directly on the physical link, outside of
    /// any specific channel's addressing (spec §4.2 keepalive).
    pub fn send_ping(&self) {
        let _ = self
            .out_tx
            .try_send((String::new(), OutboundFrame::Message(Message::new("ping"))));
    }

    /// Sends a message directly on the physical link rather than through a
    /// channel, e.g. the `pong` reply to a `ping` (spec §4.2), which carries
    /// no uuid to address a channel with.
    pub fn send(&self, message: Message) {
        let _ = self.out_tx.try_send((String::new(), OutboundFrame::Message(message)));
    }

    /// Records inbound activity, cancelling any pending keepalive timeout.
    pub fn note_inbound_activity(&self) {
        self.keepalive.read().on_inbound();
    }

    /// True if the keepalive interval has elapsed and a ping should be sent.
    #[must_use]
    pub fn keepalive_due(&self) -> bool {
        self.keepalive.read().ping_due()
    }

    pub fn note_ping_sent(&self) {
        self.keepalive.read().on_ping_sent();
    }

    /// True once the connection should be declared dead (spec §4.2).
    #[must_use]
    pub fn keepalive_expired(&self) -> bool {
        self.keepalive.read().is_dead()
    }

    /// Replaces this connection's keepalive interval/timeout, e.g. tightened
    /// to 15s/5s once a device registers on it (spec §4.9 step 2).
    pub fn tighten_keepalive(&self, interval: Duration, timeout: Duration) {
        *self.keepalive.write() = Keepalive::new(interval, timeout);
    }
}

/// Global registry of virtual channels, addressed by client-generated uuid.
///
/// Subscription handlers and the device manager send through this registry
/// rather than holding connection references directly, so a channel's
/// owning connection can be swapped or torn down transparently.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: DashMap<String, Arc<ChannelHandle>>,
}

impl ChannelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<ChannelHandle>> {
        self.channels.get(id).map(|e| e.value().clone())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<ChannelHandle>> {
        self.channels.remove(id).map(|(_, v)| v)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.channels.len()
    }

    fn insert(&self, handle: Arc<ChannelHandle>) {
        self.channels.insert(handle.id.clone(), handle);
    }
}

/// Registry of physical connections, plus the shared channel registry every
/// connection registers its channels into.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    channels: Arc<ChannelRegistry>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            channels: Arc::new(ChannelRegistry::new()),
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn channels(&self) -> Arc<ChannelRegistry> {
        Arc::clone(&self.channels)
    }

    /// Registers a new physical connection, returning a handle and the
    /// receiver the write loop should drain.
    pub fn register(
        &self,
        config: &ConnectionConfig,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<(String, OutboundFrame)>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity);
        let handle = Arc::new(ConnectionHandle {
            id,
            out_tx: tx,
            channels: DashMap::new(),
            connected_at: Instant::now(),
            binary_mode: AtomicBool::new(false),
            keepalive: RwLock::new(Keepalive::new(config.keepalive_interval, config.idle_timeout)),
        });
        self.connections.insert(id, Arc::clone(&handle));
        (handle, rx)
    }

    /// Creates a new channel bound to `uuid` on `connection`, per
    /// `connection:register` (spec §4.2). Returns `None` if that uuid is
    /// already registered on this connection (invariant: at most one
    /// channel per id).
    #[must_use]
    pub fn register_channel(
        &self,
        connection: &Arc<ConnectionHandle>,
        uuid: &str,
    ) -> Option<Arc<ChannelHandle>> {
        if connection.channels.contains_key(uuid) {
            return None;
        }
        let out_tx = connection_out_tx(connection);
        let handle = Arc::new(ChannelHandle {
            id: uuid.to_string(),
            connection_id: connection.id,
            state: RwLock::new(ChannelState::Connected),
            token: RwLock::new(None),
            out_tx,
        });
        connection.channels.insert(uuid.to_string(), Arc::clone(&handle));
        self.channels.insert(Arc::clone(&handle));
        Some(handle)
    }

    /// Tears down every channel owned by `connection` (transport disconnect
    /// per spec §3 "Connection").
    pub fn teardown(&self, connection: &Arc<ConnectionHandle>) -> Vec<Arc<ChannelHandle>> {
        self.connections.remove(&connection.id);
        let ids: Vec<String> = connection.channels.iter().map(|e| e.key().clone()).collect();
        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, handle)) = connection.channels.remove(&id) {
                handle.set_state(ChannelState::Disconnected);
                self.channels.remove(&id);
                handles.push(handle);
            }
        }
        handles
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Snapshot of every live physical connection, used to fan out a
    /// shutdown close frame without tearing them down individually (the
    /// connection's own read loop does that once the close is observed).
    #[must_use]
    pub fn all_connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.iter().map(|e| Arc::clone(e.value())).collect()
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.count()
    }

    /// Tightens the keepalive of the physical connection owning `channel_id`,
    /// e.g. to 15s/5s once a device registers (spec §4.9 step 2). No-op if
    /// the channel or its connection is no longer known.
    pub fn tighten_keepalive_for_channel(&self, channel_id: &str, interval: Duration, timeout: Duration) {
        let Some(channel) = self.channels.get(channel_id) else { return };
        if let Some(conn) = self.connections.get(&channel.connection_id) {
            conn.tighten_keepalive(interval, timeout);
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn connection_out_tx(connection: &Arc<ConnectionHandle>) -> mpsc::Sender<(String, OutboundFrame)> {
    // ConnectionHandle keeps the only sender clone it was constructed with;
    // cloning it is how every channel shares one physical write queue.
    connection.out_tx.clone()
}

/// Keepalive state machine (spec §4.2): a recurring ping every `interval`,
/// torn down if no inbound message arrives within `timeout` of the most
/// recent ping.
pub struct Keepalive {
    pub interval: Duration,
    pub timeout: Duration,
    last_activity: RwLock<Instant>,
    ping_sent_at: RwLock<Option<Instant>>,
    ping_pending: AtomicBool,
}

impl Keepalive {
    #[must_use]
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            last_activity: RwLock::new(Instant::now()),
            ping_sent_at: RwLock::new(None),
            ping_pending: AtomicBool::new(false),
        }
    }

    /// Any inbound message cancels the pending timeout and restarts the
    /// interval countdown.
    pub fn on_inbound(&self) {
        *self.last_activity.write() = Instant::now();
        *self.ping_sent_at.write() = None;
        self.ping_pending.store(false, Ordering::SeqCst);
    }

    /// Call when a ping is sent; starts the timeout countdown from now.
    pub fn on_ping_sent(&self) {
        *self.ping_sent_at.write() = Some(Instant::now());
        self.ping_pending.store(true, Ordering::SeqCst);
    }

    /// True once `interval` has elapsed since the last inbound message with
    /// no ping already outstanding -- time to send another one.
    #[must_use]
    pub fn ping_due(&self) -> bool {
        !self.ping_pending.load(Ordering::SeqCst) && self.last_activity.read().elapsed() >= self.interval
    }

    /// True once `timeout` has elapsed since a ping was sent with no
    /// subsequent inbound message -- the connection should be declared dead.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.ping_pending.load(Ordering::SeqCst)
            && self
                .ping_sent_at
                .read()
                .is_some_and(|sent| sent.elapsed() >= self.timeout)
    }
}
