//! The connection hub: registry, channels, rooms, and fan-out.
//!
//! Synchronization is split into two domains:
//!
//! - The client registry is owned by a single event-loop task driven by
//!   [`Hub::run`]. Registration and unregistration are serialized through
//!   an event queue, so connect/disconnect races resolve in arrival order
//!   and membership cleanup never interleaves with registration.
//! - Channel and room membership live under read-write locks and are
//!   mutated directly from the reader tasks. Subscription churn is much
//!   hotter than connection churn and does not need the serialization.
//!
//! Fan-out never blocks on a client: frames are pushed with a
//! non-blocking send onto each client's bounded outbound queue, and a
//! full queue marks the client as a slow consumer to be evicted.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use http::Request;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use crate::client::{read_loop, write_loop, Client, ClientId, Outbound, WriterSettings};
use crate::config::HubConfig;
use crate::error::{CloseCode, HubError, HubResult};
use crate::message::{Envelope, FrameKind};
use crate::pool::HubPools;
use crate::room::Room;
use crate::stats::{HubCounters, HubStats};
use crate::upgrade::{Negotiation, Upgrader};

/// Capacity of the hub's event queue.
const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Events serialized through the hub's event loop.
#[derive(Debug)]
enum HubEvent {
    /// A new connection finished its handshake.
    Register(Arc<Client>),
    /// A connection's reader exited, or the client was marked for eviction.
    Unregister(Arc<Client>),
    /// A pre-rendered frame to deliver to every connected client.
    Broadcast(Arc<str>),
}

/// Lifecycle callbacks invoked from the event loop.
///
/// Hooks run inline on the event-loop task, so they must be cheap and
/// must not block.
#[derive(Clone, Default)]
pub struct ConnectionHooks {
    /// Called after a client is registered.
    pub on_connect: Option<Arc<dyn Fn(&ClientId) + Send + Sync>>,
    /// Called after a client is removed from the registry.
    pub on_disconnect: Option<Arc<dyn Fn(&ClientId) + Send + Sync>>,
}

impl ConnectionHooks {
    /// Create an empty hook set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connect callback.
    pub fn on_connect(mut self, hook: impl Fn(&ClientId) + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(hook));
        self
    }

    /// Set the disconnect callback.
    pub fn on_disconnect(mut self, hook: impl Fn(&ClientId) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(hook));
        self
    }
}

impl std::fmt::Debug for ConnectionHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHooks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .finish()
    }
}

/// The central connection registry and message router.
#[derive(Debug)]
pub struct Hub {
    config: HubConfig,
    upgrader: Upgrader,
    pools: HubPools,
    clients: RwLock<HashMap<ClientId, Arc<Client>>>,
    channels: RwLock<HashMap<String, HashSet<ClientId>>>,
    rooms: RwLock<HashMap<String, Room>>,
    counters: HubCounters,
    hooks: ConnectionHooks,
    events_tx: mpsc::Sender<HubEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<HubEvent>>>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: Mutex<Option<broadcast::Receiver<()>>>,
    is_shutdown: AtomicBool,
}

impl Hub {
    /// Create a hub with the given configuration.
    pub fn new(config: HubConfig) -> Arc<Self> {
        Self::with_hooks(config, ConnectionHooks::default())
    }

    /// Create a hub with lifecycle hooks.
    pub fn with_hooks(config: HubConfig, hooks: ConnectionHooks) -> Arc<Self> {
        Self::with_pools(config, HubPools::new(), hooks)
    }

    /// Create a hub with caller-supplied pools.
    ///
    /// The owner sizes the recycling pools; tests inject fresh ones to
    /// assert isolation.
    pub fn with_pools(config: HubConfig, pools: HubPools, hooks: ConnectionHooks) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        Arc::new(Self {
            upgrader: Upgrader::new(config.clone()),
            config,
            pools,
            clients: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            counters: HubCounters::new(),
            hooks,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown_tx,
            shutdown_rx: Mutex::new(Some(shutdown_rx)),
            is_shutdown: AtomicBool::new(false),
        })
    }

    /// The hub configuration.
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// The hub's throughput counters.
    pub fn counters(&self) -> &HubCounters {
        &self.counters
    }

    /// The upgrader this hub hands handshakes to.
    pub fn upgrader(&self) -> &Upgrader {
        &self.upgrader
    }

    /// Negotiate an HTTP upgrade request on behalf of the serving layer.
    pub fn negotiate_upgrade<B>(&self, request: &Request<B>) -> Negotiation {
        self.upgrader.negotiate(request)
    }

    /// Run the hub's event loop until shutdown.
    ///
    /// Must be spawned exactly once; a second call returns immediately.
    /// Owns all writes to the client registry and the periodic sweep of
    /// inactive connections. On exit every remaining client is drained.
    pub async fn run(self: Arc<Self>) {
        let Some(mut events) = self.events_rx.lock().take() else {
            warn!("hub event loop started twice, ignoring");
            return;
        };
        // The receiver has been held since construction, so a shutdown
        // signaled before the loop first polls is buffered, not lost.
        let mut shutdown = self
            .shutdown_rx
            .lock()
            .take()
            .unwrap_or_else(|| self.shutdown_tx.subscribe());
        let sweeper = tokio::spawn({
            let hub = Arc::clone(&self);
            async move { hub.sweep_loop().await }
        });
        info!("hub event loop started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        HubEvent::Register(client) => self.finish_register(client),
                        HubEvent::Unregister(client) => self.finish_unregister(&client),
                        HubEvent::Broadcast(text) => self.fan_out_all(&text),
                    }
                }
            }
        }

        sweeper.abort();
        let drained = self.drain();
        info!(drained, "hub event loop stopped");
    }

    /// Validate an upgrade request and take ownership of its stream.
    ///
    /// For serving layers that write the `101` response themselves after
    /// calling [`Hub::negotiate_upgrade`]. The client identity is taken
    /// from the request (header, then query parameter) or generated.
    pub async fn serve<B, S>(self: &Arc<Self>, request: &Request<B>, stream: S) -> HubResult<ClientId>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.upgrader.validate(request)?;
        let id = crate::upgrade::client_identity(request);
        self.attach(stream, id).await
    }

    /// Take ownership of an upgraded connection.
    ///
    /// Wraps the raw stream as a server-side WebSocket, spawns the reader
    /// and writer tasks, and queues the registration. The `101` response
    /// must already have been written to the peer. When `id` is `None` a
    /// fresh id is generated.
    pub async fn attach<S>(self: &Arc<Self>, stream: S, id: Option<ClientId>) -> HubResult<ClientId>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.is_shutdown.load(Ordering::SeqCst) {
            return Err(HubError::connection_closed(None, "hub is shut down"));
        }

        let socket = tokio::time::timeout(
            self.config.handshake_timeout,
            self.upgrader.complete(stream),
        )
        .await
        .map_err(|_| HubError::upgrade_rejected("handshake timed out"))?;

        use futures_util::StreamExt;
        let (sink, source) = socket.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_capacity);

        let id = id.unwrap_or_else(ClientId::generate);
        let mut record = self.pools.clients.acquire();
        record.bind(id.clone(), outbound_tx);
        let client = Arc::new(record);

        let settings = WriterSettings {
            ping_interval: self.config.ping_interval,
            write_timeout: self.config.write_timeout,
        };
        tokio::spawn(write_loop(
            Arc::clone(&client),
            sink,
            outbound_rx,
            settings,
            self.shutdown_tx.subscribe(),
        ));
        tokio::spawn(read_loop(
            Arc::clone(self),
            Arc::clone(&client),
            source,
            self.shutdown_tx.subscribe(),
        ));

        self.events_tx
            .send(HubEvent::Register(client))
            .await
            .map_err(|_| HubError::connection_closed(None, "hub event loop stopped"))?;
        Ok(id)
    }

    /// Dispatch one inbound envelope from a client.
    ///
    /// Called by the reader loop for every text or binary frame. A parse
    /// failure or a missing required field is a protocol error and the
    /// caller closes the connection; unrecognized kinds are ignored.
    pub fn handle_envelope(&self, client: &Arc<Client>, raw: &[u8]) -> HubResult<()> {
        let Envelope {
            kind,
            channel,
            data,
        } = Envelope::parse(raw)?;

        match kind {
            FrameKind::Subscribe => {
                let channel = required_channel(kind, channel)?;
                self.subscribe(client, &channel);
            }
            FrameKind::Unsubscribe => {
                let channel = required_channel(kind, channel)?;
                self.unsubscribe(client, &channel);
            }
            FrameKind::Publish => {
                let channel = required_channel(kind, channel)?;
                self.publish_from(Some(client.id()), &channel, data)?;
            }
            FrameKind::Broadcast => {
                if let Err(e) = self.broadcast_from(Some(client.id()), data) {
                    warn!(client_id = %client.id(), error = %e, "broadcast not queued");
                }
            }
            FrameKind::JoinRoom => {
                let room = required_channel(kind, channel)?;
                self.join_room(client, &room);
            }
            FrameKind::LeaveRoom => {
                let room = required_channel(kind, channel)?;
                self.leave_room(client, &room);
            }
            FrameKind::Data | FrameKind::Unknown => {
                trace!(client_id = %client.id(), ?kind, "ignoring frame");
            }
        }
        Ok(())
    }

    /// Subscribe a client to a channel. Idempotent; returns `true` when
    /// the subscription is new.
    ///
    /// A retired client's reader may keep processing frames until its
    /// socket dies; its subscriptions are ignored (`retire` closes the
    /// outbound queue before detaching memberships, so a detached caller
    /// can no longer plant entries the replacement never cleans up).
    pub fn subscribe(&self, client: &Client, channel: &str) -> bool {
        if !client.is_attached() {
            debug!(client_id = %client.id(), channel, "ignoring subscribe from retired connection");
            return false;
        }
        let newly = self
            .channels
            .write()
            .entry(channel.to_string())
            .or_default()
            .insert(client.id().clone());
        client.add_channel(channel);
        if newly {
            debug!(client_id = %client.id(), channel, "subscribed");
        }
        newly
    }

    /// Remove a client from a channel. Channels with no remaining
    /// subscribers are dropped from the registry.
    pub fn unsubscribe(&self, client: &Client, channel: &str) -> bool {
        let removed = {
            let mut channels = self.channels.write();
            let Some(subscribers) = channels.get_mut(channel) else {
                return false;
            };
            let removed = subscribers.remove(client.id());
            if subscribers.is_empty() {
                channels.remove(channel);
            }
            removed
        };
        client.remove_channel(channel);
        removed
    }

    /// Add a client to a room, creating the room on first join. Joins
    /// from a retired connection are ignored, as in [`Hub::subscribe`].
    pub fn join_room(&self, client: &Client, room_id: &str) -> bool {
        if !client.is_attached() {
            debug!(client_id = %client.id(), room = room_id, "ignoring join from retired connection");
            return false;
        }
        let newly = {
            let mut rooms = self.rooms.write();
            let room = rooms.entry(room_id.to_string()).or_insert_with(|| {
                let mut room = self.pools.rooms.acquire();
                room.open(room_id);
                room
            });
            room.join(client.id().clone())
        };
        client.add_room(room_id);
        if newly {
            debug!(client_id = %client.id(), room = room_id, "joined room");
        }
        newly
    }

    /// Remove a client from a room. The room is destroyed (and recycled)
    /// the moment its last member leaves.
    pub fn leave_room(&self, client: &Client, room_id: &str) -> bool {
        let removed = {
            let mut rooms = self.rooms.write();
            let Some(room) = rooms.get_mut(room_id) else {
                return false;
            };
            let removed = room.leave(client.id());
            if room.is_empty() {
                if let Some(room) = rooms.remove(room_id) {
                    self.pools.rooms.release(room);
                }
            }
            removed
        };
        client.remove_room(room_id);
        removed
    }

    /// Fan a payload out to a channel's subscribers.
    ///
    /// Returns the number of clients the frame was queued for. A channel
    /// with no subscribers is a silent no-op (`Ok(0)`), not an error.
    pub fn publish(&self, channel: &str, payload: Value) -> HubResult<usize> {
        self.publish_from(None, channel, payload)
    }

    pub(crate) fn publish_from(
        &self,
        origin: Option<&ClientId>,
        channel: &str,
        payload: Value,
    ) -> HubResult<usize> {
        let targets: Vec<Arc<Client>> = {
            let channels = self.channels.read();
            let Some(subscribers) = channels.get(channel) else {
                return Ok(0);
            };
            let clients = self.clients.read();
            subscribers
                .iter()
                .filter_map(|id| clients.get(id).cloned())
                .collect()
        };
        if targets.is_empty() {
            return Ok(0);
        }

        let text = self.render_frame(FrameKind::Data, Some(channel), payload, origin)?;
        let mut delivered = 0;
        for client in &targets {
            if self.push_frame(client, &text).is_ok() {
                delivered += 1;
            }
        }
        trace!(channel, delivered, "published");
        Ok(delivered)
    }

    /// Serialize any payload and fan it out to a channel's subscribers.
    pub fn publish_json<T: serde::Serialize>(&self, channel: &str, payload: &T) -> HubResult<usize> {
        let value = serde_json::to_value(payload).map_err(|e| HubError::encode(e.to_string()))?;
        self.publish(channel, value)
    }

    /// Serialize any payload and queue it for delivery to every client.
    pub fn broadcast_json<T: serde::Serialize>(&self, payload: &T) -> HubResult<()> {
        let value = serde_json::to_value(payload).map_err(|e| HubError::encode(e.to_string()))?;
        self.broadcast(value)
    }

    /// Queue a frame for delivery to every connected client.
    ///
    /// The frame is rendered once and handed to the event loop, so the
    /// fan-out is ordered with respect to registrations.
    pub fn broadcast(&self, payload: Value) -> HubResult<()> {
        self.broadcast_from(None, payload)
    }

    pub(crate) fn broadcast_from(
        &self,
        origin: Option<&ClientId>,
        payload: Value,
    ) -> HubResult<()> {
        let text = self.render_frame(FrameKind::Data, None, payload, origin)?;
        self.events_tx
            .try_send(HubEvent::Broadcast(text))
            .map_err(|_| HubError::connection_closed(None, "hub event queue unavailable"))
    }

    /// Send a payload to one client. An unregistered target is a
    /// [`HubError::UnknownTarget`].
    pub fn send_to_client(&self, target: &ClientId, payload: Value) -> HubResult<()> {
        let Some(client) = self.clients.read().get(target).cloned() else {
            return Err(HubError::unknown_target(target.as_str()));
        };
        let text = self.render_frame(FrameKind::Data, None, payload, None)?;
        self.push_frame(&client, &text)
    }

    /// Fan a payload out to a room's members. A missing room is a
    /// [`HubError::UnknownTarget`].
    pub fn broadcast_to_room(&self, room_id: &str, payload: Value) -> HubResult<usize> {
        self.room_broadcast_from(None, room_id, payload)
    }

    pub(crate) fn room_broadcast_from(
        &self,
        origin: Option<&ClientId>,
        room_id: &str,
        payload: Value,
    ) -> HubResult<usize> {
        let targets: Vec<Arc<Client>> = {
            let rooms = self.rooms.read();
            let Some(room) = rooms.get(room_id) else {
                return Err(HubError::unknown_target(room_id));
            };
            let clients = self.clients.read();
            room.members()
                .filter_map(|id| clients.get(id).cloned())
                .collect()
        };

        let text = self.render_frame(FrameKind::Data, Some(room_id), payload, origin)?;
        let mut delivered = 0;
        for client in &targets {
            if self.push_frame(client, &text).is_ok() {
                delivered += 1;
            }
        }
        trace!(room = room_id, delivered, "room broadcast");
        Ok(delivered)
    }

    /// Force-unregister connections idle longer than twice the pong
    /// timeout. Returns the number of evictions requested.
    pub fn sweep(&self) -> usize {
        let cutoff = self.config.pong_timeout * 2;
        let stale: Vec<Arc<Client>> = self
            .clients
            .read()
            .values()
            .filter(|client| client.idle_for() > cutoff)
            .cloned()
            .collect();
        for client in &stale {
            debug!(client_id = %client.id(), "sweeping inactive connection");
            self.request_unregister(client);
        }
        stale.len()
    }

    /// Begin shutdown: stop accepting connections and signal every
    /// reader, writer, and the event loop. Returns the number of tasks
    /// notified. Idempotent.
    pub fn shutdown(&self) -> usize {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            return 0;
        }
        info!("hub shutting down");
        self.shutdown_tx.send(()).unwrap_or(0)
    }

    /// Whether [`Hub::shutdown`] has been called.
    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    /// A point-in-time snapshot of hub statistics.
    pub fn stats(&self) -> HubStats {
        let channels = self.channels.read().len();
        let rooms = self.rooms.read().len();
        self.counters.snapshot(channels, rooms)
    }

    /// Number of registered clients.
    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Look up a registered client.
    pub fn client(&self, id: &ClientId) -> Option<Arc<Client>> {
        self.clients.read().get(id).cloned()
    }

    /// Queue an unregistration for the event loop. Best effort: if the
    /// queue is full the sweep or the reader's exit will retry the same
    /// eviction later.
    pub(crate) fn request_unregister(&self, client: &Arc<Client>) {
        let _ = self
            .events_tx
            .try_send(HubEvent::Unregister(Arc::clone(client)));
    }

    /// Event-loop half of registration. A second connection under an
    /// already-registered id evicts the first.
    fn finish_register(&self, client: Arc<Client>) {
        let previous = self
            .clients
            .write()
            .insert(client.id().clone(), Arc::clone(&client));
        if let Some(previous) = previous {
            debug!(client_id = %previous.id(), "evicting superseded connection");
            self.retire(previous, CloseCode::PolicyViolation, "client id reconnected");
        }

        self.counters.record_register();
        debug!(client_id = %client.id(), "client registered");
        if let Some(hook) = &self.hooks.on_connect {
            hook(client.id());
        }
    }

    /// Event-loop half of unregistration. Stale requests for an id that
    /// has since been re-registered by a different connection are ignored.
    fn finish_unregister(&self, client: &Arc<Client>) {
        let removed = {
            let mut clients = self.clients.write();
            match clients.get(client.id()) {
                Some(current) if Arc::ptr_eq(current, client) => {
                    clients.remove(client.id());
                    true
                }
                _ => false,
            }
        };
        if !removed {
            return;
        }
        debug!(client_id = %client.id(), "client unregistered");
        self.retire(Arc::clone(client), CloseCode::Normal, "connection closed");
    }

    /// Close a client's outbound queue, detach it from every channel and
    /// room, and recycle the record. The caller has already removed it
    /// from the registry. The queue is closed before memberships are
    /// detached so that new subscriptions from the retired connection are
    /// rejected before the cleanup pass runs.
    fn retire(&self, client: Arc<Client>, code: CloseCode, reason: &str) {
        let _ = client.push_item(Outbound::Close(code, reason.to_string()));
        client.close_outbound();
        self.detach_memberships(&client);
        self.counters.record_unregister();
        if let Some(hook) = &self.hooks.on_disconnect {
            hook(client.id());
        }
        self.pools.clients.release_shared(client);
    }

    fn detach_memberships(&self, client: &Client) {
        let subscribed = client.channel_names();
        if !subscribed.is_empty() {
            let mut channels = self.channels.write();
            for channel in subscribed {
                if let Some(subscribers) = channels.get_mut(&channel) {
                    subscribers.remove(client.id());
                    if subscribers.is_empty() {
                        channels.remove(&channel);
                    }
                }
            }
        }

        let joined = client.room_names();
        if !joined.is_empty() {
            let mut rooms = self.rooms.write();
            for room_id in joined {
                if let Some(room) = rooms.get_mut(&room_id) {
                    room.leave(client.id());
                    if room.is_empty() {
                        if let Some(room) = rooms.remove(&room_id) {
                            self.pools.rooms.release(room);
                        }
                    }
                }
            }
        }
    }

    /// Deliver a pre-rendered frame to every registered client.
    fn fan_out_all(&self, text: &Arc<str>) {
        let targets: Vec<Arc<Client>> = self.clients.read().values().cloned().collect();
        for client in &targets {
            let _ = self.push_frame(client, text);
        }
        trace!(targets = targets.len(), "broadcast fan-out");
    }

    /// Push a rendered frame onto one client's outbound queue.
    ///
    /// A full queue drops the frame and requests the client's eviction.
    fn push_frame(&self, client: &Arc<Client>, text: &Arc<str>) -> HubResult<()> {
        match client.try_push(Arc::clone(text)) {
            Ok(()) => {
                self.counters.record_sent(text.len());
                Ok(())
            }
            Err(e @ HubError::SlowConsumer { .. }) => {
                self.counters.record_dropped();
                warn!(client_id = %client.id(), "outbound queue full, evicting slow consumer");
                self.request_unregister(client);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Render an outbound frame once, through the message pool.
    fn render_frame(
        &self,
        kind: FrameKind,
        channel: Option<&str>,
        payload: Value,
        origin: Option<&ClientId>,
    ) -> HubResult<Arc<str>> {
        let mut frame = self.pools.messages.acquire();
        frame.kind = kind;
        frame.channel = channel.map(str::to_string);
        frame.payload = payload;
        frame.origin = origin.map(|id| id.as_str().to_string());
        frame.stamp();
        let rendered = frame.to_wire();
        self.pools.messages.release(frame);
        Ok(Arc::from(rendered?))
    }

    async fn sweep_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let swept = self.sweep();
            if swept > 0 {
                debug!(swept, "sweep requested evictions");
            }
        }
    }

    /// Drop every remaining client at event-loop exit.
    fn drain(&self) -> usize {
        let remaining: Vec<Arc<Client>> = {
            let mut clients = self.clients.write();
            clients.drain().map(|(_, client)| client).collect()
        };
        let count = remaining.len();
        for client in remaining {
            self.retire(client, CloseCode::GoingAway, "server shutting down");
        }
        self.channels.write().clear();
        for (_, room) in self.rooms.write().drain() {
            self.pools.rooms.release(room);
        }
        count
    }
}

fn required_channel(kind: FrameKind, channel: Option<String>) -> HubResult<String> {
    channel.ok_or_else(|| HubError::protocol(format!("{kind:?} frame requires a channel")))
}
