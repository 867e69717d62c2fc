//! Per-connection client actor.
//!
//! Each connection owns exactly two tasks for its lifetime: a reader loop
//! that decodes envelopes and drives hub operations, and a writer loop
//! that drains the bounded outbound queue and sends keepalive pings. All
//! other components interact with a client only through its outbound
//! queue or through the hub's maps.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{CloseCode, HubError, HubResult};
use crate::hub::Hub;
use crate::pool::Poolable;

/// A client identifier: either supplied by the client at upgrade time or
/// generated by the hub.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    /// Create an id from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh time-ordered id.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// An item on a client's outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A serialized message envelope.
    Frame(Arc<str>),
    /// A pong reply to a received ping.
    Pong(Vec<u8>),
    /// A close frame; the writer loop exits after sending it.
    Close(CloseCode, String),
}

/// A registered connection.
///
/// The connection halves themselves live inside the reader and writer
/// tasks; this record holds everything the hub needs to address the
/// client. The `channels` and `rooms` sets are written only by the owning
/// reader loop (via the hub) and read by the hub during unregistration,
/// which runs strictly after or independently of the reader.
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    channels: RwLock<HashSet<String>>,
    rooms: RwLock<HashSet<String>>,
    last_activity: Mutex<Instant>,
    metadata: RwLock<HashMap<String, String>>,
    connected_at: Instant,
}

impl Default for Client {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            id: ClientId::default(),
            outbound: Mutex::new(None),
            channels: RwLock::new(HashSet::new()),
            rooms: RwLock::new(HashSet::new()),
            last_activity: Mutex::new(now),
            metadata: RwLock::new(HashMap::new()),
            connected_at: now,
        }
    }
}

impl Client {
    /// Bind a (fresh or recycled) client record to a connection.
    pub(crate) fn bind(&mut self, id: ClientId, outbound: mpsc::Sender<Outbound>) {
        let now = Instant::now();
        self.id = id;
        *self.outbound.lock() = Some(outbound);
        *self.last_activity.lock() = now;
        self.connected_at = now;
    }

    /// The client id.
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// When the connection was registered.
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// How long since the last received frame or pong.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Record activity on the connection.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    #[cfg(test)]
    pub(crate) fn set_last_activity(&self, at: Instant) {
        *self.last_activity.lock() = at;
    }

    /// Push a serialized frame onto the outbound queue without blocking.
    ///
    /// A full queue is a [`HubError::SlowConsumer`]; the caller decides
    /// what to do about the connection. A detached or closed queue is a
    /// [`HubError::ConnectionClosed`].
    pub fn try_push(&self, frame: Arc<str>) -> HubResult<()> {
        self.push_item(Outbound::Frame(frame))
    }

    /// Push a control item onto the outbound queue without blocking.
    pub(crate) fn push_item(&self, item: Outbound) -> HubResult<()> {
        let guard = self.outbound.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(HubError::connection_closed(None, "client is not attached"));
        };
        sender.try_send(item).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => HubError::slow_consumer(self.id.as_str()),
            mpsc::error::TrySendError::Closed(_) => {
                HubError::connection_closed(None, "outbound queue closed")
            }
        })
    }

    /// Drop the outbound sender so the writer loop drains and exits.
    pub(crate) fn close_outbound(&self) {
        self.outbound.lock().take();
    }

    /// Whether the client is bound to a live outbound queue.
    pub fn is_attached(&self) -> bool {
        self.outbound.lock().is_some()
    }

    pub(crate) fn add_channel(&self, channel: &str) -> bool {
        self.channels.write().insert(channel.to_string())
    }

    pub(crate) fn remove_channel(&self, channel: &str) -> bool {
        self.channels.write().remove(channel)
    }

    /// Channels this client is subscribed to.
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.read().iter().cloned().collect()
    }

    pub(crate) fn add_room(&self, room: &str) -> bool {
        self.rooms.write().insert(room.to_string())
    }

    pub(crate) fn remove_room(&self, room: &str) -> bool {
        self.rooms.write().remove(room)
    }

    /// Rooms this client is a member of.
    pub fn room_names(&self) -> Vec<String> {
        self.rooms.read().iter().cloned().collect()
    }

    /// Attach a metadata entry (e.g. an authenticated user id).
    pub fn insert_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.write().insert(key.into(), value.into());
    }

    /// Look up a metadata entry.
    pub fn metadata(&self, key: &str) -> Option<String> {
        self.metadata.read().get(key).cloned()
    }
}

impl Poolable for Client {
    fn reset(&mut self) {
        let now = Instant::now();
        self.id = ClientId::default();
        *self.outbound.lock() = None;
        self.channels.write().clear();
        self.rooms.write().clear();
        *self.last_activity.lock() = now;
        self.metadata.write().clear();
        self.connected_at = now;
    }
}

/// Timing knobs the writer loop needs, copied out of the hub config.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WriterSettings {
    pub ping_interval: Duration,
    pub write_timeout: Duration,
}

/// The writer loop: sole writer of the connection.
///
/// Selects between the outbound queue and a keepalive ticker. After each
/// queue item it drains whatever else is already queued before returning
/// to select, so a burst becomes one write sequence instead of one
/// wakeup per frame. On any write failure it closes the sink and returns;
/// the reader loop's subsequent read error owns the unregistration, so
/// there is a single point of failure detection.
pub(crate) async fn write_loop<S>(
    client: Arc<Client>,
    mut sink: SplitSink<WebSocketStream<S>, tungstenite::Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    settings: WriterSettings,
    mut shutdown: broadcast::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let first_tick = tokio::time::Instant::now() + settings.ping_interval;
    let mut keepalive = tokio::time::interval_at(first_tick, settings.ping_interval);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                let frame = close_message(CloseCode::GoingAway, "server shutting down");
                let _ = write_with_deadline(&mut sink, frame, settings.write_timeout).await;
                break;
            }
            _ = keepalive.tick() => {
                let ping = tungstenite::Message::Ping(Vec::new().into());
                if write_with_deadline(&mut sink, ping, settings.write_timeout).await.is_err() {
                    debug!(client_id = %client.id(), "keepalive write failed, closing writer");
                    break;
                }
            }
            item = outbound.recv() => {
                let Some(item) = item else { break };
                let mut finished = flush_item(&mut sink, item, settings.write_timeout)
                    .await
                    .unwrap_or(true);
                while !finished {
                    match outbound.try_recv() {
                        Ok(next) => {
                            finished = flush_item(&mut sink, next, settings.write_timeout)
                                .await
                                .unwrap_or(true);
                        }
                        Err(_) => break,
                    }
                }
                if finished {
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
    trace!(client_id = %client.id(), "writer loop exited");
}

/// Write one outbound item. Returns `Ok(true)` when the item was a close
/// frame and the loop should end.
async fn flush_item<S>(
    sink: &mut SplitSink<WebSocketStream<S>, tungstenite::Message>,
    item: Outbound,
    deadline: Duration,
) -> HubResult<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (message, is_close) = match item {
        Outbound::Frame(text) => (tungstenite::Message::Text(text.as_ref().into()), false),
        Outbound::Pong(payload) => (tungstenite::Message::Pong(payload.into()), false),
        Outbound::Close(code, reason) => (close_message(code, &reason), true),
    };
    write_with_deadline(sink, message, deadline).await?;
    Ok(is_close)
}

async fn write_with_deadline<S>(
    sink: &mut SplitSink<WebSocketStream<S>, tungstenite::Message>,
    message: tungstenite::Message,
    deadline: Duration,
) -> HubResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(deadline, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(HubError::from(e)),
        Err(_) => Err(HubError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "write deadline exceeded",
        ))),
    }
}

fn close_message(code: CloseCode, reason: &str) -> tungstenite::Message {
    tungstenite::Message::Close(Some(tungstenite::protocol::CloseFrame {
        code: code.as_u16().into(),
        reason: reason.to_string().into(),
    }))
}

/// The reader loop: sole reader of the connection and sole owner of the
/// "client is dead" decision.
///
/// Reads one frame at a time under a deadline of `pong_timeout`, refreshed
/// by every frame and pong. Envelope frames are dispatched into the hub;
/// protocol violations (oversized frames, malformed envelopes) close this
/// connection only. Any exit path requests exactly one unregistration.
pub(crate) async fn read_loop<S>(
    hub: Arc<Hub>,
    client: Arc<Client>,
    mut source: SplitStream<WebSocketStream<S>>,
    mut shutdown: broadcast::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let read_deadline = hub.config().pong_timeout;

    loop {
        let next = tokio::select! {
            _ = shutdown.recv() => break,
            next = tokio::time::timeout(read_deadline, source.next()) => next,
        };

        let message = match next {
            Err(_) => {
                debug!(client_id = %client.id(), "read deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                if matches!(e, tungstenite::Error::Capacity(_)) {
                    warn!(client_id = %client.id(), error = %e, "oversized frame, closing connection");
                    let _ = client.push_item(Outbound::Close(
                        CloseCode::MessageTooBig,
                        "frame exceeds maximum size".to_string(),
                    ));
                } else {
                    debug!(client_id = %client.id(), error = %e, "read error");
                }
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        client.touch();
        match message {
            tungstenite::Message::Text(text) => {
                hub.counters().record_received(text.len());
                if let Err(e) = hub.handle_envelope(&client, text.as_bytes()) {
                    debug!(client_id = %client.id(), error = %e, "dropping connection after bad envelope");
                    let _ = client.push_item(Outbound::Close(
                        CloseCode::Protocol,
                        "malformed message envelope".to_string(),
                    ));
                    break;
                }
            }
            tungstenite::Message::Binary(data) => {
                hub.counters().record_received(data.len());
                if let Err(e) = hub.handle_envelope(&client, &data) {
                    debug!(client_id = %client.id(), error = %e, "dropping connection after bad envelope");
                    let _ = client.push_item(Outbound::Close(
                        CloseCode::Protocol,
                        "malformed message envelope".to_string(),
                    ));
                    break;
                }
            }
            tungstenite::Message::Ping(payload) => {
                let _ = client.push_item(Outbound::Pong(payload.to_vec()));
            }
            tungstenite::Message::Pong(_) => {}
            tungstenite::Message::Close(_) => break,
            tungstenite::Message::Frame(_) => {}
        }
    }

    hub.request_unregister(&client);
    trace!(client_id = %client.id(), "reader loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound_client(capacity: usize) -> (Client, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        let mut client = Client::default();
        client.bind(ClientId::new("c1"), tx);
        (client, rx)
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(ClientId::generate(), ClientId::generate());
    }

    #[tokio::test]
    async fn test_try_push_delivers_in_order() {
        let (client, mut rx) = bound_client(4);
        client.try_push(Arc::from("one")).unwrap();
        client.try_push(Arc::from("two")).unwrap();

        assert_eq!(rx.recv().await, Some(Outbound::Frame(Arc::from("one"))));
        assert_eq!(rx.recv().await, Some(Outbound::Frame(Arc::from("two"))));
    }

    #[tokio::test]
    async fn test_try_push_full_queue_is_slow_consumer() {
        let (client, _rx) = bound_client(1);
        client.try_push(Arc::from("one")).unwrap();

        let err = client.try_push(Arc::from("two")).unwrap_err();
        assert!(matches!(err, HubError::SlowConsumer { .. }));
    }

    #[tokio::test]
    async fn test_try_push_after_receiver_dropped() {
        let (client, rx) = bound_client(4);
        drop(rx);

        let err = client.try_push(Arc::from("one")).unwrap_err();
        assert!(matches!(err, HubError::ConnectionClosed { .. }));
    }

    #[test]
    fn test_try_push_unbound_client() {
        let client = Client::default();
        let err = client.try_push(Arc::from("one")).unwrap_err();
        assert!(matches!(err, HubError::ConnectionClosed { .. }));
    }

    #[tokio::test]
    async fn test_close_outbound_ends_queue() {
        let (client, mut rx) = bound_client(4);
        client.try_push(Arc::from("one")).unwrap();
        client.close_outbound();
        assert!(!client.is_attached());

        // Queued items drain, then the channel reports closed.
        assert_eq!(rx.recv().await, Some(Outbound::Frame(Arc::from("one"))));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_membership_bookkeeping() {
        let (client, _rx) = bound_client(4);
        assert!(client.add_channel("news"));
        assert!(!client.add_channel("news"));
        assert_eq!(client.channel_names(), vec!["news".to_string()]);
        assert!(client.remove_channel("news"));
        assert!(client.channel_names().is_empty());

        assert!(client.add_room("lobby"));
        assert_eq!(client.room_names(), vec!["lobby".to_string()]);
    }

    #[test]
    fn test_metadata() {
        let (client, _rx) = bound_client(4);
        client.insert_metadata("user_id", "u-17");
        assert_eq!(client.metadata("user_id").as_deref(), Some("u-17"));
        assert_eq!(client.metadata("missing"), None);
    }

    #[test]
    fn test_touch_refreshes_activity() {
        let (client, _rx) = bound_client(4);
        client.set_last_activity(Instant::now() - Duration::from_secs(5));
        assert!(client.idle_for() >= Duration::from_secs(5));
        client.touch();
        assert!(client.idle_for() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_reset_zeroes_state() {
        let (mut client, _rx) = bound_client(4);
        client.add_channel("news");
        client.add_room("lobby");
        client.insert_metadata("k", "v");

        client.reset();
        assert_eq!(client.id().as_str(), "");
        assert!(!client.is_attached());
        assert!(client.channel_names().is_empty());
        assert!(client.room_names().is_empty());
        assert_eq!(client.metadata("k"), None);
    }
}
