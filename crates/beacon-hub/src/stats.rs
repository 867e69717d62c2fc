//! Hub throughput counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Atomic counters updated by the hub and the client loops.
#[derive(Debug, Default)]
pub struct HubCounters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_dropped: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl HubCounters {
    /// Create a zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a client registration.
    pub fn record_register(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a client unregistration.
    pub fn record_unregister(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Record a frame delivered onto a client's outbound queue.
    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a frame received from a client.
    pub fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a frame dropped during fan-out.
    pub fn record_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time snapshot.
    pub fn snapshot(&self, channels: usize, rooms: usize) -> HubStats {
        HubStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            channels: channels as u64,
            rooms: rooms as u64,
        }
    }
}

/// A point-in-time snapshot of hub counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Connections ever registered.
    pub total_connections: u64,
    /// Currently registered connections.
    pub active_connections: u64,
    /// Frames pushed onto outbound queues.
    pub messages_sent: u64,
    /// Frames received from clients.
    pub messages_received: u64,
    /// Frames dropped during fan-out.
    pub messages_dropped: u64,
    /// Bytes pushed onto outbound queues.
    pub bytes_sent: u64,
    /// Bytes received from clients.
    pub bytes_received: u64,
    /// Channels with at least one subscriber.
    pub channels: u64,
    /// Rooms with at least one member.
    pub rooms: u64,
}

impl HubStats {
    /// Flatten the snapshot into a counter map.
    pub fn as_map(&self) -> HashMap<&'static str, u64> {
        HashMap::from([
            ("total_connections", self.total_connections),
            ("active_connections", self.active_connections),
            ("messages_sent", self.messages_sent),
            ("messages_received", self.messages_received),
            ("messages_dropped", self.messages_dropped),
            ("bytes_sent", self.bytes_sent),
            ("bytes_received", self.bytes_received),
            ("channels", self.channels),
            ("rooms", self.rooms),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_unregister_balance() {
        let counters = HubCounters::new();
        counters.record_register();
        counters.record_register();
        counters.record_unregister();

        let stats = counters.snapshot(0, 0);
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.active_connections, 1);
    }

    #[test]
    fn test_unregister_never_underflows() {
        let counters = HubCounters::new();
        counters.record_unregister();
        assert_eq!(counters.snapshot(0, 0).active_connections, 0);
    }

    #[test]
    fn test_throughput_counters() {
        let counters = HubCounters::new();
        counters.record_sent(10);
        counters.record_sent(5);
        counters.record_received(7);
        counters.record_dropped();

        let stats = counters.snapshot(2, 1);
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.bytes_sent, 15);
        assert_eq!(stats.messages_received, 1);
        assert_eq!(stats.bytes_received, 7);
        assert_eq!(stats.messages_dropped, 1);
        assert_eq!(stats.channels, 2);
        assert_eq!(stats.rooms, 1);
    }

    #[test]
    fn test_as_map() {
        let counters = HubCounters::new();
        counters.record_register();
        let map = counters.snapshot(0, 0).as_map();
        assert_eq!(map["total_connections"], 1);
        assert_eq!(map["active_connections"], 1);
        assert_eq!(map.len(), 9);
    }
}
