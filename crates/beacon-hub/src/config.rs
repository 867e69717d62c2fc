//! Hub configuration.
//!
//! A flat configuration record consumed at hub construction time. Every
//! option has a documented default; the owning application's configuration
//! loader is expected to produce this struct.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Predicate applied to the `Origin` header during upgrade. Receives the
/// header value, or an empty string when the header is absent.
pub type OriginCheck = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Configuration for the hub and its connections.
#[derive(Clone)]
pub struct HubConfig {
    /// Frame read buffer size in bytes (default: 128 KiB).
    pub read_buffer_size: usize,
    /// Frame write buffer size in bytes (default: 128 KiB).
    pub write_buffer_size: usize,
    /// How long an upgrade may take before it is rejected (default: 10 s).
    pub handshake_timeout: Duration,
    /// Hard cap on inbound frame size; oversized frames are a fatal
    /// protocol error for that connection (default: 1 MiB).
    pub max_message_size: usize,
    /// Keepalive ping cadence on the writer loop (default: 30 s).
    pub ping_interval: Duration,
    /// Inactivity threshold: the reader deadline, and (doubled) the sweep
    /// cutoff for forced disconnects (default: 60 s).
    pub pong_timeout: Duration,
    /// Per-write deadline on the writer loop (default: 10 s).
    pub write_timeout: Duration,
    /// Capacity of each client's outbound frame queue (default: 256).
    pub outbound_capacity: usize,
    /// How often the hub scans for inactive connections (default: 30 s).
    pub sweep_interval: Duration,
    /// Reserved: whether compression may be advertised during negotiation.
    /// The upgrader currently never offers `Sec-WebSocket-Extensions`, so
    /// this flag has no effect yet (default: false).
    pub compression: bool,
    /// Optional origin-check predicate. When set, upgrades whose origin the
    /// predicate rejects are refused with a 403.
    pub origin_check: Option<OriginCheck>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 128 * 1024,
            write_buffer_size: 128 * 1024,
            handshake_timeout: Duration::from_secs(10),
            max_message_size: 1024 * 1024,
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            outbound_capacity: 256,
            sweep_interval: Duration::from_secs(30),
            compression: false,
            origin_check: None,
        }
    }
}

impl HubConfig {
    /// Create a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the frame read buffer size.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set the frame write buffer size.
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Set the handshake timeout.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the maximum inbound frame size.
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the keepalive ping cadence.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the inactivity threshold.
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }

    /// Set the per-write deadline.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the outbound queue capacity per client.
    pub fn outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    /// Set the inactive-connection sweep interval.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the reserved compression flag.
    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    /// Set the origin-check predicate.
    pub fn origin_check(mut self, check: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.origin_check = Some(Arc::new(check));
        self
    }
}

impl fmt::Debug for HubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubConfig")
            .field("read_buffer_size", &self.read_buffer_size)
            .field("write_buffer_size", &self.write_buffer_size)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("max_message_size", &self.max_message_size)
            .field("ping_interval", &self.ping_interval)
            .field("pong_timeout", &self.pong_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("outbound_capacity", &self.outbound_capacity)
            .field("sweep_interval", &self.sweep_interval)
            .field("compression", &self.compression)
            .field("origin_check", &self.origin_check.is_some())
            .finish()
    }
}
