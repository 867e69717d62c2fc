//! Real-time WebSocket connection hub.
//!
//! `beacon-hub` accepts upgraded WebSocket connections, tracks them in a
//! central registry, and routes JSON envelopes between them through
//! channel subscriptions, whole-hub broadcasts, and transient rooms.
//!
//! ```text
//!  HTTP request ──> Upgrader ──> Hub::attach
//!                                   │
//!                        ┌──────────┴──────────┐
//!                   reader task           writer task
//!                        │                     ▲
//!                        ▼                     │ bounded queue
//!                  Hub (registry, channels, rooms)
//! ```
//!
//! The serving layer negotiates the handshake with
//! [`Upgrader::negotiate`](upgrade::Upgrader::negotiate), writes the
//! `101` response, and hands the raw stream to
//! [`Hub::attach`](hub::Hub::attach). From then on the hub owns the
//! connection: a reader task decodes envelopes and drives subscriptions
//! and publishes, a writer task drains the client's bounded outbound
//! queue and sends keepalive pings. Clients that cannot keep up with
//! fan-out are evicted rather than ever blocking a sender.
//!
//! [`Hub::run`](hub::Hub::run) must be spawned once per hub; it
//! serializes registration, unregistration, and whole-hub broadcasts,
//! and periodically sweeps inactive connections.

pub mod client;
pub mod config;
pub mod error;
pub mod hub;
pub mod message;
pub mod pool;
pub mod room;
pub mod stats;
pub mod upgrade;

pub use client::{Client, ClientId, Outbound};
pub use config::{HubConfig, OriginCheck};
pub use error::{CloseCode, HubError, HubResult};
pub use hub::{ConnectionHooks, Hub};
pub use message::{Envelope, Frame, FrameKind};
pub use pool::{HubPools, Pool, Poolable};
pub use room::Room;
pub use stats::{HubCounters, HubStats};
pub use upgrade::{client_identity, Negotiation, Upgrader};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_surface() {
        let config = HubConfig::default();
        let hub = Hub::new(config);
        assert_eq!(hub.client_count(), 0);
        assert!(!hub.is_shutdown());
    }
}
