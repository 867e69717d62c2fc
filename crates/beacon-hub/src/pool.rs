//! Reusable-object pools.
//!
//! Message, client, and room objects are recycled rather than freshly
//! allocated per connection or per dispatch, which keeps allocation churn
//! flat under high connection turnover. Pooling is a throughput
//! optimization only: an implementation that allocated directly would
//! behave identically.
//!
//! Pools are explicit instances owned by the hub (see [`HubPools`]), not
//! process-wide singletons, so tests can inject fresh ones and assert
//! isolation.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::Client;
use crate::message::Frame;
use crate::room::Room;

/// An object that can live in a [`Pool`].
///
/// `reset` must return every field to its zero value so that no data from
/// a previous use can leak into the next acquirer.
pub trait Poolable: Default + Send {
    /// Clear the object back to its zero value.
    fn reset(&mut self);
}

/// A bounded free-list of reusable objects.
pub struct Pool<T: Poolable> {
    idle: Mutex<Vec<T>>,
    max_idle: usize,
}

impl<T: Poolable> Pool<T> {
    /// Create a pool retaining at most `max_idle` released objects.
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Take an object from the pool, allocating a fresh one when empty.
    pub fn acquire(&self) -> T {
        self.idle.lock().pop().unwrap_or_default()
    }

    /// Reset an object and return it to the pool. Objects beyond the idle
    /// cap are dropped instead of retained.
    pub fn release(&self, mut value: T) {
        value.reset();
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(value);
        }
    }

    /// Return a shared object to the pool.
    ///
    /// Recycles only when the caller held the last reference; while other
    /// tasks still hold the `Arc` the object is simply dropped with them,
    /// which keeps the no-retained-reference invariant trivially true.
    pub fn release_shared(&self, value: Arc<T>) {
        if let Ok(inner) = Arc::try_unwrap(value) {
            self.release(inner);
        }
    }

    /// Number of idle objects currently retained.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }
}

impl<T: Poolable> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("idle", &self.idle())
            .field("max_idle", &self.max_idle)
            .finish()
    }
}

/// The pool set a hub owns: one pool per recycled type.
#[derive(Debug)]
pub struct HubPools {
    /// Pool of outbound message envelopes.
    pub messages: Pool<Frame>,
    /// Pool of per-connection client records.
    pub clients: Pool<Client>,
    /// Pool of room records.
    pub rooms: Pool<Room>,
}

impl HubPools {
    /// Create a pool set with the default idle caps.
    pub fn new() -> Self {
        Self::with_capacity(1024, 256, 64)
    }

    /// Create a pool set with explicit idle caps.
    pub fn with_capacity(messages: usize, clients: usize, rooms: usize) -> Self {
        Self {
            messages: Pool::new(messages),
            clients: Pool::new(clients),
            rooms: Pool::new(rooms),
        }
    }
}

impl Default for HubPools {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::FrameKind;
    use serde_json::json;

    #[test]
    fn test_acquire_from_empty_pool_allocates() {
        let pool: Pool<Frame> = Pool::new(8);
        assert_eq!(pool.idle(), 0);
        let frame = pool.acquire();
        assert_eq!(frame, Frame::default());
    }

    #[test]
    fn test_release_then_acquire_yields_zeroed_object() {
        let pool: Pool<Frame> = Pool::new(8);

        let mut frame = pool.acquire();
        frame.kind = FrameKind::Publish;
        frame.channel = Some("news".to_string());
        frame.payload = json!({"headline": "x"});
        frame.origin = Some("c1".to_string());
        frame.stamp();
        pool.release(frame);
        assert_eq!(pool.idle(), 1);

        let recycled = pool.acquire();
        assert_eq!(recycled, Frame::default());
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_idle_cap_drops_overflow() {
        let pool: Pool<Frame> = Pool::new(2);
        for _ in 0..5 {
            pool.release(Frame::default());
        }
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_release_shared_recycles_last_reference() {
        let pool: Pool<Frame> = Pool::new(8);
        let frame = Arc::new(pool.acquire());
        pool.release_shared(frame);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_release_shared_skips_live_references() {
        let pool: Pool<Frame> = Pool::new(8);
        let frame = Arc::new(pool.acquire());
        let held = Arc::clone(&frame);
        pool.release_shared(frame);
        assert_eq!(pool.idle(), 0);
        drop(held);
    }

    #[test]
    fn test_pools_are_isolated_instances() {
        let a = HubPools::new();
        let b = HubPools::new();
        a.messages.release(Frame::default());
        assert_eq!(a.messages.idle(), 1);
        assert_eq!(b.messages.idle(), 0);
    }
}
