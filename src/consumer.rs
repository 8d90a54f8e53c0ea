//! Downstream consumers and the broadcast group.
//!
//! A [`Consumer`] is one downstream network channel. The scheduler never
//! talks to sockets directly; it checks writability across the whole
//! [`ConsumerGroup`] and broadcasts one shared buffer to every member.
//!
//! Group membership drives the session lifecycle, so [`add`](ConsumerGroup::add)
//! and [`remove`](ConsumerGroup::remove) report the empty-transition under
//! the same lock that mutates membership — the scheduler never misses or
//! doubles a start/stop transition.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

static CONSUMER_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Allocate a process-unique consumer id.
pub fn next_consumer_id() -> u64 {
    CONSUMER_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// One downstream delivery channel.
///
/// `send` must never block the caller: implementations queue the frame and
/// report a full queue through [`is_writable`](Self::is_writable) instead.
/// A consumer that stops keeping up is throttled (the whole group slows
/// down), never disconnected by the scheduler.
pub trait Consumer: Send + Sync {
    /// Process-unique identifier, used for detach.
    fn id(&self) -> u64;

    /// Whether the underlying channel is still open.
    fn is_open(&self) -> bool;

    /// Whether the bounded send buffer has room for another frame.
    fn is_writable(&self) -> bool;

    /// Queue one encoded frame for delivery. The `Arc` is this consumer's
    /// reference to the shared broadcast buffer.
    fn send(&self, frame: Arc<Vec<u8>>);

    /// Close the underlying channel.
    fn close(&self);
}

/// Thread-safe registry of the consumers attached to one streaming session.
///
/// Mutated from connection threads (attach/detach) and read from the
/// scheduler's tick thread; a single mutex keeps membership checks atomic
/// with add/remove.
#[derive(Clone, Default)]
pub struct ConsumerGroup {
    members: Arc<Mutex<Vec<Arc<dyn Consumer>>>>,
}

impl ConsumerGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a consumer. Returns whether the group was empty before the add
    /// (i.e. this consumer triggers the start transition).
    pub fn add(&self, consumer: Arc<dyn Consumer>) -> bool {
        let mut members = self.members.lock();
        let was_empty = members.is_empty();
        if !members.iter().any(|c| c.id() == consumer.id()) {
            tracing::debug!(consumer_id = consumer.id(), "consumer attached");
            members.push(consumer);
        }
        was_empty
    }

    /// Remove a consumer by id. Returns `(removed, now_empty)`; the stop
    /// transition fires only when a real removal emptied the group, so a
    /// duplicate detach can never stop a fresh session.
    pub fn remove(&self, id: u64) -> (bool, bool) {
        let mut members = self.members.lock();
        let before = members.len();
        members.retain(|c| c.id() != id);
        let removed = members.len() < before;
        if removed {
            tracing::debug!(consumer_id = id, remaining = members.len(), "consumer detached");
        }
        (removed, removed && members.is_empty())
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }

    /// Whether every member can accept another frame.
    ///
    /// A closed member counts as not writable; it stays throttling the
    /// group until its owner detaches it.
    pub fn all_writable(&self) -> bool {
        self.members
            .lock()
            .iter()
            .all(|c| c.is_open() && c.is_writable())
    }

    /// Broadcast one shared frame to every open member, in registration
    /// order. Each member receives its own `Arc` reference; no member is
    /// written ahead of another within a frame.
    pub fn broadcast(&self, frame: &Arc<Vec<u8>>) {
        for consumer in self.members.lock().iter() {
            if consumer.is_open() {
                consumer.send(frame.clone());
            }
        }
    }

    /// Close every member's channel and clear the registry.
    pub fn close_all(&self) {
        let drained: Vec<_> = std::mem::take(&mut *self.members.lock());
        for consumer in &drained {
            consumer.close();
        }
        if !drained.is_empty() {
            tracing::debug!(closed = drained.len(), "consumer group closed");
        }
    }
}
