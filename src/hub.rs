//! # Broadcast Hub
//!
//! Per-channel fan-out of frames to connected observers.
//!
//! ```text
//!                    ┌─────────────── channel "42" ───────────────┐
//!   publish("42") ──►│ conn#1 queue    conn#3 queue    conn#9 ✗   │
//!                    └────────────────────────────────────────────┘
//!                                                       └─ removed, others
//!                                                          still delivered
//! ```
//!
//! Delivery never waits on a client: each subscriber owns a bounded queue and
//! [`Subscriber::deliver`] is non-blocking. A subscriber that is closed or
//! whose queue is full is removed from every channel and told so through
//! [`Subscriber::evict`]; the rest of the broadcast continues.
//!
//! There is no history. A subscriber sees only frames published after it
//! joined. Ordering is FIFO per channel per subscriber.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::protocol::OutboundFrame;

/// Identifies one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocates a process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Why one delivery failed. Contained inside the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The connection is gone.
    #[error("subscriber closed")]
    Closed,
    /// The subscriber is not keeping up.
    #[error("subscriber queue full")]
    Full,
}

/// A connection that can receive frames.
pub trait Subscriber: Send + Sync {
    /// The connection this subscriber belongs to.
    fn id(&self) -> ConnectionId;

    /// Hands `frame` to the connection without waiting.
    fn deliver(&self, frame: &OutboundFrame) -> Result<(), DeliveryError>;

    /// Called once the hub has removed this subscriber after a failed
    /// delivery.
    fn evict(&self, _reason: DeliveryError) {}
}

/// [`Subscriber`] backed by a bounded mpsc queue drained by the connection's
/// writer task.
#[derive(Debug, Clone)]
pub struct ChannelSubscriber {
    id: ConnectionId,
    tx: mpsc::Sender<OutboundFrame>,
    evicted: CancellationToken,
}

impl ChannelSubscriber {
    /// Creates a subscriber and the receiving end of its queue.
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: ConnectionId::next(),
                tx,
                evicted: CancellationToken::new(),
            },
            rx,
        )
    }

    /// Cancelled when the hub drops this subscriber.
    pub fn eviction(&self) -> CancellationToken {
        self.evicted.clone()
    }
}

impl Subscriber for ChannelSubscriber {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn deliver(&self, frame: &OutboundFrame) -> Result<(), DeliveryError> {
        self.tx.try_send(frame.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    fn evict(&self, _reason: DeliveryError) {
        self.evicted.cancel();
    }
}

type Members = HashMap<ConnectionId, Arc<dyn Subscriber>>;

/// Subscription table plus publish.
#[derive(Default)]
pub struct BroadcastHub {
    channels: RwLock<HashMap<String, Members>>,
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("channels", &self.channel_names())
            .finish()
    }
}

impl BroadcastHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Members>> {
        self.channels
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Members>> {
        self.channels
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Adds `subscriber` to `channel`. Returns false if it was already a member.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>, channel: &str) -> bool {
        let id = subscriber.id();
        let inserted = self
            .write()
            .entry(channel.to_string())
            .or_default()
            .insert(id, subscriber)
            .is_none();
        debug!(connection = %id, channel, "subscribed");
        inserted
    }

    /// Removes a connection from one channel.
    pub fn unsubscribe(&self, id: ConnectionId, channel: &str) -> bool {
        let mut channels = self.write();
        let Some(members) = channels.get_mut(channel) else {
            return false;
        };
        let removed = members.remove(&id).is_some();
        if members.is_empty() {
            channels.remove(channel);
        }
        if removed {
            debug!(connection = %id, channel, "unsubscribed");
        }
        removed
    }

    /// Removes a connection from every channel. Returns how many it left.
    pub fn unsubscribe_all(&self, id: ConnectionId) -> usize {
        let mut channels = self.write();
        let mut left = 0;
        channels.retain(|_, members| {
            if members.remove(&id).is_some() {
                left += 1;
            }
            !members.is_empty()
        });
        debug!(connection = %id, channels = left, "connection left hub");
        left
    }

    /// Delivers `frame` to every current member of `channel`.
    ///
    /// Returns the number of successful deliveries. Failed members are
    /// removed from the hub.
    pub fn publish(&self, channel: &str, frame: &OutboundFrame) -> usize {
        let members: Vec<Arc<dyn Subscriber>> = match self.read().get(channel) {
            Some(members) => members.values().cloned().collect(),
            None => Vec::new(),
        };

        if members.is_empty() {
            warn!(channel, "publish to channel with no subscribers");
            return 0;
        }

        let (delivered, failed) = deliver_all(&members, frame);
        trace!(channel, delivered, "published");
        self.drop_failed(failed);
        delivered
    }

    /// Delivers `frame` to every other member of each channel `from` belongs
    /// to. Each recipient gets the frame once.
    pub fn relay(&self, from: ConnectionId, frame: &OutboundFrame) -> usize {
        let recipients: Vec<Arc<dyn Subscriber>> = {
            let channels = self.read();
            let mut seen = HashSet::new();
            channels
                .values()
                .filter(|members| members.contains_key(&from))
                .flat_map(|members| members.values())
                .filter(|s| s.id() != from && seen.insert(s.id()))
                .cloned()
                .collect()
        };

        let (delivered, failed) = deliver_all(&recipients, frame);
        self.drop_failed(failed);
        delivered
    }

    fn drop_failed(&self, failed: Vec<(Arc<dyn Subscriber>, DeliveryError)>) {
        for (subscriber, error) in failed {
            let id = subscriber.id();
            warn!(connection = %id, %error, "dropping subscriber");
            self.unsubscribe_all(id);
            subscriber.evict(error);
        }
    }

    /// Number of members in `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.read().get(channel).map_or(0, HashMap::len)
    }

    /// Channels `id` currently belongs to.
    pub fn channels_of(&self, id: ConnectionId) -> Vec<String> {
        let mut names: Vec<String> = self
            .read()
            .iter()
            .filter(|(_, members)| members.contains_key(&id))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Names of all non-empty channels.
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }
}

fn deliver_all(
    members: &[Arc<dyn Subscriber>],
    frame: &OutboundFrame,
) -> (usize, Vec<(Arc<dyn Subscriber>, DeliveryError)>) {
    let mut delivered = 0;
    let mut failed = Vec::new();
    for member in members {
        match member.deliver(frame) {
            Ok(()) => delivered += 1,
            Err(e) => failed.push((Arc::clone(member), e)),
        }
    }
    (delivered, failed)
}
