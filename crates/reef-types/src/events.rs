//! Type-safe event bus for intra-node pub/sub.
//!
//! The [`EventBus`] lets the coordinator and the recovery scheduler publish
//! typed events and lets tests or operators subscribe to specific event types
//! without direct coupling.
//!
//! Each event type is a distinct struct implementing the [`Event`] marker
//! trait. Internally the bus keeps a `HashMap<TypeId, Box<dyn Any>>` whose
//! values are `tokio::sync::broadcast::Sender<E>`, created lazily on the first
//! `subscribe()` for a given type.
//!
//! ```rust
//! use reef_types::events::{EventBus, RecoveryStarted};
//! use reef_types::{CollectionId, CopyId, NodeId, ShardId};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe::<RecoveryStarted>();
//!
//! bus.emit(RecoveryStarted {
//!     collection: CollectionId::new("test"),
//!     copy: CopyId::new(ShardId(0), 1),
//!     target: NodeId::from([1u8; 32]),
//!     source: None,
//! });
//!
//! let event = rx.recv().await.unwrap();
//! assert_eq!(event.target, NodeId::from([1u8; 32]));
//! # });
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::warn;

use crate::{CollectionId, CopyId, NodeId};

/// Marker trait for all events that can travel through the [`EventBus`].
pub trait Event: Any + Send + Sync + Clone + std::fmt::Debug + 'static {}

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// A recovery session began transferring data to its target.
#[derive(Clone, Debug)]
pub struct RecoveryStarted {
    /// Collection the copy belongs to.
    pub collection: CollectionId,
    /// The copy being recovered.
    pub copy: CopyId,
    /// Node receiving the data.
    pub target: NodeId,
    /// Node the data comes from; `None` when built from the durable log.
    pub source: Option<NodeId>,
}
impl Event for RecoveryStarted {}

/// A recovery session promoted its target to STARTED.
#[derive(Clone, Debug)]
pub struct RecoveryCompleted {
    /// Collection the copy belongs to.
    pub collection: CollectionId,
    /// The recovered copy.
    pub copy: CopyId,
    /// Node now serving the copy.
    pub target: NodeId,
    /// Delta transfers needed before the version check matched.
    pub delta_rounds: u32,
}
impl Event for RecoveryCompleted {}

/// A recovery session gave up; its slot is back to UNASSIGNED.
#[derive(Clone, Debug)]
pub struct RecoveryFailed {
    /// Collection the copy belongs to.
    pub collection: CollectionId,
    /// The copy that failed to recover.
    pub copy: CopyId,
    /// Why the session failed.
    pub reason: String,
}
impl Event for RecoveryFailed {}

/// A STARTED replica took over as primary after the primary's node left.
#[derive(Clone, Debug)]
pub struct PrimaryPromoted {
    /// Collection the copy belongs to.
    pub collection: CollectionId,
    /// The promoted copy.
    pub copy: CopyId,
    /// Node hosting the new primary.
    pub node: NodeId,
}
impl Event for PrimaryPromoted {}

/// The aggregate health of a collection changed.
#[derive(Clone, Debug)]
pub struct HealthChanged {
    /// Collection whose status changed.
    pub collection: CollectionId,
    /// Status name (`RED`, `YELLOW`, `GREEN`).
    pub status: String,
}
impl Event for HealthChanged {}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default broadcast channel capacity.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

struct EventBusInner {
    channels: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

/// A type-safe event bus.
///
/// Clonable (`Arc` inside), thread-safe, non-blocking emits. Each event type
/// gets its own `tokio::broadcast` channel.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<EventBusInner>>,
}

impl EventBus {
    /// Create a new empty event bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventBusInner {
                channels: HashMap::new(),
            })),
        }
    }

    /// Emit an event to all current subscribers of type `E`.
    ///
    /// Dropped silently when nobody subscribed to `E`.
    pub fn emit<E: Event>(&self, event: E) {
        let type_id = TypeId::of::<E>();
        let inner = self.inner.lock().expect("event bus lock poisoned");

        if let Some(sender) = inner
            .channels
            .get(&type_id)
            .and_then(|boxed| boxed.downcast_ref::<broadcast::Sender<E>>())
        {
            let _ = sender.send(event);
        }
    }

    /// Subscribe to events of type `E`.
    pub fn subscribe<E: Event>(&self) -> EventReceiver<E> {
        let type_id = TypeId::of::<E>();
        let mut inner = self.inner.lock().expect("event bus lock poisoned");

        let sender = inner
            .channels
            .entry(type_id)
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel::<E>(DEFAULT_CHANNEL_CAPACITY);
                Box::new(tx)
            })
            .downcast_ref::<broadcast::Sender<E>>()
            .expect("type mismatch in event bus");

        EventReceiver {
            rx: sender.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("event bus lock poisoned");
        f.debug_struct("EventBus")
            .field("channel_count", &inner.channels.len())
            .finish()
    }
}

/// Typed receiver for a specific event type.
pub struct EventReceiver<E: Event> {
    rx: broadcast::Receiver<E>,
}

impl<E: Event> EventReceiver<E> {
    /// Wait for the next event, skipping over lagged ones.
    ///
    /// Returns `None` once every bus handle has been dropped.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        skipped = n,
                        event_type = std::any::type_name::<E>(),
                        "event receiver lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Return the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
