//! Type-safe event bus for repair notifications.
//!
//! The [`EventBus`] lets the steppers, the algorithms and the coordinator
//! announce what they did without knowing who is listening (monitoring,
//! tests, an operator console).
//!
//! Each event type is a distinct struct implementing the [`Event`] marker
//! trait. Internally the bus keeps one lazily created
//! `tokio::sync::broadcast` channel per event type.
//!
//! ```rust
//! use tide_types::events::{ClusterTaskDone, EventBus};
//! use tide_types::{DiskMask, TaskLabel, Topology};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe::<ClusterTaskDone>();
//!
//! bus.emit(ClusterTaskDone {
//!     task: TaskLabel::RecoverLostFrags,
//!     mask: DiskMask::full(Topology::new(3, 1)),
//! });
//!
//! let event = rx.recv().await.unwrap();
//! assert_eq!(event.task, TaskLabel::RecoverLostFrags);
//! # });
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::warn;

use crate::{DiskId, DiskMask, FragmentRef, TaskLabel};

/// Marker trait for everything that can travel through the [`EventBus`].
pub trait Event: Any + Send + Sync + Clone + std::fmt::Debug + 'static {}

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// A stepper finished one full cycle over its steps.
#[derive(Clone, Debug)]
pub struct CycleCompleted {
    /// The task that cycled.
    pub task: TaskLabel,
    /// The disk it runs on.
    pub disk: DiskId,
    /// Cycles completed by this stepper so far.
    pub cycles: u64,
    /// Faults counted during the cycle.
    pub faults: u64,
}

impl Event for CycleCompleted {}

/// Every online disk of the cell reported a task done.
#[derive(Clone, Debug)]
pub struct ClusterTaskDone {
    /// The converged task.
    pub task: TaskLabel,
    /// Disk mask in effect when convergence was observed.
    pub mask: DiskMask,
}

impl Event for ClusterTaskDone {}

/// The published failure-tolerance flag flipped.
#[derive(Clone, Debug)]
pub struct ToleranceChanged {
    /// New published value.
    pub tolerant: bool,
    /// Unhealed disk failures at the time of the change.
    pub unhealed: usize,
    /// Unhealed failures collapsed by node.
    pub unique_nodes: usize,
}

impl Event for ToleranceChanged {}

/// Where a recovered fragment came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepairSource {
    /// Copied from the healed-row holder.
    HealedRow,
    /// Copied from the pre-expansion holder.
    PreExpansion,
    /// Rebuilt by the erasure-coding engine.
    Reconstructed,
}

/// A missing fragment was written to its layout disk.
#[derive(Clone, Debug)]
pub struct FragmentRepaired {
    /// The fragment.
    pub fragment: FragmentRef,
    /// The disk it was written to.
    pub disk: DiskId,
    /// How it was obtained.
    pub source: RepairSource,
}

impl Event for FragmentRepaired {}

/// Why a fragment was removed from a disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscardReason {
    /// The layout places it elsewhere and the rightful holder has it.
    Duplicate,
    /// Leftover of a store that never completed, or a stale temp copy.
    Temp,
    /// Checksum verification failed.
    Corrupt,
}

/// A fragment was deleted by a repair algorithm.
#[derive(Clone, Debug)]
pub struct FragmentDiscarded {
    /// The fragment.
    pub fragment: FragmentRef,
    /// The disk it was removed from.
    pub disk: DiskId,
    /// Why it was removed.
    pub reason: DiscardReason,
}

impl Event for FragmentDiscarded {}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

struct EventBusInner {
    channels: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

/// A type-safe event bus for intra-node notifications.
///
/// Clonable (`Arc` inside), thread-safe, non-blocking emits.
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
        let inner = self.inner.lock().expect("event bus lock poisoned");
        if let Some(sender) = inner
            .channels
            .get(&TypeId::of::<E>())
            .and_then(|boxed| boxed.downcast_ref::<broadcast::Sender<E>>())
        {
            let _ = sender.send(event);
        }
    }

    /// Subscribe to events of type `E`, creating the channel if needed.
    pub fn subscribe<E: Event>(&self) -> EventReceiver<E> {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        let sender = inner
            .channels
            .entry(TypeId::of::<E>())
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

/// Typed receiver for one event type.
pub struct EventReceiver<E: Event> {
    rx: broadcast::Receiver<E>,
}

impl<E: Event> EventReceiver<E> {
    /// Wait for the next event; `None` once the bus is gone.
    ///
    /// Lagged events are skipped with a warning.
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

    /// Return an already-buffered event without waiting.
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ObjectIdentifier, ObjectKind, Topology};

    fn fragment() -> FragmentRef {
        FragmentRef::new(ObjectIdentifier::new(1, ObjectKind::Data, 0, 0, 8), 2)
    }

    #[tokio::test]
    async fn test_emit_subscribe_basic() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe::<CycleCompleted>();

        bus.emit(CycleCompleted {
            task: TaskLabel::ScanFrags,
            disk: DiskId::new(0, 1),
            cycles: 3,
            faults: 0,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.task, TaskLabel::ScanFrags);
        assert_eq!(event.disk, DiskId::new(0, 1));
        assert_eq!(event.cycles, 3);
    }

    #[tokio::test]
    async fn test_event_types_are_independent() {
        let bus = EventBus::new();
        let mut repaired = bus.subscribe::<FragmentRepaired>();
        let mut discarded = bus.subscribe::<FragmentDiscarded>();

        bus.emit(FragmentDiscarded {
            fragment: fragment(),
            disk: DiskId::new(1, 0),
            reason: DiscardReason::Corrupt,
        });

        assert!(repaired.try_recv().is_none());
        let event = discarded.recv().await.unwrap();
        assert_eq!(event.reason, DiscardReason::Corrupt);
    }

    #[tokio::test]
    async fn test_subscribe_after_emit_misses_past() {
        let bus = EventBus::new();
        bus.emit(ToleranceChanged {
            tolerant: false,
            unhealed: 3,
            unique_nodes: 3,
        });

        let mut rx = bus.subscribe::<ToleranceChanged>();
        bus.emit(ToleranceChanged {
            tolerant: true,
            unhealed: 0,
            unique_nodes: 0,
        });

        let event = rx.recv().await.unwrap();
        assert!(event.tolerant);
    }

    #[tokio::test]
    async fn test_clone_shares_channels() {
        let bus = EventBus::new();
        let other = bus.clone();
        let mut rx = bus.subscribe::<ClusterTaskDone>();

        other.emit(ClusterTaskDone {
            task: TaskLabel::RemoveDupFrags,
            mask: DiskMask::full(Topology::new(2, 2)),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.mask.count(), 4);
    }

    #[tokio::test]
    async fn test_receiver_closed_when_bus_dropped() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe::<FragmentRepaired>();
        drop(bus);
        assert!(rx.recv().await.is_none());
    }
}
