use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::Waker;

use futures::task::AtomicWaker;
use tokio::task::AbortHandle;

use crate::error::{ChainError, Operation};

/// Identifies a relay within its [`Chain`](crate::Chain).
///
/// Identifiers are assigned in spawn order, starting at zero, and are never reused.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RelayId(u64);

impl RelayId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the numeric value of this identifier.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The lifecycle state of a [`Chain`](crate::Chain).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ChainState {
    /// Producers are recorded, but no relay has been spawned yet.
    Idle,
    /// Relays are running, new producers can be added.
    Running,
    /// All relays were cancelled or have finished. The chain cannot be restarted.
    Stopped,
}

impl fmt::Display for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// The live set of relays of a chain, together with the chain's lifecycle state.
///
/// Keeping both behind one lock makes "is the chain running" and "register a relay" a single
/// atomic step, so a relay can never be added to a chain that is being torn down.
#[derive(Debug)]
pub(crate) struct TaskRegistry {
    inner: Mutex<Inner>,
    /// Woken whenever a relay leaves the registry.
    consumer: AtomicWaker,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ChainState::Idle,
                next_id: 0,
                relays: BTreeMap::new(),
            }),
            consumer: AtomicWaker::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ChainState {
        self.lock().state
    }

    /// Returns the number of relays that can still produce items.
    pub fn len(&self) -> usize {
        self.lock().relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().relays.is_empty()
    }

    /// Transitions an idle chain into the running state.
    pub fn start(&self) -> Result<(), ChainError> {
        let mut inner = self.lock();
        match inner.state {
            ChainState::Idle => {
                inner.state = ChainState::Running;
                Ok(())
            }
            state => Err(ChainError::InvalidState {
                operation: Operation::Start,
                state,
            }),
        }
    }

    /// Registers a relay spawned by `spawn`, provided the chain is running.
    ///
    /// The relay's id is reserved before `spawn` runs, so the relay cannot remove itself before
    /// it has been inserted. `spawn` runs without holding the lock and receives the
    /// [`RelayGuard`] that the relay must own for its entire lifetime. If the chain stops while
    /// the relay is being spawned, the relay is cancelled right away. If the chain is not running,
    /// `spawn` is not called.
    pub fn register<F>(self: &Arc<Self>, spawn: F) -> Result<RelayId, ChainError>
    where
        F: FnOnce(RelayGuard) -> AbortHandle,
    {
        let id = {
            let mut inner = self.lock();
            if inner.state != ChainState::Running {
                return Err(ChainError::InvalidState {
                    operation: Operation::AddProducer,
                    state: inner.state,
                });
            }

            let id = RelayId::new(inner.next_id);
            inner.next_id += 1;
            inner.relays.insert(id, None);
            id
        };

        // A runtime that is shutting down drops the relay inline, and its guard locks the
        // registry.
        let handle = spawn(RelayGuard {
            id,
            registry: Arc::clone(self),
        });

        let orphaned = {
            let mut inner = self.lock();
            let running = inner.state == ChainState::Running;
            match inner.relays.get_mut(&id) {
                Some(slot) if running => {
                    *slot = Some(handle);
                    None
                }
                _ => Some(handle),
            }
        };

        if let Some(handle) = orphaned {
            relay_log::trace!(relay = %id, "relay left the chain during spawn");
            handle.abort();
        }

        Ok(id)
    }

    /// Removes a relay from the registry. Removing a relay twice has no effect.
    fn remove(&self, id: RelayId) {
        let removed = self.lock().relays.remove(&id).is_some();
        if removed {
            self.consumer.wake();
        }
    }

    /// Stops the chain: cancels all relays that are still running and clears the registry.
    ///
    /// Cancellation does not wait for the relays to acknowledge. Calling this more than once has
    /// no further effect. Returns the number of cancelled relays.
    pub fn shutdown(&self) -> usize {
        let relays = {
            let mut inner = self.lock();
            inner.state = ChainState::Stopped;
            std::mem::take(&mut inner.relays)
        };

        for handle in relays.values().flatten() {
            handle.abort();
        }

        self.consumer.wake();
        relays.len()
    }

    /// Registers the waker of the consumer, which is woken whenever a relay exits.
    pub fn register_consumer(&self, waker: &Waker) {
        self.consumer.register(waker);
    }
}

#[derive(Debug)]
struct Inner {
    state: ChainState,
    next_id: u64,
    /// Relays by id. The handle is `None` while the relay is being spawned.
    relays: BTreeMap<RelayId, Option<AbortHandle>>,
}

/// Removes a relay from its registry when dropped.
///
/// The guard is moved into the relay's future, so it is dropped exactly once, no matter whether
/// the relay finished, failed, panicked or was cancelled.
#[derive(Debug)]
pub(crate) struct RelayGuard {
    id: RelayId,
    registry: Arc<TaskRegistry>,
}

impl RelayGuard {
    pub fn id(&self) -> RelayId {
        self.id
    }
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
