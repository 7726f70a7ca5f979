use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::{ChainConfig, ConfigError};
use crate::error::{ChainError, Operation};
use crate::merged::Merged;
use crate::producer::Producer;
use crate::queue::RelayQueue;
use crate::registry::{ChainState, RelayId, TaskRegistry};
use crate::relay;

/// State shared between all handles of a chain, its relays and its merged stream.
pub(crate) struct Shared<T> {
    pub(crate) queue: RelayQueue<T>,
    pub(crate) registry: Arc<TaskRegistry>,
    /// Producers recorded before the chain was started.
    pending: Mutex<Vec<Producer<T>>>,
    /// Set once the merged stream has been handed out.
    merged: Mutex<bool>,
}

impl<T> Shared<T> {
    /// Cancels all running relays and stops the chain.
    pub(crate) fn teardown(&self) {
        let cancelled = self.registry.shutdown();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        if cancelled > 0 {
            relay_log::debug!(cancelled, "cancelled running relays");
        }
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        // The last handle is gone, cancel relays that were never merged.
        self.registry.shutdown();
    }
}

/// A merge session over a set of asynchronous producers.
///
/// A chain is created idle: it records its producers but does not poll them. Once started, every
/// producer is drained by its own relay task into a bounded queue shared by all relays, and the
/// [`Merged`] stream hands out items in the order in which they arrive in that queue. The queue
/// capacity bounds how far producers can run ahead of the consumer. With the default capacity of
/// one, a producer cannot generate its next item before the consumer has taken the previous one
/// out of the queue.
///
/// While the chain is running, more producers can be added with [`add_producer`](Self::add_producer).
/// The chain stops when the merged stream ends or is dropped, or explicitly with
/// [`stop`](Self::stop). A stopped chain cannot be restarted.
///
/// `Chain` is a handle: clones refer to the same session, so a clone can be moved into another
/// task to add producers while the merged stream is being consumed.
///
/// Relays are spawned onto the current Tokio runtime.
///
/// # Example
///
/// ```
/// use futures::{stream, StreamExt};
/// use relay_chain::{Chain, Producer};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let chain = Chain::new([
///     Producer::new(stream::iter([1, 2, 3])),
///     Producer::new(stream::iter([10, 20])),
/// ]);
///
/// let mut merged = chain.merged()?;
/// let mut items = Vec::new();
/// while let Some(item) = merged.next().await {
///     items.push(item?);
/// }
///
/// items.sort();
/// assert_eq!(items, [1, 2, 3, 10, 20]);
/// # Ok(())
/// # }
/// ```
pub struct Chain<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Chain<T>
where
    T: Send + 'static,
{
    /// Creates an idle chain with the default configuration.
    pub fn new<I>(producers: I) -> Self
    where
        I: IntoIterator<Item = Producer<T>>,
    {
        Self::from_parts(&ChainConfig::default(), producers)
    }

    /// Creates an idle chain with the given configuration.
    ///
    /// Fails if the configuration is invalid.
    pub fn with_config<I>(config: &ChainConfig, producers: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = Producer<T>>,
    {
        config.validate()?;
        Ok(Self::from_parts(config, producers))
    }

    fn from_parts<I>(config: &ChainConfig, producers: I) -> Self
    where
        I: IntoIterator<Item = Producer<T>>,
    {
        Self {
            shared: Arc::new(Shared {
                queue: RelayQueue::new(config.capacity),
                registry: Arc::new(TaskRegistry::new()),
                pending: Mutex::new(producers.into_iter().collect()),
                merged: Mutex::new(false),
            }),
        }
    }

    /// Spawns a relay for every producer held by the chain.
    ///
    /// Starting is optional: [`merged`](Self::merged) starts an idle chain on its own. Starting
    /// explicitly allows adding producers before the merged stream is requested.
    ///
    /// Fails with [`ChainError::InvalidState`] if the chain has already been started or stopped,
    /// including when it is stopped concurrently while the producers are being spawned. Producers
    /// that were not spawned by then are dropped.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn start(&self) -> Result<(), ChainError> {
        self.shared.registry.start()?;
        self.spawn_pending()
    }

    fn spawn_pending(&self) -> Result<(), ChainError> {
        let producers = std::mem::take(
            &mut *self
                .shared
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        relay_log::debug!(producers = producers.len(), "starting relay chain");
        for producer in producers {
            relay::spawn(&self.shared.registry, &self.shared.queue, producer).map_err(
                |error| match error {
                    ChainError::InvalidState { state, .. } => ChainError::InvalidState {
                        operation: Operation::Start,
                        state,
                    },
                    error => error,
                },
            )?;
        }

        Ok(())
    }

    /// Returns the merged stream of all producers.
    ///
    /// Starts the chain if it is idle. The stream can only be requested once per chain, further
    /// calls fail with [`ChainError::AlreadyMerged`]. Fails with [`ChainError::InvalidState`] if
    /// the chain has been stopped.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn merged(&self) -> Result<Merged<T>, ChainError> {
        let mut merged = self
            .shared
            .merged
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if *merged {
            return Err(ChainError::AlreadyMerged);
        }

        match self.state() {
            ChainState::Idle => self.start()?,
            ChainState::Running => {}
            state @ ChainState::Stopped => {
                return Err(ChainError::InvalidState {
                    operation: Operation::Merge,
                    state,
                });
            }
        }

        *merged = true;
        Ok(Merged::new(Arc::clone(&self.shared)))
    }

    /// Adds a producer to a running chain.
    ///
    /// The producer is drained by a new relay into the same queue as all other producers, so its
    /// items show up in the merged stream after this call. Fails with
    /// [`ChainError::InvalidState`] if the chain has not been started or has already stopped, in
    /// which case the producer is dropped without being polled.
    ///
    /// The producer must own everything it needs. When producers are built in a loop, move the
    /// loop's values into the stream so each producer keeps the value from its own iteration.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn add_producer(&self, producer: Producer<T>) -> Result<RelayId, ChainError> {
        relay::spawn(&self.shared.registry, &self.shared.queue, producer)
    }
}

impl<T> Chain<T> {
    /// Cancels all running relays and stops the chain.
    ///
    /// Cancellation does not wait for the relays to finish. An item that a relay has already
    /// taken from its producer but not yet put into the queue is lost. Items already in the queue
    /// are still handed out by the merged stream. Calling `stop` more than once has no effect.
    pub fn stop(&self) {
        self.shared.teardown();
    }

    /// Returns the lifecycle state of the chain.
    pub fn state(&self) -> ChainState {
        self.shared.registry.state()
    }

    /// Returns `true` if relays have been started and the chain has not stopped yet.
    pub fn is_running(&self) -> bool {
        self.state() == ChainState::Running
    }

    /// Returns the number of relays that can still produce items.
    pub fn active_relays(&self) -> usize {
        self.shared.registry.len()
    }

    /// Returns the number of producers waiting for the chain to start.
    pub fn pending_producers(&self) -> usize {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns the number of items waiting in the queue for the consumer.
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    /// Returns the capacity of the relay queue.
    pub fn capacity(&self) -> usize {
        self.shared.queue.capacity()
    }
}

impl<T> Clone for Chain<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Chain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("state", &self.state())
            .field("pending_producers", &self.pending_producers())
            .field("active_relays", &self.active_relays())
            .field("queued", &self.queued())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use futures::stream::FusedStream;
    use futures::{StreamExt, stream};
    use insta::assert_debug_snapshot;

    use super::*;
    use crate::error::RelayError;

    async fn collect<T: 'static>(merged: Merged<T>) -> Vec<T> {
        merged
            .map(|item| item.expect("relay chain ended abnormally"))
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_empty_chain_ends_immediately() {
        let chain = Chain::<u32>::new([]);
        let items = collect(chain.merged().unwrap()).await;

        assert!(items.is_empty());
        assert_eq!(chain.state(), ChainState::Stopped);
    }

    #[tokio::test]
    async fn test_merges_all_items() {
        let chain = Chain::new((0..4).map(|p| Producer::new(stream::iter(p * 10..p * 10 + 5))));
        let items = collect(chain.merged().unwrap()).await;

        assert_eq!(items.len(), 20);
        for p in 0..4 {
            let own: Vec<_> = items.iter().filter(|i| **i / 10 == p).copied().collect();
            assert_eq!(own, (p * 10..p * 10 + 5).collect::<Vec<_>>());
        }
        assert_eq!(chain.active_relays(), 0);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let chain = Chain::new([Producer::new(stream::iter([1]))]);
        chain.start().unwrap();

        assert_eq!(
            chain.start(),
            Err(ChainError::InvalidState {
                operation: Operation::Start,
                state: ChainState::Running,
            })
        );
    }

    #[tokio::test]
    async fn test_merged_after_start() {
        let chain = Chain::new([Producer::new(stream::iter([1, 2]))]);
        chain.start().unwrap();
        assert_eq!(chain.pending_producers(), 0);

        assert_eq!(collect(chain.merged().unwrap()).await, [1, 2]);
    }

    #[tokio::test]
    async fn test_merged_only_once() {
        let chain = Chain::new([Producer::new(stream::pending::<u32>())]);
        let _merged = chain.merged().unwrap();

        assert_eq!(chain.merged().err(), Some(ChainError::AlreadyMerged));
    }

    #[tokio::test]
    async fn test_merged_after_stop() {
        let chain = Chain::new([Producer::new(stream::iter([1]))]);
        chain.stop();

        assert_eq!(
            chain.merged().err(),
            Some(ChainError::InvalidState {
                operation: Operation::Merge,
                state: ChainState::Stopped,
            })
        );
        assert_eq!(chain.pending_producers(), 0);
    }

    #[tokio::test]
    async fn test_add_producer_before_start() {
        let chain = Chain::<u32>::new([]);
        let polled = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&polled);
        let producer = Producer::<u32>::new(stream::poll_fn(move |_| {
            flag.store(true, Ordering::SeqCst);
            std::task::Poll::Ready(None)
        }));

        assert_eq!(
            chain.add_producer(producer),
            Err(ChainError::InvalidState {
                operation: Operation::AddProducer,
                state: ChainState::Idle,
            })
        );

        tokio::task::yield_now().await;
        assert_eq!(chain.active_relays(), 0);
        assert!(!polled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_add_producer_after_teardown() {
        let chain = Chain::new([Producer::new(stream::iter([1]))]);
        assert_eq!(collect(chain.merged().unwrap()).await, [1]);

        let result = chain.add_producer(Producer::new(stream::iter([2])));
        assert_eq!(
            result,
            Err(ChainError::InvalidState {
                operation: Operation::AddProducer,
                state: ChainState::Stopped,
            })
        );
        assert_eq!(chain.active_relays(), 0);
    }

    #[tokio::test]
    async fn test_producer_error_ends_stream() {
        let chain = Chain::new([
            Producer::try_new(stream::iter([Ok(1), Err("boom")])),
            Producer::new(stream::pending()),
        ]);

        let mut merged = chain.merged().unwrap();
        assert_eq!(merged.next().await.unwrap().unwrap(), 1);

        let error = merged.next().await.unwrap().unwrap_err();
        assert!(matches!(error, RelayError::Producer { .. }));

        assert!(merged.next().await.is_none());
        assert!(merged.is_terminated());
        assert_eq!(chain.state(), ChainState::Stopped);
        assert_eq!(chain.active_relays(), 0);
    }

    #[tokio::test]
    async fn test_drop_merged_stops_chain() {
        let chain = Chain::new([Producer::new(stream::repeat(7u8))]);

        let mut merged = chain.merged().unwrap();
        assert_eq!(merged.next().await.unwrap().unwrap(), 7);
        drop(merged);

        assert_eq!(chain.state(), ChainState::Stopped);
        assert_eq!(chain.active_relays(), 0);
        assert!(chain.add_producer(Producer::new(stream::iter([1]))).is_err());
    }

    #[tokio::test]
    async fn test_with_config_rejects_zero_capacity() {
        let config = ChainConfig::with_capacity(0);
        assert!(Chain::<u32>::with_config(&config, []).is_err());
    }

    #[test]
    fn test_add_producer_after_runtime_shutdown() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let handle = runtime.handle().clone();

        let chain = Chain::<u32>::new([]);
        {
            let _entered = handle.enter();
            chain.start().unwrap();
        }
        runtime.shutdown_background();

        let (tx, rx) = std::sync::mpsc::channel();
        let adder = chain.clone();
        std::thread::spawn(move || {
            let _entered = handle.enter();
            let result = adder.add_producer(Producer::new(stream::iter([1])));
            tx.send(result).ok();
        });

        // The runtime drops the relay right away, which must not block the caller.
        let result = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert!(result.is_ok());
        assert_eq!(chain.active_relays(), 0);
        assert!(chain.is_running());
    }

    #[tokio::test]
    async fn test_start_reports_concurrent_stop() {
        let chain = Chain::new([
            Producer::new(stream::iter([1u32])),
            Producer::new(stream::iter([2u32])),
        ]);

        // Stopped after the state changed, but before any producer was spawned.
        chain.shared.registry.start().unwrap();
        chain.shared.registry.shutdown();

        assert_eq!(
            chain.spawn_pending(),
            Err(ChainError::InvalidState {
                operation: Operation::Start,
                state: ChainState::Stopped,
            })
        );
        assert_eq!(chain.active_relays(), 0);
    }

    #[tokio::test]
    async fn test_drop_last_handle_stops_relays() {
        let (dropped, items) = relay_test::tracked(stream::pending::<u32>());
        let chain = Chain::new([Producer::new(items)]);
        chain.start().unwrap();

        let registry = Arc::clone(&chain.shared.registry);
        assert_eq!(registry.len(), 1);

        drop(chain);
        assert_eq!(registry.state(), ChainState::Stopped);
        assert!(registry.is_empty());

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(dropped.is_dropped());
    }

    #[tokio::test]
    async fn test_debug() {
        let config = ChainConfig::with_capacity(4);
        let chain = Chain::with_config(&config, [Producer::new(stream::iter([1u32]))]).unwrap();

        assert_debug_snapshot!(chain, @r###"
        Chain {
            state: Idle,
            pending_producers: 1,
            active_relays: 0,
            queued: 0,
            capacity: 4,
        }
        "###);
    }
}
