use flume::r#async::RecvStream;

use crate::error::RelayError;

/// An item, or the failure that ended a relay, on its way to the consumer.
pub(crate) type Relayed<T> = Result<T, RelayError>;

/// Returned by [`RelaySender::put`] when the consumer side of the queue is gone.
#[derive(Debug)]
pub(crate) struct QueueClosed;

/// The bounded queue between the relays and the consumer of a chain.
///
/// All relays write into the same queue, the merged stream is the sole reader. The queue never
/// holds more than its capacity: a relay putting into a full queue is suspended until the
/// consumer takes an item.
#[derive(Debug)]
pub(crate) struct RelayQueue<T> {
    tx: flume::Sender<Relayed<T>>,
    rx: flume::Receiver<Relayed<T>>,
}

impl<T> RelayQueue<T> {
    /// Creates a queue that holds at most `capacity` items.
    ///
    /// The capacity is validated by [`ChainConfig`](crate::ChainConfig). A capacity of zero is
    /// raised to one, since a rendezvous queue would hand items straight to the consumer.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity.max(1));
        Self { tx, rx }
    }

    /// Returns the maximum number of items the queue holds.
    pub fn capacity(&self) -> usize {
        // Bounded channels always report their capacity.
        self.tx.capacity().unwrap_or(1)
    }

    /// Returns the number of items currently waiting for the consumer.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns `true` if no item is waiting for the consumer.
    ///
    /// This is a snapshot: relays may put items concurrently with the check.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Returns a write handle for a relay.
    pub fn sender(&self) -> RelaySender<T> {
        RelaySender(self.tx.clone())
    }

    /// Returns the read side of the queue as a stream.
    ///
    /// The queue keeps its own sender, so the stream never ends on its own.
    pub fn stream(&self) -> RecvStream<'static, Relayed<T>> {
        self.rx.clone().into_stream()
    }

    /// Takes the next item, waiting until one is available.
    #[cfg(test)]
    pub async fn take(&self) -> Option<Relayed<T>> {
        self.rx.recv_async().await.ok()
    }
}

/// The write handle of a [`RelayQueue`], owned by a single relay.
#[derive(Debug)]
pub(crate) struct RelaySender<T>(flume::Sender<Relayed<T>>);

impl<T> RelaySender<T> {
    /// Puts an item into the queue, waiting for a free slot if the queue is full.
    ///
    /// Dropping the returned future before it completes discards the item.
    pub async fn put(&self, item: Relayed<T>) -> Result<(), QueueClosed> {
        self.0.send_async(item).await.map_err(|_| QueueClosed)
    }
}
