use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use tokio::runtime::Handle;

use crate::error::{ChainError, RelayError};
use crate::producer::Producer;
use crate::queue::{RelayQueue, RelaySender};
use crate::registry::{RelayGuard, RelayId, TaskRegistry};

/// Spawns a relay draining `producer` into `queue` and registers it.
///
/// Fails without spawning anything if the chain is not running.
///
/// # Panics
///
/// Panics if called outside of a Tokio runtime.
pub(crate) fn spawn<T>(
    registry: &Arc<TaskRegistry>,
    queue: &RelayQueue<T>,
    producer: Producer<T>,
) -> Result<RelayId, ChainError>
where
    T: Send + 'static,
{
    // Resolve the runtime before registering, so a missing runtime cannot leave a reserved relay
    // behind in the registry.
    let runtime = Handle::current();
    let sender = queue.sender();

    registry.register(|guard| {
        relay_log::trace!(relay = %guard.id(), "spawning relay");
        runtime.spawn(run(guard, producer, sender)).abort_handle()
    })
}

/// Drains a producer into the relay queue until it is exhausted or fails.
///
/// The guard is held for the entire lifetime of the relay and removes it from the registry on
/// every kind of exit, including cancellation.
async fn run<T>(guard: RelayGuard, producer: Producer<T>, sender: RelaySender<T>)
where
    T: Send + 'static,
{
    let relay = guard.id();

    let result = AssertUnwindSafe(relay_items(relay, producer, &sender))
        .catch_unwind()
        .await;

    if let Err(panic) = result {
        let error = RelayError::Panicked {
            relay,
            message: panic_message(&*panic),
        };
        // The consumer is gone if this fails, there is nobody left to notify.
        let _ = sender.put(Err(error)).await;
    }

    drop(guard);
}

async fn relay_items<T>(relay: RelayId, producer: Producer<T>, sender: &RelaySender<T>) {
    let mut stream = producer.into_stream();

    while let Some(next) = stream.next().await {
        let item = next.map_err(|source| RelayError::Producer { relay, source });
        let failed = item.is_err();

        if sender.put(item).await.is_err() {
            relay_log::debug!(relay = %relay, "relay queue closed");
            return;
        }

        if failed {
            relay_log::debug!(relay = %relay, "producer failed");
            return;
        }
    }

    relay_log::trace!(relay = %relay, "producer exhausted");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::stream;

    use super::*;
    use crate::error::Operation;
    use crate::registry::ChainState;

    fn running_registry() -> Arc<TaskRegistry> {
        let registry = Arc::new(TaskRegistry::new());
        registry.start().unwrap();
        registry
    }

    #[tokio::test]
    async fn test_relay_drains_producer_in_order() {
        let registry = running_registry();
        let queue = RelayQueue::new(1);

        spawn(&registry, &queue, Producer::new(stream::iter(0..5))).unwrap();

        for expected in 0..5 {
            assert_eq!(queue.take().await.unwrap().unwrap(), expected);
        }

        // The relay removes itself once the producer is exhausted.
        tokio::time::timeout(Duration::from_secs(1), async {
            while !registry.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_relay_respects_capacity() {
        let registry = running_registry();
        let queue = RelayQueue::new(1);
        let produced = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&produced);
        let producer = Producer::new(stream::iter(0..10).inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        spawn(&registry, &queue, producer).unwrap();

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        // One item sits in the queue, the next one waits in the pending put.
        assert_eq!(queue.len(), 1);
        assert_eq!(produced.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_relay_forwards_producer_error() {
        let registry = running_registry();
        let queue = RelayQueue::new(4);

        let producer = Producer::try_new(stream::iter(vec![
            Ok(1),
            Err("broken pipe"),
            Ok(2),
        ]));
        let id = spawn(&registry, &queue, producer).unwrap();

        assert_eq!(queue.take().await.unwrap().unwrap(), 1);

        let error = queue.take().await.unwrap().unwrap_err();
        assert_eq!(error.relay(), id);
        assert!(matches!(error, RelayError::Producer { .. }));

        // The relay stops at the first error.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(queue.is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_relay_catches_panic() {
        let registry = running_registry();
        let queue = RelayQueue::<u32>::new(1);

        let producer = Producer::new(stream::poll_fn(|_| panic!("producer exploded")));
        spawn(&registry, &queue, producer).unwrap();

        let error = queue.take().await.unwrap().unwrap_err();
        assert_eq!(error.to_string(), "relay 0 panicked: producer exploded");
    }

    #[tokio::test]
    async fn test_spawn_requires_running_chain() {
        let registry = Arc::new(TaskRegistry::new());
        let queue = RelayQueue::new(1);

        let result = spawn(&registry, &queue, Producer::new(stream::iter(0..1)));
        assert_eq!(
            result,
            Err(ChainError::InvalidState {
                operation: Operation::AddProducer,
                state: ChainState::Idle,
            })
        );
        assert!(queue.is_empty());
    }
}
