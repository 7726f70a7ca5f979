use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use flume::r#async::RecvStream;
use futures::stream::{FusedStream, Stream};
use pin_project_lite::pin_project;
use relay_log::LogError;
use tokio::time::{Instant, Sleep};

use crate::chain::Shared;
use crate::error::RelayError;
use crate::queue::Relayed;

/// Interval at which the merged stream re-checks whether any relay is left.
///
/// Relays wake the consumer when they exit, so this only bounds the wait if such a wake-up is
/// missed.
pub(crate) const LIVENESS_POLL_INTERVAL: Duration = Duration::from_millis(1);

pin_project! {
    /// The merged stream of a [`Chain`](crate::Chain).
    ///
    /// Yields items in the order in which the relays put them into the relay queue, as soon as
    /// any producer has one ready. The stream ends once no relay is left and the queue is empty.
    /// It never ends while a relay could still yield an item.
    ///
    /// If a producer fails or panics, all remaining relays are cancelled, the stream yields the
    /// [`RelayError`] once and then ends. An `Err` item therefore always marks an abnormal end.
    ///
    /// When the stream ends, or when it is dropped before that, the chain is stopped: all relays
    /// still running are cancelled and no more producers can be added.
    pub struct Merged<T: 'static> {
        shared: Arc<Shared<T>>,
        #[pin]
        items: RecvStream<'static, Relayed<T>>,
        liveness: Pin<Box<Sleep>>,
        terminated: bool,
    }

    impl<T: 'static> PinnedDrop for Merged<T> {
        fn drop(this: Pin<&mut Self>) {
            if !this.terminated {
                this.shared.teardown();
            }
        }
    }
}

impl<T: 'static> Merged<T> {
    pub(crate) fn new(shared: Arc<Shared<T>>) -> Self {
        let items = shared.queue.stream();
        Self {
            shared,
            items,
            liveness: Box::pin(tokio::time::sleep(LIVENESS_POLL_INTERVAL)),
            terminated: false,
        }
    }
}

impl<T: 'static> Stream for Merged<T> {
    type Item = Result<T, RelayError>;

    /// Drains the relay queue while relays are registered or items are queued.
    ///
    /// The termination condition depends on two facts that change independently: whether relays
    /// are registered and whether the queue is empty. The consumer's waker is registered with the
    /// task registry before either is inspected, so a relay exiting in between wakes this stream.
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if *this.terminated {
            return Poll::Ready(None);
        }

        loop {
            this.shared.registry.register_consumer(cx.waker());

            match this.items.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(item))) => return Poll::Ready(Some(Ok(item))),
                Poll::Ready(Some(Err(error))) => {
                    relay_log::error!("relay chain ended abnormally: {}", LogError(&error));
                    this.shared.teardown();
                    *this.terminated = true;
                    return Poll::Ready(Some(Err(error)));
                }
                Poll::Ready(None) => {
                    this.shared.teardown();
                    *this.terminated = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => {}
            }

            // Both checks are hints. A relay may still put an item after the registry check, in
            // which case the queue check catches it, or the next poll does.
            if this.shared.registry.is_empty() && this.shared.queue.is_empty() {
                relay_log::debug!("all relays finished");
                this.shared.teardown();
                *this.terminated = true;
                return Poll::Ready(None);
            }

            match this.liveness.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    let deadline = Instant::now() + LIVENESS_POLL_INTERVAL;
                    this.liveness.as_mut().reset(deadline);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<T: 'static> FusedStream for Merged<T> {
    fn is_terminated(&self) -> bool {
        self.terminated
    }
}
