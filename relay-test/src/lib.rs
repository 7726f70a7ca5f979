//! Helpers for testing relay chains.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output is
//!    captured by the test runner. All logs emitted with [`relay_log`] will show up for test
//!    failures or when run with `--nocapture`.
//!  - The producer helpers return plain streams. Wrap them in a producer of the crate under test.
//!
//! # Example
//!
//! ```no_run
//! #[tokio::test]
//! async fn my_test() {
//!     relay_test::setup();
//!
//!     let _ticks = relay_test::ticker(std::time::Duration::from_millis(10), [1, 2, 3]);
//!     relay_log::debug!("hello, world!");
//! }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::{Stream, StreamExt, stream};
use tokio::sync::Semaphore;

/// Setup the test environment.
///
///  - Initializes logs: The logger captures logs from `relay_chain` and this crate, and mutes all
///    other logs.
pub fn setup() {
    relay_log::init_test!("relay_chain");
}

/// Returns a stream that sleeps for `period` before yielding each of `items`.
///
/// Under a paused Tokio clock, item `i` becomes ready at exactly `(i + 1) * period`.
pub fn ticker<I>(period: Duration, items: I) -> impl Stream<Item = I::Item> + Send + 'static
where
    I: IntoIterator,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    stream::iter(items).then(move |item| async move {
        tokio::time::sleep(period).await;
        item
    })
}

/// Releases items of a [`gated`] stream.
#[derive(Clone, Debug)]
pub struct Gate {
    permits: Arc<Semaphore>,
}

impl Gate {
    /// Allows the stream to yield `n` more items.
    pub fn release(&self, n: usize) {
        self.permits.add_permits(n);
    }

    /// Lets the stream yield all remaining items without waiting.
    pub fn open(&self) {
        self.permits.close();
    }
}

/// Returns a stream that yields each of `items` only after it was released through the [`Gate`].
pub fn gated<I>(items: I) -> (Gate, impl Stream<Item = I::Item> + Send + 'static)
where
    I: IntoIterator,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    let permits = Arc::new(Semaphore::new(0));
    let gate = Gate {
        permits: permits.clone(),
    };

    let stream = stream::iter(items).then(move |item| {
        let permits = permits.clone();
        async move {
            // A closed semaphore means the gate was opened for good.
            if let Ok(permit) = permits.acquire().await {
                permit.forget();
            }
            item
        }
    });

    (gate, stream)
}

/// Counts the items pulled from a [`counted`] stream.
#[derive(Clone, Debug, Default)]
pub struct Produced(Arc<AtomicUsize>);

impl Produced {
    /// Returns the number of items the stream has yielded so far.
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Wraps `stream` to count how many items were pulled from it.
pub fn counted<S>(stream: S) -> (Produced, impl Stream<Item = S::Item> + Send + 'static)
where
    S: Stream + Send + 'static,
{
    let produced = Produced::default();
    let counter = produced.0.clone();

    let stream = stream.inspect(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    (produced, stream)
}

/// Set once the stream returned by [`tracked`] has been dropped.
#[derive(Clone, Debug, Default)]
pub struct DropFlag(Arc<AtomicBool>);

impl DropFlag {
    /// Returns `true` if the tracked stream was dropped.
    pub fn is_dropped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Wraps `stream` to observe when it is dropped.
pub fn tracked<S>(stream: S) -> (DropFlag, impl Stream<Item = S::Item> + Send + 'static)
where
    S: Stream + Send + 'static,
{
    let flag = DropFlag::default();
    let guard = SetOnDrop(flag.0.clone());

    let stream = stream.map(move |item| {
        let _guard = &guard;
        item
    });

    (flag, stream)
}
