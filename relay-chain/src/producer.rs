use std::error::Error;
use std::fmt;

use futures::stream::{BoxStream, Stream, StreamExt};

use crate::error::ProducerError;

/// An asynchronous source of items that is merged into a [`Chain`](crate::Chain).
///
/// A producer wraps any [`Stream`], finite or unbounded. It is consumed at most once: as soon as
/// the chain starts, the producer is moved into its own relay task and never shared.
///
/// The stream must be `'static`, so any state taken from the surrounding scope, such as a loop
/// variable, has to be moved into the stream when the producer is built. This matters most for
/// producers that are added while the chain is already running:
///
/// ```
/// use futures::stream;
/// use relay_chain::Producer;
///
/// let producers: Vec<Producer<String>> = (0..3)
///     .map(|index| {
///         let label = format!("producer {index}");
///         Producer::new(stream::once(async move { label }))
///     })
///     .collect();
/// ```
pub struct Producer<T> {
    stream: BoxStream<'static, Result<T, ProducerError>>,
}

impl<T> Producer<T>
where
    T: Send + 'static,
{
    /// Creates a producer from an infallible stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
    {
        Self {
            stream: stream.map(Ok).boxed(),
        }
    }

    /// Creates a producer from a stream of results.
    ///
    /// The first error returned by the stream terminates the whole merge. The merged stream
    /// yields it as [`RelayError::Producer`](crate::RelayError::Producer).
    pub fn try_new<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn Error + Send + Sync>> + 'static,
    {
        Self {
            stream: stream.map(|result| result.map_err(ProducerError::new)).boxed(),
        }
    }
}

impl<T> Producer<T> {
    pub(crate) fn into_stream(self) -> BoxStream<'static, Result<T, ProducerError>> {
        self.stream
    }
}

impl<T> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer").finish_non_exhaustive()
    }
}
