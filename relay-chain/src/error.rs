use std::error::Error;
use std::fmt;

use crate::registry::{ChainState, RelayId};

/// An operation on a [`Chain`](crate::Chain) that depends on its lifecycle state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    /// Spawning relays for the producers held by the chain.
    Start,
    /// Handing out the merged stream.
    Merge,
    /// Registering a new producer with a running chain.
    AddProducer,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Merge => write!(f, "merge"),
            Self::AddProducer => write!(f, "add a producer to"),
        }
    }
}

/// Errors returned synchronously by the lifecycle operations of a [`Chain`](crate::Chain).
///
/// None of the operations have a side effect when they fail.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ChainError {
    /// The operation is not allowed in the chain's current state.
    #[error("cannot {operation} a chain that is {state}")]
    InvalidState {
        /// The rejected operation.
        operation: Operation,
        /// The state of the chain when the operation was attempted.
        state: ChainState,
    },
    /// The merged stream can only be handed out once per chain.
    #[error("the merged stream of this chain has already been taken")]
    AlreadyMerged,
}

/// A failure raised by a producer while generating its next item.
///
/// This wraps the producer's own error type, which remains available through
/// [`Error::source`].
#[derive(Debug)]
pub struct ProducerError(Box<dyn Error + Send + Sync>);

impl ProducerError {
    pub(crate) fn new<E>(error: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        Self(error.into())
    }

    /// Returns the underlying error of the producer.
    pub fn into_inner(self) -> Box<dyn Error + Send + Sync> {
        self.0
    }
}

impl fmt::Display for ProducerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Error for ProducerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.0.source()
    }
}

/// Signals that a merged stream ended abnormally.
///
/// When a relay fails, the [`Merged`](crate::Merged) stream cancels all remaining relays, yields
/// this error exactly once and then ends.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The producer of a relay returned an error.
    #[error("producer of relay {relay} failed")]
    Producer {
        /// The relay that drained the failing producer.
        relay: RelayId,
        /// The error returned by the producer.
        #[source]
        source: ProducerError,
    },
    /// Polling the producer of a relay panicked.
    #[error("relay {relay} panicked: {message}")]
    Panicked {
        /// The relay that drained the panicking producer.
        relay: RelayId,
        /// The panic payload, if it was a string.
        message: String,
    },
}

impl RelayError {
    /// Returns the relay that raised this error.
    pub fn relay(&self) -> RelayId {
        match *self {
            Self::Producer { relay, .. } => relay,
            Self::Panicked { relay, .. } => relay,
        }
    }
}
