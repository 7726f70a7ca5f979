//! # Relay Chain
//!
//! Bounded fan-in of independently paced asynchronous producers into a single stream.
//!
//! A [`Chain`] merges any number of [`Producer`]s, each wrapping a [`Stream`](futures::Stream),
//! and hands out their items in arrival order as soon as any producer has one ready. How many
//! unconsumed items may accumulate is bounded by the capacity of the chain's relay queue.
//!
//! ## Concurrency Model
//!
//! Every producer is drained by its own relay task, spawned onto the current Tokio runtime. All
//! relays put their items into one bounded queue, and the [`Merged`] stream is its only reader.
//! A relay that finds the queue full is suspended until the consumer takes an item, which
//! provides backpressure towards the producers: with the default capacity of one, a producer
//! cannot generate more than one item ahead of the consumer.
//!
//! Relays are kept in a registry and remove themselves when they exit, whether their producer
//! was exhausted, failed, or the relay was cancelled. The merged stream ends once the registry
//! and the queue are both empty. Producers can be added with [`Chain::add_producer`] for as long
//! as the chain is running.
//!
//! There is no ordering guarantee across producers. The items of a single producer keep their
//! relative order.
//!
//! ## Usage Example
//!
//! ```
//! use std::time::Duration;
//!
//! use futures::{stream, StreamExt};
//! use relay_chain::{Chain, ChainConfig, Producer};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ticks = |label: &'static str, period: Duration| {
//!     stream::iter(0..3).then(move |i| async move {
//!         tokio::time::sleep(period).await;
//!         format!("{label}{i}")
//!     })
//! };
//!
//! let chain = Chain::with_config(
//!     &ChainConfig::with_capacity(4),
//!     [Producer::new(ticks("a", Duration::from_millis(4)))],
//! )?;
//!
//! let mut merged = chain.merged()?;
//! let mut count = 0;
//! while let Some(item) = merged.next().await {
//!     let item = item?;
//!     count += 1;
//!
//!     // Producers can join while the chain is running.
//!     if item == "a0" {
//!         chain.add_producer(Producer::new(ticks("b", Duration::from_millis(1))))?;
//!     }
//! }
//!
//! assert_eq!(count, 6);
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Lifecycle violations, such as adding a producer to a chain that is not running, are reported
//! synchronously as [`ChainError`]. A failing or panicking producer ends the whole merge: all
//! relays are cancelled and the merged stream yields a final [`RelayError`] before it ends, so an
//! abnormal end can always be told apart from a regular one.

#![warn(missing_docs)]

mod chain;
mod config;
mod error;
mod merged;
mod producer;
mod queue;
mod registry;
mod relay;

pub use self::chain::*;
pub use self::config::*;
pub use self::error::*;
pub use self::merged::Merged;
pub use self::producer::*;
pub use self::registry::{ChainState, RelayId};
