//! Backpressure-aware, pull-based Kafka source
//!
//! This library adapts a polling Kafka consumer into a demand-driven source:
//! records are buffered between polls, handed out one per pull, and the
//! client is paused on all assigned partitions while the buffer is over
//! capacity. Offsets are committed by the application through the token
//! attached to every record, never by the source itself.
//!
//! # Example
//!
//! ```no_run
//! use kafka_pull_source::consumer::{
//!     committable_source, ConsumerSettings, MemoryBroker, Subscription, TopicPartition,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let broker = MemoryBroker::<(), String>::new();
//! broker.produce("events", 0, 0, (), "hello".to_string());
//!
//! let (mut source, _task) = committable_source(
//!     ConsumerSettings::default(),
//!     Subscription::assignment(vec![TopicPartition::new("events", 0)]),
//!     broker.factory(),
//! );
//! if let Some(message) = source.pull().await {
//!     let message = message?;
//!     message.committable_offset.commit()?;
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]

/// The buffered pull source and its client adapters
pub mod consumer;

/// Logging setup
pub mod telemetry;

pub use consumer::{
    committable_source, CommittableMessage, CommittableOffset, ConsumerSettings, RestartingSource,
    SourceError, SourceHandle, SourceResult, Subscription,
};
