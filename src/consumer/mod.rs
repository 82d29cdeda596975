//! Pull-based Kafka source with manual offset commits
//!
//! The source buffers polled records and hands them out one per downstream
//! pull. When the buffer grows past `buffer_size` the client is paused on all
//! assigned partitions, and it is resumed once downstream has drained the
//! buffer. Offsets are never committed by the source; every record carries a
//! [`CommittableOffset`] the application commits when it is done.
//!
//! # Example
//!
//! ```no_run
//! # #[cfg(feature = "kafka")]
//! # async fn example() -> anyhow::Result<()> {
//! use kafka_pull_source::consumer::{
//!     committable_source, ConsumerSettings, KafkaClientFactory, StringDeserializer, Subscription,
//! };
//!
//! let settings = ConsumerSettings::builder()
//!     .bootstrap_servers("localhost:9092")
//!     .group_id("alerts")
//!     .buffer_size(64)
//!     .build();
//! let factory = KafkaClientFactory::<Option<String>, String>::new(StringDeserializer, StringDeserializer);
//!
//! let (mut source, _task) = committable_source(settings, Subscription::topics(["alerts"]), factory);
//! while let Some(message) = source.pull().await {
//!     let message = message?;
//!     println!("{}", message.record.value);
//!     message.committable_offset.commit()?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod backpressure;
pub mod client;
pub mod config;
pub mod deserializer;
pub mod error;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod message;
pub mod restart;
pub mod retry;
pub mod shutdown;
pub mod stage;
pub mod subscription;
pub mod supervision;

pub use backpressure::{BackpressureController, FlowAction};
pub use client::{factory_fn, ClientEvent, ClientFactory, ConsumerClient, FnFactory};
pub use config::{ConsumerSettings, ConsumerSettingsBuilder};
pub use deserializer::{
    BytesDeserializer, DeserializationError, Deserializer, IgnoreDeserializer, JsonDeserializer,
    StringDeserializer,
};
pub use error::{BrokerError, ErrorClass, SourceError, SourceResult};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaClient, KafkaClientFactory};
pub use memory::{ClientCall, MemoryBroker, MemoryClient, MemoryClientFactory};
pub use message::{
    CommittableMessage, CommittableOffset, CommittableOffsetBatch, Committer, Message,
    PartitionOffset, TopicPartition, TopicPartitionOffset,
};
pub use restart::RestartingSource;
pub use retry::RetryPolicy;
pub use shutdown::ShutdownHandle;
pub use stage::{committable_source, SourceHandle, SourceLogic, SourceStage, StageState};
pub use subscription::Subscription;
pub use supervision::{Directive, SupervisionStrategy};
