//! Narrow interface the source stage drives the broker client through

use crate::consumer::config::ConsumerSettings;
use crate::consumer::error::{BrokerError, SourceResult};
use crate::consumer::message::{Committer, Message, TopicPartition, TopicPartitionOffset};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Notification produced by a poll, in the order the client observed it
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent<K, V> {
    /// A record arrived
    Message(Message<K, V>),
    /// A record could not be consumed or deserialized
    ConsumeError {
        /// Topic of the record
        topic: String,
        /// Partition of the record
        partition: i32,
        /// Offset of the record
        offset: i64,
        /// Why it failed
        reason: String,
    },
    /// The client reported an error not tied to a record
    Error(BrokerError),
    /// The consumer group assigned partitions to this member
    PartitionsAssigned(Vec<TopicPartition>),
    /// The consumer group revoked partitions from this member
    PartitionsRevoked(Vec<TopicPartition>),
}

/// Polling broker client
///
/// `pause` and `resume` with an empty partition set must be a no-op.
#[async_trait]
pub trait ConsumerClient: Send + 'static {
    /// Key type of produced records
    type Key: Send + 'static;
    /// Value type of produced records
    type Value: Send + 'static;

    /// Client name for logs
    fn name(&self) -> &str;

    /// Group-managed subscription to topics
    fn subscribe(&mut self, topics: &[String]) -> SourceResult<()>;

    /// Group-managed subscription to topics matching a regex
    fn subscribe_pattern(&mut self, pattern: &str) -> SourceResult<()>;

    /// Use exactly these partitions, from the committed offsets
    fn assign(&mut self, partitions: &[TopicPartition]) -> SourceResult<()>;

    /// Use exactly these partitions, from the given offsets
    fn assign_with_offsets(&mut self, partitions: &[TopicPartitionOffset]) -> SourceResult<()>;

    /// Drop the current assignment
    fn unassign(&mut self) -> SourceResult<()>;

    /// Wait at most `timeout` for records and notifications
    async fn poll(&mut self, timeout: Duration) -> Vec<ClientEvent<Self::Key, Self::Value>>;

    /// Stop returning records for these partitions
    fn pause(&mut self, partitions: &[TopicPartition]) -> SourceResult<()>;

    /// Return records for these partitions again
    fn resume(&mut self, partitions: &[TopicPartition]) -> SourceResult<()>;

    /// Commit operation bound into every token
    fn committer(&self) -> Arc<dyn Committer>;

    /// Unsubscribe and release the client
    fn close(&mut self);
}

/// Creates the client when the stage starts
pub trait ClientFactory: Send + 'static {
    /// Client produced by this factory
    type Client: ConsumerClient;

    /// Build a client for the given settings
    fn create(&self, settings: &ConsumerSettings) -> SourceResult<Self::Client>;
}

/// [`ClientFactory`] built from a closure
pub struct FnFactory<F>(F);

/// Wrap a closure as a [`ClientFactory`]
pub fn factory_fn<F, C>(f: F) -> FnFactory<F>
where
    F: Fn(&ConsumerSettings) -> SourceResult<C> + Send + 'static,
    C: ConsumerClient,
{
    FnFactory(f)
}

impl<F, C> ClientFactory for FnFactory<F>
where
    F: Fn(&ConsumerSettings) -> SourceResult<C> + Send + 'static,
    C: ConsumerClient,
{
    type Client = C;

    fn create(&self, settings: &ConsumerSettings) -> SourceResult<C> {
        (self.0)(settings)
    }
}

impl<F> ClientFactory for Arc<F>
where
    F: ClientFactory + Sync,
{
    type Client = F::Client;

    fn create(&self, settings: &ConsumerSettings) -> SourceResult<Self::Client> {
        (**self).create(settings)
    }
}
