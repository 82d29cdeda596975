//! rdkafka implementation of the client adapter
//!
//! Rebalance and error callbacks run on librdkafka threads. [`SourceContext`]
//! only forwards them over an unbounded channel; [`KafkaClient::poll`] drains
//! that channel in order with the records it receives, so the stage sees every
//! notification on its own task.

use crate::consumer::client::{ClientEvent, ClientFactory, ConsumerClient};
use crate::consumer::config::ConsumerSettings;
use crate::consumer::deserializer::Deserializer;
use crate::consumer::error::{BrokerError, ErrorClass, SourceError, SourceResult};
use crate::consumer::message::{Committer, Message, TopicPartition, TopicPartitionOffset};

use async_trait::async_trait;
use futures::FutureExt;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::BorrowedMessage;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientConfig, ClientContext, Message as _, Offset, TopicPartitionList};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Notification forwarded from librdkafka callbacks
#[derive(Debug)]
enum ContextEvent {
    Assigned(Vec<TopicPartition>),
    Revoked(Vec<TopicPartition>),
    Error(BrokerError),
}

/// Consumer context bridging librdkafka callbacks into the stage
pub struct SourceContext {
    events: mpsc::UnboundedSender<ContextEvent>,
}

impl SourceContext {
    fn forward(&self, event: ContextEvent) {
        if self.events.send(event).is_err() {
            debug!("Source client dropped, discarding callback event");
        }
    }
}

impl ClientContext for SourceContext {
    fn error(&self, error: KafkaError, reason: &str) {
        let broker = classify(&error, reason);
        match broker.class {
            ErrorClass::Retriable => warn!("librdkafka error: {}: {}", error, reason),
            _ => error!("librdkafka error: {}: {}", error, reason),
        }
        self.forward(ContextEvent::Error(broker));
    }
}

impl ConsumerContext for SourceContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                debug!("Pre-rebalance revoke of {} partitions", tpl.count());
                self.forward(ContextEvent::Revoked(partitions_of(tpl)));
            }
            Rebalance::Assign(tpl) => {
                debug!("Pre-rebalance assign of {} partitions", tpl.count());
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
                self.forward(ContextEvent::Error(BrokerError::new(
                    "Rebalance",
                    e.to_string(),
                    ErrorClass::NonRetriable,
                )));
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Assign(tpl) = rebalance {
            debug!("Post-rebalance assign of {} partitions", tpl.count());
            self.forward(ContextEvent::Assigned(partitions_of(tpl)));
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!("Committed offsets for {} partitions", offsets.count()),
            Err(e) => warn!("Failed to commit offsets: {}", e),
        }
    }
}

type SourceConsumer = StreamConsumer<SourceContext>;

/// Commits through the rdkafka consumer that produced the records
struct KafkaCommitter {
    consumer: Arc<SourceConsumer>,
    closed: Arc<AtomicBool>,
}

impl Committer for KafkaCommitter {
    fn commit(&self, offsets: &[TopicPartitionOffset]) -> SourceResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SourceError::Commit("consumer is closed".to_string()));
        }
        let tpl = offset_list(offsets)?;
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| SourceError::Commit(e.to_string()))
    }
}

/// Broker client backed by an rdkafka `StreamConsumer`
pub struct KafkaClient<K, V> {
    name: String,
    consumer: Arc<SourceConsumer>,
    events: mpsc::UnboundedReceiver<ContextEvent>,
    key_deserializer: Arc<dyn Deserializer<K>>,
    value_deserializer: Arc<dyn Deserializer<V>>,
    max_poll_records: usize,
    closed: Arc<AtomicBool>,
}

impl<K: Send + 'static, V: Send + 'static> KafkaClient<K, V> {
    /// Create a consumer for the given settings
    pub fn new(
        settings: &ConsumerSettings,
        key_deserializer: Arc<dyn Deserializer<K>>,
        value_deserializer: Arc<dyn Deserializer<V>>,
    ) -> SourceResult<Self> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &settings.bootstrap_servers)
            .set("group.id", &settings.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &settings.auto_offset_reset)
            .set("session.timeout.ms", settings.session_timeout_ms.to_string());
        for (key, value) in &settings.properties {
            client_config.set(key, value);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let consumer: SourceConsumer = client_config
            .create_with_context(SourceContext { events: tx })
            .map_err(|e| SourceError::Client(format!("Failed to create consumer: {}", e)))?;

        let name = settings
            .properties
            .get("client.id")
            .cloned()
            .unwrap_or_else(|| format!("consumer[{}]", settings.group_id));

        Ok(Self {
            name,
            consumer: Arc::new(consumer),
            events: rx,
            key_deserializer,
            value_deserializer,
            max_poll_records: settings.max_poll_records,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn drain_context(&mut self, out: &mut Vec<ClientEvent<K, V>>) {
        while let Ok(event) = self.events.try_recv() {
            out.push(match event {
                ContextEvent::Assigned(partitions) => ClientEvent::PartitionsAssigned(partitions),
                ContextEvent::Revoked(partitions) => ClientEvent::PartitionsRevoked(partitions),
                ContextEvent::Error(e) => ClientEvent::Error(e),
            });
        }
    }

    fn convert(&self, result: KafkaResult<BorrowedMessage<'_>>) -> ClientEvent<K, V> {
        let message = match result {
            Ok(message) => message,
            Err(e) => return ClientEvent::Error(classify(&e, "consume")),
        };

        let decoded = self
            .key_deserializer
            .deserialize(message.key())
            .and_then(|key| {
                self.value_deserializer
                    .deserialize(message.payload())
                    .map(|value| (key, value))
            });

        match decoded {
            Ok((key, value)) => ClientEvent::Message(Message {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                key,
                value,
                timestamp: message.timestamp().to_millis(),
            }),
            Err(e) => ClientEvent::ConsumeError {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                reason: e.to_string(),
            },
        }
    }
}

#[async_trait]
impl<K: Send + 'static, V: Send + 'static> ConsumerClient for KafkaClient<K, V> {
    type Key = K;
    type Value = V;

    fn name(&self) -> &str {
        &self.name
    }

    fn subscribe(&mut self, topics: &[String]) -> SourceResult<()> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&topics)
            .map_err(|e| SourceError::Subscription(format!("Failed to subscribe: {}", e)))
    }

    fn subscribe_pattern(&mut self, pattern: &str) -> SourceResult<()> {
        self.consumer
            .subscribe(&[pattern])
            .map_err(|e| SourceError::Subscription(format!("Failed to subscribe: {}", e)))
    }

    fn assign(&mut self, partitions: &[TopicPartition]) -> SourceResult<()> {
        let tpl = partition_list(partitions);
        self.consumer
            .assign(&tpl)
            .map_err(|e| SourceError::Subscription(format!("Failed to assign: {}", e)))
    }

    fn assign_with_offsets(&mut self, partitions: &[TopicPartitionOffset]) -> SourceResult<()> {
        let tpl = offset_list(partitions)?;
        self.consumer
            .assign(&tpl)
            .map_err(|e| SourceError::Subscription(format!("Failed to assign: {}", e)))
    }

    fn unassign(&mut self) -> SourceResult<()> {
        self.consumer
            .unassign()
            .map_err(|e| SourceError::Client(format!("Failed to unassign: {}", e)))
    }

    async fn poll(&mut self, timeout: Duration) -> Vec<ClientEvent<K, V>> {
        let mut out = Vec::new();
        let consumer = self.consumer.clone();

        let first = tokio::time::timeout(timeout, consumer.recv()).await;
        self.drain_context(&mut out);
        let Ok(first) = first else {
            return out;
        };
        out.push(self.convert(first));

        let mut received = 1;
        while received < self.max_poll_records {
            let Some(result) = consumer.recv().now_or_never() else {
                break;
            };
            self.drain_context(&mut out);
            out.push(self.convert(result));
            received += 1;
        }
        self.drain_context(&mut out);
        out
    }

    fn pause(&mut self, partitions: &[TopicPartition]) -> SourceResult<()> {
        if partitions.is_empty() {
            return Ok(());
        }
        self.consumer
            .pause(&partition_list(partitions))
            .map_err(|e| SourceError::Client(format!("Failed to pause: {}", e)))
    }

    fn resume(&mut self, partitions: &[TopicPartition]) -> SourceResult<()> {
        if partitions.is_empty() {
            return Ok(());
        }
        self.consumer
            .resume(&partition_list(partitions))
            .map_err(|e| SourceError::Client(format!("Failed to resume: {}", e)))
    }

    fn committer(&self) -> Arc<dyn Committer> {
        Arc::new(KafkaCommitter {
            consumer: self.consumer.clone(),
            closed: self.closed.clone(),
        })
    }

    fn close(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.consumer.unsubscribe();
        // committers still hold the consumer, so a manual assignment must be dropped here
        if let Err(e) = self.consumer.unassign() {
            warn!("Failed to unassign consumer {}: {}", self.name, e);
        }
        info!("Closed consumer {}", self.name);
    }
}

/// Creates a [`KafkaClient`] with the configured deserializers
pub struct KafkaClientFactory<K, V> {
    key_deserializer: Arc<dyn Deserializer<K>>,
    value_deserializer: Arc<dyn Deserializer<V>>,
}

impl<K, V> KafkaClientFactory<K, V> {
    /// Create a factory
    pub fn new(
        key_deserializer: impl Deserializer<K>,
        value_deserializer: impl Deserializer<V>,
    ) -> Self {
        Self {
            key_deserializer: Arc::new(key_deserializer),
            value_deserializer: Arc::new(value_deserializer),
        }
    }
}

impl<K: Send + 'static, V: Send + 'static> ClientFactory for KafkaClientFactory<K, V> {
    type Client = KafkaClient<K, V>;

    fn create(&self, settings: &ConsumerSettings) -> SourceResult<Self::Client> {
        KafkaClient::new(
            settings,
            self.key_deserializer.clone(),
            self.value_deserializer.clone(),
        )
    }
}

/// Map an rdkafka error to a classified broker error
pub fn classify(error: &KafkaError, context: &str) -> BrokerError {
    let class = match error {
        KafkaError::MessageConsumptionFatal(_) => ErrorClass::Fatal,
        KafkaError::ClientCreation(_) => ErrorClass::Fatal,
        _ => match error.rdkafka_error_code() {
            Some(code) => classify_code(code),
            None => ErrorClass::NonRetriable,
        },
    };
    let code = error
        .rdkafka_error_code()
        .map(|c| format!("{:?}", c))
        .unwrap_or_else(|| "Unknown".to_string());
    BrokerError::new(code, format!("{}: {}", context, error), class)
}

fn classify_code(code: RDKafkaErrorCode) -> ErrorClass {
    match code {
        RDKafkaErrorCode::Fatal
        | RDKafkaErrorCode::Authentication
        | RDKafkaErrorCode::SaslAuthenticationFailed
        | RDKafkaErrorCode::TopicAuthorizationFailed
        | RDKafkaErrorCode::GroupAuthorizationFailed
        | RDKafkaErrorCode::ClusterAuthorizationFailed => ErrorClass::Fatal,
        RDKafkaErrorCode::BrokerTransportFailure
        | RDKafkaErrorCode::AllBrokersDown
        | RDKafkaErrorCode::OperationTimedOut
        | RDKafkaErrorCode::RequestTimedOut
        | RDKafkaErrorCode::NetworkException
        | RDKafkaErrorCode::LeaderNotAvailable
        | RDKafkaErrorCode::NotLeaderForPartition
        | RDKafkaErrorCode::CoordinatorNotAvailable
        | RDKafkaErrorCode::NotCoordinator
        | RDKafkaErrorCode::CoordinatorLoadInProgress
        | RDKafkaErrorCode::PartitionEOF => ErrorClass::Retriable,
        _ => ErrorClass::NonRetriable,
    }
}

fn partitions_of(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|e| TopicPartition::new(e.topic(), e.partition()))
        .collect()
}

fn partition_list(partitions: &[TopicPartition]) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for tp in partitions {
        tpl.add_partition(&tp.topic, tp.partition);
    }
    tpl
}

fn offset_list(offsets: &[TopicPartitionOffset]) -> SourceResult<TopicPartitionList> {
    let mut tpl = TopicPartitionList::new();
    for tpo in offsets {
        tpl.add_partition_offset(
            &tpo.topic_partition.topic,
            tpo.topic_partition.partition,
            Offset::Offset(tpo.offset),
        )
        .map_err(|e| SourceError::Client(format!("Invalid offset for {}: {}", tpo.topic_partition, e)))?;
    }
    Ok(tpl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::deserializer::IgnoreDeserializer;

    #[test]
    fn test_classify_codes() {
        assert_eq!(classify_code(RDKafkaErrorCode::AllBrokersDown), ErrorClass::Retriable);
        assert_eq!(classify_code(RDKafkaErrorCode::Authentication), ErrorClass::Fatal);
        assert_eq!(classify_code(RDKafkaErrorCode::OffsetOutOfRange), ErrorClass::NonRetriable);
    }

    #[test]
    fn test_classify_fatal_consumption() {
        let err = classify(
            &KafkaError::MessageConsumptionFatal(RDKafkaErrorCode::Fatal),
            "consume",
        );
        assert!(err.is_fatal());
    }

    #[test]
    fn test_partition_lists() {
        let tpl = partition_list(&[TopicPartition::new("a", 0), TopicPartition::new("a", 1)]);
        assert_eq!(tpl.count(), 2);
        assert_eq!(partitions_of(&tpl), vec![TopicPartition::new("a", 0), TopicPartition::new("a", 1)]);

        let tpl = offset_list(&[TopicPartitionOffset::new("b", 2, 40)]).unwrap();
        let elements = tpl.elements();
        assert_eq!(elements[0].offset(), Offset::Offset(40));
    }

    #[tokio::test]
    async fn test_close_releases_manual_assignment() {
        let settings = ConsumerSettings::builder()
            .bootstrap_servers("localhost:1")
            .group_id("close-test")
            .build();
        let mut client: KafkaClient<(), ()> = KafkaClient::new(
            &settings,
            Arc::new(IgnoreDeserializer),
            Arc::new(IgnoreDeserializer),
        )
        .unwrap();
        client.assign(&[TopicPartition::new("events", 0)]).unwrap();
        assert_eq!(client.consumer.assignment().unwrap().count(), 1);

        let committer = client.committer();
        client.close();

        assert_eq!(client.consumer.assignment().unwrap().count(), 0);
        assert!(committer
            .commit(&[TopicPartitionOffset::new("events", 0, 1)])
            .is_err());
    }
}
