//! In-memory broker client
//!
//! [`MemoryBroker`] is a scripted stand-in for a broker. Records and
//! notifications are queued on the broker and handed out by
//! [`MemoryClient::poll`] in queue order. Records of a paused or unassigned
//! partition are withheld until it is resumed or assigned. Every call the
//! stage makes on the client is recorded for inspection.

use crate::consumer::client::{ClientEvent, ClientFactory, ConsumerClient};
use crate::consumer::config::ConsumerSettings;
use crate::consumer::error::{BrokerError, SourceError, SourceResult};
use crate::consumer::message::{Committer, Message, TopicPartition, TopicPartitionOffset};
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A call made on a [`MemoryClient`]
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ClientCall {
    Subscribe(Vec<String>),
    SubscribePattern(String),
    Assign(Vec<TopicPartition>),
    AssignWithOffsets(Vec<TopicPartitionOffset>),
    Unassign,
    Pause(Vec<TopicPartition>),
    Resume(Vec<TopicPartition>),
    Close,
}

struct BrokerState<K, V> {
    queue: VecDeque<ClientEvent<K, V>>,
    topics: Vec<String>,
    pattern: Option<Regex>,
    assigned: BTreeSet<TopicPartition>,
    paused: BTreeSet<TopicPartition>,
    committed: BTreeMap<TopicPartition, i64>,
    commits: Vec<Vec<TopicPartitionOffset>>,
    calls: Vec<ClientCall>,
    max_per_poll: Option<usize>,
    fail_create: Option<String>,
    fail_pause: Option<String>,
    clients_created: usize,
    polls: usize,
    closed: bool,
}

impl<K, V> BrokerState<K, V> {
    fn deliverable(&self, tp: &TopicPartition) -> bool {
        if self.paused.contains(tp) {
            return false;
        }
        self.assigned.contains(tp)
            || self.topics.iter().any(|t| *t == tp.topic)
            || self.pattern.as_ref().is_some_and(|p| p.is_match(&tp.topic))
    }
}

/// Scripted broker shared by its clients
pub struct MemoryBroker<K, V> {
    state: Arc<Mutex<BrokerState<K, V>>>,
}

impl<K, V> Clone for MemoryBroker<K, V> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<K, V> Default for MemoryBroker<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> MemoryBroker<K, V> {
    /// Empty broker
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                queue: VecDeque::new(),
                topics: Vec::new(),
                pattern: None,
                assigned: BTreeSet::new(),
                paused: BTreeSet::new(),
                committed: BTreeMap::new(),
                commits: Vec::new(),
                calls: Vec::new(),
                max_per_poll: None,
                fail_create: None,
                fail_pause: None,
                clients_created: 0,
                polls: 0,
                closed: false,
            })),
        }
    }

    /// Limit the records handed out by a single poll
    pub fn with_max_per_poll(self, max: usize) -> Self {
        self.state.lock().max_per_poll = Some(max);
        self
    }

    /// Append a record
    pub fn produce(&self, topic: &str, partition: i32, offset: i64, key: K, value: V) {
        self.push(ClientEvent::Message(Message {
            topic: topic.to_string(),
            partition,
            offset,
            key,
            value,
            timestamp: None,
        }));
    }

    /// Append any client event
    pub fn push(&self, event: ClientEvent<K, V>) {
        self.state.lock().queue.push_back(event);
    }

    /// Append a broker error
    pub fn push_error(&self, error: BrokerError) {
        self.push(ClientEvent::Error(error));
    }

    /// Append a record that fails to decode
    pub fn push_consume_error(&self, topic: &str, partition: i32, offset: i64, reason: &str) {
        self.push(ClientEvent::ConsumeError {
            topic: topic.to_string(),
            partition,
            offset,
            reason: reason.to_string(),
        });
    }

    /// Append a group rebalance assignment
    pub fn rebalance_assign(&self, partitions: Vec<TopicPartition>) {
        self.push(ClientEvent::PartitionsAssigned(partitions));
    }

    /// Append a group rebalance revocation
    pub fn rebalance_revoke(&self, partitions: Vec<TopicPartition>) {
        self.push(ClientEvent::PartitionsRevoked(partitions));
    }

    /// Make the next client creation fail
    pub fn fail_next_create(&self, reason: &str) {
        self.state.lock().fail_create = Some(reason.to_string());
    }

    /// Make the next pause call fail without pausing anything
    pub fn fail_next_pause(&self, reason: &str) {
        self.state.lock().fail_pause = Some(reason.to_string());
    }

    /// Calls made by clients so far
    pub fn calls(&self) -> Vec<ClientCall> {
        self.state.lock().calls.clone()
    }

    /// Pause and resume calls only
    pub fn flow_calls(&self) -> Vec<ClientCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, ClientCall::Pause(_) | ClientCall::Resume(_)))
            .collect()
    }

    /// Offsets of each commit request
    pub fn commits(&self) -> Vec<Vec<TopicPartitionOffset>> {
        self.state.lock().commits.clone()
    }

    /// Latest committed offset of a partition
    pub fn committed(&self, tp: &TopicPartition) -> Option<i64> {
        self.state.lock().committed.get(tp).copied()
    }

    /// Currently paused partitions
    pub fn paused(&self) -> BTreeSet<TopicPartition> {
        self.state.lock().paused.clone()
    }

    /// Currently assigned partitions
    pub fn assigned(&self) -> BTreeSet<TopicPartition> {
        self.state.lock().assigned.clone()
    }

    /// Events not yet handed out
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Number of polls across all clients
    pub fn polls(&self) -> usize {
        self.state.lock().polls
    }

    /// Number of close calls across all clients
    pub fn close_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| **c == ClientCall::Close)
            .count()
    }

    /// Number of clients created
    pub fn clients_created(&self) -> usize {
        self.state.lock().clients_created
    }
}

impl<K: Send + 'static, V: Send + 'static> MemoryBroker<K, V> {
    /// Factory creating clients of this broker
    pub fn factory(&self) -> MemoryClientFactory<K, V> {
        MemoryClientFactory {
            broker: self.clone(),
        }
    }
}

struct MemoryCommitter<K, V> {
    state: Arc<Mutex<BrokerState<K, V>>>,
}

impl<K: Send, V: Send> Committer for MemoryCommitter<K, V> {
    fn commit(&self, offsets: &[TopicPartitionOffset]) -> SourceResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(SourceError::Commit("consumer is closed".to_string()));
        }
        for tpo in offsets {
            state
                .committed
                .insert(tpo.topic_partition.clone(), tpo.offset);
        }
        state.commits.push(offsets.to_vec());
        Ok(())
    }
}

/// Client of a [`MemoryBroker`]
pub struct MemoryClient<K, V> {
    name: String,
    state: Arc<Mutex<BrokerState<K, V>>>,
    max_poll_records: usize,
}

#[async_trait]
impl<K: Send + 'static, V: Send + 'static> ConsumerClient for MemoryClient<K, V> {
    type Key = K;
    type Value = V;

    fn name(&self) -> &str {
        &self.name
    }

    fn subscribe(&mut self, topics: &[String]) -> SourceResult<()> {
        let mut state = self.state.lock();
        state.topics = topics.to_vec();
        state.calls.push(ClientCall::Subscribe(topics.to_vec()));
        Ok(())
    }

    fn subscribe_pattern(&mut self, pattern: &str) -> SourceResult<()> {
        let regex = Regex::new(pattern)
            .map_err(|e| SourceError::Subscription(format!("Invalid topic pattern: {}", e)))?;
        let mut state = self.state.lock();
        state.pattern = Some(regex);
        state.calls.push(ClientCall::SubscribePattern(pattern.to_string()));
        Ok(())
    }

    fn assign(&mut self, partitions: &[TopicPartition]) -> SourceResult<()> {
        let mut state = self.state.lock();
        state.assigned = partitions.iter().cloned().collect();
        state.paused.clear();
        state.calls.push(ClientCall::Assign(partitions.to_vec()));
        Ok(())
    }

    fn assign_with_offsets(&mut self, partitions: &[TopicPartitionOffset]) -> SourceResult<()> {
        let mut state = self.state.lock();
        state.assigned = partitions
            .iter()
            .map(|p| p.topic_partition.clone())
            .collect();
        state.paused.clear();
        // records before the starting offset are skipped
        state.queue.retain(|event| match event {
            ClientEvent::Message(m) => partitions
                .iter()
                .find(|p| p.topic_partition.topic == m.topic && p.topic_partition.partition == m.partition)
                .map_or(true, |p| m.offset >= p.offset),
            _ => true,
        });
        state.calls.push(ClientCall::AssignWithOffsets(partitions.to_vec()));
        Ok(())
    }

    fn unassign(&mut self) -> SourceResult<()> {
        let mut state = self.state.lock();
        state.assigned.clear();
        state.paused.clear();
        state.calls.push(ClientCall::Unassign);
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Vec<ClientEvent<K, V>> {
        let events = {
            let mut state = self.state.lock();
            state.polls += 1;
            let limit = state
                .max_per_poll
                .map_or(self.max_poll_records, |m| m.min(self.max_poll_records));

            let mut events = Vec::new();
            let mut delivered = 0;
            let mut withheld = VecDeque::new();
            while let Some(event) = state.queue.pop_front() {
                let partition = match &event {
                    ClientEvent::Message(m) => Some(m.topic_partition()),
                    ClientEvent::ConsumeError {
                        topic, partition, ..
                    } => Some(TopicPartition::new(topic.clone(), *partition)),
                    _ => None,
                };
                let Some(tp) = partition else {
                    events.push(event);
                    continue;
                };
                if delivered >= limit {
                    state.queue.push_front(event);
                    break;
                }
                if state.deliverable(&tp) {
                    delivered += 1;
                    events.push(event);
                } else {
                    withheld.push_back(event);
                }
            }
            while let Some(event) = withheld.pop_back() {
                state.queue.push_front(event);
            }
            events
        };

        if events.is_empty() {
            tokio::time::sleep(timeout).await;
        } else {
            debug!(client = %self.name, events = events.len(), "Memory poll");
        }
        events
    }

    fn pause(&mut self, partitions: &[TopicPartition]) -> SourceResult<()> {
        if partitions.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        state.calls.push(ClientCall::Pause(partitions.to_vec()));
        if let Some(reason) = state.fail_pause.take() {
            return Err(SourceError::Client(reason));
        }
        state.paused.extend(partitions.iter().cloned());
        Ok(())
    }

    fn resume(&mut self, partitions: &[TopicPartition]) -> SourceResult<()> {
        if partitions.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        for tp in partitions {
            state.paused.remove(tp);
        }
        state.calls.push(ClientCall::Resume(partitions.to_vec()));
        Ok(())
    }

    fn committer(&self) -> Arc<dyn Committer> {
        Arc::new(MemoryCommitter {
            state: self.state.clone(),
        })
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.topics.clear();
        state.pattern = None;
        state.assigned.clear();
        state.paused.clear();
        state.calls.push(ClientCall::Close);
    }
}

/// Creates [`MemoryClient`]s of one broker
pub struct MemoryClientFactory<K, V> {
    broker: MemoryBroker<K, V>,
}

impl<K: Send + 'static, V: Send + 'static> ClientFactory for MemoryClientFactory<K, V> {
    type Client = MemoryClient<K, V>;

    fn create(&self, settings: &ConsumerSettings) -> SourceResult<Self::Client> {
        let mut state = self.broker.state.lock();
        if let Some(reason) = state.fail_create.take() {
            return Err(SourceError::Client(reason));
        }
        state.clients_created += 1;
        state.closed = false;
        Ok(MemoryClient {
            name: format!("memory-{}", state.clients_created),
            state: self.broker.state.clone(),
            max_poll_records: settings.max_poll_records,
        })
    }
}
